//! Persisted per-directory view state, keyed by path relative to the tree root.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Flags for one directory. `mark` is reconciliation-transient and never
/// serialized: a full update pass clears all marks, marks every directory
/// still seen on disk, and sweeps the rest.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirFlags {
    pub open: bool,
    #[serde(default)]
    pub sort_by_mod_time: bool,
    #[serde(skip)]
    pub mark: bool,
}

/// Ordered map of relative directory path to [`DirFlags`]. The enclosing
/// application serializes this as part of its saved project state.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DirStateMap {
    map: BTreeMap<String, DirFlags>,
}

impl DirStateMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_open(&self, rel: &str) -> bool {
        self.map.get(rel).is_some_and(|f| f.open)
    }

    pub fn set_open(&mut self, rel: &str, open: bool) {
        self.map.entry(rel.to_string()).or_default().open = open;
    }

    pub fn sort_by_mod_time(&self, rel: &str) -> bool {
        self.map.get(rel).is_some_and(|f| f.sort_by_mod_time)
    }

    pub fn set_sort_by(&mut self, rel: &str, by_mod_time: bool) {
        self.map
            .entry(rel.to_string())
            .or_default()
            .sort_by_mod_time = by_mod_time;
    }

    /// Flag `rel` as still existing on disk. Only marks entries that are
    /// already present; reconciliation creates entries via `set_open`.
    pub fn mark(&mut self, rel: &str) {
        if let Some(flags) = self.map.get_mut(rel) {
            flags.mark = true;
        }
    }

    pub fn clear_marks(&mut self) {
        for flags in self.map.values_mut() {
            flags.mark = false;
        }
    }

    /// Drop every unmarked entry (the root entry `"."` is always kept).
    /// Returns how many entries were removed.
    pub fn sweep(&mut self) -> usize {
        let before = self.map.len();
        self.map.retain(|rel, flags| flags.mark || rel == ".");
        before - self.map.len()
    }

    /// Carry flags across a directory rename: every entry at or under
    /// `old_rel` is re-keyed under `new_rel`.
    pub fn rename_prefix(&mut self, old_rel: &str, new_rel: &str) {
        let moved: Vec<(String, DirFlags)> = self
            .map
            .iter()
            .filter(|(rel, _)| {
                rel.as_str() == old_rel || rel.starts_with(&format!("{old_rel}/"))
            })
            .map(|(rel, flags)| {
                let tail = &rel[old_rel.len()..];
                (format!("{new_rel}{tail}"), *flags)
            })
            .collect();
        self.map.retain(|rel, _| {
            rel.as_str() != old_rel && !rel.starts_with(&format!("{old_rel}/"))
        });
        self.map.extend(moved);
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn contains(&self, rel: &str) -> bool {
        self.map.contains_key(rel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_flag_roundtrip() {
        let mut dirs = DirStateMap::new();
        assert!(!dirs.is_open("src"));
        dirs.set_open("src", true);
        assert!(dirs.is_open("src"));
        dirs.set_open("src", false);
        assert!(!dirs.is_open("src"));
        assert!(dirs.contains("src"));
    }

    #[test]
    fn sweep_removes_unmarked_only() {
        let mut dirs = DirStateMap::new();
        dirs.set_open(".", true);
        dirs.set_open("src", true);
        dirs.set_open("gone", true);

        dirs.clear_marks();
        dirs.mark(".");
        dirs.mark("src");
        assert_eq!(dirs.sweep(), 1);
        assert!(dirs.contains("src"));
        assert!(!dirs.contains("gone"));
    }

    #[test]
    fn sweep_keeps_root_entry() {
        let mut dirs = DirStateMap::new();
        dirs.set_open(".", true);
        dirs.clear_marks();
        assert_eq!(dirs.sweep(), 0);
        assert!(dirs.is_open("."));
    }

    #[test]
    fn mark_ignores_unknown_paths() {
        let mut dirs = DirStateMap::new();
        dirs.mark("never-seen");
        assert!(!dirs.contains("never-seen"));
    }

    #[test]
    fn rename_prefix_moves_subtree_flags() {
        let mut dirs = DirStateMap::new();
        dirs.set_open("a", true);
        dirs.set_sort_by("a/b", true);
        dirs.set_open("ab", true);

        dirs.rename_prefix("a", "a2");
        assert!(dirs.is_open("a2"));
        assert!(dirs.sort_by_mod_time("a2/b"));
        assert!(!dirs.contains("a"));
        assert!(!dirs.contains("a/b"));
        // sibling with a common name prefix is untouched
        assert!(dirs.is_open("ab"));
    }

    #[test]
    fn serialization_skips_mark() {
        let mut dirs = DirStateMap::new();
        dirs.set_open("src", true);
        dirs.mark("src");

        let json = serde_json::to_string(&dirs).expect("serialize");
        assert!(!json.contains("mark"));

        let back: DirStateMap = serde_json::from_str(&json).expect("deserialize");
        assert!(back.is_open("src"));
    }
}
