//! Tree behavior knobs, fixed at construction.

use crate::models::file_info::FileInfo;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Predicate deciding whether an entry enters the tree at all.
/// Returning false hides the entry; hidden entries are never watched.
pub type EntryFilter = Arc<dyn Fn(&Path, &FileInfo) -> bool + Send + Sync>;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum VcsMode {
    /// Detect a repository at or below the root and overlay statuses.
    Auto,
    /// Never consult any VCS; browsing is plain POSIX.
    Disabled,
}

#[derive(Clone)]
pub struct TreeConfig {
    /// Directories sort before files within each directory.
    pub dirs_on_top: bool,
    /// Default sort for directories without a persisted per-dir override.
    pub sort_by_mod_time: bool,
    pub show_hidden: bool,
    /// Window within which repeat change notifications for the same
    /// directory are coalesced.
    pub debounce: Duration,
    pub vcs: VcsMode,
    pub filter: Option<EntryFilter>,
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            dirs_on_top: true,
            sort_by_mod_time: false,
            show_hidden: false,
            debounce: Duration::from_millis(100),
            vcs: VcsMode::Auto,
            filter: None,
        }
    }
}

impl TreeConfig {
    /// Default visibility policy plus the user filter, if any.
    pub fn admits(&self, path: &Path, info: &FileInfo) -> bool {
        if !self.show_hidden && info.is_hidden() {
            return false;
        }
        if info.is_auto_save() {
            return false;
        }
        if crate::models::should_ignore(&info.name.to_string_lossy()) {
            return false;
        }
        match &self.filter {
            Some(filter) => filter(path, info),
            None => true,
        }
    }
}
