//! Filesystem watch layer: one non-recursive watch per open directory,
//! raw notify events normalized into a small delta vocabulary.

use notify::event::{CreateKind, ModifyKind, RenameMode};
use notify::{Config, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use rustc_hash::FxHashSet;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::time::Duration;
use tracing::{debug, warn};

const WATCHER_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Message on the dispatcher channel. `Stop` is the shutdown sentinel sent
/// when the tree is dropped.
pub enum WatchMsg {
    Fs(notify::Event),
    Stop,
}

/// Normalized filesystem change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsDelta {
    Created { path: PathBuf, is_dir: bool },
    Deleted { path: PathBuf },
    Renamed { from: PathBuf, to: PathBuf },
    Modified { path: PathBuf },
}

impl FsDelta {
    /// The path whose containing directory needs re-reading. Renames report
    /// the destination; the source shows up as a stale child there or via a
    /// separate delta.
    pub fn touched_path(&self) -> &Path {
        match self {
            FsDelta::Created { path, .. }
            | FsDelta::Deleted { path }
            | FsDelta::Modified { path } => path,
            FsDelta::Renamed { to, .. } => to,
        }
    }
}

/// Watches exactly the set of directories handed to it, non-recursively.
/// Closed or vanished directories are unwatched; re-watching an already
/// watched directory is a no-op.
pub struct DirWatcher {
    watcher: RecommendedWatcher,
    watched: FxHashSet<PathBuf>,
}

impl DirWatcher {
    pub fn new(tx: mpsc::Sender<WatchMsg>) -> Result<Self, notify::Error> {
        let watcher = RecommendedWatcher::new(
            move |res: Result<notify::Event, notify::Error>| {
                let Ok(event) = res else { return };
                let _ = tx.send(WatchMsg::Fs(event));
            },
            Config::default().with_poll_interval(WATCHER_POLL_INTERVAL),
        )?;
        Ok(Self {
            watcher,
            watched: FxHashSet::default(),
        })
    }

    pub fn watch_dir(&mut self, path: &Path) -> Result<(), notify::Error> {
        if self.watched.contains(path) {
            return Ok(());
        }
        self.watcher.watch(path, RecursiveMode::NonRecursive)?;
        self.watched.insert(path.to_path_buf());
        debug!(path = %path.display(), "watching directory");
        Ok(())
    }

    pub fn unwatch_dir(&mut self, path: &Path) {
        if !self.watched.remove(path) {
            return;
        }
        // The backend may already have dropped the watch with the directory.
        if let Err(err) = self.watcher.unwatch(path) {
            debug!(path = %path.display(), %err, "unwatch after removal");
        }
    }

    /// Drop every watch outside `keep`.
    pub fn retain_watched(&mut self, keep: &FxHashSet<PathBuf>) {
        let stale: Vec<PathBuf> = self
            .watched
            .iter()
            .filter(|p| !keep.contains(*p))
            .cloned()
            .collect();
        for path in stale {
            self.unwatch_dir(&path);
        }
    }

    pub fn is_watched(&self, path: &Path) -> bool {
        self.watched.contains(path)
    }

    pub fn watched_count(&self) -> usize {
        self.watched.len()
    }
}

fn infer_is_dir(path: &Path, create_kind: Option<CreateKind>) -> bool {
    match create_kind {
        Some(CreateKind::Folder) => true,
        Some(CreateKind::File) => false,
        _ => std::fs::metadata(path)
            .map(|meta| meta.is_dir())
            .unwrap_or(false),
    }
}

/// Flatten one notify event into deltas. Access-only and unknown kinds are
/// dropped here so the dispatcher never sees them.
pub fn normalize_notify_event(event: notify::Event) -> Vec<FsDelta> {
    match event.kind {
        EventKind::Create(create_kind) => event
            .paths
            .into_iter()
            .map(|path| FsDelta::Created {
                is_dir: infer_is_dir(path.as_path(), Some(create_kind)),
                path,
            })
            .collect(),
        EventKind::Remove(_) => event
            .paths
            .into_iter()
            .map(|path| FsDelta::Deleted { path })
            .collect(),
        EventKind::Modify(kind) => normalize_modify_event(kind, event.paths),
        EventKind::Any | EventKind::Other => {
            warn!(paths = ?event.paths, "unclassified watch event");
            Vec::new()
        }
        _ => Vec::new(),
    }
}

fn normalize_modify_event(kind: ModifyKind, paths: Vec<PathBuf>) -> Vec<FsDelta> {
    match kind {
        ModifyKind::Name(RenameMode::Both) => {
            if paths.len() >= 2 {
                vec![FsDelta::Renamed {
                    from: paths[0].clone(),
                    to: paths[1].clone(),
                }]
            } else {
                paths
                    .into_iter()
                    .map(|path| FsDelta::Modified { path })
                    .collect()
            }
        }
        ModifyKind::Name(RenameMode::From) => paths
            .into_iter()
            .map(|path| FsDelta::Deleted { path })
            .collect(),
        ModifyKind::Name(RenameMode::To) => paths
            .into_iter()
            .map(|path| FsDelta::Created {
                is_dir: infer_is_dir(path.as_path(), None),
                path,
            })
            .collect(),
        ModifyKind::Data(_)
        | ModifyKind::Any
        | ModifyKind::Other
        | ModifyKind::Metadata(_)
        | ModifyKind::Name(_) => paths
            .into_iter()
            .map(|path| FsDelta::Modified { path })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modify_name_any_normalizes_to_modified() {
        let path = PathBuf::from("/tmp/ztree-name-modified.rs");
        let event = notify::Event {
            kind: EventKind::Modify(ModifyKind::Name(RenameMode::Any)),
            paths: vec![path.clone()],
            attrs: Default::default(),
        };

        let deltas = normalize_notify_event(event);
        assert_eq!(deltas, vec![FsDelta::Modified { path }]);
    }

    #[test]
    fn rename_both_pairs_from_and_to() {
        let from = PathBuf::from("/tmp/old.rs");
        let to = PathBuf::from("/tmp/new.rs");
        let event = notify::Event {
            kind: EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
            paths: vec![from.clone(), to.clone()],
            attrs: Default::default(),
        };

        let deltas = normalize_notify_event(event);
        assert_eq!(deltas, vec![FsDelta::Renamed { from, to }]);
    }

    #[test]
    fn split_rename_degrades_to_delete_and_create() {
        let from_event = notify::Event {
            kind: EventKind::Modify(ModifyKind::Name(RenameMode::From)),
            paths: vec![PathBuf::from("/tmp/old.rs")],
            attrs: Default::default(),
        };
        let to_event = notify::Event {
            kind: EventKind::Modify(ModifyKind::Name(RenameMode::To)),
            paths: vec![PathBuf::from("/tmp/new.rs")],
            attrs: Default::default(),
        };

        assert!(matches!(
            normalize_notify_event(from_event).as_slice(),
            [FsDelta::Deleted { .. }]
        ));
        assert!(matches!(
            normalize_notify_event(to_event).as_slice(),
            [FsDelta::Created { .. }]
        ));
    }

    #[test]
    fn access_events_are_dropped() {
        let event = notify::Event {
            kind: EventKind::Access(notify::event::AccessKind::Read),
            paths: vec![PathBuf::from("/tmp/a.rs")],
            attrs: Default::default(),
        };
        assert!(normalize_notify_event(event).is_empty());
    }

    #[test]
    fn watch_set_is_idempotent() {
        let dir = tempfile::tempdir().expect("create tempdir");
        let (tx, _rx) = mpsc::channel();
        let mut watcher = DirWatcher::new(tx).expect("create watcher");

        watcher.watch_dir(dir.path()).expect("watch");
        watcher.watch_dir(dir.path()).expect("watch again");
        assert_eq!(watcher.watched_count(), 1);

        watcher.unwatch_dir(dir.path());
        assert_eq!(watcher.watched_count(), 0);
        // unwatching an unknown path is a no-op
        watcher.unwatch_dir(dir.path());
    }

    #[test]
    fn retain_drops_stale_watches() {
        let dir = tempfile::tempdir().expect("create tempdir");
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        std::fs::create_dir(&a).expect("mkdir");
        std::fs::create_dir(&b).expect("mkdir");

        let (tx, _rx) = mpsc::channel();
        let mut watcher = DirWatcher::new(tx).expect("create watcher");
        watcher.watch_dir(&a).expect("watch a");
        watcher.watch_dir(&b).expect("watch b");

        let mut keep = FxHashSet::default();
        keep.insert(a.clone());
        watcher.retain_watched(&keep);

        assert!(watcher.is_watched(&a));
        assert!(!watcher.is_watched(&b));
    }
}
