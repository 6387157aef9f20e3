//! Synchronized tree root: owns the arena, the persisted directory state,
//! the watch set, and the background dispatcher that folds filesystem
//! changes back into the tree.

use crate::buffer::EditBuffer;
use crate::config::{TreeConfig, VcsMode};
use crate::models::dir_state::DirStateMap;
use crate::models::file_info::{EntryKind, FileInfo};
use crate::models::file_tree::{
    FileTree, FileTreeError, NodeId, RepoCache, TreeRow, EXTERNAL_FILES_NAME,
};
use crate::vcs::{detect_repo, VcsError, VcsLogEntry, VcsStatus};
use crate::watcher::{normalize_notify_event, DirWatcher, FsDelta, WatchMsg};
use rustc_hash::FxHashSet;
use std::ffi::OsString;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug)]
pub enum TreeError {
    NotFound(PathBuf),
    AlreadyExists(PathBuf),
    PermissionDenied(PathBuf),
    NotADirectory(PathBuf),
    /// Buffer operation on a node with no open buffer.
    NoBuffer(PathBuf),
    /// VCS operation outside any detected repository.
    NoRepo(PathBuf),
    Tree(FileTreeError),
    Vcs(VcsError),
    Watch(notify::Error),
    Io(io::Error),
}

impl fmt::Display for TreeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TreeError::NotFound(path) => write!(f, "not found: {}", path.display()),
            TreeError::AlreadyExists(path) => {
                write!(f, "already exists: {}", path.display())
            }
            TreeError::PermissionDenied(path) => {
                write!(f, "permission denied: {}", path.display())
            }
            TreeError::NotADirectory(path) => {
                write!(f, "not a directory: {}", path.display())
            }
            TreeError::NoBuffer(path) => write!(f, "no open buffer: {}", path.display()),
            TreeError::NoRepo(path) => {
                write!(f, "no repository covers: {}", path.display())
            }
            TreeError::Tree(err) => write!(f, "{err}"),
            TreeError::Vcs(err) => write!(f, "{err}"),
            TreeError::Watch(err) => write!(f, "watch error: {err}"),
            TreeError::Io(err) => write!(f, "io error: {err}"),
        }
    }
}

impl std::error::Error for TreeError {}

impl From<io::Error> for TreeError {
    fn from(err: io::Error) -> Self {
        TreeError::Io(err)
    }
}

impl From<VcsError> for TreeError {
    fn from(err: VcsError) -> Self {
        TreeError::Vcs(err)
    }
}

impl From<notify::Error> for TreeError {
    fn from(err: notify::Error) -> Self {
        TreeError::Watch(err)
    }
}

impl From<FileTreeError> for TreeError {
    fn from(err: FileTreeError) -> Self {
        TreeError::Tree(err)
    }
}

impl TreeError {
    /// Typed mapping for io failures of explicit operations, where the
    /// affected path is known.
    fn from_io(err: io::Error, path: &Path) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => TreeError::NotFound(path.to_path_buf()),
            io::ErrorKind::PermissionDenied => TreeError::PermissionDenied(path.to_path_buf()),
            io::ErrorKind::AlreadyExists => TreeError::AlreadyExists(path.to_path_buf()),
            _ => TreeError::Io(err),
        }
    }
}

/// Change notification for subscribers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TreeEvent {
    /// One directory was re-read after a filesystem change.
    DirChanged { path: PathBuf },
    /// A full refresh pass completed.
    Refreshed,
}

struct TreeState {
    tree: FileTree,
    dirs: DirStateMap,
    watcher: DirWatcher,
    externals: Option<NodeId>,
    last_update: Option<(PathBuf, Instant)>,
    subscribers: Vec<mpsc::Sender<TreeEvent>>,
}

struct Inner {
    config: TreeConfig,
    state: Mutex<TreeState>,
}

/// A live mirror of one directory subtree. Cheap to share by reference;
/// dropping it stops the dispatcher thread.
pub struct FileTreeSync {
    inner: Arc<Inner>,
    watch_tx: mpsc::Sender<WatchMsg>,
    dispatcher: Option<JoinHandle<()>>,
}

impl FileTreeSync {
    /// Open `path` as a tree root with default view state.
    pub fn open_path(path: &Path, config: TreeConfig) -> Result<Self, TreeError> {
        Self::open_path_with_state(path, config, DirStateMap::new())
    }

    /// Open `path`, restoring previously persisted per-directory flags.
    pub fn open_path_with_state(
        path: &Path,
        config: TreeConfig,
        mut dirs: DirStateMap,
    ) -> Result<Self, TreeError> {
        let root_info = FileInfo::probe(path)?;
        if !root_info.is_dir() {
            return Err(TreeError::NotADirectory(path.to_path_buf()));
        }

        let mut tree = FileTree::new_with_root(root_info);
        dirs.set_open(".", true);

        if config.vcs == VcsMode::Auto {
            if let Some(repo) = detect_repo(tree.absolute_root()) {
                info!(root = %repo.root().display(), kind = repo.kind(), "repository detected");
                let root = tree.root();
                if let Some(node) = tree.get_mut(root) {
                    node.set_repo(Some(RepoCache::new(repo)));
                }
            }
        }

        let (watch_tx, watch_rx) = mpsc::channel();
        let watcher = DirWatcher::new(watch_tx.clone())?;

        let state = TreeState {
            tree,
            dirs,
            watcher,
            externals: None,
            last_update: None,
            subscribers: Vec::new(),
        };

        let inner = Arc::new(Inner {
            config,
            state: Mutex::new(state),
        });

        let sync = Self {
            inner: Arc::clone(&inner),
            watch_tx,
            dispatcher: Some(thread::spawn(move || run_dispatcher(inner, watch_rx))),
        };
        sync.update_all()?;
        Ok(sync)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TreeState> {
        match self.inner.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn root_path(&self) -> PathBuf {
        self.lock().tree.absolute_root().to_path_buf()
    }

    /// Full refresh: re-read every open directory, sweep directory state for
    /// paths that no longer exist, refresh VCS statuses, prune stale watches.
    pub fn update_all(&self) -> Result<(), TreeError> {
        let config = &self.inner.config;
        let mut state = self.lock();
        state.dirs.clear_marks();
        let root = state.tree.root();
        state.reconcile_dir(config, root)?;
        state.refresh_vcs();
        let swept = state.dirs.sweep();
        if swept > 0 {
            debug!(swept, "directory state entries swept");
        }
        state.prune_watches();
        state.emit(TreeEvent::Refreshed);
        Ok(())
    }

    /// Re-read the directory containing `path`, opening intermediate
    /// directories down to it as needed.
    pub fn update_path(&self, path: &Path) -> Result<(), TreeError> {
        let config = &self.inner.config;
        let mut state = self.lock();
        let dir = if path.is_dir() {
            path
        } else {
            path.parent()
                .ok_or_else(|| TreeError::NotFound(path.to_path_buf()))?
        };
        let id = state.dirs_to(config, dir)?;
        let dir_path = state.tree.full_path(id);
        state.emit(TreeEvent::DirChanged { path: dir_path });
        Ok(())
    }

    /// Mark a directory open, load its children, and start watching it.
    pub fn set_dir_open(&self, path: &Path) -> Result<(), TreeError> {
        let config = &self.inner.config;
        let mut state = self.lock();
        let rel = state.rel_key(path);
        state.dirs.set_open(&rel, true);
        if let Some(id) = state.tree.find_node_by_path(path) {
            if !state.tree.get(id).is_some_and(|n| n.is_dir()) {
                return Err(TreeError::NotADirectory(path.to_path_buf()));
            }
            state.tree.expand(id);
            state.reconcile_dir(config, id)?;
            state.refresh_vcs();
            state.emit(TreeEvent::DirChanged {
                path: path.to_path_buf(),
            });
        }
        Ok(())
    }

    /// Mark a directory closed. Loaded children are kept but hidden from
    /// flattened views; the directory is no longer watched.
    pub fn set_dir_closed(&self, path: &Path) {
        let mut state = self.lock();
        let rel = state.rel_key(path);
        state.dirs.set_open(&rel, false);
        if let Some(id) = state.tree.find_node_by_path(path) {
            if id != state.tree.root() {
                state.tree.collapse(id);
            }
        }
        state.prune_watches();
        state.emit(TreeEvent::DirChanged {
            path: path.to_path_buf(),
        });
    }

    pub fn is_dir_open(&self, path: &Path) -> bool {
        let mut state = self.lock();
        let rel = state.rel_key(path);
        state.dirs.is_open(&rel)
    }

    /// Per-directory sort override: by modification time, newest first.
    pub fn set_dir_sort_by(&self, path: &Path, by_mod_time: bool) -> Result<(), TreeError> {
        let config = &self.inner.config;
        let mut state = self.lock();
        let rel = state.rel_key(path);
        state.dirs.set_sort_by(&rel, by_mod_time);
        if let Some(id) = state.tree.find_node_by_path(path) {
            state.reconcile_dir(config, id)?;
        }
        Ok(())
    }

    /// Open every directory in the subtree, loading as it goes.
    pub fn open_all(&self) -> Result<(), TreeError> {
        let config = &self.inner.config;
        let mut state = self.lock();
        let root = state.tree.root();
        state.open_all_under(config, root)?;
        state.emit(TreeEvent::Refreshed);
        Ok(())
    }

    /// Close every directory except the root.
    pub fn close_all(&self) {
        let mut state = self.lock();
        let root = state.tree.root();
        let ids: Vec<NodeId> = state.tree.node_ids().collect();
        for id in ids {
            if id == root {
                continue;
            }
            if state.tree.get(id).is_some_and(|n| n.is_dir() && !n.is_external()) {
                let path = state.tree.full_path(id);
                let rel = state.rel_key(&path);
                state.dirs.set_open(&rel, false);
                state.tree.collapse(id);
            }
        }
        state.prune_watches();
        state.emit(TreeEvent::Refreshed);
    }

    /// Locate a file: absolute paths match exactly, relative ones match as
    /// a path suffix against loaded nodes first, then external files.
    pub fn find_file(&self, find: &Path) -> Option<PathBuf> {
        let mut state = self.lock();
        if find.is_absolute() {
            if let Some(id) = state.tree.find_node_by_path(find) {
                return Some(state.tree.full_path(id));
            }
            // external files live outside the root, invisible to path lookup
            let ext = state.find_ext_file(find)?;
            return Some(state.tree.full_path(ext));
        }
        let internal = state
            .tree
            .node_ids()
            .filter(|id| !state.tree.get(*id).is_some_and(|n| n.is_external()))
            .find(|id| state.tree.path_of(*id).ends_with(find));
        if let Some(id) = internal {
            return Some(state.tree.full_path(id));
        }
        let external = state
            .tree
            .node_ids()
            .filter(|id| state.tree.get(*id).is_some_and(|n| n.is_external() && !n.is_dir()))
            .find(|id| state.tree.path_of(*id).ends_with(find));
        external.map(|id| state.tree.full_path(id))
    }

    /// Loaded files whose name contains `pattern`.
    pub fn find_files_matching(&self, pattern: &str, ignore_case: bool) -> Vec<PathBuf> {
        let state = self.lock();
        state
            .tree
            .files_matching(pattern, ignore_case)
            .into_iter()
            .map(|id| state.tree.path_of(id))
            .collect()
    }

    /// Track a file outside the root under the synthetic external node.
    /// Adding the same path twice is a no-op.
    pub fn add_ext_file(&self, path: &Path) -> Result<(), TreeError> {
        let info = FileInfo::probe(path)?;
        if info.is_dir() {
            return Err(TreeError::NotADirectory(path.to_path_buf()));
        }
        let mut state = self.lock();
        if state.find_ext_file(path).is_some() {
            return Ok(());
        }
        let ext = state.ensure_externals_node()?;
        state.tree.insert_child(ext, info, true)?;
        state.tree.expand(ext);
        state.emit(TreeEvent::Refreshed);
        Ok(())
    }

    pub fn remove_ext_file(&self, path: &Path) -> bool {
        let mut state = self.lock();
        let Some(id) = state.find_ext_file(path) else {
            return false;
        };
        let removed = state.tree.delete(id).is_ok();
        if removed {
            state.emit(TreeEvent::Refreshed);
        }
        removed
    }

    pub fn ext_files(&self) -> Vec<PathBuf> {
        let state = self.lock();
        let Some(ext) = state.externals else {
            return Vec::new();
        };
        state
            .tree
            .children_ordered(ext)
            .into_iter()
            .map(|id| state.tree.path_of(id))
            .collect()
    }

    /// Create an empty file in a loaded directory and insert its node.
    pub fn new_file(&self, dir: &Path, name: &str) -> Result<PathBuf, TreeError> {
        let config = &self.inner.config;
        let mut state = self.lock();
        let parent = state.dir_node(dir)?;
        let path = dir.join(name);
        if let Err(err) = fs::OpenOptions::new().write(true).create_new(true).open(&path) {
            return Err(TreeError::from_io(err, &path));
        }
        state.insert_new_entry(config, parent, &path)?;
        state.emit(TreeEvent::DirChanged {
            path: dir.to_path_buf(),
        });
        Ok(path)
    }

    pub fn new_folder(&self, dir: &Path, name: &str) -> Result<PathBuf, TreeError> {
        let config = &self.inner.config;
        let mut state = self.lock();
        let parent = state.dir_node(dir)?;
        let path = dir.join(name);
        if let Err(err) = fs::create_dir(&path) {
            return Err(TreeError::from_io(err, &path));
        }
        state.insert_new_entry(config, parent, &path)?;
        state.emit(TreeEvent::DirChanged {
            path: dir.to_path_buf(),
        });
        Ok(path)
    }

    /// Copy a file next to itself under a generated `_copy` name.
    pub fn duplicate_file(&self, path: &Path) -> Result<PathBuf, TreeError> {
        let config = &self.inner.config;
        let mut state = self.lock();
        let id = state
            .tree
            .find_node_by_path(path)
            .ok_or_else(|| TreeError::NotFound(path.to_path_buf()))?;
        if state.tree.get(id).is_some_and(|n| n.is_dir()) {
            return Err(TreeError::NotADirectory(path.to_path_buf()));
        }
        let parent = state
            .tree
            .get(id)
            .and_then(|n| n.parent())
            .ok_or(TreeError::Tree(FileTreeError::InvalidNodeId))?;
        let copy = crate::models::file_info::duplicate_path(path)?;
        fs::copy(path, &copy)?;
        state.insert_new_entry(config, parent, &copy)?;
        state.emit(TreeEvent::DirChanged {
            path: copy.parent().unwrap_or(path).to_path_buf(),
        });
        Ok(copy)
    }

    /// Delete a file or directory. Tracked files are removed through the
    /// repository so the deletion is staged; the filesystem is mutated
    /// before the tree, so a failed operation leaves the tree untouched.
    pub fn delete_file(&self, path: &Path) -> Result<(), TreeError> {
        let mut state = self.lock();
        let id = state
            .tree
            .find_node_by_path(path)
            .ok_or_else(|| TreeError::NotFound(path.to_path_buf()))?;
        if state.tree.get(id).is_some_and(|n| n.is_external()) {
            state.tree.delete(id)?;
            state.emit(TreeEvent::Refreshed);
            return Ok(());
        }

        let is_dir = state.tree.get(id).is_some_and(|n| n.is_dir());
        let tracked = state
            .tree
            .get(id)
            .and_then(|n| n.vcs())
            .is_some_and(|s| s != VcsStatus::Untracked);
        let repo = state.repo_for(id);

        match (tracked, repo) {
            (true, Some(repo)) => repo.remove(path)?,
            _ => {
                let removed = if is_dir {
                    fs::remove_dir_all(path)
                } else {
                    fs::remove_file(path)
                };
                removed.map_err(|err| TreeError::from_io(err, path))?;
            }
        }

        state.tree.delete(id)?;
        state.emit(TreeEvent::DirChanged {
            path: path.parent().unwrap_or(path).to_path_buf(),
        });
        Ok(())
    }

    /// Rename or move within the tree. Tracked files move through the
    /// repository to preserve history; directory view flags follow the
    /// rename.
    pub fn rename_file(&self, old: &Path, new: &Path) -> Result<(), TreeError> {
        let mut state = self.lock();
        let id = state
            .tree
            .find_node_by_path(old)
            .ok_or_else(|| TreeError::NotFound(old.to_path_buf()))?;
        if new.exists() {
            return Err(TreeError::AlreadyExists(new.to_path_buf()));
        }
        let new_name: OsString = new
            .file_name()
            .ok_or_else(|| TreeError::NotFound(new.to_path_buf()))?
            .to_os_string();

        let tracked = state
            .tree
            .get(id)
            .and_then(|n| n.vcs())
            .is_some_and(|s| s != VcsStatus::Untracked);
        match (tracked, state.repo_for(id)) {
            (true, Some(repo)) => repo.move_file(old, new)?,
            _ => fs::rename(old, new).map_err(|err| TreeError::from_io(err, old))?,
        }

        let was_dir = state.tree.get(id).is_some_and(|n| n.is_dir());
        let old_rel = state.rel_key(old);
        let new_rel = state.rel_key(new);

        let old_parent = old.parent();
        let new_parent_path = new.parent();
        if old_parent == new_parent_path {
            state.tree.rename(id, new_name)?;
        } else {
            let target = new_parent_path.and_then(|p| state.tree.find_node_by_path(p));
            match target {
                Some(target) => {
                    state.tree.move_to(id, target)?;
                    state.tree.rename(id, new_name)?;
                }
                // destination not loaded: the node reappears when it is
                None => {
                    state.tree.delete(id)?;
                }
            }
        }

        if was_dir {
            state.dirs.rename_prefix(&old_rel, &new_rel);
        }
        if state.tree.contains(id) {
            if let Ok(info) = FileInfo::probe(new) {
                state.tree.update_info(id, info);
            }
            // buffers anywhere under the renamed path follow it
            let ids: Vec<NodeId> = state.tree.node_ids().collect();
            for nid in ids {
                let actual = state.tree.path_of(nid);
                let Some(node) = state.tree.get_mut(nid) else {
                    continue;
                };
                if node.is_external() {
                    continue;
                }
                if let Some(buffer) = node.buffer_mut() {
                    if buffer.path() != actual {
                        buffer.set_path(actual);
                    }
                }
            }
        }
        state.emit(TreeEvent::DirChanged {
            path: old.parent().unwrap_or(old).to_path_buf(),
        });
        if new_parent_path != old_parent {
            if let Some(parent) = new_parent_path {
                state.emit(TreeEvent::DirChanged {
                    path: parent.to_path_buf(),
                });
            }
        }
        Ok(())
    }

    /// Open an edit buffer for a file node. Re-opening is a no-op and never
    /// discards edits.
    pub fn open_buf(&self, path: &Path) -> Result<(), TreeError> {
        let mut state = self.lock();
        let id = state.file_node(path)?;
        if state.tree.get(id).is_some_and(|n| n.buffer().is_some()) {
            return Ok(());
        }
        let buffer = EditBuffer::open(path)?;
        if let Some(node) = state.tree.get_mut(id) {
            node.set_buffer(Some(buffer));
        }
        Ok(())
    }

    /// Close a buffer, discarding unsaved edits. Returns whether one existed.
    pub fn close_buf(&self, path: &Path) -> bool {
        let mut state = self.lock();
        let Ok(id) = state.file_node(path) else {
            return false;
        };
        let Some(node) = state.tree.get_mut(id) else {
            return false;
        };
        let had = node.buffer().is_some();
        node.set_buffer(None);
        had
    }

    pub fn buffer_text(&self, path: &Path) -> Option<String> {
        let mut state = self.lock();
        let id = state.file_node(path).ok()?;
        state.tree.get(id)?.buffer().map(|b| b.text())
    }

    pub fn buffer_is_dirty(&self, path: &Path) -> Option<bool> {
        let mut state = self.lock();
        let id = state.file_node(path).ok()?;
        state.tree.get(id)?.buffer().map(|b| b.is_dirty())
    }

    /// Insert text into an open buffer. The first edit to a clean buffer of
    /// a Stored file optimistically flips its status to Modified without
    /// consulting the backend.
    pub fn edit_buf_insert(&self, path: &Path, at: usize, text: &str) -> Result<(), TreeError> {
        let mut state = self.lock();
        let id = state.file_node(path)?;
        let node = state
            .tree
            .get_mut(id)
            .ok_or(TreeError::Tree(FileTreeError::InvalidNodeId))?;
        let buffer = node
            .buffer_mut()
            .ok_or_else(|| TreeError::NoBuffer(path.to_path_buf()))?;
        let first_edit = buffer.insert(at, text);
        if first_edit && node.vcs() == Some(VcsStatus::Stored) {
            node.set_vcs(Some(VcsStatus::Modified));
        }
        Ok(())
    }

    /// Remove a char range from an open buffer, with the same optimistic
    /// status flip as [`FileTreeSync::edit_buf_insert`].
    pub fn edit_buf_remove(&self, path: &Path, start: usize, end: usize) -> Result<(), TreeError> {
        let mut state = self.lock();
        let id = state.file_node(path)?;
        let node = state
            .tree
            .get_mut(id)
            .ok_or(TreeError::Tree(FileTreeError::InvalidNodeId))?;
        let buffer = node
            .buffer_mut()
            .ok_or_else(|| TreeError::NoBuffer(path.to_path_buf()))?;
        let first_edit = buffer.remove(start, end);
        if first_edit && node.vcs() == Some(VcsStatus::Stored) {
            node.set_vcs(Some(VcsStatus::Modified));
        }
        Ok(())
    }

    pub fn save_buf(&self, path: &Path) -> Result<(), TreeError> {
        let mut state = self.lock();
        let id = state.file_node(path)?;
        let buffer = state
            .tree
            .get_mut(id)
            .and_then(|n| n.buffer_mut())
            .ok_or_else(|| TreeError::NoBuffer(path.to_path_buf()))?;
        buffer.save()?;
        if let Ok(info) = FileInfo::probe(path) {
            state.tree.update_info(id, info);
        }
        Ok(())
    }

    /// Stage a file for addition; its status becomes Added immediately.
    pub fn add_to_vcs(&self, path: &Path) -> Result<(), TreeError> {
        let mut state = self.lock();
        let id = state.file_node(path)?;
        let repo = state
            .repo_for(id)
            .ok_or_else(|| TreeError::NoRepo(path.to_path_buf()))?;
        repo.add(path)?;
        if let Some(node) = state.tree.get_mut(id) {
            node.set_vcs(Some(VcsStatus::Added));
        }
        Ok(())
    }

    /// Remove a file from the repository and the working tree.
    pub fn delete_from_vcs(&self, path: &Path) -> Result<(), TreeError> {
        let mut state = self.lock();
        let id = state.file_node(path)?;
        let repo = state
            .repo_for(id)
            .ok_or_else(|| TreeError::NoRepo(path.to_path_buf()))?;
        repo.remove(path)?;
        state.tree.delete(id)?;
        state.emit(TreeEvent::DirChanged {
            path: path.parent().unwrap_or(path).to_path_buf(),
        });
        Ok(())
    }

    /// Commit one file; on success its status settles to Stored.
    pub fn commit_to_vcs(&self, path: &Path, message: &str) -> Result<(), TreeError> {
        let mut state = self.lock();
        let id = state.file_node(path)?;
        let repo = state
            .repo_for(id)
            .ok_or_else(|| TreeError::NoRepo(path.to_path_buf()))?;
        repo.commit(path, message)?;
        if let Some(node) = state.tree.get_mut(id) {
            node.set_vcs(Some(VcsStatus::Stored));
        }
        if let Some(rn) = state.tree.repo_node_for(id) {
            if let Some(cache) = state.tree.get_mut(rn).and_then(|n| n.repo_mut()) {
                cache.files.remove(path);
            }
        }
        Ok(())
    }

    /// Discard local modifications. A Modified file settles back to Stored;
    /// an Added file stays Added because it has no committed baseline to
    /// revert to. An open buffer is re-read from disk.
    pub fn revert_vcs(&self, path: &Path) -> Result<(), TreeError> {
        let mut state = self.lock();
        let id = state.file_node(path)?;
        let repo = state
            .repo_for(id)
            .ok_or_else(|| TreeError::NoRepo(path.to_path_buf()))?;
        let status = state.tree.get(id).and_then(|n| n.vcs());
        if status != Some(VcsStatus::Added) {
            repo.revert(path)?;
        }
        if let Some(node) = state.tree.get_mut(id) {
            if node.vcs() == Some(VcsStatus::Modified) || node.vcs() == Some(VcsStatus::Deleted) {
                node.set_vcs(Some(VcsStatus::Stored));
            }
            if let Some(buffer) = node.buffer_mut() {
                buffer.revert()?;
            }
        }
        Ok(())
    }

    pub fn diff_vcs(&self, path: &Path, rev_a: &str, rev_b: &str) -> Result<String, TreeError> {
        let mut state = self.lock();
        let id = state.file_node(path)?;
        let repo = state
            .repo_for(id)
            .ok_or_else(|| TreeError::NoRepo(path.to_path_buf()))?;
        Ok(repo.diff(path, rev_a, rev_b)?)
    }

    /// History for one path, or the whole repository when `path` is `None`.
    pub fn log_vcs(
        &self,
        path: Option<&Path>,
        since: &str,
    ) -> Result<Vec<VcsLogEntry>, TreeError> {
        let mut state = self.lock();
        let repo = match path {
            Some(path) => {
                let id = state.file_node(path)?;
                state
                    .repo_for(id)
                    .ok_or_else(|| TreeError::NoRepo(path.to_path_buf()))?
            }
            None => {
                let root = state.tree.root();
                state
                    .repo_for(root)
                    .ok_or_else(|| TreeError::NoRepo(state.tree.absolute_root().to_path_buf()))?
            }
        };
        Ok(repo.log(path, since)?)
    }

    pub fn blame_vcs(&self, path: &Path) -> Result<String, TreeError> {
        let mut state = self.lock();
        let id = state.file_node(path)?;
        let repo = state
            .repo_for(id)
            .ok_or_else(|| TreeError::NoRepo(path.to_path_buf()))?;
        Ok(repo.blame(path)?)
    }

    pub fn node_vcs_status(&self, path: &Path) -> Option<VcsStatus> {
        let mut state = self.lock();
        let id = state.tree.find_node_by_path(path)?;
        state.tree.get(id)?.vcs()
    }

    pub fn node_info(&self, path: &Path) -> Option<FileInfo> {
        let mut state = self.lock();
        let id = state.tree.find_node_by_path(path)?;
        state.tree.get(id).map(|n| n.info().clone())
    }

    /// The loaded tree flattened by open state, for rendering.
    pub fn flatten_rows(&self) -> Vec<TreeRow> {
        self.lock().tree.flatten_rows()
    }

    /// Snapshot of the persisted per-directory flags, for saving alongside
    /// application state.
    pub fn dir_state_snapshot(&self) -> DirStateMap {
        self.lock().dirs.clone()
    }

    /// Register a change listener. Disconnected receivers are dropped on
    /// the next send.
    pub fn subscribe(&self) -> mpsc::Receiver<TreeEvent> {
        let (tx, rx) = mpsc::channel();
        self.lock().subscribers.push(tx);
        rx
    }
}

impl Drop for FileTreeSync {
    fn drop(&mut self) {
        let _ = self.watch_tx.send(WatchMsg::Stop);
        if let Some(handle) = self.dispatcher.take() {
            let _ = handle.join();
        }
    }
}

impl TreeState {
    fn rel_key(&self, path: &Path) -> String {
        let root = self.tree.absolute_root();
        match path.strip_prefix(root) {
            Ok(rel) if rel.as_os_str().is_empty() => ".".to_string(),
            Ok(rel) => rel.to_string_lossy().replace('\\', "/"),
            Err(_) => path.to_string_lossy().into_owned(),
        }
    }

    fn emit(&mut self, event: TreeEvent) {
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn dir_node(&mut self, path: &Path) -> Result<NodeId, TreeError> {
        let id = self
            .tree
            .find_node_by_path(path)
            .ok_or_else(|| TreeError::NotFound(path.to_path_buf()))?;
        if !self.tree.get(id).is_some_and(|n| n.is_dir()) {
            return Err(TreeError::NotADirectory(path.to_path_buf()));
        }
        Ok(id)
    }

    fn file_node(&mut self, path: &Path) -> Result<NodeId, TreeError> {
        if let Some(id) = self.tree.find_node_by_path(path) {
            return Ok(id);
        }
        if let Some(id) = self.find_ext_file(path) {
            return Ok(id);
        }
        Err(TreeError::NotFound(path.to_path_buf()))
    }

    fn find_ext_file(&self, path: &Path) -> Option<NodeId> {
        let ext = self.externals?;
        self.tree
            .children_ordered(ext)
            .into_iter()
            .find(|id| self.tree.get(*id).is_some_and(|n| n.info().path == path))
    }

    fn ensure_externals_node(&mut self) -> Result<NodeId, TreeError> {
        if let Some(ext) = self.externals {
            if self.tree.contains(ext) {
                return Ok(ext);
            }
        }
        let root = self.tree.root();
        let info = FileInfo {
            path: self.tree.absolute_root().join(EXTERNAL_FILES_NAME),
            name: OsString::from(EXTERNAL_FILES_NAME),
            kind: EntryKind::Dir,
            cat: crate::models::file_info::FileCat::Folder,
            size: 0,
            modified: None,
            readonly: true,
            exec: false,
        };
        let ext = self.tree.insert_child(root, info, true)?;
        // external bucket renders first
        let mut order = vec![ext];
        order.extend(
            self.tree
                .children_ordered(root)
                .into_iter()
                .filter(|id| *id != ext),
        );
        self.tree.set_child_order(root, order);
        self.externals = Some(ext);
        Ok(ext)
    }

    fn repo_for(&self, id: NodeId) -> Option<Arc<dyn crate::vcs::VcsRepo>> {
        let rn = self.tree.repo_node_for(id)?;
        self.tree.get(rn)?.repo().map(|c| Arc::clone(&c.repo))
    }

    /// Insert a node for a freshly created filesystem entry, carrying the
    /// VCS status it starts with.
    fn insert_new_entry(
        &mut self,
        config: &TreeConfig,
        parent: NodeId,
        path: &Path,
    ) -> Result<NodeId, TreeError> {
        let info = FileInfo::probe(path)?;
        let is_file = !info.is_dir();
        let id = match self.tree.insert_child(parent, info, false) {
            Ok(id) => id,
            Err(FileTreeError::NameExists) => {
                // already mirrored by a concurrent reconcile
                return self
                    .tree
                    .find_node_by_path(path)
                    .ok_or_else(|| TreeError::NotFound(path.to_path_buf()));
            }
            Err(err) => return Err(err.into()),
        };
        if is_file && config.vcs == VcsMode::Auto && self.tree.repo_node_for(id).is_some() {
            if let Some(node) = self.tree.get_mut(id) {
                node.set_vcs(Some(VcsStatus::Untracked));
            }
        }
        self.reconcile_dir(config, parent)?;
        Ok(id)
    }

    /// Re-read one directory and fold the result into the arena: nodes are
    /// reused by name, stale ones deleted, new ones inserted, and the
    /// presentation order rewritten per the sort policy. Open child
    /// directories are reconciled recursively.
    fn reconcile_dir(&mut self, config: &TreeConfig, id: NodeId) -> Result<(), TreeError> {
        let dir_path = self.tree.full_path(id);
        let rel = self.rel_key(&dir_path);

        let mut entries: Vec<FileInfo> = Vec::new();
        for entry in fs::read_dir(&dir_path)? {
            let entry = entry?;
            let path = entry.path();
            // dangling symlinks and probe races are skipped, not fatal
            let Ok(entry_info) = FileInfo::probe(&path) else {
                continue;
            };
            if !config.admits(&path, &entry_info) {
                continue;
            }
            entries.push(entry_info);
        }

        let by_mod_time = self.dirs.sort_by_mod_time(&rel) || config.sort_by_mod_time;
        sort_entries(&mut entries, by_mod_time, config.dirs_on_top);

        let mut seen: FxHashSet<OsString> = FxHashSet::default();
        let mut order: Vec<NodeId> = Vec::with_capacity(entries.len());
        for entry_info in entries {
            seen.insert(entry_info.name.clone());
            match self.tree.child_by_name(id, &entry_info.name) {
                Some(child)
                    if self.tree.get(child).map(|n| n.is_dir()) == Some(entry_info.is_dir()) =>
                {
                    self.tree.update_info(child, entry_info);
                    order.push(child);
                }
                Some(child) => {
                    // same name, different kind: identity does not survive
                    self.tree.delete(child)?;
                    order.push(self.tree.insert_child(id, entry_info, false)?);
                }
                None => {
                    order.push(self.tree.insert_child(id, entry_info, false)?);
                }
            }
        }

        for child in self.tree.children_ordered(id) {
            let Some(node) = self.tree.get(child) else {
                continue;
            };
            if node.is_external() {
                continue;
            }
            if !seen.contains(node.name()) {
                self.tree.delete(child)?;
            }
        }

        // the external bucket, if parented here, stays first
        let externals: Vec<NodeId> = self
            .tree
            .children_ordered(id)
            .into_iter()
            .filter(|c| self.tree.get(*c).is_some_and(|n| n.is_external()))
            .collect();
        let mut full_order = externals;
        full_order.extend(order.iter().copied());
        self.tree.set_child_order(id, full_order);

        self.dirs.mark(&rel);
        if let Err(err) = self.watcher.watch_dir(&dir_path) {
            warn!(path = %dir_path.display(), %err, "watch failed");
        }

        // assign cached VCS statuses to file children
        let mut statuses: Vec<(NodeId, VcsStatus)> = Vec::new();
        for &child in &order {
            let Some(node) = self.tree.get(child) else {
                continue;
            };
            if node.is_dir() || node.vcs().is_some() {
                continue;
            }
            if let Some(rn) = self.tree.repo_node_for(child) {
                let path = self.tree.path_of(child);
                if let Some(cache) = self.tree.get(rn).and_then(|n| n.repo()) {
                    statuses.push((child, cache.status_of(&path)));
                }
            }
        }
        for (child, status) in statuses {
            if let Some(node) = self.tree.get_mut(child) {
                node.set_vcs(Some(status));
            }
        }

        // descend into child directories
        for child in order {
            if !self.tree.get(child).is_some_and(|n| n.is_dir()) {
                continue;
            }
            let child_path = self.tree.full_path(child);
            let child_rel = self.rel_key(&child_path);
            self.dirs.mark(&child_rel);

            if config.vcs == VcsMode::Auto && self.tree.repo_node_for(child).is_none() {
                if let Some(repo) = detect_repo(&child_path) {
                    info!(root = %repo.root().display(), "nested repository detected");
                    if let Some(node) = self.tree.get_mut(child) {
                        node.set_repo(Some(RepoCache::new(repo)));
                    }
                }
            }

            if self.dirs.is_open(&child_rel) {
                self.tree.expand(child);
                // a child that fails to read keeps its last known-good
                // contents; the failure never aborts the parent's pass
                if let Err(err) = self.reconcile_dir(config, child) {
                    warn!(path = %child_path.display(), %err, "child reconcile failed");
                }
            } else {
                self.tree.collapse(child);
            }
        }

        Ok(())
    }

    /// Open and load every directory on the way from the root down to
    /// `dir`, reconcile the final one, and return its node. Stops early at
    /// the nearest still-existing ancestor when `dir` is gone from disk.
    fn dirs_to(&mut self, config: &TreeConfig, dir: &Path) -> Result<NodeId, TreeError> {
        let root_path = self.tree.absolute_root().to_path_buf();
        let rel = dir
            .strip_prefix(&root_path)
            .map_err(|_| TreeError::NotFound(dir.to_path_buf()))?
            .to_path_buf();

        let mut id = self.tree.root();
        let mut cur = root_path;
        for comp in rel.components() {
            cur.push(comp);
            if !cur.is_dir() {
                break;
            }
            let name = comp.as_os_str().to_os_string();
            let child = match self.tree.child_by_name(id, &name) {
                Some(child) => child,
                None => {
                    self.reconcile_dir(config, id)?;
                    self.tree
                        .child_by_name(id, &name)
                        .ok_or_else(|| TreeError::NotFound(dir.to_path_buf()))?
                }
            };
            let rel_key = self.rel_key(&cur);
            self.dirs.set_open(&rel_key, true);
            self.tree.expand(child);
            id = child;
        }
        self.reconcile_dir(config, id)?;
        Ok(id)
    }

    fn open_all_under(&mut self, config: &TreeConfig, id: NodeId) -> Result<(), TreeError> {
        let path = self.tree.full_path(id);
        let rel = self.rel_key(&path);
        self.dirs.set_open(&rel, true);
        self.tree.expand(id);
        self.reconcile_dir(config, id)?;
        for child in self.tree.children_ordered(id) {
            if self
                .tree
                .get(child)
                .is_some_and(|n| n.is_dir() && !n.is_external())
            {
                self.open_all_under(config, child)?;
            }
        }
        Ok(())
    }

    /// Re-run the batched status query for every repository in the tree and
    /// re-annotate file nodes from the fresh caches.
    fn refresh_vcs(&mut self) {
        let repo_nodes: Vec<NodeId> = self
            .tree
            .node_ids()
            .filter(|id| self.tree.get(*id).is_some_and(|n| n.repo().is_some()))
            .collect();
        if repo_nodes.is_empty() {
            return;
        }

        for &rn in &repo_nodes {
            let Some(repo) = self.tree.get(rn).and_then(|n| n.repo()).map(|c| Arc::clone(&c.repo))
            else {
                continue;
            };
            match repo.status_batch() {
                Ok(statuses) => {
                    if let Some(cache) = self.tree.get_mut(rn).and_then(|n| n.repo_mut()) {
                        cache.files = statuses.into_iter().collect();
                    }
                }
                Err(err) => warn!(%err, "status query failed"),
            }
        }

        let mut assignments: Vec<(NodeId, VcsStatus)> = Vec::new();
        for id in self.tree.node_ids().collect::<Vec<_>>() {
            let Some(node) = self.tree.get(id) else {
                continue;
            };
            if node.is_dir() || node.is_external() {
                continue;
            }
            let Some(rn) = self.tree.repo_node_for(id) else {
                continue;
            };
            let path = self.tree.path_of(id);
            let Some(cache) = self.tree.get(rn).and_then(|n| n.repo()) else {
                continue;
            };
            let mut status = cache.status_of(&path);
            // keep the optimistic flip until the backend confirms
            if status == VcsStatus::Stored
                && node.vcs() == Some(VcsStatus::Modified)
                && node.buffer().is_some_and(|b| b.is_dirty())
            {
                status = VcsStatus::Modified;
            }
            assignments.push((id, status));
        }
        for (id, status) in assignments {
            if let Some(node) = self.tree.get_mut(id) {
                node.set_vcs(Some(status));
            }
        }
    }

    /// Keep watches only for directories that are loaded and open.
    fn prune_watches(&mut self) {
        let mut keep: FxHashSet<PathBuf> = FxHashSet::default();
        keep.insert(self.tree.absolute_root().to_path_buf());
        let ids: Vec<NodeId> = self.tree.node_ids().collect();
        for id in ids {
            let Some(node) = self.tree.get(id) else {
                continue;
            };
            if node.is_dir() && !node.is_external() && self.tree.is_expanded(id) {
                keep.insert(self.tree.path_of(id));
            }
        }
        self.watcher.retain_watched(&keep);
    }

    /// One watcher-triggered update: debounce, re-validate, reconcile.
    fn handle_watched_dir(&mut self, config: &TreeConfig, dir: &Path) {
        if let Some((last, at)) = &self.last_update {
            if last == dir && at.elapsed() < config.debounce {
                return;
            }
        }

        let root = self.tree.absolute_root().to_path_buf();
        if !dir.starts_with(&root) {
            return;
        }
        // walk up to the nearest directory that still exists
        let mut target = dir.to_path_buf();
        while !target.is_dir() {
            if target == root {
                return;
            }
            match target.parent() {
                Some(parent) => target = parent.to_path_buf(),
                None => return,
            }
        }

        let Some(id) = self.tree.find_node_by_path(&target) else {
            return;
        };
        if !(id == self.tree.root() || self.tree.is_expanded(id)) {
            return;
        }

        if let Err(err) = self.reconcile_dir(config, id) {
            warn!(path = %target.display(), %err, "watched reconcile failed");
            return;
        }
        self.refresh_vcs();
        self.last_update = Some((dir.to_path_buf(), Instant::now()));
        self.emit(TreeEvent::DirChanged { path: target });
    }
}

fn sort_entries(entries: &mut [FileInfo], by_mod_time: bool, dirs_on_top: bool) {
    entries.sort_by(|a, b| {
        if dirs_on_top && a.is_dir() != b.is_dir() {
            return b.is_dir().cmp(&a.is_dir());
        }
        if by_mod_time {
            // newest first, name as tiebreak
            b.modified
                .cmp(&a.modified)
                .then_with(|| a.name.cmp(&b.name))
        } else {
            a.name.cmp(&b.name)
        }
    });
}

fn run_dispatcher(inner: Arc<Inner>, rx: mpsc::Receiver<WatchMsg>) {
    debug!("dispatcher started");
    for msg in rx {
        let event = match msg {
            WatchMsg::Stop => break,
            WatchMsg::Fs(event) => event,
        };
        for delta in normalize_notify_event(event) {
            let mut dirs: Vec<PathBuf> = Vec::new();
            match &delta {
                FsDelta::Renamed { from, to } => {
                    if let Some(parent) = from.parent() {
                        dirs.push(parent.to_path_buf());
                    }
                    if let Some(parent) = to.parent() {
                        if !dirs.contains(&parent.to_path_buf()) {
                            dirs.push(parent.to_path_buf());
                        }
                    }
                }
                other => {
                    if let Some(parent) = other.touched_path().parent() {
                        dirs.push(parent.to_path_buf());
                    }
                }
            }

            let mut state = match inner.state.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            for dir in dirs {
                state.handle_watched_dir(&inner.config, &dir);
            }
        }
    }
    debug!("dispatcher stopped");
}
