//! Version-control port: status kinds, the repository trait, detection.
//!
//! The tree only ever consumes this interface; when no repository is
//! detected the overlay is absent and browsing is plain POSIX.

pub mod git;

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Per-file status as annotated on tree nodes.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum VcsStatus {
    /// Not known to the repository.
    Untracked,
    /// Tracked, no local changes.
    Stored,
    /// Tracked, local modifications.
    Modified,
    /// Staged for first commit.
    Added,
    /// Staged for removal.
    Deleted,
    /// Merge conflict.
    Conflicted,
    /// Updated upstream, not yet merged locally.
    Updated,
}

impl VcsStatus {
    pub fn marker(self) -> char {
        match self {
            Self::Untracked => '?',
            Self::Stored => ' ',
            Self::Modified => 'M',
            Self::Added => 'A',
            Self::Deleted => 'D',
            Self::Conflicted => 'U',
            Self::Updated => '^',
        }
    }
}

#[derive(Debug)]
pub enum VcsError {
    NotARepo(PathBuf),
    /// The backend command ran and failed; stderr is captured.
    CommandFailed { command: String, stderr: String },
    Io(io::Error),
}

impl fmt::Display for VcsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VcsError::NotARepo(path) => {
                write!(f, "no repository at or above {}", path.display())
            }
            VcsError::CommandFailed { command, stderr } => {
                write!(f, "{command} failed: {}", stderr.trim_end())
            }
            VcsError::Io(err) => write!(f, "vcs io error: {err}"),
        }
    }
}

impl std::error::Error for VcsError {}

impl From<io::Error> for VcsError {
    fn from(err: io::Error) -> Self {
        VcsError::Io(err)
    }
}

/// One commit in a file's history.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VcsLogEntry {
    pub rev: String,
    pub author: String,
    pub date: String,
    pub message: String,
}

/// The consumed repository interface. One batched status query covers the
/// whole repo; per-file status queries are deliberately absent.
pub trait VcsRepo: Send + Sync {
    /// Working-tree root this repository was detected at.
    fn root(&self) -> &Path;

    /// Backend name ("git", ...), for messages.
    fn kind(&self) -> &'static str;

    /// Status of every non-Stored file in the repository, in one query.
    /// Files absent from the result are Stored.
    fn status_batch(&self) -> Result<Vec<(PathBuf, VcsStatus)>, VcsError>;

    fn add(&self, path: &Path) -> Result<(), VcsError>;

    /// Remove from both the repository and the working tree.
    fn remove(&self, path: &Path) -> Result<(), VcsError>;

    fn commit(&self, path: &Path, message: &str) -> Result<(), VcsError>;

    /// Discard local modifications to `path`.
    fn revert(&self, path: &Path) -> Result<(), VcsError>;

    /// Rename preserving history.
    fn move_file(&self, src: &Path, dst: &Path) -> Result<(), VcsError>;

    /// History for one path, or the whole repo when `path` is `None`.
    /// `since` is a backend date expression; empty means unbounded.
    fn log(&self, path: Option<&Path>, since: &str) -> Result<Vec<VcsLogEntry>, VcsError>;

    /// Unified diff of `path` between two revisions; empty revision means
    /// HEAD for `rev_a` and the working tree for `rev_b`.
    fn diff(&self, path: &Path, rev_a: &str, rev_b: &str) -> Result<String, VcsError>;

    fn blame(&self, path: &Path) -> Result<String, VcsError>;
}

/// Probe `path` for a repository root. Returns `None` when the directory is
/// not itself the root of any supported VCS (ancestors are the caller's
/// concern: the tree walks upward through its own nodes).
pub fn detect_repo(path: &Path) -> Option<Arc<dyn VcsRepo>> {
    if path.join(".git").exists() {
        return Some(Arc::new(git::GitRepo::new(path.to_path_buf())));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detect_requires_git_dir() {
        let dir = tempfile::tempdir().expect("create tempdir");
        assert!(detect_repo(dir.path()).is_none());

        std::fs::create_dir(dir.path().join(".git")).expect("mkdir");
        let repo = detect_repo(dir.path()).expect("detected");
        assert_eq!(repo.kind(), "git");
        assert_eq!(repo.root(), dir.path());
    }

    #[test]
    fn status_markers_are_distinct() {
        let all = [
            VcsStatus::Untracked,
            VcsStatus::Stored,
            VcsStatus::Modified,
            VcsStatus::Added,
            VcsStatus::Deleted,
            VcsStatus::Conflicted,
            VcsStatus::Updated,
        ];
        let mut markers: Vec<char> = all.iter().map(|s| s.marker()).collect();
        markers.sort_unstable();
        markers.dedup();
        assert_eq!(markers.len(), all.len());
    }
}
