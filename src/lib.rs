//! ztree - live file-tree synchronization engine
//!
//! Module structure:
//! - models: data model (FileInfo, DirStateMap, FileTree arena)
//! - buffer: rope-backed edit buffers owned by tree nodes
//! - vcs: repository port and the git adapter
//! - watcher: per-directory filesystem watches over notify
//! - sync: the synchronized tree root and background dispatcher
//! - config: behavior knobs fixed at construction

pub mod buffer;
pub mod config;
pub mod models;
pub mod sync;
pub mod vcs;
pub mod watcher;

pub use buffer::EditBuffer;
pub use config::{TreeConfig, VcsMode};
pub use models::{DirFlags, DirStateMap, EntryKind, FileCat, FileInfo, NodeId, TreeRow};
pub use sync::{FileTreeSync, TreeError, TreeEvent};
pub use vcs::{VcsError, VcsLogEntry, VcsRepo, VcsStatus};
