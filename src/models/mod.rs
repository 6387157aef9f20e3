//! Data model layer: metadata snapshots, persisted view state, the tree arena.

pub mod dir_state;
pub mod file_info;
pub mod file_tree;

pub use dir_state::{DirFlags, DirStateMap};
pub use file_info::{duplicate_path, EntryKind, FileCat, FileInfo};
pub use file_tree::{
    should_ignore, FileTree, FileTreeError, Node, NodeId, RepoCache, TreeRow, EXTERNAL_FILES_NAME,
};
