//! Arena-backed file tree: nodes own their children, everything else is an id.

use crate::buffer::EditBuffer;
use crate::models::file_info::{EntryKind, FileInfo};
use crate::vcs::{VcsRepo, VcsStatus};
use rustc_hash::{FxHashMap, FxHashSet};
use slotmap::{new_key_type, SlotMap};
use std::collections::{BTreeMap, HashMap};
use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

new_key_type! { pub struct NodeId; }

/// Name of the synthetic directory node holding external files.
pub const EXTERNAL_FILES_NAME: &str = "[external files]";

#[derive(Debug)]
pub enum FileTreeError {
    ParentNotDirectory,
    NameExists,
    MoveIntoDescendant,
    InvalidNodeId,
}

impl fmt::Display for FileTreeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileTreeError::ParentNotDirectory => write!(f, "parent is not a directory"),
            FileTreeError::NameExists => write!(f, "name already exists in parent"),
            FileTreeError::MoveIntoDescendant => {
                write!(f, "cannot move node into its own subtree")
            }
            FileTreeError::InvalidNodeId => write!(f, "invalid node id"),
        }
    }
}

impl std::error::Error for FileTreeError {}

/// Repository handle plus the batched status cache, held only by the
/// directory node that is the repository root for its subtree.
pub struct RepoCache {
    pub repo: Arc<dyn VcsRepo>,
    /// Paths absent from the map are Stored.
    pub files: FxHashMap<PathBuf, VcsStatus>,
}

impl RepoCache {
    pub fn new(repo: Arc<dyn VcsRepo>) -> Self {
        Self {
            repo,
            files: FxHashMap::default(),
        }
    }

    pub fn status_of(&self, path: &Path) -> VcsStatus {
        self.files.get(path).copied().unwrap_or(VcsStatus::Stored)
    }
}

/// Ordered children of a directory: name-keyed for the reconciliation diff,
/// order vector for presentation (reconciliation rewrites it per policy).
#[derive(Default)]
struct Children {
    by_name: BTreeMap<OsString, NodeId>,
    order: Vec<NodeId>,
}

pub struct Node {
    name: OsString,
    parent: Option<NodeId>,
    children: Option<Children>,
    info: FileInfo,
    buffer: Option<EditBuffer>,
    vcs: Option<VcsStatus>,
    repo: Option<RepoCache>,
    external: bool,
}

impl Node {
    fn new(info: FileInfo, parent: Option<NodeId>, external: bool) -> Self {
        let children = match info.kind {
            EntryKind::Dir => Some(Children::default()),
            EntryKind::File => None,
        };
        Self {
            name: info.name.clone(),
            parent,
            children,
            info,
            buffer: None,
            vcs: None,
            repo: None,
            external,
        }
    }

    pub fn name(&self) -> &OsString {
        &self.name
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn is_dir(&self) -> bool {
        self.info.kind == EntryKind::Dir
    }

    pub fn info(&self) -> &FileInfo {
        &self.info
    }

    pub fn is_external(&self) -> bool {
        self.external
    }

    pub fn vcs(&self) -> Option<VcsStatus> {
        self.vcs
    }

    pub fn set_vcs(&mut self, status: Option<VcsStatus>) {
        self.vcs = status;
    }

    pub fn buffer(&self) -> Option<&EditBuffer> {
        self.buffer.as_ref()
    }

    pub fn buffer_mut(&mut self) -> Option<&mut EditBuffer> {
        self.buffer.as_mut()
    }

    pub fn set_buffer(&mut self, buffer: Option<EditBuffer>) {
        self.buffer = buffer;
    }

    pub fn repo(&self) -> Option<&RepoCache> {
        self.repo.as_ref()
    }

    pub fn repo_mut(&mut self) -> Option<&mut RepoCache> {
        self.repo.as_mut()
    }

    pub fn set_repo(&mut self, repo: Option<RepoCache>) {
        self.repo = repo;
    }
}

/// Row for GUI consumers: the loaded tree flattened by open state.
#[derive(Clone, Debug)]
pub struct TreeRow {
    pub id: NodeId,
    pub depth: u16,
    pub name: OsString,
    pub is_dir: bool,
    pub is_open: bool,
    pub vcs: Option<VcsStatus>,
    pub has_buffer: bool,
}

pub struct FileTree {
    arena: SlotMap<NodeId, Node>,
    root: NodeId,
    expanded: FxHashSet<NodeId>,
    absolute_root: PathBuf,
    path_cache: HashMap<NodeId, PathBuf>,
    id_by_path: HashMap<PathBuf, NodeId>,
}

impl FileTree {
    pub fn new_with_root(info: FileInfo) -> Self {
        let absolute_root = info.path.clone();
        let mut arena = SlotMap::with_key();
        let root = arena.insert(Node::new(info, None, false));

        let mut expanded = FxHashSet::default();
        expanded.insert(root);

        Self {
            arena,
            root,
            expanded,
            absolute_root,
            path_cache: HashMap::new(),
            id_by_path: HashMap::new(),
        }
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn absolute_root(&self) -> &Path {
        &self.absolute_root
    }

    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.arena.get(id)
    }

    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.arena.get_mut(id)
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.arena.contains_key(id)
    }

    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.arena.keys()
    }

    pub fn insert_child(
        &mut self,
        parent: NodeId,
        info: FileInfo,
        external: bool,
    ) -> Result<NodeId, FileTreeError> {
        let name = info.name.clone();
        {
            let parent_ro = self.arena.get(parent).ok_or(FileTreeError::InvalidNodeId)?;
            let children_ro = parent_ro
                .children
                .as_ref()
                .ok_or(FileTreeError::ParentNotDirectory)?;
            if children_ro.by_name.contains_key(&name) {
                return Err(FileTreeError::NameExists);
            }
        }

        let id = self.arena.insert(Node::new(info, Some(parent), external));

        let parent_node = self
            .arena
            .get_mut(parent)
            .ok_or(FileTreeError::InvalidNodeId)?;
        let children = parent_node
            .children
            .as_mut()
            .ok_or(FileTreeError::ParentNotDirectory)?;
        children.by_name.insert(name, id);
        children.order.push(id);

        Ok(id)
    }

    pub fn child_by_name(&self, parent: NodeId, name: &OsString) -> Option<NodeId> {
        self.arena
            .get(parent)?
            .children
            .as_ref()?
            .by_name
            .get(name)
            .copied()
    }

    /// Children in presentation order.
    pub fn children_ordered(&self, parent: NodeId) -> Vec<NodeId> {
        self.arena
            .get(parent)
            .and_then(|n| n.children.as_ref())
            .map(|c| c.order.clone())
            .unwrap_or_default()
    }

    pub fn child_names(&self, parent: NodeId) -> Vec<OsString> {
        self.children_ordered(parent)
            .into_iter()
            .filter_map(|id| self.arena.get(id).map(|n| n.name.clone()))
            .collect()
    }

    /// Rewrite a directory's presentation order. Ids that are not current
    /// children are dropped; children missing from `order` keep their old
    /// relative position at the tail.
    pub fn set_child_order(&mut self, parent: NodeId, order: Vec<NodeId>) {
        let Some(children) = self.arena.get_mut(parent).and_then(|n| n.children.as_mut())
        else {
            return;
        };
        let current: FxHashSet<NodeId> = children.by_name.values().copied().collect();
        let mut next: Vec<NodeId> = order
            .into_iter()
            .filter(|id| current.contains(id))
            .collect();
        let placed: FxHashSet<NodeId> = next.iter().copied().collect();
        for id in &children.order {
            if !placed.contains(id) {
                next.push(*id);
            }
        }
        children.order = next;
    }

    /// Compute the full path for `id`, caching the result. External file
    /// nodes carry their own absolute path.
    pub fn full_path(&mut self, id: NodeId) -> PathBuf {
        if id == self.root {
            self.id_by_path
                .insert(self.absolute_root.clone(), self.root);
            return self.absolute_root.clone();
        }
        if let Some(cached) = self.path_cache.get(&id) {
            return cached.clone();
        }

        let path = self.path_of(id);
        self.path_cache.insert(id, path.clone());
        self.id_by_path.insert(path.clone(), id);
        path
    }

    /// Non-caching path computation, usable with a shared borrow.
    pub fn path_of(&self, id: NodeId) -> PathBuf {
        if id == self.root {
            return self.absolute_root.clone();
        }
        if let Some(node) = self.arena.get(id) {
            if node.external && !node.is_dir() {
                return node.info.path.clone();
            }
        }

        let mut components = vec![];
        let mut current = id;
        while let Some(node) = self.arena.get(current) {
            if let Some(parent) = node.parent {
                components.push(node.name.as_os_str());
                current = parent;
            } else {
                break;
            }
        }

        let mut path = self.absolute_root.clone();
        for comp in components.iter().rev() {
            path.push(comp);
        }
        path
    }

    fn invalidate_path_cache_subtree(&mut self, id: NodeId) {
        let mut stack = vec![id];
        while let Some(node_id) = stack.pop() {
            if let Some(path) = self.path_cache.remove(&node_id) {
                self.id_by_path.remove(&path);
            }
            if let Some(children) = self.arena.get(node_id).and_then(|n| n.children.as_ref()) {
                stack.extend(children.by_name.values().copied());
            }
        }
    }

    fn is_ancestor(&self, ancestor: NodeId, mut descendant: NodeId) -> bool {
        while let Some(node) = self.arena.get(descendant) {
            if let Some(parent) = node.parent {
                if parent == ancestor {
                    return true;
                }
                descendant = parent;
            } else {
                break;
            }
        }
        false
    }

    /// Rename within the same parent. The caller refreshes `info` afterwards
    /// via [`FileTree::update_info`].
    pub fn rename(&mut self, id: NodeId, new_name: OsString) -> Result<(), FileTreeError> {
        let (parent, old_name) = {
            let node = self.arena.get(id).ok_or(FileTreeError::InvalidNodeId)?;
            (node.parent, node.name.clone())
        };

        if old_name == new_name {
            return Ok(());
        }

        if let Some(parent_id) = parent {
            let parent_node = self
                .arena
                .get_mut(parent_id)
                .ok_or(FileTreeError::InvalidNodeId)?;
            let children = parent_node
                .children
                .as_mut()
                .ok_or(FileTreeError::ParentNotDirectory)?;

            if children.by_name.contains_key(&new_name) {
                return Err(FileTreeError::NameExists);
            }
            children.by_name.remove(&old_name);
            children.by_name.insert(new_name.clone(), id);
        }

        let node = self.arena.get_mut(id).ok_or(FileTreeError::InvalidNodeId)?;
        node.name = new_name.clone();
        node.info.name = new_name;

        self.invalidate_path_cache_subtree(id);
        Ok(())
    }

    pub fn move_to(&mut self, id: NodeId, new_parent: NodeId) -> Result<(), FileTreeError> {
        if id == new_parent || self.is_ancestor(id, new_parent) {
            return Err(FileTreeError::MoveIntoDescendant);
        }

        let (name, old_parent) = {
            let node = self.arena.get(id).ok_or(FileTreeError::InvalidNodeId)?;
            (node.name.clone(), node.parent)
        };

        if old_parent == Some(new_parent) {
            return Ok(());
        }

        {
            let target = self
                .arena
                .get(new_parent)
                .ok_or(FileTreeError::InvalidNodeId)?;
            let children = target
                .children
                .as_ref()
                .ok_or(FileTreeError::ParentNotDirectory)?;
            if children.by_name.contains_key(&name) {
                return Err(FileTreeError::NameExists);
            }
        }

        if let Some(old_parent_id) = old_parent {
            if let Some(children) = self
                .arena
                .get_mut(old_parent_id)
                .and_then(|n| n.children.as_mut())
            {
                children.by_name.remove(&name);
                children.order.retain(|c| *c != id);
            }
        }

        let children = self
            .arena
            .get_mut(new_parent)
            .and_then(|n| n.children.as_mut())
            .ok_or(FileTreeError::ParentNotDirectory)?;
        children.by_name.insert(name, id);
        children.order.push(id);

        self.arena
            .get_mut(id)
            .ok_or(FileTreeError::InvalidNodeId)?
            .parent = Some(new_parent);

        self.invalidate_path_cache_subtree(id);
        Ok(())
    }

    /// Delete `id` and its whole subtree, dropping buffers and repo caches.
    pub fn delete(&mut self, id: NodeId) -> Result<(), FileTreeError> {
        if id == self.root {
            return Err(FileTreeError::InvalidNodeId);
        }

        let (parent, name) = {
            let node = self.arena.get(id).ok_or(FileTreeError::InvalidNodeId)?;
            (node.parent, node.name.clone())
        };

        if let Some(parent_id) = parent {
            if let Some(children) = self
                .arena
                .get_mut(parent_id)
                .and_then(|n| n.children.as_mut())
            {
                children.by_name.remove(&name);
                children.order.retain(|c| *c != id);
            }
        }

        self.recursive_remove(id);
        Ok(())
    }

    fn recursive_remove(&mut self, id: NodeId) {
        let children = self
            .arena
            .get_mut(id)
            .and_then(|n| n.children.take())
            .map(|c| c.order)
            .unwrap_or_default();
        for child in children {
            self.recursive_remove(child);
        }

        self.expanded.remove(&id);
        if let Some(path) = self.path_cache.remove(&id) {
            self.id_by_path.remove(&path);
        }
        // buffer and repo cache drop with the node
        self.arena.remove(id);
    }

    pub fn update_info(&mut self, id: NodeId, info: FileInfo) {
        if let Some(node) = self.arena.get_mut(id) {
            node.info = info;
        }
    }

    pub fn expand(&mut self, id: NodeId) {
        if self.arena.get(id).is_some_and(|n| n.is_dir()) {
            self.expanded.insert(id);
        }
    }

    pub fn collapse(&mut self, id: NodeId) {
        self.expanded.remove(&id);
    }

    pub fn is_expanded(&self, id: NodeId) -> bool {
        self.expanded.contains(&id)
    }

    /// Resolve a path to a node by walking name components from the root.
    pub fn find_node_by_path(&mut self, path: &Path) -> Option<NodeId> {
        if path == self.absolute_root {
            return Some(self.root);
        }
        if let Some(id) = self.id_by_path.get(path).copied() {
            if self.arena.contains_key(id) {
                return Some(id);
            }
            self.id_by_path.remove(path);
        }

        let relative = path.strip_prefix(&self.absolute_root).ok()?;
        let mut current = self.root;
        for component in relative.components() {
            let name = component.as_os_str();
            let children = self.arena.get(current)?.children.as_ref()?;
            current = *children.by_name.get(name)?;
        }

        self.path_cache.insert(current, path.to_path_buf());
        self.id_by_path.insert(path.to_path_buf(), current);
        Some(current)
    }

    /// First node whose full path ends with `suffix` (whole path components,
    /// not substrings). Directories match too.
    pub fn find_by_suffix(&self, suffix: &Path) -> Option<NodeId> {
        self.arena.keys().find(|&id| {
            let path = self.path_of(id);
            path.ends_with(suffix)
        })
    }

    /// Loaded nodes whose name contains `pattern`, sorted by path.
    pub fn files_matching(&self, pattern: &str, ignore_case: bool) -> Vec<NodeId> {
        let pattern = if ignore_case {
            pattern.to_lowercase()
        } else {
            pattern.to_string()
        };
        let mut out: Vec<NodeId> = self
            .arena
            .iter()
            .filter(|(_, node)| {
                let name = node.name.to_string_lossy();
                if ignore_case {
                    name.to_lowercase().contains(&pattern)
                } else {
                    name.contains(&pattern)
                }
            })
            .map(|(id, _)| id)
            .collect();
        out.sort_by_key(|id| self.path_of(*id));
        out
    }

    /// Nearest ancestor-or-self directory holding a repository handle.
    /// External nodes never belong to a repository.
    pub fn repo_node_for(&self, id: NodeId) -> Option<NodeId> {
        let mut current = Some(id);
        while let Some(cid) = current {
            let node = self.arena.get(cid)?;
            if node.external {
                return None;
            }
            if node.repo.is_some() {
                return Some(cid);
            }
            current = node.parent;
        }
        None
    }

    /// Flatten by open state for rendering; the root itself is omitted.
    pub fn flatten_rows(&self) -> Vec<TreeRow> {
        let mut result = Vec::new();
        let mut stack: Vec<(NodeId, u16)> = vec![(self.root, 0)];

        while let Some((id, depth)) = stack.pop() {
            let Some(node) = self.arena.get(id) else {
                continue;
            };
            if id != self.root {
                result.push(TreeRow {
                    id,
                    depth,
                    name: node.name.clone(),
                    is_dir: node.is_dir(),
                    is_open: self.expanded.contains(&id),
                    vcs: node.vcs,
                    has_buffer: node.buffer.is_some(),
                });
            }
            if self.expanded.contains(&id) {
                if let Some(children) = &node.children {
                    for child in children.order.iter().rev() {
                        stack.push((*child, depth + 1));
                    }
                }
            }
        }

        result
    }
}

pub fn should_ignore(name: &str) -> bool {
    matches!(
        name,
        ".DS_Store"
            | ".Spotlight-V100"
            | ".Trashes"
            | ".fseventsd"
            | ".TemporaryItems"
            | "Thumbs.db"
            | "desktop.ini"
            | ".git"
    )
}
