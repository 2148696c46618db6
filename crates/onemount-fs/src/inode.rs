//! Inode graph - in-memory projection of the metadata catalog
//!
//! An arena of inodes keyed by FUSE node ID plus two secondary indexes:
//! `item id -> node id` and `(parent id, lowercased name) -> node id`.
//! Relations between inodes are index lookups, never owning pointers, so
//! there is no parent/child reference cycle and child state is always read
//! from a snapshot taken after the parent lookup completed.
//!
//! Node IDs are assigned monotonically on first insertion and survive
//! rename and ID reconciliation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::{Instant, SystemTime};

use dashmap::DashMap;

use onemount_core::domain::{Entry, ItemKind, ItemState};
use onemount_core::{ItemId, NodeId};

/// One inode in the arena.
pub struct Inode {
    node_id: NodeId,
    kind: ItemKind,
    id: RwLock<ItemId>,
    parent: RwLock<Option<ItemId>>,
    name: RwLock<String>,
    state: RwLock<ItemState>,
    size: AtomicU64,
    mtime: RwLock<SystemTime>,
    /// In-memory extended attributes outside the reserved namespace
    xattrs: Mutex<HashMap<String, Vec<u8>>>,
    /// Set by write paths; cleared once an upload is queued
    local_changes: AtomicBool,
    /// Body for synthetic nodes; writes to these never propagate
    virtual_content: Option<Vec<u8>>,
    /// When this directory's child listing was last refreshed from the server
    children_fetched: Mutex<Option<Instant>>,
    open_handles: AtomicU64,
}

impl Inode {
    fn from_entry(node_id: NodeId, entry: &Entry) -> Self {
        Self {
            node_id,
            kind: entry.kind,
            id: RwLock::new(entry.id.clone()),
            parent: RwLock::new(entry.parent_id.clone()),
            name: RwLock::new(entry.name.clone()),
            state: RwLock::new(entry.state),
            size: AtomicU64::new(entry.size),
            mtime: RwLock::new(system_time_from(entry.mtime)),
            xattrs: Mutex::new(HashMap::new()),
            local_changes: AtomicBool::new(false),
            virtual_content: None,
            children_fetched: Mutex::new(None),
            open_handles: AtomicU64::new(0),
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn id(&self) -> ItemId {
        self.id.read().unwrap().clone()
    }

    pub fn parent_id(&self) -> Option<ItemId> {
        self.parent.read().unwrap().clone()
    }

    pub fn name(&self) -> String {
        self.name.read().unwrap().clone()
    }

    pub fn kind(&self) -> ItemKind {
        self.kind
    }

    pub fn is_directory(&self) -> bool {
        matches!(self.kind, ItemKind::Directory)
    }

    pub fn state(&self) -> ItemState {
        *self.state.read().unwrap()
    }

    pub fn set_state(&self, state: ItemState) {
        *self.state.write().unwrap() = state;
    }

    pub fn size(&self) -> u64 {
        self.size.load(Ordering::SeqCst)
    }

    pub fn set_size(&self, size: u64) {
        self.size.store(size, Ordering::SeqCst);
    }

    pub fn mtime(&self) -> SystemTime {
        *self.mtime.read().unwrap()
    }

    pub fn set_mtime(&self, mtime: SystemTime) {
        *self.mtime.write().unwrap() = mtime;
    }

    pub fn is_virtual(&self) -> bool {
        self.virtual_content.is_some()
    }

    /// Body of a synthetic node.
    pub fn virtual_content(&self) -> Option<&[u8]> {
        self.virtual_content.as_deref()
    }

    pub fn has_local_changes(&self) -> bool {
        self.local_changes.load(Ordering::SeqCst)
    }

    pub fn set_local_changes(&self, value: bool) {
        self.local_changes.store(value, Ordering::SeqCst);
    }

    pub fn open_count(&self) -> u64 {
        self.open_handles.load(Ordering::SeqCst)
    }

    pub fn retain_handle(&self) {
        self.open_handles.fetch_add(1, Ordering::SeqCst);
    }

    pub fn release_handle(&self) {
        let _ = self
            .open_handles
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1));
    }

    /// Whether the cached child listing is younger than `ttl`.
    pub fn children_fresh(&self, ttl: std::time::Duration) -> bool {
        self.children_fetched
            .lock()
            .unwrap()
            .map(|at| at.elapsed() < ttl)
            .unwrap_or(false)
    }

    /// Marks the child listing as just refreshed.
    pub fn mark_children_fetched(&self) {
        *self.children_fetched.lock().unwrap() = Some(Instant::now());
    }

    // --- xattr map (outside the reserved namespace) ---

    pub fn xattr(&self, name: &str) -> Option<Vec<u8>> {
        self.xattrs.lock().unwrap().get(name).cloned()
    }

    pub fn set_xattr(&self, name: &str, value: Vec<u8>) {
        self.xattrs.lock().unwrap().insert(name.to_string(), value);
    }

    pub fn remove_xattr(&self, name: &str) -> bool {
        self.xattrs.lock().unwrap().remove(name).is_some()
    }

    pub fn xattr_names(&self) -> Vec<String> {
        self.xattrs.lock().unwrap().keys().cloned().collect()
    }
}

fn system_time_from(dt: chrono::DateTime<chrono::Utc>) -> SystemTime {
    let secs = dt.timestamp();
    let nanos = dt.timestamp_subsec_nanos();
    if secs >= 0 {
        SystemTime::UNIX_EPOCH + std::time::Duration::new(secs as u64, nanos)
    } else {
        SystemTime::UNIX_EPOCH
    }
}

/// Arena + indexes.
pub struct InodeGraph {
    by_node: DashMap<u64, std::sync::Arc<Inode>>,
    by_id: DashMap<ItemId, u64>,
    by_parent_name: DashMap<(ItemId, String), u64>,
    next_node: AtomicU64,
}

impl InodeGraph {
    #[must_use]
    pub fn new() -> Self {
        Self {
            by_node: DashMap::new(),
            by_id: DashMap::new(),
            by_parent_name: DashMap::new(),
            // 1 is reserved for the root
            next_node: AtomicU64::new(2),
        }
    }

    fn key_for(parent: &ItemId, name: &str) -> (ItemId, String) {
        (parent.clone(), name.to_lowercase())
    }

    /// Inserts or refreshes the projection of an entry.
    ///
    /// The node ID is allocated monotonically on first sight of the item ID
    /// and reused afterwards, so renames and refreshes keep it stable.
    pub fn upsert(&self, entry: &Entry) -> std::sync::Arc<Inode> {
        if let Some(node_id) = self.by_id.get(&entry.id).map(|r| *r) {
            if let Some(inode) = self.by_node.get(&node_id).map(|r| std::sync::Arc::clone(&r)) {
                self.refresh(&inode, entry);
                return inode;
            }
        }

        let node_id = if entry.is_root() {
            NodeId::ROOT
        } else {
            NodeId::new(self.next_node.fetch_add(1, Ordering::SeqCst))
        };
        let inode = std::sync::Arc::new(Inode::from_entry(node_id, entry));
        self.by_node.insert(node_id.get(), std::sync::Arc::clone(&inode));
        self.by_id.insert(entry.id.clone(), node_id.get());
        if let Some(parent) = &entry.parent_id {
            self.by_parent_name
                .insert(Self::key_for(parent, &entry.name), node_id.get());
        }
        inode
    }

    /// Updates an existing inode to match a committed entry, fixing the
    /// name index if the placement changed.
    fn refresh(&self, inode: &std::sync::Arc<Inode>, entry: &Entry) {
        let old_parent = inode.parent_id();
        let old_name = inode.name();

        inode.set_state(entry.state);
        inode.set_size(entry.size);
        inode.set_mtime(system_time_from(entry.mtime));

        let placement_changed = old_parent != entry.parent_id
            || old_name.to_lowercase() != entry.name.to_lowercase();
        if placement_changed {
            if let Some(old_parent) = old_parent {
                self.by_parent_name
                    .remove(&Self::key_for(&old_parent, &old_name));
            }
            if let Some(new_parent) = &entry.parent_id {
                self.by_parent_name
                    .insert(Self::key_for(new_parent, &entry.name), inode.node_id().get());
            }
        }
        *inode.parent.write().unwrap() = entry.parent_id.clone();
        *inode.name.write().unwrap() = entry.name.clone();
    }

    /// Registers a synthetic node under the root (e.g. volume info).
    pub fn insert_virtual(
        &self,
        root_id: &ItemId,
        name: &str,
        content: Vec<u8>,
    ) -> std::sync::Arc<Inode> {
        let node_id = NodeId::new(self.next_node.fetch_add(1, Ordering::SeqCst));
        let inode = std::sync::Arc::new(Inode {
            node_id,
            kind: ItemKind::File,
            id: RwLock::new(ItemId::local()),
            parent: RwLock::new(Some(root_id.clone())),
            name: RwLock::new(name.to_string()),
            state: RwLock::new(ItemState::Hydrated),
            size: AtomicU64::new(content.len() as u64),
            mtime: RwLock::new(SystemTime::now()),
            xattrs: Mutex::new(HashMap::new()),
            local_changes: AtomicBool::new(false),
            virtual_content: Some(content),
            children_fetched: Mutex::new(None),
            open_handles: AtomicU64::new(0),
        });
        self.by_node.insert(node_id.get(), std::sync::Arc::clone(&inode));
        self.by_id.insert(inode.id(), node_id.get());
        self.by_parent_name
            .insert(Self::key_for(root_id, name), node_id.get());
        inode
    }

    /// Inode by FUSE node ID.
    pub fn get(&self, node_id: u64) -> Option<std::sync::Arc<Inode>> {
        self.by_node.get(&node_id).map(|r| std::sync::Arc::clone(&r))
    }

    /// Inode by item ID.
    pub fn get_by_id(&self, id: &ItemId) -> Option<std::sync::Arc<Inode>> {
        let node_id = self.by_id.get(id).map(|r| *r)?;
        self.get(node_id)
    }

    /// Case-insensitive child lookup.
    pub fn lookup(&self, parent_id: &ItemId, name: &str) -> Option<std::sync::Arc<Inode>> {
        let node_id = self
            .by_parent_name
            .get(&Self::key_for(parent_id, name))
            .map(|r| *r)?;
        self.get(node_id)
    }

    /// Snapshot of a directory's child inodes.
    ///
    /// The list is copied out of the index before any child is touched, so
    /// callers never hold a parent-side lock while inspecting children.
    pub fn children_of(&self, parent_id: &ItemId) -> Vec<std::sync::Arc<Inode>> {
        let node_ids: Vec<u64> = self
            .by_parent_name
            .iter()
            .filter(|r| &r.key().0 == parent_id)
            .map(|r| *r.value())
            .collect();
        node_ids.into_iter().filter_map(|n| self.get(n)).collect()
    }

    /// Drops an item's projection. The node ID is never reused.
    pub fn remove(&self, id: &ItemId) {
        if let Some((_, node_id)) = self.by_id.remove(id) {
            if let Some((_, inode)) = self.by_node.remove(&node_id) {
                if let Some(parent) = inode.parent_id() {
                    self.by_parent_name
                        .remove(&Self::key_for(&parent, &inode.name()));
                }
            }
        }
    }

    /// Applies a rename/reparent to the projection; the node ID is stable.
    pub fn rename(&self, id: &ItemId, new_parent: &ItemId, new_name: &str) {
        if let Some(inode) = self.get_by_id(id) {
            if let Some(old_parent) = inode.parent_id() {
                self.by_parent_name
                    .remove(&Self::key_for(&old_parent, &inode.name()));
            }
            self.by_parent_name
                .insert(Self::key_for(new_parent, new_name), inode.node_id().get());
            *inode.parent.write().unwrap() = Some(new_parent.clone());
            *inode.name.write().unwrap() = new_name.to_string();
        }
    }

    /// ID reconciliation: re-keys the item index and every child's parent
    /// reference from `old` to `new`. The node ID does not change.
    pub fn move_id(&self, old: &ItemId, new: &ItemId) {
        let Some((_, node_id)) = self.by_id.remove(old) else {
            return;
        };
        self.by_id.insert(new.clone(), node_id);
        if let Some(inode) = self.get(node_id) {
            *inode.id.write().unwrap() = new.clone();
        }

        // child name-index keys referencing the old parent id
        let stale: Vec<((ItemId, String), u64)> = self
            .by_parent_name
            .iter()
            .filter(|r| &r.key().0 == old)
            .map(|r| (r.key().clone(), *r.value()))
            .collect();
        for (key, child_node) in stale {
            self.by_parent_name.remove(&key);
            self.by_parent_name.insert((new.clone(), key.1), child_node);
            if let Some(child) = self.get(child_node) {
                *child.parent.write().unwrap() = Some(new.clone());
            }
        }
    }

    /// Resolves a slash-separated path from the root, component by
    /// component, case-insensitively. Each step is an independent index
    /// lookup, so the walk is restartable.
    pub fn resolve_path(&self, root_id: &ItemId, path: &str) -> Option<std::sync::Arc<Inode>> {
        let mut current = self.get_by_id(root_id)?;
        for component in path.split('/').filter(|c| !c.is_empty()) {
            current = self.lookup(&current.id(), component)?;
        }
        Some(current)
    }

    /// Full path of an item from the root, walking the parent index.
    ///
    /// Returns `None` when the item (or any ancestor) is not projected.
    pub fn path_of(&self, id: &ItemId) -> Option<String> {
        let mut components = Vec::new();
        let mut current = self.get_by_id(id)?;
        loop {
            let Some(parent_id) = current.parent_id() else {
                break; // reached the root
            };
            components.push(current.name());
            current = self.get_by_id(&parent_id)?;
        }
        components.reverse();
        Some(format!("/{}", components.join("/")))
    }

    /// Number of inodes in the arena.
    pub fn len(&self) -> usize {
        self.by_node.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_node.is_empty()
    }
}

impl Default for InodeGraph {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn root_id() -> ItemId {
        ItemId::new("root").unwrap()
    }

    fn graph_with_root() -> InodeGraph {
        let graph = InodeGraph::new();
        graph.upsert(&Entry::root(root_id()));
        graph
    }

    fn file_entry(id: &str, parent: &ItemId, name: &str) -> Entry {
        let mut entry = Entry::new_local_file(parent.clone(), name).unwrap();
        entry.id = ItemId::new(id).unwrap();
        entry.pending_remote = false;
        entry
    }

    #[test]
    fn test_root_gets_node_one() {
        let graph = graph_with_root();
        let root = graph.get_by_id(&root_id()).unwrap();
        assert_eq!(root.node_id(), NodeId::ROOT);
        assert_eq!(graph.get(1).unwrap().id(), root_id());
    }

    #[test]
    fn test_node_ids_are_monotonic() {
        let graph = graph_with_root();
        let a = graph.upsert(&file_entry("a", &root_id(), "a.txt"));
        let b = graph.upsert(&file_entry("b", &root_id(), "b.txt"));
        assert!(b.node_id().get() > a.node_id().get());
        assert!(a.node_id().get() > NodeId::ROOT.get());
    }

    #[test]
    fn test_upsert_is_idempotent_per_id() {
        let graph = graph_with_root();
        let entry = file_entry("a", &root_id(), "a.txt");
        let first = graph.upsert(&entry);
        let mut updated = entry.clone();
        updated.size = 42;
        let second = graph.upsert(&updated);
        assert_eq!(first.node_id(), second.node_id());
        assert_eq!(first.size(), 42);
        assert_eq!(graph.len(), 2);
    }

    #[test]
    fn test_lookup_is_case_insensitive() {
        let graph = graph_with_root();
        graph.upsert(&file_entry("a", &root_id(), "Report.DOCX"));
        let found = graph.lookup(&root_id(), "report.docx").unwrap();
        assert_eq!(found.name(), "Report.DOCX");
        assert!(graph.lookup(&root_id(), "missing.txt").is_none());
    }

    #[test]
    fn test_rename_preserves_node_id() {
        let graph = graph_with_root();
        let inode = graph.upsert(&file_entry("a", &root_id(), "old.txt"));
        let node_id = inode.node_id();

        let dir = graph.upsert(&{
            let mut d = Entry::new_local_dir(root_id(), "docs").unwrap();
            d.id = ItemId::new("dir1").unwrap();
            d.pending_remote = false;
            d
        });

        graph.rename(&ItemId::new("a").unwrap(), &dir.id(), "new.txt");

        assert!(graph.lookup(&root_id(), "old.txt").is_none());
        let moved = graph.lookup(&dir.id(), "new.txt").unwrap();
        assert_eq!(moved.node_id(), node_id);
        assert_eq!(moved.parent_id(), Some(dir.id()));
    }

    #[test]
    fn test_move_id_preserves_node_and_rekeys_children() {
        let graph = graph_with_root();
        let old_dir_id = ItemId::new("local-dir").unwrap();
        let dir = graph.upsert(&{
            let mut d = Entry::new_local_dir(root_id(), "pkg").unwrap();
            d.id = old_dir_id.clone();
            d
        });
        let dir_node = dir.node_id();
        graph.upsert(&file_entry("child", &old_dir_id, "inner.txt"));

        let new_id = ItemId::new("SERVER-1").unwrap();
        graph.move_id(&old_dir_id, &new_id);

        // node id preserved, indexes re-keyed
        let moved = graph.get_by_id(&new_id).unwrap();
        assert_eq!(moved.node_id(), dir_node);
        assert_eq!(moved.id(), new_id);
        assert!(graph.get_by_id(&old_dir_id).is_none());

        // children follow the new parent id
        let child = graph.lookup(&new_id, "inner.txt").unwrap();
        assert_eq!(child.parent_id(), Some(new_id.clone()));
        assert_eq!(graph.children_of(&new_id).len(), 1);
        assert!(graph.children_of(&old_dir_id).is_empty());
    }

    #[test]
    fn test_remove_clears_all_indexes() {
        let graph = graph_with_root();
        graph.upsert(&file_entry("a", &root_id(), "a.txt"));
        let id = ItemId::new("a").unwrap();

        graph.remove(&id);
        assert!(graph.get_by_id(&id).is_none());
        assert!(graph.lookup(&root_id(), "a.txt").is_none());
        assert_eq!(graph.len(), 1); // just the root
    }

    #[test]
    fn test_resolve_path() {
        let graph = graph_with_root();
        let dir_id = ItemId::new("d1").unwrap();
        graph.upsert(&{
            let mut d = Entry::new_local_dir(root_id(), "Documents").unwrap();
            d.id = dir_id.clone();
            d.pending_remote = false;
            d
        });
        graph.upsert(&file_entry("f1", &dir_id, "notes.txt"));

        let found = graph.resolve_path(&root_id(), "/documents/NOTES.TXT").unwrap();
        assert_eq!(found.id(), ItemId::new("f1").unwrap());
        assert!(graph.resolve_path(&root_id(), "/documents/missing").is_none());

        // empty path resolves to the root itself
        let root = graph.resolve_path(&root_id(), "/").unwrap();
        assert_eq!(root.node_id(), NodeId::ROOT);
    }

    #[test]
    fn test_virtual_node() {
        let graph = graph_with_root();
        let v = graph.insert_virtual(&root_id(), ".xdg-volume-info", b"[Volume Info]\n".to_vec());
        assert!(v.is_virtual());
        assert_eq!(v.virtual_content().unwrap(), b"[Volume Info]\n");

        let found = graph.lookup(&root_id(), ".XDG-VOLUME-INFO").unwrap();
        assert_eq!(found.node_id(), v.node_id());
    }

    #[test]
    fn test_path_of() {
        let graph = graph_with_root();
        let dir_id = ItemId::new("d1").unwrap();
        graph.upsert(&{
            let mut d = Entry::new_local_dir(root_id(), "Documents").unwrap();
            d.id = dir_id.clone();
            d.pending_remote = false;
            d
        });
        graph.upsert(&file_entry("f1", &dir_id, "notes.txt"));

        assert_eq!(
            graph.path_of(&ItemId::new("f1").unwrap()).unwrap(),
            "/Documents/notes.txt"
        );
        assert_eq!(graph.path_of(&root_id()).unwrap(), "/");
        assert!(graph.path_of(&ItemId::new("missing").unwrap()).is_none());
    }

    #[test]
    fn test_children_snapshot() {
        let graph = graph_with_root();
        graph.upsert(&file_entry("a", &root_id(), "a.txt"));
        graph.upsert(&file_entry("b", &root_id(), "b.txt"));
        let children = graph.children_of(&root_id());
        assert_eq!(children.len(), 2);
    }

    #[test]
    fn test_xattr_map() {
        let graph = graph_with_root();
        let inode = graph.upsert(&file_entry("a", &root_id(), "a.txt"));
        inode.set_xattr("user.comment", b"hello".to_vec());
        assert_eq!(inode.xattr("user.comment").unwrap(), b"hello");
        assert_eq!(inode.xattr_names(), vec!["user.comment".to_string()]);
        assert!(inode.remove_xattr("user.comment"));
        assert!(!inode.remove_xattr("user.comment"));
    }
}
