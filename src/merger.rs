//! `TreeMerger`: grafts every entry of a temporary (bulk-built) tree into
//! a live tree in key order, used to fold a large batch load in without
//! paying a per-key insert's split/compact overhead for each one.
//!
//! `graft_temp_tree` assumes `dest` and `source` hold disjoint key ranges
//! (every key of `dest` precedes every key of `source`) and tries the
//! structural splice described for that case: `source`'s root becomes a
//! new sibling of `dest`'s root under a freshly allocated internal root,
//! with the boundary's extremity bits cleared. Ranges that turn out not
//! to be disjoint (or trees of differing height, which a single new
//! internal root can't splice without leaving leaves at uneven depths)
//! fall back to a per-key cursor walk that can also honor `overwrite`.

use tracing::{debug, instrument};

use crate::btree::BTree;
use crate::error::Result;

/// Grafts every key in `source` into `dest`, in ascending key order.
/// `source` is left empty once the graft completes; this is the only way
/// a `TreeMerger` consumes a tree.
pub struct TreeMerger<'a> {
    dest: &'a BTree,
    source: &'a BTree,
    overwrite: bool,
}

impl<'a> TreeMerger<'a> {
    pub fn new(dest: &'a BTree, source: &'a BTree, overwrite: bool) -> Self {
        TreeMerger { dest, source, overwrite }
    }

    /// Run the graft to completion.
    #[instrument(skip(self))]
    pub fn run(&self) -> Result<u64> {
        graft_temp_tree(self.dest, self.source, self.overwrite)
    }
}

/// Move every `(key, value)` in `source` into `dest`.
pub fn graft_temp_tree(dest: &BTree, source: &BTree, overwrite: bool) -> Result<u64> {
    if let Some(moved) = dest.try_graft_structural(source)? {
        debug!(moved, "graft complete (structural splice)");
        return Ok(moved);
    }
    graft_per_key(dest, source, overwrite)
}

/// Copy every `(key, value)` in `source` into `dest`, then delete the
/// entries out of `source` as they're consumed so a crash mid-merge
/// leaves `source` holding only the not-yet-grafted tail (restartable).
/// Used when the structural splice's preconditions (disjoint ranges,
/// matching tree height) don't hold.
fn graft_per_key(dest: &BTree, source: &BTree, overwrite: bool) -> Result<u64> {
    let mut moved = 0u64;
    let mut cursor = source.cursor();
    cursor.first()?;
    while cursor.key().is_some() {
        cursor.transfer_to(dest, overwrite)?;
        moved += 1;
    }
    debug!(moved, "graft complete (per-key fallback)");
    Ok(moved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::PageCache;
    use crate::pagearray::MemArray;
    use crate::pagedb::PageDb;
    use std::sync::Arc;

    fn new_tree(id: u8, db: &Arc<PageDb>, cache: &Arc<PageCache>) -> BTree {
        BTree::create(id, None, db.clone(), cache.clone()).unwrap()
    }

    #[test]
    fn graft_moves_every_key_and_empties_the_source() {
        let array: Arc<dyn crate::pagearray::PageArray> = Arc::new(MemArray::new(512));
        let db = Arc::new(PageDb::open(array, true).unwrap());
        let cache = Arc::new(PageCache::new(db.clone(), 64));
        let dest = new_tree(1, &db, &cache);
        let source = new_tree(2, &db, &cache);

        for k in ["a", "b", "c"] {
            source.store(k.as_bytes(), Some(b"v")).unwrap();
        }
        let moved = graft_temp_tree(&dest, &source, true).unwrap();
        assert_eq!(moved, 3);
        for k in ["a", "b", "c"] {
            assert_eq!(dest.load(k.as_bytes()).unwrap(), Some(b"v".to_vec()));
            assert_eq!(source.load(k.as_bytes()).unwrap(), None);
        }
    }

    #[test]
    fn graft_without_overwrite_keeps_existing_destination_value() {
        let array: Arc<dyn crate::pagearray::PageArray> = Arc::new(MemArray::new(512));
        let db = Arc::new(PageDb::open(array, true).unwrap());
        let cache = Arc::new(PageCache::new(db.clone(), 64));
        let dest = new_tree(1, &db, &cache);
        let source = new_tree(2, &db, &cache);

        dest.store(b"k", Some(b"old")).unwrap();
        source.store(b"k", Some(b"new")).unwrap();
        graft_temp_tree(&dest, &source, false).unwrap();
        assert_eq!(dest.load(b"k").unwrap(), Some(b"old".to_vec()));
    }

    #[test]
    fn graft_clears_extremity_bits_only_at_the_new_internal_boundary() {
        let array: Arc<dyn crate::pagearray::PageArray> = Arc::new(MemArray::new(512));
        let db = Arc::new(PageDb::open(array, true).unwrap());
        let cache = Arc::new(PageCache::new(db.clone(), 64));
        let dest = new_tree(1, &db, &cache);
        let source = new_tree(2, &db, &cache);

        dest.store(b"a", Some(b"v")).unwrap();
        dest.store(b"b", Some(b"v")).unwrap();
        source.store(b"c", Some(b"v")).unwrap();
        source.store(b"d", Some(b"v")).unwrap();

        let moved = graft_temp_tree(&dest, &source, true).unwrap();
        assert_eq!(moved, 2);

        let mut cursor = dest.cursor();
        cursor.find(b"a").unwrap();
        let low_leaf = cursor.leaf_page().unwrap();
        cursor.find(b"d").unwrap();
        let high_leaf = cursor.leaf_page().unwrap();

        assert_eq!(dest.extremity_bits(low_leaf).unwrap(), (true, false));
        assert_eq!(dest.extremity_bits(high_leaf).unwrap(), (false, true));
        assert_eq!(dest.extremity_bits(dest.root_id()).unwrap(), (true, true));
    }
}
