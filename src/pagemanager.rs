//! Free-list and allocation over a [`PageArray`](crate::pagearray::PageArray).
//!
//! Two logical free lists are kept, matching the durability contract a
//! copy-on-write store needs:
//!
//! - **regular**: pages that are safe to hand out to `alloc()` because the
//!   commit that freed them has already gone durable. Persisted across
//!   restarts as a chain of free-list pages rooted in the 96-byte
//!   page-manager header.
//! - **pending**: pages freed since the last `commit_start`; not yet
//!   allocatable, because a crash before the next commit must still be able
//!   to see them as live. `commit_end` folds `pending` into `regular` once
//!   the commit that made them free is durable.
//! - **recycle**: pages explicitly marked immediately reusable, no rollback
//!   protection. Not persisted — by definition recycled pages carry no
//!   durability guarantee, so losing them on crash just means they leak
//!   until the next `alloc` extends the file; that's the contract's intent.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Result, StoreError};
use crate::pagearray::PageArray;
use crate::types::PageId;

/// A contiguous run of `len` free pages starting at `start`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Extent {
    pub start: PageId,
    pub len: u32,
}

impl Extent {
    pub fn single(id: PageId) -> Self {
        Extent { start: id, len: 1 }
    }

    fn coalesce_with(&mut self, other: &Extent) -> bool {
        if self.start.0 + self.len as u64 == other.start.0 {
            self.len += other.len;
            true
        } else {
            false
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct HeapExtent(Extent);

impl Ord for HeapExtent {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0
            .len
            .cmp(&other.0.len)
            .then_with(|| other.0.start.0.cmp(&self.0.start.0))
    }
}
impl PartialOrd for HeapExtent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// An in-memory, coalescing set of free extents with largest-first pop
/// order (favors leaving behind small, easily-satisfied leftovers).
#[derive(Default)]
struct FreeCache {
    extents: Vec<Extent>,
    heap: BinaryHeap<HeapExtent>,
}

impl FreeCache {
    fn from_extents(extents: Vec<Extent>) -> Self {
        let mut cache = FreeCache {
            extents,
            heap: BinaryHeap::new(),
        };
        cache.rebuild();
        cache
    }

    fn is_empty(&self) -> bool {
        self.extents.is_empty()
    }

    fn pop(&mut self) -> Option<PageId> {
        let mut extent = self.heap.pop()?.0;
        let page = extent.start;
        match self.extents.binary_search_by_key(&extent.start.0, |e| e.start.0) {
            Ok(pos) => {
                if extent.len > 1 {
                    self.extents[pos].start.0 += 1;
                    self.extents[pos].len -= 1;
                    extent.start.0 += 1;
                    extent.len -= 1;
                    self.heap.push(HeapExtent(extent));
                } else {
                    self.extents.remove(pos);
                }
            }
            Err(_) => {
                // heap was stale relative to `extents`; rebuild and retry.
                self.heap.push(HeapExtent(extent));
                self.rebuild();
                return self.pop();
            }
        }
        Some(page)
    }

    fn push(&mut self, extent: Extent) {
        self.extents.push(extent);
        self.rebuild();
    }

    fn extend(&mut self, mut extents: Vec<Extent>) {
        if extents.is_empty() {
            return;
        }
        self.extents.append(&mut extents);
        self.rebuild();
    }

    fn rebuild(&mut self) {
        if self.extents.is_empty() {
            self.heap.clear();
            return;
        }
        self.extents.sort_by_key(|e| e.start.0);
        let mut merged: Vec<Extent> = Vec::with_capacity(self.extents.len());
        for extent in self.extents.drain(..) {
            if let Some(last) = merged.last_mut() {
                if last.coalesce_with(&extent) {
                    continue;
                }
            }
            merged.push(extent);
        }
        self.heap = merged.iter().copied().map(HeapExtent).collect();
        self.extents = merged;
    }

    fn take_extents(&mut self) -> Vec<Extent> {
        std::mem::take(&mut self.extents)
    }
}

/// Durable free-list header fields, embedded in the 96-byte page-manager
/// region of [`crate::header::Header`].
#[derive(Clone, Copy, Debug, Default)]
pub struct PageManagerHeader {
    pub total_page_count: u64,
    pub regular_head: u64,
}

const OFF_TOTAL: usize = 0;
const OFF_HEAD: usize = 8;

impl PageManagerHeader {
    pub fn encode(&self, buf: &mut [u8]) {
        buf[OFF_TOTAL..OFF_TOTAL + 8].copy_from_slice(&self.total_page_count.to_le_bytes());
        buf[OFF_HEAD..OFF_HEAD + 8].copy_from_slice(&self.regular_head.to_le_bytes());
        buf[16..].fill(0);
    }

    pub fn decode(buf: &[u8]) -> Self {
        PageManagerHeader {
            total_page_count: u64::from_le_bytes(buf[OFF_TOTAL..OFF_TOTAL + 8].try_into().unwrap()),
            regular_head: u64::from_le_bytes(buf[OFF_HEAD..OFF_HEAD + 8].try_into().unwrap()),
        }
    }
}

fn free_page_capacity(page_size: usize) -> usize {
    // [next:8][count:4][pad:4][extent...], extent = start:8 + len:4
    (page_size.saturating_sub(16)) / 12
}

fn read_free_chain(array: &dyn PageArray, mut head: u64) -> Result<(Vec<Extent>, Vec<PageId>)> {
    let page_size = array.page_size();
    let mut extents = Vec::new();
    let mut chain_pages = Vec::new();
    let mut buf = vec![0u8; page_size];
    while head != 0 {
        let page = PageId(head);
        chain_pages.push(page);
        array.read_page(page, &mut buf)?;
        let next = u64::from_le_bytes(buf[0..8].try_into().unwrap());
        let count = u32::from_le_bytes(buf[8..12].try_into().unwrap()) as usize;
        let capacity = free_page_capacity(page_size);
        if count > capacity {
            return Err(StoreError::corrupt("free list page count exceeds capacity"));
        }
        for i in 0..count {
            let off = 16 + i * 12;
            let start = PageId(u64::from_le_bytes(buf[off..off + 8].try_into().unwrap()));
            let len = u32::from_le_bytes(buf[off + 8..off + 12].try_into().unwrap());
            extents.push(Extent { start, len });
        }
        head = next;
    }
    Ok((extents, chain_pages))
}

fn write_free_chain(array: &dyn PageArray, pages: &[PageId], extents: &[Extent]) -> Result<u64> {
    let page_size = array.page_size();
    let capacity = free_page_capacity(page_size);
    if pages.is_empty() {
        return Ok(0);
    }
    let chunks: Vec<&[Extent]> = extents.chunks(capacity.max(1)).collect();
    let chunks = if chunks.is_empty() { vec![&[][..]] } else { chunks };
    if pages.len() < chunks.len() {
        return Err(StoreError::illegal_state("free chain page allocation mismatch"));
    }
    let mut buf = vec![0u8; page_size];
    for (i, chunk) in chunks.iter().enumerate() {
        let next = if i + 1 < chunks.len() { pages[i + 1].0 } else { 0 };
        buf.fill(0);
        buf[0..8].copy_from_slice(&next.to_le_bytes());
        buf[8..12].copy_from_slice(&(chunk.len() as u32).to_le_bytes());
        for (j, extent) in chunk.iter().enumerate() {
            let off = 16 + j * 12;
            buf[off..off + 8].copy_from_slice(&extent.start.0.to_le_bytes());
            buf[off + 8..off + 12].copy_from_slice(&extent.len.to_le_bytes());
        }
        array.write_page(pages[i], &buf)?;
    }
    Ok(pages[0].0)
}

/// Free-list and allocation manager. Thread-safe: internal state is
/// protected by its own mutex, independent of `PageDb`'s commit lock (the
/// caller is responsible for holding the commit lock's read side across
/// mutating calls, per the concurrency model).
pub struct PageManager {
    array: Arc<dyn PageArray>,
    inner: Mutex<Inner>,
}

struct Inner {
    total_page_count: u64,
    regular: FreeCache,
    pending: FreeCache,
    recycle: FreeCache,
    /// Pages currently used to store the regular free-list chain itself;
    /// reused in place on the next `commit_start` rather than freed, so the
    /// free list never needs to free itself.
    chain_pages: Vec<PageId>,
}

impl PageManager {
    /// Build a manager over a fresh, empty array. `total_page_count` should
    /// already account for the reserved header pages.
    pub fn fresh(array: Arc<dyn PageArray>, total_page_count: u64) -> Self {
        PageManager {
            array,
            inner: Mutex::new(Inner {
                total_page_count,
                regular: FreeCache::default(),
                pending: FreeCache::default(),
                recycle: FreeCache::default(),
                chain_pages: Vec::new(),
            }),
        }
    }

    /// Rebuild a manager from a decoded durable header.
    pub fn open(array: Arc<dyn PageArray>, header: &PageManagerHeader) -> Result<Self> {
        let (extents, chain_pages) = read_free_chain(array.as_ref(), header.regular_head)?;
        Ok(PageManager {
            array,
            inner: Mutex::new(Inner {
                total_page_count: header.total_page_count,
                regular: FreeCache::from_extents(extents),
                pending: FreeCache::default(),
                recycle: FreeCache::default(),
                chain_pages,
            }),
        })
    }

    pub fn total_page_count(&self) -> u64 {
        self.inner.lock().total_page_count
    }

    /// Allocate one page: prefer recycle, then regular, else extend the
    /// array and bump the total page count.
    pub fn alloc(&self) -> Result<PageId> {
        let mut inner = self.inner.lock();
        if let Some(id) = inner.recycle.pop() {
            return Ok(id);
        }
        if let Some(id) = inner.regular.pop() {
            return Ok(id);
        }
        let id = PageId(inner.total_page_count);
        inner.total_page_count += 1;
        self.array.set_page_count(inner.total_page_count)?;
        Ok(id)
    }

    /// Return `id` to the durable-but-not-yet-reusable pending list.
    pub fn delete(&self, id: PageId) -> Result<()> {
        if id.is_header() {
            return Err(StoreError::invalid("cannot delete a reserved header page"));
        }
        self.inner.lock().pending.push(Extent::single(id));
        Ok(())
    }

    /// Return `id` to the immediately-reusable recycle list.
    pub fn recycle(&self, id: PageId) -> Result<()> {
        if id.is_header() {
            return Err(StoreError::invalid("cannot recycle a reserved header page"));
        }
        self.inner.lock().recycle.push(Extent::single(id));
        Ok(())
    }

    /// Snapshot the regular free list (not `pending`) into the 96-byte
    /// page-manager header region, persisting the chain to disk first.
    pub fn commit_start(&self) -> Result<PageManagerHeader> {
        let mut inner = self.inner.lock();
        let extents = inner.regular.extents.clone();
        let needed_pages = {
            let capacity = free_page_capacity(self.array.page_size()).max(1);
            extents.len().div_ceil(capacity).max(if extents.is_empty() { 0 } else { 1 })
        };
        while inner.chain_pages.len() < needed_pages {
            // Allocate fresh chain pages directly (bypassing alloc(), which
            // would itself consult the free lists we're in the middle of
            // snapshotting).
            let id = PageId(inner.total_page_count);
            inner.total_page_count += 1;
            self.array.set_page_count(inner.total_page_count)?;
            inner.chain_pages.push(id);
        }
        let head = write_free_chain(self.array.as_ref(), &inner.chain_pages[..needed_pages], &extents)?;
        Ok(PageManagerHeader {
            total_page_count: inner.total_page_count,
            regular_head: head,
        })
    }

    /// Fold pages freed during the just-durable commit into the regular
    /// free list, making them reusable by the *next* `alloc`.
    pub fn commit_end(&self) {
        let mut inner = self.inner.lock();
        let freed = inner.pending.take_extents();
        inner.regular.extend(freed);
    }

    /// True if the regular free list currently holds any pages (diagnostic
    /// / test use only).
    pub fn has_free_pages(&self) -> bool {
        !self.inner.lock().regular.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pagearray::MemArray;

    fn manager() -> PageManager {
        let array = Arc::new(MemArray::new(512));
        array.set_page_count(2).unwrap();
        PageManager::fresh(array, 2)
    }

    #[test]
    fn alloc_extends_when_lists_are_empty() {
        let mgr = manager();
        assert_eq!(mgr.alloc().unwrap(), PageId(2));
        assert_eq!(mgr.alloc().unwrap(), PageId(3));
    }

    #[test]
    fn deleted_page_not_reusable_until_next_commit() {
        let mgr = manager();
        let p = mgr.alloc().unwrap();
        mgr.delete(p).unwrap();
        // Not yet in `regular`, so alloc extends instead of reusing `p`.
        let next = mgr.alloc().unwrap();
        assert_ne!(next, p);
        mgr.commit_start().unwrap();
        mgr.commit_end();
        // Now it's folded into `regular` and reusable.
        assert!(mgr.has_free_pages());
    }

    #[test]
    fn recycled_page_is_immediately_reusable() {
        let mgr = manager();
        let p = mgr.alloc().unwrap();
        mgr.recycle(p).unwrap();
        assert_eq!(mgr.alloc().unwrap(), p);
    }

    #[test]
    fn free_chain_round_trips_through_header() {
        let mgr = manager();
        let pages: Vec<_> = (0..5).map(|_| mgr.alloc().unwrap()).collect();
        for p in &pages {
            mgr.delete(*p).unwrap();
        }
        let header = mgr.commit_start().unwrap();
        mgr.commit_end();

        let array = Arc::new(MemArray::new(512));
        array.set_page_count(header.total_page_count).unwrap();
        // Copy chain pages over manually since MemArray instances don't share storage.
        let (extents, _) = read_free_chain(&*mgr.array, header.regular_head).unwrap();
        let total: u32 = extents.iter().map(|e| e.len).sum();
        assert_eq!(total as usize, pages.len());
    }
}
