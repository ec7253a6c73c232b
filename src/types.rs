//! Small shared value types used across the page store and B+tree.

use std::cmp::Ordering;
use std::fmt;

/// A page identifier. Ids 0 and 1 are reserved for the two database headers;
/// user pages start at 2.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PageId(pub u64);

impl PageId {
    /// Lowest id a data page may have.
    pub const FIRST_DATA_PAGE: PageId = PageId(2);

    /// True if this id addresses one of the two reserved header pages.
    pub fn is_header(self) -> bool {
        self.0 <= 1
    }
}

impl fmt::Debug for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PageId({})", self.0)
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A commit number: monotonically increasing modulo 2^32. Comparisons use
/// the signed-difference trick so wraparound still orders correctly.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommitNumber(pub u32);

impl CommitNumber {
    /// Starting point for a fresh database's in-memory counter, chosen so
    /// that the two seed commits `open()` performs land on `u32::MAX` and
    /// `0` in turn -- the post-open commit number is `0`, per spec S1.
    pub const SEED: CommitNumber = CommitNumber(u32::MAX - 1);

    /// Next commit number, wrapping modulo 2^32.
    pub fn next(self) -> CommitNumber {
        CommitNumber(self.0.wrapping_add(1))
    }

    /// Index (0 or 1) of the header page holding this commit's data, i.e.
    /// `commitNumber & 1`.
    pub fn header_slot(self) -> u64 {
        (self.0 & 1) as u64
    }

    /// Modulo-32 comparison: treats the difference of the two `u32` values
    /// as a signed 32-bit delta so a wrapped counter still compares sanely.
    pub fn compare_mod32(self, other: CommitNumber) -> Ordering {
        let delta = self.0.wrapping_sub(other.0) as i32;
        delta.cmp(&0)
    }
}

impl fmt::Debug for CommitNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CommitNumber({})", self.0)
    }
}

/// Reserved internal tree ids (spec §3, §6). Values `0..=255` are reserved;
/// user trees use ids outside that range.
pub mod reserved_tree_id {
    /// Registry tree mapping tree name -> root page id.
    pub const REGISTRY: u8 = 0;
    /// Registry key-map: secondary index from id -> name.
    pub const REGISTRY_KEY_MAP: u8 = 1;
    /// Cursor registry used to track long-lived cursors across checkpoints.
    pub const CURSOR_REGISTRY: u8 = 2;
    /// Trash tree holding orphaned fragmented-value page chains.
    pub const FRAGMENTED_TRASH: u8 = 3;
}

/// Isolation level honored by [`crate::lockmanager::LockManager`] when a
/// cursor or transaction reads through the B+tree.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IsolationLevel {
    /// No read locks are acquired; reads may observe uncommitted data.
    ReadUncommitted,
    /// A read lock is acquired and released immediately around the read.
    ReadCommitted,
    /// A shared read lock is held for the remainder of the transaction.
    RepeatableRead,
    /// A shared lock is acquired, upgradable to exclusive without releasing.
    UpgradableRead,
    /// Full two-phase locking; shared locks are held and no re-reads change.
    Serializable,
}

impl IsolationLevel {
    /// True if this level requires acquiring any lock at all to read.
    pub fn requires_read_lock(self) -> bool {
        !matches!(self, IsolationLevel::ReadUncommitted)
    }

    /// True if the acquired read lock should be released immediately after
    /// the read completes rather than retained for the transaction.
    pub fn releases_immediately(self) -> bool {
        matches!(self, IsolationLevel::ReadCommitted)
    }
}
