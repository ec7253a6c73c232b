//! Per-`(indexId, key)` row lock table with isolation levels, deadlock
//! detection, and timeouts. Distinct from [`crate::latch::Latch`], which
//! guards in-memory node structure rather than transaction-scoped rows.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{DeadlockInfo, Result, StoreError};
use crate::types::IsolationLevel;

/// Outcome of a lock acquisition attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockResult {
    /// The lock was newly granted at the requested level.
    Acquired,
    /// The caller already owned the lock at or above the requested level.
    OwnedShared,
    OwnedUpgradable,
    OwnedExclusive,
    /// The request is illegal given current ownership (e.g. a second
    /// upgradable request while one is already outstanding).
    Illegal,
    /// The timeout elapsed before the lock could be granted.
    TimedOut,
}

/// A timeout value for `try_*` lock calls, mirroring the source's
/// "-1 means no wait, MAX means wait forever" convention.
#[derive(Debug, Clone, Copy)]
pub enum Timeout {
    NoWait,
    Nanos(u64),
    Forever,
}

impl Timeout {
    fn deadline(self) -> Option<Instant> {
        match self {
            Timeout::NoWait => Some(Instant::now()),
            Timeout::Nanos(n) => Some(Instant::now() + Duration::from_nanos(n)),
            Timeout::Forever => None,
        }
    }
}

type TxnId = u64;

#[derive(Default)]
struct LockEntry {
    shared: HashSet<TxnId>,
    upgradable: Option<TxnId>,
    exclusive: Option<TxnId>,
    /// Transactions parked waiting on this entry, in arrival order, each
    /// tagged with the level they're waiting for.
    waiters: Vec<(TxnId, Level)>,
}

impl LockEntry {
    fn is_free(&self) -> bool {
        self.shared.is_empty() && self.upgradable.is_none() && self.exclusive.is_none()
    }

    fn owner_level(&self, txn: TxnId) -> Option<Level> {
        if self.exclusive == Some(txn) {
            Some(Level::Exclusive)
        } else if self.upgradable == Some(txn) {
            Some(Level::Upgradable)
        } else if self.shared.contains(&txn) {
            Some(Level::Shared)
        } else {
            None
        }
    }

    /// Every transaction presently blocking this entry's availability,
    /// used to build the wait-for graph.
    fn blockers(&self, requester: TxnId) -> Vec<TxnId> {
        let mut v: Vec<TxnId> = self.shared.iter().copied().filter(|&t| t != requester).collect();
        v.extend(self.upgradable.filter(|&t| t != requester));
        v.extend(self.exclusive.filter(|&t| t != requester));
        v
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Level {
    Shared,
    Upgradable,
    Exclusive,
}

#[derive(Hash, PartialEq, Eq, Clone)]
struct Key {
    index_id: u64,
    key: Vec<u8>,
}

struct Stripe {
    table: Mutex<HashMap<Key, LockEntry>>,
    cond: Condvar,
}

const STRIPE_COUNT: usize = 16;

/// The row-lock manager. Entries are bucketed under striped latches keyed
/// by `hash(indexId, key)`.
pub struct LockManager {
    stripes: Vec<Stripe>,
}

impl Default for LockManager {
    fn default() -> Self {
        LockManager::new()
    }
}

impl LockManager {
    pub fn new() -> Self {
        LockManager {
            stripes: (0..STRIPE_COUNT)
                .map(|_| Stripe {
                    table: Mutex::new(HashMap::new()),
                    cond: Condvar::new(),
                })
                .collect(),
        }
    }

    fn stripe_for(&self, index_id: u64, key: &[u8]) -> &Stripe {
        use std::hash::{Hash, Hasher};
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        index_id.hash(&mut hasher);
        key.hash(&mut hasher);
        &self.stripes[(hasher.finish() as usize) % self.stripes.len()]
    }

    fn acquire(
        &self,
        txn: TxnId,
        index_id: u64,
        key: &[u8],
        level: Level,
        timeout: Timeout,
    ) -> Result<LockResult> {
        let stripe = self.stripe_for(index_id, key);
        let map_key = Key {
            index_id,
            key: key.to_vec(),
        };
        let deadline = timeout.deadline();
        let mut table = stripe.table.lock();

        loop {
            {
                let entry = table.entry(map_key.clone()).or_default();
                if let Some(owned) = entry.owner_level(txn) {
                    if owned >= level {
                        return Ok(match owned {
                            Level::Shared => LockResult::OwnedShared,
                            Level::Upgradable => LockResult::OwnedUpgradable,
                            Level::Exclusive => LockResult::OwnedExclusive,
                        });
                    }
                    if owned == Level::Shared && level == Level::Upgradable && entry.upgradable.is_some() {
                        return Ok(LockResult::Illegal);
                    }
                }
                if level == Level::Upgradable && entry.upgradable.is_some() && entry.upgradable != Some(txn) {
                    // fall through to wait below
                } else if Self::grantable(entry, txn, level) {
                    Self::grant(entry, txn, level);
                    return Ok(LockResult::Acquired);
                }
            }

            // Not grantable yet: deadlock check, then block.
            if let Some(cycle) = self.detect_cycle(&table, txn, &map_key) {
                return Err(StoreError::Deadlock {
                    info: DeadlockInfo {
                        requester: txn,
                        cycle,
                    },
                });
            }

            table.entry(map_key.clone()).or_default().waiters.push((txn, level));

            match deadline {
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        Self::remove_waiter(&mut table, &map_key, txn);
                        return Ok(LockResult::TimedOut);
                    }
                    let timed_out = stripe.cond.wait_for(&mut table, d - now).timed_out();
                    if timed_out {
                        Self::remove_waiter(&mut table, &map_key, txn);
                        return Ok(LockResult::TimedOut);
                    }
                }
                None => {
                    stripe.cond.wait(&mut table);
                }
            }
        }
    }

    fn grantable(entry: &LockEntry, txn: TxnId, level: Level) -> bool {
        match level {
            Level::Shared => entry.exclusive.is_none() || entry.exclusive == Some(txn),
            Level::Upgradable => {
                entry.upgradable.is_none() && (entry.exclusive.is_none() || entry.exclusive == Some(txn))
            }
            Level::Exclusive => {
                entry.is_free()
                    || (entry.exclusive == Some(txn))
                    || (entry.shared.is_empty() && entry.upgradable == Some(txn))
                    || (entry.shared.len() == 1 && entry.shared.contains(&txn) && entry.upgradable.is_none())
            }
        }
    }

    fn grant(entry: &mut LockEntry, txn: TxnId, level: Level) {
        match level {
            Level::Shared => {
                entry.shared.insert(txn);
            }
            Level::Upgradable => {
                entry.shared.remove(&txn);
                entry.upgradable = Some(txn);
            }
            Level::Exclusive => {
                entry.shared.remove(&txn);
                if entry.upgradable == Some(txn) {
                    entry.upgradable = None;
                }
                entry.exclusive = Some(txn);
            }
        }
    }

    fn remove_waiter(table: &mut HashMap<Key, LockEntry>, key: &Key, txn: TxnId) {
        if let Some(entry) = table.get_mut(key) {
            entry.waiters.retain(|(t, _)| *t != txn);
        }
    }

    /// Walk the wait-for graph starting from `requester`'s would-be
    /// blockers; if it cycles back to `requester`, report the cycle.
    fn detect_cycle(&self, table: &HashMap<Key, LockEntry>, requester: TxnId, start: &Key) -> Option<Vec<TxnId>> {
        let entry = table.get(start)?;
        for blocker in entry.blockers(requester) {
            let mut visited = HashSet::new();
            let mut path = vec![blocker];
            if self.search_cycle(table, blocker, requester, &mut visited, &mut path) {
                path.reverse();
                return Some(path);
            }
        }
        None
    }

    fn search_cycle(
        &self,
        table: &HashMap<Key, LockEntry>,
        current: TxnId,
        target: TxnId,
        visited: &mut HashSet<TxnId>,
        path: &mut Vec<TxnId>,
    ) -> bool {
        if current == target {
            return true;
        }
        if !visited.insert(current) {
            return false;
        }
        for entry in table.values() {
            if entry.waiters.iter().any(|(t, _)| *t == current) {
                for blocker in entry.blockers(current) {
                    if self.search_cycle(table, blocker, target, visited, path) {
                        path.push(blocker);
                        return true;
                    }
                }
            }
        }
        false
    }

    pub fn lock_shared(&self, txn: TxnId, index_id: u64, key: &[u8], timeout: Timeout) -> Result<LockResult> {
        self.acquire(txn, index_id, key, Level::Shared, timeout)
    }

    pub fn lock_upgradable(&self, txn: TxnId, index_id: u64, key: &[u8], timeout: Timeout) -> Result<LockResult> {
        self.acquire(txn, index_id, key, Level::Upgradable, timeout)
    }

    pub fn lock_exclusive(&self, txn: TxnId, index_id: u64, key: &[u8], timeout: Timeout) -> Result<LockResult> {
        self.acquire(txn, index_id, key, Level::Exclusive, timeout)
    }

    /// Acquire (or skip) a read lock according to `isolation`, returning
    /// `true` if a lock was actually taken (and should be released by the
    /// caller per [`IsolationLevel::releases_immediately`]).
    pub fn lock_for_read(&self, txn: TxnId, index_id: u64, key: &[u8], isolation: IsolationLevel, timeout: Timeout) -> Result<bool> {
        if !isolation.requires_read_lock() {
            return Ok(false);
        }
        self.lock_shared(txn, index_id, key, timeout)?;
        if isolation.releases_immediately() {
            self.release(txn, index_id, key);
            Ok(false)
        } else {
            Ok(true)
        }
    }

    /// Release a lock held by `txn` on `(index_id, key)`. Every waiter on
    /// the key's stripe is woken (`notify_all`); each re-checks whether its
    /// own request is now grantable and re-waits if not. Simpler than a
    /// single precise wake but costs a stripe-wide wakeup storm under heavy
    /// contention.
    pub fn release(&self, txn: TxnId, index_id: u64, key: &[u8]) {
        let stripe = self.stripe_for(index_id, key);
        let map_key = Key {
            index_id,
            key: key.to_vec(),
        };
        let mut table = stripe.table.lock();
        if let Some(entry) = table.get_mut(&map_key) {
            if entry.exclusive == Some(txn) {
                entry.exclusive = None;
            }
            if entry.upgradable == Some(txn) {
                entry.upgradable = None;
            }
            entry.shared.remove(&txn);
            if entry.is_free() && entry.waiters.is_empty() {
                table.remove(&map_key);
            }
        }
        drop(table);
        stripe.cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_locks_stack_across_transactions() {
        let mgr = LockManager::new();
        assert_eq!(
            mgr.lock_shared(1, 0, b"k", Timeout::NoWait).unwrap(),
            LockResult::Acquired
        );
        assert_eq!(
            mgr.lock_shared(2, 0, b"k", Timeout::NoWait).unwrap(),
            LockResult::Acquired
        );
    }

    #[test]
    fn exclusive_excludes_other_transactions() {
        let mgr = LockManager::new();
        assert_eq!(
            mgr.lock_exclusive(1, 0, b"k", Timeout::NoWait).unwrap(),
            LockResult::Acquired
        );
        assert_eq!(
            mgr.lock_shared(2, 0, b"k", Timeout::NoWait).unwrap(),
            LockResult::TimedOut
        );
    }

    #[test]
    fn re_requesting_owned_level_reports_owned() {
        let mgr = LockManager::new();
        mgr.lock_shared(1, 0, b"k", Timeout::NoWait).unwrap();
        assert_eq!(
            mgr.lock_shared(1, 0, b"k", Timeout::NoWait).unwrap(),
            LockResult::OwnedShared
        );
    }

    #[test]
    fn release_wakes_a_waiter() {
        let mgr = LockManager::new();
        mgr.lock_exclusive(1, 0, b"k", Timeout::NoWait).unwrap();
        mgr.release(1, 0, b"k");
        assert_eq!(
            mgr.lock_exclusive(2, 0, b"k", Timeout::NoWait).unwrap(),
            LockResult::Acquired
        );
    }

    #[test]
    fn read_uncommitted_never_locks() {
        let mgr = LockManager::new();
        mgr.lock_exclusive(1, 0, b"k", Timeout::NoWait).unwrap();
        let took = mgr
            .lock_for_read(2, 0, b"k", IsolationLevel::ReadUncommitted, Timeout::NoWait)
            .unwrap();
        assert!(!took);
    }
}
