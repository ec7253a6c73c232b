//! Non-reentrant shared/exclusive latch on in-memory data, distinct from
//! the transaction-scoped [`crate::lockmanager::Lock`].
//!
//! Modeled as a `Mutex`-protected state word plus a `Condvar` park queue,
//! in the spirit of the teacher's guard/Drop locking idiom (see
//! `primitives::concurrency::SingleWriter`) but blocking genuinely instead
//! of polling, since this is in-process state rather than a cross-process
//! file lock.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

/// -1 encodes "exclusively held"; 0 is free; N > 0 is the shared count.
#[derive(Default)]
struct State {
    shared: u32,
    exclusive: bool,
}

struct Inner {
    state: Mutex<State>,
    cond: Condvar,
}

/// A non-reentrant shared/exclusive latch. Upgrade is not supported by
/// design: release a shared hold, then acquire exclusive.
pub struct Latch {
    inner: Arc<Inner>,
}

impl Default for Latch {
    fn default() -> Self {
        Latch::new()
    }
}

impl Latch {
    pub fn new() -> Self {
        Latch {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                cond: Condvar::new(),
            }),
        }
    }

    /// Attempt to acquire shared without blocking.
    pub fn try_acquire_shared(&self) -> Option<SharedGuard> {
        let mut state = self.inner.state.lock();
        if state.exclusive {
            return None;
        }
        state.shared += 1;
        Some(SharedGuard {
            inner: self.inner.clone(),
        })
    }

    /// Acquire shared, blocking while an exclusive holder is present.
    pub fn acquire_shared(&self) -> SharedGuard {
        let mut state = self.inner.state.lock();
        while state.exclusive {
            self.inner.cond.wait(&mut state);
        }
        state.shared += 1;
        SharedGuard {
            inner: self.inner.clone(),
        }
    }

    /// Attempt to acquire exclusive without blocking.
    pub fn try_acquire_exclusive(&self) -> Option<ExclusiveGuard> {
        let mut state = self.inner.state.lock();
        if state.exclusive || state.shared > 0 {
            return None;
        }
        state.exclusive = true;
        Some(ExclusiveGuard {
            inner: self.inner.clone(),
        })
    }

    /// Acquire exclusive, blocking until no shared or exclusive holder
    /// remains.
    pub fn acquire_exclusive(&self) -> ExclusiveGuard {
        let mut state = self.inner.state.lock();
        while state.exclusive || state.shared > 0 {
            self.inner.cond.wait(&mut state);
        }
        state.exclusive = true;
        ExclusiveGuard {
            inner: self.inner.clone(),
        }
    }
}

/// RAII guard releasing a shared hold on drop.
pub struct SharedGuard {
    inner: Arc<Inner>,
}

impl Drop for SharedGuard {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock();
        state.shared -= 1;
        if state.shared == 0 {
            self.inner.cond.notify_all();
        }
    }
}

/// RAII guard releasing an exclusive hold on drop.
pub struct ExclusiveGuard {
    inner: Arc<Inner>,
}

impl Drop for ExclusiveGuard {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock();
        state.exclusive = false;
        drop(state);
        self.inner.cond.notify_all();
    }
}

/// Reader-biased variant used as `PageDb`'s commit lock: all page mutators
/// hold the read side concurrently; `commit()` takes the write side to
/// reach quiescence, then downgrades by dropping it and reacquiring read.
pub struct CommitLock {
    latch: Latch,
}

impl Default for CommitLock {
    fn default() -> Self {
        CommitLock::new()
    }
}

impl CommitLock {
    pub fn new() -> Self {
        CommitLock { latch: Latch::new() }
    }

    /// Held by allocation/delete/recycle/read/write calls.
    pub fn acquire_read(&self) -> SharedGuard {
        self.latch.acquire_shared()
    }

    /// Held by `commit()` to reach a quiescent point before publishing a
    /// new header.
    pub fn acquire_write(&self) -> ExclusiveGuard {
        self.latch.acquire_exclusive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn shared_holds_stack() {
        let latch = Latch::new();
        let a = latch.acquire_shared();
        let b = latch.acquire_shared();
        assert!(latch.try_acquire_exclusive().is_none());
        drop(a);
        drop(b);
        assert!(latch.try_acquire_exclusive().is_some());
    }

    #[test]
    fn exclusive_excludes_shared() {
        let latch = Latch::new();
        let _guard = latch.acquire_exclusive();
        assert!(latch.try_acquire_shared().is_none());
    }

    #[test]
    fn exclusive_blocks_until_released() {
        let latch = Arc::new(Latch::new());
        let guard = latch.acquire_exclusive();
        let latch2 = latch.clone();
        let acquired = Arc::new(AtomicBool::new(false));
        let acquired2 = acquired.clone();
        let handle = thread::spawn(move || {
            let _g = latch2.acquire_exclusive();
            acquired2.store(true, Ordering::SeqCst);
        });
        thread::sleep(Duration::from_millis(30));
        assert!(!acquired.load(Ordering::SeqCst));
        drop(guard);
        handle.join().unwrap();
        assert!(acquired.load(Ordering::SeqCst));
    }

    #[test]
    fn commit_lock_allows_concurrent_readers() {
        let lock = CommitLock::new();
        let a = lock.acquire_read();
        let b = lock.acquire_read();
        drop(a);
        drop(b);
    }
}
