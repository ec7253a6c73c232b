//! Crate-wide error type and small helpers, in the spirit of a single
//! `thiserror` enum rather than one type per subsystem.

use std::io;
use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Deadlock participant information attached to [`StoreError::Deadlock`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadlockInfo {
    /// Id of the transaction that requested the lock and discovered the cycle.
    pub requester: u64,
    /// Ids of the other transactions found along the wait-for cycle.
    pub cycle: Vec<u64>,
}

/// Sub-kind for [`StoreError::LockFailure`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockFailureKind {
    /// The requested timeout elapsed before the lock was granted.
    TimedOut,
    /// The request would require an illegal state transition (e.g. a shared
    /// owner requesting exclusive without going through upgradable first).
    Illegal,
}

/// Unified error type for the storage engine.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Wrapped I/O failure; any I/O error closes the owning component.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Checksum, magic, or structural corruption detected on disk.
    #[error("corrupt database: {0}")]
    CorruptDatabase(String),

    /// An index (tree) has been closed and can no longer be used.
    #[error("index is closed")]
    ClosedIndex,

    /// A lock request failed (timeout or illegal state transition).
    #[error("lock failure: {kind:?}: {message}")]
    LockFailure {
        /// The sub-kind of lock failure.
        kind: LockFailureKind,
        /// Human readable detail.
        message: String,
    },

    /// A cycle was detected in the lock wait-for graph.
    #[error("deadlock detected: requester={} cycle={:?}", info.requester, info.cycle)]
    Deadlock {
        /// Deadlock participant information.
        info: DeadlockInfo,
    },

    /// Caller passed a bad argument (page id, page size, null key, etc).
    #[error("illegal argument: {0}")]
    IllegalArgument(String),

    /// Operation attempted from a state that forbids it (drop non-empty,
    /// finish-term backwards, etc).
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// Storing a value into a key-only view, or similar structural
    /// constraint violation.
    #[error("view constraint violated: {0}")]
    ViewConstraint(String),

    /// Write attempted against a replica that cannot currently accept writes.
    #[error("replica is not modifiable")]
    UnmodifiableReplica,
}

impl StoreError {
    /// Shorthand for a corruption error built from a `&str`.
    pub fn corrupt(msg: impl Into<String>) -> Self {
        StoreError::CorruptDatabase(msg.into())
    }

    /// Shorthand for an illegal-argument error built from a `&str`.
    pub fn invalid(msg: impl Into<String>) -> Self {
        StoreError::IllegalArgument(msg.into())
    }

    /// Shorthand for an illegal-state error built from a `&str`.
    pub fn illegal_state(msg: impl Into<String>) -> Self {
        StoreError::IllegalState(msg.into())
    }

    /// True if this error should close the owning `PageDb`/tree rather than
    /// be treated as a recoverable, non-mutating failure.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            StoreError::Io(_) | StoreError::CorruptDatabase(_) | StoreError::ClosedIndex
        )
    }
}
