//! Embedded, transactional, ordered key/value storage engine: a
//! copy-on-write B+tree over a paged file, with row-level locking,
//! deadlock detection, and an append-only replication log.
//!
//! The four load-bearing subsystems, from the bottom up:
//!
//! - [`pagearray`] / [`header`] / [`pagemanager`] / [`pagedb`]: fixed-size
//!   pages over one file, a two-header commit protocol, and a free-list
//!   page manager.
//! - [`node`]: the binary page layout of one B+tree node and its
//!   split/compact routines.
//! - [`btree`] / [`cursor`] / [`merger`]: tree-level load/store/delete,
//!   ordered iteration, and bulk grafting.
//! - [`latch`] / [`lockmanager`]: in-memory shared/exclusive node
//!   latching and transaction-scoped row locking with deadlock detection.
//! - [`termlog`]: an append-only log of committed write batches for
//!   replication.

pub mod btree;
pub mod cursor;
pub mod error;
pub mod header;
pub mod latch;
pub mod lockmanager;
pub mod merger;
pub mod node;
pub mod options;
pub mod pagearray;
pub mod pagedb;
pub mod pagemanager;
pub mod termlog;
pub mod types;

pub use btree::{BTree, Stats, VerifyObserver};
pub use cursor::{Cursor, CursorAnalysis};
pub use error::{Result, StoreError};
pub use lockmanager::{LockManager, Timeout};
pub use merger::{graft_temp_tree, TreeMerger};
pub use options::{DurabilityMode, Options};
pub use pagearray::{FileArray, MemArray, PageArray};
pub use pagedb::PageDb;
pub use termlog::TermLog;
pub use types::{CommitNumber, IsolationLevel, PageId};
