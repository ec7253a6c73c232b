//! Database-open configuration, following the teacher's builder-struct
//! convention for knobs that matter at open time and rarely change after.

use std::path::PathBuf;

use crate::lockmanager::Timeout;

/// How aggressively `PageDb::commit` flushes to the backing store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DurabilityMode {
    /// `fsync` before and after publishing the header (default, crash-safe).
    Sync,
    /// Skip the data `fsync`; only the header write is flushed. Faster,
    /// tolerates process crashes but not power loss.
    NoSync,
    /// No flushing at all; for throwaway/test databases only.
    NoFlush,
}

impl Default for DurabilityMode {
    fn default() -> Self {
        DurabilityMode::Sync
    }
}

/// Open-time configuration for a database.
#[derive(Debug, Clone)]
pub struct Options {
    pub path: Option<PathBuf>,
    pub page_size: usize,
    pub min_cache_pages: usize,
    pub max_cache_pages: usize,
    pub durability: DurabilityMode,
    pub lock_timeout: Timeout,
    pub create_if_missing: bool,
    pub destroy_existing: bool,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            path: None,
            page_size: 4096,
            min_cache_pages: 128,
            max_cache_pages: 4096,
            durability: DurabilityMode::Sync,
            lock_timeout: Timeout::Nanos(1_000_000_000),
            create_if_missing: true,
            destroy_existing: false,
        }
    }
}

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn page_size(mut self, size: usize) -> Self {
        self.page_size = size;
        self
    }

    pub fn cache_pages(mut self, min: usize, max: usize) -> Self {
        self.min_cache_pages = min;
        self.max_cache_pages = max;
        self
    }

    pub fn durability(mut self, mode: DurabilityMode) -> Self {
        self.durability = mode;
        self
    }

    pub fn lock_timeout(mut self, timeout: Timeout) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    /// In-memory database with no backing file, for tests and scratch use.
    pub fn memory() -> Self {
        Options {
            path: None,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_overrides_defaults() {
        let opts = Options::new()
            .page_size(8192)
            .cache_pages(16, 256)
            .durability(DurabilityMode::NoSync)
            .create_if_missing(false);
        assert_eq!(opts.page_size, 8192);
        assert_eq!(opts.min_cache_pages, 16);
        assert_eq!(opts.max_cache_pages, 256);
        assert_eq!(opts.durability, DurabilityMode::NoSync);
        assert!(!opts.create_if_missing);
    }

    #[test]
    fn memory_options_have_no_path() {
        assert!(Options::memory().path.is_none());
    }
}
