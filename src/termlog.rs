//! `TermLog`: append-only, range-tracking log of one replication term.
//!
//! Unlike a record-framed WAL, a term log is addressed by absolute index
//! into a byte stream: `open_writer(index)` lets a writer append starting
//! anywhere, so out-of-order delivery from multiple feeders can leave
//! "islands" of durably-written-but-not-yet-contiguous data ahead of the
//! log's `highest_index`. `check_for_missing_data` reports those islands
//! as gaps so a reader can request retransmission instead of blocking
//! forever on a position that will never arrive from this term.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, instrument};

use crate::error::{Result, StoreError};

struct Inner {
    file: File,
    prev_term: u64,
    term: u64,
    prev_index: u64,
    /// Largest index such that `[prev_index, highest_index)` is fully,
    /// contiguously written.
    highest_index: u64,
    /// Largest index that has been committed; always `<= highest_index`.
    commit_index: u64,
    /// `None` until `finish_term` is called, at which point `Some(index)`.
    end_index: Option<u64>,
    /// Durably written ranges beyond `highest_index` that haven't yet
    /// become contiguous with it, keyed by range start.
    pending: BTreeMap<u64, u64>,
}

/// Append-only, range-tracking replication log for one term.
pub struct TermLog {
    inner: Mutex<Inner>,
    commit_cond: Condvar,
}

impl TermLog {
    /// Open (creating if necessary) a term log rooted at `dir`, starting
    /// at `prev_index` 0. Reopening an existing log trusts its file length
    /// as the contiguous high-water mark -- a term log does not persist
    /// `commit_index` or in-flight islands across a restart, so a caller
    /// recovering after a crash should re-derive commit state from the
    /// replication protocol rather than from this log alone.
    #[instrument(skip(dir))]
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let path = dir.join("term.data");
        let file = OpenOptions::new().create(true).read(true).write(true).open(&path)?;
        let existing_len = file.metadata()?.len();

        debug!(existing_len, "opened term log");
        Ok(TermLog {
            inner: Mutex::new(Inner {
                file,
                prev_term: 0,
                term: 0,
                prev_index: 0,
                highest_index: existing_len,
                commit_index: existing_len,
                end_index: None,
                pending: BTreeMap::new(),
            }),
            commit_cond: Condvar::new(),
        })
    }

    pub fn prev_term(&self) -> u64 {
        self.inner.lock().prev_term
    }

    pub fn term(&self) -> u64 {
        self.inner.lock().term
    }

    pub fn prev_index(&self) -> u64 {
        self.inner.lock().prev_index
    }

    /// Largest index such that everything from `prev_index` up to it has
    /// been durably, contiguously written.
    pub fn highest_index(&self) -> u64 {
        self.inner.lock().highest_index
    }

    pub fn commit_index(&self) -> u64 {
        self.inner.lock().commit_index
    }

    pub fn end_index(&self) -> Option<u64> {
        self.inner.lock().end_index
    }

    /// A writer appending from `index`. Multiple writers may coexist
    /// covering disjoint ranges.
    pub fn open_writer(self: &Arc<Self>, index: u64) -> LogWriter {
        LogWriter {
            log: self.clone(),
            position: index,
        }
    }

    /// A reader consuming committed data from `index`.
    pub fn open_reader(self: &Arc<Self>, index: u64) -> LogReader {
        LogReader {
            log: self.clone(),
            position: index,
        }
    }

    fn write_at(&self, index: u64, data: &[u8]) -> Result<usize> {
        let mut inner = self.inner.lock();
        let len = match inner.end_index {
            Some(end) if index >= end => return Ok(0),
            Some(end) => data.len().min((end - index) as usize),
            None => data.len(),
        };
        if len == 0 {
            return Ok(0);
        }

        let rel = index - inner.prev_index;
        inner.file.seek(SeekFrom::Start(rel))?;
        inner.file.write_all(&data[..len])?;

        Self::record_range(&mut inner, index, index + len as u64);
        Ok(len)
    }

    /// Fold a newly-written `[start, end)` range into `highest_index`
    /// (when it's contiguous with the current frontier) or into the
    /// pending-island set, then absorb any islands that have become
    /// contiguous as a result.
    fn record_range(inner: &mut Inner, start: u64, end: u64) {
        if start <= inner.highest_index {
            if end > inner.highest_index {
                inner.highest_index = end;
            }
        } else {
            Self::insert_island(&mut inner.pending, start, end);
        }
        loop {
            let hit = inner
                .pending
                .iter()
                .next()
                .filter(|&(&s, _)| s <= inner.highest_index)
                .map(|(&s, &e)| (s, e));
            match hit {
                Some((s, e)) => {
                    inner.pending.remove(&s);
                    if e > inner.highest_index {
                        inner.highest_index = e;
                    }
                }
                None => break,
            }
        }
    }

    /// Insert `[start, end)` into `pending`, coalescing with any
    /// overlapping or adjacent range already recorded.
    fn insert_island(pending: &mut BTreeMap<u64, u64>, mut start: u64, mut end: u64) {
        if let Some((&s, &e)) = pending.range(..=start).next_back() {
            if e >= start {
                start = start.min(s);
                end = end.max(e);
                pending.remove(&s);
            }
        }
        loop {
            let hit = pending.range(start..=end).next().map(|(&s, &e)| (s, e));
            match hit {
                Some((s, e)) => {
                    end = end.max(e);
                    pending.remove(&s);
                }
                None => break,
            }
        }
        pending.insert(start, end);
    }

    /// Advance the committed index; lower values are ignored. Clamped to
    /// `highest_index` (nothing not yet durably written can be committed)
    /// and, once the term has finished, to `end_index`.
    pub fn commit(&self, index: u64) -> Result<()> {
        let mut inner = self.inner.lock();
        let mut ceiling = inner.highest_index;
        if let Some(end) = inner.end_index {
            ceiling = ceiling.min(end);
        }
        let target = index.min(ceiling);
        if target > inner.commit_index {
            inner.commit_index = target;
            self.commit_cond.notify_all();
        }
        Ok(())
    }

    /// Block until `commit_index >= wait_for`, returning it. Returns
    /// `None` if the term finishes with `end_index < wait_for` -- nothing
    /// will ever satisfy the wait.
    pub fn wait_for_commit(&self, wait_for: u64) -> Result<Option<u64>> {
        let mut inner = self.inner.lock();
        loop {
            if inner.commit_index >= wait_for {
                return Ok(Some(inner.commit_index));
            }
            if let Some(end) = inner.end_index {
                if end < wait_for {
                    return Ok(None);
                }
            }
            self.commit_cond.wait(&mut inner);
        }
    }

    /// Callback variant of [`TermLog::wait_for_commit`].
    pub fn upon_commit(&self, wait_for: u64, callback: impl FnOnce(Option<u64>)) -> Result<()> {
        let result = self.wait_for_commit(wait_for)?;
        callback(result);
        Ok(())
    }

    /// Fsync the backing file. The first call on an empty term is a no-op
    /// in effect, since there is nothing dirty to flush.
    pub fn sync(&self) -> Result<()> {
        let inner = self.inner.lock();
        inner.file.sync_data()?;
        Ok(())
    }

    /// Mark the end of this term at `index`: ranges strictly past `index`
    /// are discarded, `highest_index` is clamped down to `index`, and
    /// `commit_index` is never raised. A no-op if already finished at
    /// `index`; an error if finished at a different index already, or if
    /// `index` precedes the already-committed position.
    pub fn finish_term(&self, index: u64) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(end) = inner.end_index {
            if index == end {
                return Ok(());
            }
            if index > end {
                return Err(StoreError::illegal_state(
                    "finish_term index exceeds an already-finished end_index",
                ));
            }
        }
        if index < inner.commit_index {
            return Err(StoreError::invalid("finish_term index precedes commit_index"));
        }

        inner.pending.retain(|&start, end| {
            if start >= index {
                false
            } else {
                if *end > index {
                    *end = index;
                }
                true
            }
        });
        if inner.highest_index > index {
            inner.highest_index = index;
        }
        inner.end_index = Some(index);
        self.commit_cond.notify_all();
        Ok(())
    }

    /// Report gaps between `contiguous_up_to` and the recorded `end_index`
    /// (or, while unfinished, up to the last known island -- no trailing
    /// gap is emitted for an unbounded tail), invoking `sink(start, end)`
    /// for each. Returns the log's own contiguous upper bound
    /// (`highest_index`), which a caller typically threads back in as the
    /// next call's `contiguous_up_to`. Passing `u64::MAX` returns the
    /// contiguous bound and emits nothing.
    pub fn check_for_missing_data(&self, contiguous_up_to: u64, mut sink: impl FnMut(u64, u64)) -> u64 {
        let inner = self.inner.lock();
        if contiguous_up_to == u64::MAX {
            return inner.highest_index;
        }
        let mut cursor = contiguous_up_to.max(inner.highest_index);
        for (&start, &end) in inner.pending.range(cursor..) {
            if start > cursor {
                sink(cursor, start);
            }
            cursor = cursor.max(end);
        }
        if let Some(end_idx) = inner.end_index {
            if cursor < end_idx {
                sink(cursor, end_idx);
            }
        }
        inner.highest_index
    }
}

/// A writer appending to a [`TermLog`] from some starting index.
pub struct LogWriter {
    log: Arc<TermLog>,
    position: u64,
}

impl LogWriter {
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Append `data` at the writer's current position, advancing it by
    /// the number of bytes actually written. Clamped to `end_index`:
    /// crossing it writes a prefix, writing entirely past it writes `0`.
    pub fn write(&mut self, data: &[u8]) -> Result<usize> {
        let written = self.log.write_at(self.position, data)?;
        self.position += written as u64;
        Ok(written)
    }
}

/// A reader consuming committed data from a [`TermLog`].
pub struct LogReader {
    log: Arc<TermLog>,
    position: u64,
}

impl LogReader {
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Read up to `buf.len()` committed bytes, blocking until at least one
    /// byte is available. Returns `Ok(-1)` once the term has finished and
    /// no more data will ever arrive at this position.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<i64> {
        loop {
            let mut inner = self.log.inner.lock();
            let available = inner.commit_index.saturating_sub(self.position);
            if available > 0 {
                let rel = self.position - inner.prev_index;
                let want = (buf.len() as u64).min(available) as usize;
                inner.file.seek(SeekFrom::Start(rel))?;
                inner.file.read_exact(&mut buf[..want])?;
                self.position += want as u64;
                return Ok(want as i64);
            }
            if let Some(end) = inner.end_index {
                if end <= self.position {
                    return Ok(-1);
                }
            }
            self.log.commit_cond.wait(&mut inner);
        }
    }

    /// Read up to `buf.len()` committed bytes without blocking. Returns
    /// `Ok(0)` if nothing is currently available at the contiguous tail.
    pub fn read_any(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut inner = self.log.inner.lock();
        let available = inner.commit_index.saturating_sub(self.position);
        if available == 0 {
            return Ok(0);
        }
        let rel = self.position - inner.prev_index;
        let want = (buf.len() as u64).min(available) as usize;
        inner.file.seek(SeekFrom::Start(rel))?;
        inner.file.read_exact(&mut buf[..want])?;
        self.position += want as u64;
        Ok(want)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_commit_and_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let log = Arc::new(TermLog::open(dir.path()).unwrap());

        let mut writer = log.open_writer(0);
        assert_eq!(writer.write(b"hello").unwrap(), 5);

        log.commit(2).unwrap();
        log.commit(5).unwrap();
        assert_eq!(log.wait_for_commit(5).unwrap(), Some(5));

        let mut reader = log.open_reader(0);
        let mut buf = [0u8; 5];
        assert_eq!(reader.read(&mut buf).unwrap(), 5);
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn wait_for_commit_unblocks_after_commit() {
        let dir = tempfile::tempdir().unwrap();
        let log = Arc::new(TermLog::open(dir.path()).unwrap());
        log.open_writer(0).write(b"one").unwrap();

        let reader_log = log.clone();
        let handle = std::thread::spawn(move || reader_log.wait_for_commit(3));
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(!handle.is_finished());

        log.commit(3).unwrap();
        assert_eq!(handle.join().unwrap().unwrap(), Some(3));
    }

    #[test]
    fn out_of_order_write_reports_gap_until_filled() {
        let dir = tempfile::tempdir().unwrap();
        let log = TermLog::open(dir.path()).unwrap();

        let mut writer = log.open_writer(50);
        writer.write(&[0u8; 100]).unwrap();

        let mut gaps = Vec::new();
        let bound = log.check_for_missing_data(0, |s, e| gaps.push((s, e)));
        assert_eq!(bound, 0);
        assert_eq!(gaps, vec![(0, 50)]);

        let mut filler = log.open_writer(0);
        filler.write(&[0u8; 55]).unwrap();

        let mut gaps = Vec::new();
        let bound = log.check_for_missing_data(0, |s, e| gaps.push((s, e)));
        assert_eq!(bound, 150);
        assert!(gaps.is_empty());
    }

    #[test]
    fn finish_term_truncates_ranges_past_index_and_clamps_highest() {
        let dir = tempfile::tempdir().unwrap();
        let log = TermLog::open(dir.path()).unwrap();
        log.open_writer(0).write(b"hello").unwrap();
        log.commit(3).unwrap();

        log.finish_term(4).unwrap();
        assert_eq!(log.end_index(), Some(4));
        assert_eq!(log.highest_index(), 4);
        assert_eq!(log.commit_index(), 3);

        // Re-finishing at the same index is a no-op.
        log.finish_term(4).unwrap();
        // Finishing before the already-committed position is rejected.
        assert!(log.finish_term(1).is_err());
    }

    #[test]
    fn writes_past_end_index_are_clamped_or_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let log = TermLog::open(dir.path()).unwrap();
        log.finish_term(5).unwrap();

        let mut writer = log.open_writer(3);
        // Crosses end_index at 5: only 2 of the 4 bytes are accepted.
        assert_eq!(writer.write(b"abcd").unwrap(), 2);

        let mut past = log.open_writer(10);
        assert_eq!(past.write(b"later").unwrap(), 0);
    }
}
