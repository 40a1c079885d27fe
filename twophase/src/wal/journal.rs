use crate::common::{Lsn, LsnRange};
use crate::errors::{ErrorKind, TwoPhaseError, TwoPhaseResult};
use parking_lot::RwLock;
use std::sync::Arc;

/// Position of the first byte ever written to a log. Everything below is a
/// reserved header so that `Lsn(0)` stays invalid.
pub const WAL_START: Lsn = Lsn(16);

/// Byte-level contract of the write-ahead log.
///
/// Framing is done by the caller; the log only stores bytes and hands out the
/// positions they landed at.
pub trait WriteAheadLog: Send + Sync {
    /// Appends `bytes` and returns the range they occupy.
    fn append(&self, bytes: &[u8]) -> TwoPhaseResult<LsnRange>;

    /// Makes everything up to `upto` durable.
    fn flush(&self, upto: Lsn) -> TwoPhaseResult<()>;

    /// Reads up to `len` bytes starting at `at`. Returns fewer bytes at the end
    /// of the log and fails with [`ErrorKind::WalSegmentRemoved`] below
    /// [`WriteAheadLog::oldest_lsn`].
    fn read(&self, at: Lsn, len: usize) -> TwoPhaseResult<Vec<u8>>;

    /// Position just past the last appended byte.
    fn end_lsn(&self) -> Lsn;

    /// Oldest position still retained.
    fn oldest_lsn(&self) -> Lsn;

    /// Allows the log to drop everything before `lsn`.
    fn discard_before(&self, lsn: Lsn) -> TwoPhaseResult<()>;

    /// Drops everything from `at` onwards. Used to cut a torn tail after recovery.
    fn truncate(&self, at: Lsn) -> TwoPhaseResult<()>;
}

struct MemoryWalState {
    start: Lsn,
    bytes: Vec<u8>,
    flushed: Lsn,
}

impl MemoryWalState {
    fn end(&self) -> Lsn {
        self.start.offset(self.bytes.len() as u64)
    }
}

/// In-memory write-ahead log.
///
/// Clones share the same buffer, so a log can outlive the manager that wrote it
/// and be replayed by a new one. [`MemoryWal::crash`] drops everything that was
/// appended but not flushed, the way a power loss would.
#[derive(Clone)]
pub struct MemoryWal {
    state: Arc<RwLock<MemoryWalState>>,
}

impl Default for MemoryWal {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryWal {
    pub fn new() -> Self {
        MemoryWal {
            state: Arc::new(RwLock::new(MemoryWalState {
                start: WAL_START,
                bytes: Vec::new(),
                flushed: WAL_START,
            })),
        }
    }

    /// Highest flushed position.
    pub fn flushed_lsn(&self) -> Lsn {
        self.state.read().flushed
    }

    /// Loses every byte that was not flushed.
    pub fn crash(&self) {
        let mut state = self.state.write();
        let keep = (state.flushed.0 - state.start.0) as usize;
        state.bytes.truncate(keep);
        log::debug!("Simulated crash, WAL ends at {}", state.end());
    }

    /// Removes the last `bytes` bytes, even if flushed, to simulate a torn write.
    pub fn tear_tail(&self, bytes: usize) {
        let mut state = self.state.write();
        let keep = state.bytes.len().saturating_sub(bytes);
        state.bytes.truncate(keep);
        let end = state.end();
        if state.flushed > end {
            state.flushed = end;
        }
    }

    /// Flips one byte at `at`, to simulate media corruption.
    pub fn corrupt_byte(&self, at: Lsn) -> TwoPhaseResult<()> {
        let mut state = self.state.write();
        if at < state.start || at >= state.end() {
            return Err(TwoPhaseError::new(
                &format!("position {} is outside the log", at),
                ErrorKind::InvalidOperation,
            ));
        }
        let index = (at.0 - state.start.0) as usize;
        state.bytes[index] ^= 0xFF;
        Ok(())
    }
}

impl WriteAheadLog for MemoryWal {
    fn append(&self, bytes: &[u8]) -> TwoPhaseResult<LsnRange> {
        let mut state = self.state.write();
        let start = state.end();
        state.bytes.extend_from_slice(bytes);
        Ok(LsnRange {
            start,
            end: state.end(),
        })
    }

    fn flush(&self, upto: Lsn) -> TwoPhaseResult<()> {
        let mut state = self.state.write();
        let end = state.end();
        if upto > end {
            return Err(TwoPhaseError::new(
                &format!("cannot flush to {}, log ends at {}", upto, end),
                ErrorKind::WalError,
            ));
        }
        if upto > state.flushed {
            state.flushed = upto;
        }
        Ok(())
    }

    fn read(&self, at: Lsn, len: usize) -> TwoPhaseResult<Vec<u8>> {
        let state = self.state.read();
        if at < state.start {
            return Err(TwoPhaseError::new(
                &format!(
                    "requested WAL position {} has already been removed, oldest is {}",
                    at, state.start
                ),
                ErrorKind::WalSegmentRemoved,
            ));
        }
        let from = ((at.0 - state.start.0) as usize).min(state.bytes.len());
        let to = from.saturating_add(len).min(state.bytes.len());
        Ok(state.bytes[from..to].to_vec())
    }

    fn end_lsn(&self) -> Lsn {
        self.state.read().end()
    }

    fn oldest_lsn(&self) -> Lsn {
        self.state.read().start
    }

    fn discard_before(&self, lsn: Lsn) -> TwoPhaseResult<()> {
        let mut state = self.state.write();
        if lsn <= state.start {
            return Ok(());
        }
        if lsn > state.flushed {
            return Err(TwoPhaseError::new(
                &format!("cannot discard unflushed WAL up to {}", lsn),
                ErrorKind::WalError,
            ));
        }
        let drop = (lsn.0 - state.start.0) as usize;
        state.bytes.drain(..drop);
        state.start = lsn;
        log::debug!("Discarded WAL before {}", lsn);
        Ok(())
    }

    fn truncate(&self, at: Lsn) -> TwoPhaseResult<()> {
        let mut state = self.state.write();
        if at < state.start {
            return Err(TwoPhaseError::new(
                &format!("cannot truncate at {}, oldest retained is {}", at, state.start),
                ErrorKind::WalSegmentRemoved,
            ));
        }
        let keep = ((at.0 - state.start.0) as usize).min(state.bytes.len());
        state.bytes.truncate(keep);
        let end = state.end();
        if state.flushed > end {
            state.flushed = end;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_returns_contiguous_ranges() {
        let wal = MemoryWal::new();
        let a = wal.append(b"abc").unwrap();
        let b = wal.append(b"de").unwrap();
        assert_eq!(a.start, WAL_START);
        assert_eq!(a.end, b.start);
        assert_eq!(b.end, WAL_START.offset(5));
        assert_eq!(wal.read(b.start, 10).unwrap(), b"de");
    }

    #[test]
    fn test_crash_loses_unflushed_bytes() {
        let wal = MemoryWal::new();
        let a = wal.append(b"durable").unwrap();
        wal.flush(a.end).unwrap();
        wal.append(b"volatile").unwrap();

        wal.crash();
        assert_eq!(wal.end_lsn(), a.end);
    }

    #[test]
    fn test_flush_past_end_fails() {
        let wal = MemoryWal::new();
        assert_eq!(wal.flush(Lsn(1000)).unwrap_err().kind(), &ErrorKind::WalError);
    }

    #[test]
    fn test_discard_before() {
        let wal = MemoryWal::new();
        let a = wal.append(b"old").unwrap();
        let b = wal.append(b"new").unwrap();
        wal.flush(b.end).unwrap();

        wal.discard_before(b.start).unwrap();
        assert_eq!(wal.oldest_lsn(), b.start);
        assert_eq!(wal.read(a.start, 3).unwrap_err().kind(), &ErrorKind::WalSegmentRemoved);
        assert_eq!(wal.read(b.start, 3).unwrap(), b"new");
    }

    #[test]
    fn test_discard_unflushed_fails() {
        let wal = MemoryWal::new();
        let a = wal.append(b"abc").unwrap();
        assert!(wal.discard_before(a.end).is_err());
    }

    #[test]
    fn test_truncate_and_tear_tail() {
        let wal = MemoryWal::new();
        let a = wal.append(b"abcdef").unwrap();
        wal.flush(a.end).unwrap();
        wal.tear_tail(2);
        assert_eq!(wal.end_lsn(), Lsn(a.end.0 - 2));
        assert!(wal.flushed_lsn() <= wal.end_lsn());

        wal.truncate(a.start.offset(1)).unwrap();
        assert_eq!(wal.read(a.start, 10).unwrap(), b"a");
    }

    #[test]
    fn test_corrupt_byte() {
        let wal = MemoryWal::new();
        let a = wal.append(&[0u8; 4]).unwrap();
        wal.corrupt_byte(a.start.offset(2)).unwrap();
        assert_eq!(wal.read(a.start, 4).unwrap(), vec![0, 0, 0xFF, 0]);
        assert!(wal.corrupt_byte(a.end).is_err());
    }
}
