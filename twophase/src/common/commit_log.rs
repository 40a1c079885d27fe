use crate::common::types::TransactionId;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;

/// Final status of a transaction as known to the transaction manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionStatus {
    InProgress,
    Committed,
    Aborted,
}

/// The slice of the transaction manager this crate talks to: recording the
/// outcome of a finished prepared transaction and answering whether an id is
/// already decided or lies in the future.
pub trait CommitLog: Send + Sync {
    fn status(&self, xid: TransactionId) -> TransactionStatus;

    fn set_committed(&self, xid: TransactionId, subxids: &[TransactionId]);

    fn set_aborted(&self, xid: TransactionId, subxids: &[TransactionId]);

    /// The next id the transaction manager will assign.
    fn next_transaction_id(&self) -> TransactionId;

    /// Makes sure `xid` is below the next id to assign. Used during replay.
    fn advance_next_transaction_id(&self, xid: TransactionId);
}

/// In-memory commit log.
///
/// Cheap to clone, all clones share the same state, which lets tests keep the
/// "durable" transaction status across a simulated restart.
#[derive(Clone)]
pub struct MemoryCommitLog {
    statuses: Arc<DashMap<TransactionId, TransactionStatus>>,
    next_xid: Arc<Mutex<TransactionId>>,
}

impl Default for MemoryCommitLog {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCommitLog {
    pub fn new() -> Self {
        MemoryCommitLog {
            statuses: Arc::new(DashMap::new()),
            next_xid: Arc::new(Mutex::new(TransactionId::FIRST_NORMAL)),
        }
    }

    /// Hands out the next transaction id.
    pub fn assign(&self) -> TransactionId {
        let mut next = self.next_xid.lock();
        let xid = *next;
        *next = advance(xid);
        xid
    }

    fn set_status(&self, xid: TransactionId, subxids: &[TransactionId], status: TransactionStatus) {
        for sub in subxids {
            self.statuses.insert(*sub, status);
        }
        self.statuses.insert(xid, status);
    }
}

fn advance(xid: TransactionId) -> TransactionId {
    let next = TransactionId(xid.0.wrapping_add(1));
    if next.is_normal() {
        next
    } else {
        TransactionId::FIRST_NORMAL
    }
}

impl CommitLog for MemoryCommitLog {
    fn status(&self, xid: TransactionId) -> TransactionStatus {
        self.statuses
            .get(&xid)
            .map(|s| *s)
            .unwrap_or(TransactionStatus::InProgress)
    }

    fn set_committed(&self, xid: TransactionId, subxids: &[TransactionId]) {
        self.set_status(xid, subxids, TransactionStatus::Committed);
    }

    fn set_aborted(&self, xid: TransactionId, subxids: &[TransactionId]) {
        self.set_status(xid, subxids, TransactionStatus::Aborted);
    }

    fn next_transaction_id(&self) -> TransactionId {
        *self.next_xid.lock()
    }

    fn advance_next_transaction_id(&self, xid: TransactionId) {
        let mut next = self.next_xid.lock();
        if xid.follows_or_equals(*next) {
            *next = advance(xid);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_xid_is_in_progress() {
        let clog = MemoryCommitLog::new();
        assert_eq!(clog.status(TransactionId(10)), TransactionStatus::InProgress);
    }

    #[test]
    fn test_set_committed_covers_subxids() {
        let clog = MemoryCommitLog::new();
        clog.set_committed(TransactionId(10), &[TransactionId(11), TransactionId(12)]);
        assert_eq!(clog.status(TransactionId(10)), TransactionStatus::Committed);
        assert_eq!(clog.status(TransactionId(12)), TransactionStatus::Committed);
    }

    #[test]
    fn test_assign_and_advance() {
        let clog = MemoryCommitLog::new();
        assert_eq!(clog.assign(), TransactionId(3));
        assert_eq!(clog.next_transaction_id(), TransactionId(4));

        clog.advance_next_transaction_id(TransactionId(100));
        assert_eq!(clog.next_transaction_id(), TransactionId(101));

        // older ids never move the counter back
        clog.advance_next_transaction_id(TransactionId(50));
        assert_eq!(clog.next_transaction_id(), TransactionId(101));
    }

    #[test]
    fn test_clones_share_state() {
        let clog = MemoryCommitLog::new();
        let other = clog.clone();
        clog.set_aborted(TransactionId(9), &[]);
        assert_eq!(other.status(TransactionId(9)), TransactionStatus::Aborted);
    }
}
