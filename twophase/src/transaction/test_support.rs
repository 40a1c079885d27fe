use crate::common::{
    BackendId, LockDescriptor, LockManager, LockMode, LockTable, MemoryCommitLog, TransactionId,
};
use crate::transaction::{GxactHandle, PrepareRequest, RecoveryReport, Session, TwoPhaseManager};
use crate::wal::MemoryWal;
use std::sync::Arc;
use tempfile::TempDir;

/// A manager over in-memory collaborators that can be crashed and restarted.
pub(crate) struct Fixture {
    pub dir: TempDir,
    pub capacity: usize,
    pub wal: MemoryWal,
    pub locks: LockTable,
    pub commit_log: MemoryCommitLog,
    pub manager: TwoPhaseManager,
}

impl Fixture {
    /// A recovered manager in normal mode.
    pub fn new(capacity: usize) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let wal = MemoryWal::new();
        let locks = LockTable::new();
        let commit_log = MemoryCommitLog::new();
        let manager = build(&dir, capacity, &wal, &locks, &commit_log);
        manager.startup_recovery(None).unwrap();
        Fixture {
            dir,
            capacity,
            wal,
            locks,
            commit_log,
            manager,
        }
    }

    /// A fresh manager over the same log, state files and commit log, still in
    /// startup mode. Locks do not survive.
    pub fn reopen(&mut self) -> TwoPhaseManager {
        self.locks = LockTable::new();
        self.manager = build(&self.dir, self.capacity, &self.wal, &self.locks, &self.commit_log);
        self.manager.clone()
    }

    /// Loses unflushed log bytes and runs crash recovery on a new manager.
    pub fn crash_and_recover(&mut self) -> RecoveryReport {
        self.wal.crash();
        self.reopen().startup_recovery(None).unwrap()
    }

    /// Prepares `xid` under `gid`, holding a row-exclusive lock on `relation`.
    pub fn prepare(&self, session: &Session, xid: u32, gid: &str, relation: u32) -> GxactHandle {
        let lock = LockDescriptor::relation(session.database(), relation, LockMode::RowExclusive);
        self.locks.acquire(session.lock_owner(), &lock).unwrap();
        let request = PrepareRequest::new(TransactionId(xid), gid).with_locks(vec![lock]);
        self.manager.prepare(session, request).unwrap()
    }
}

pub(crate) fn session(backend: u32) -> Session {
    Session::new(BackendId(backend), 10, 5)
}

fn build(
    dir: &TempDir,
    capacity: usize,
    wal: &MemoryWal,
    locks: &LockTable,
    commit_log: &MemoryCommitLog,
) -> TwoPhaseManager {
    TwoPhaseManager::builder()
        .max_prepared_transactions(capacity)
        .max_backends(10)
        .state_dir(dir.path().join("twophase"))
        .wal(Arc::new(wal.clone()))
        .lock_manager(Arc::new(locks.clone()))
        .commit_log(Arc::new(commit_log.clone()))
        .build()
        .unwrap()
}
