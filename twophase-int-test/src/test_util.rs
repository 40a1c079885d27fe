use parking_lot::Mutex;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::Arc;
use std::{env, fs};
use twophase::common::{
    BackendId, CommitLog, LockDescriptor, LockManager, LockMode, LockTable, MemoryCommitLog, Oid,
    TransactionId,
};
use twophase::errors::TwoPhaseResult;
use twophase::transaction::{
    CheckpointStats, GxactHandle, PrepareRequest, RecoveryReport, Session, TwoPhaseManager,
};
use twophase::wal::{MemoryWal, WriteAheadLog};

/// Database every test session connects to.
pub const DATABASE: Oid = 5;
/// User every test session runs as.
pub const USER: Oid = 10;

/// Runs a test between a setup and a teardown step.
///
/// The teardown runs even if the test fails or panics.
pub fn run_test<T, B, A>(before: B, test: T, after: A)
where
    T: Fn(TestContext) -> TwoPhaseResult<()>,
    B: Fn() -> TwoPhaseResult<TestContext>,
    A: Fn(TestContext) -> TwoPhaseResult<()>,
{
    let ctx = match before() {
        Ok(ctx) => ctx,
        Err(e) => panic!("Before run failed: {:?}", e),
    };

    let result = panic::catch_unwind(AssertUnwindSafe(|| test(ctx.clone())));
    let after_result = after(ctx);

    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => panic!("Test failed: {:?}", e),
        Err(panic_payload) => panic::resume_unwind(panic_payload),
    }
    if let Err(e) = after_result {
        panic!("After run failed: {:?}", e);
    }
}

struct Node {
    locks: LockTable,
    manager: TwoPhaseManager,
}

/// A two-phase manager whose log, commit log and state directory outlive it,
/// so tests can crash it and start a new one over the same durable state.
#[derive(Clone)]
pub struct TestContext {
    path: String,
    capacity: usize,
    wal: MemoryWal,
    commit_log: MemoryCommitLog,
    node: Arc<Mutex<Node>>,
}

impl TestContext {
    fn new(path: String, capacity: usize) -> TwoPhaseResult<Self> {
        let wal = MemoryWal::new();
        let commit_log = MemoryCommitLog::new();
        let node = start_node(&path, capacity, &wal, &commit_log)?;
        node.manager.startup_recovery(None)?;
        Ok(TestContext {
            path,
            capacity,
            wal,
            commit_log,
            node: Arc::new(Mutex::new(node)),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn state_dir(&self) -> PathBuf {
        PathBuf::from(&self.path).join("twophase")
    }

    pub fn manager(&self) -> TwoPhaseManager {
        self.node.lock().manager.clone()
    }

    pub fn locks(&self) -> LockTable {
        self.node.lock().locks.clone()
    }

    pub fn wal(&self) -> MemoryWal {
        self.wal.clone()
    }

    pub fn commit_log(&self) -> MemoryCommitLog {
        self.commit_log.clone()
    }

    /// Hands out a fresh transaction id.
    pub fn next_xid(&self) -> TransactionId {
        self.commit_log.assign()
    }

    /// Simulates a crash: unflushed log bytes and every lock are lost. The new
    /// manager is returned still in startup mode.
    pub fn crash(&self) -> TwoPhaseResult<TwoPhaseManager> {
        self.wal.crash();
        let node = start_node(&self.path, self.capacity, &self.wal, &self.commit_log)?;
        let manager = node.manager.clone();
        *self.node.lock() = node;
        Ok(manager)
    }

    /// Crashes and runs crash recovery.
    pub fn restart(&self) -> TwoPhaseResult<RecoveryReport> {
        let manager = self.crash()?;
        manager.startup_recovery(None)
    }

    /// Prepares `xid` as `gid`, after taking a row-exclusive lock on each of
    /// `relations` for `session`.
    pub fn prepare(
        &self,
        session: &Session,
        xid: TransactionId,
        gid: &str,
        relations: &[Oid],
    ) -> TwoPhaseResult<GxactHandle> {
        let locks = self.locks();
        let mut held = Vec::with_capacity(relations.len());
        for relation in relations {
            let lock = relation_lock(*relation);
            locks.acquire(session.lock_owner(), &lock)?;
            held.push(lock);
        }
        let request = PrepareRequest::new(xid, gid).with_locks(held);
        self.manager().prepare(session, request)
    }

    /// Runs a checkpoint at the current end of the log and discards the log
    /// the manager no longer needs.
    pub fn checkpoint(&self) -> TwoPhaseResult<CheckpointStats> {
        let redo = self.wal.end_lsn();
        self.wal.flush(redo)?;
        let stats = self.manager().check_point(redo)?;
        self.wal.discard_before(stats.retain_from)?;
        Ok(stats)
    }

    /// Number of state files currently on disk.
    pub fn state_file_count(&self) -> usize {
        fs::read_dir(self.state_dir())
            .map(|entries| entries.filter_map(|e| e.ok()).count())
            .unwrap_or(0)
    }
}

fn start_node(
    path: &str,
    capacity: usize,
    wal: &MemoryWal,
    commit_log: &MemoryCommitLog,
) -> TwoPhaseResult<Node> {
    let locks = LockTable::new();
    let manager = TwoPhaseManager::builder()
        .max_prepared_transactions(capacity)
        .max_backends(100)
        .state_dir(PathBuf::from(path).join("twophase"))
        .wal(Arc::new(wal.clone()))
        .lock_manager(Arc::new(locks.clone()))
        .commit_log(Arc::new(commit_log.clone()) as Arc<dyn CommitLog>)
        .build()?;
    Ok(Node { locks, manager })
}

/// A session of the test user.
pub fn session(backend: u32) -> Session {
    Session::new(BackendId(backend), USER, DATABASE)
}

/// The row-exclusive lock the test helpers take on `relation`.
pub fn relation_lock(relation: Oid) -> LockDescriptor {
    LockDescriptor::relation(DATABASE, relation, LockMode::RowExclusive)
}

pub fn random_path() -> String {
    let id = uuid::Uuid::new_v4();
    let temp_dir = env::temp_dir();
    temp_dir.join(id.to_string()).to_string_lossy().to_string()
}

pub fn create_test_context() -> TwoPhaseResult<TestContext> {
    create_test_context_with_capacity(16)
}

pub fn create_test_context_with_capacity(capacity: usize) -> TwoPhaseResult<TestContext> {
    TestContext::new(random_path(), capacity)
}

pub fn cleanup(ctx: TestContext) -> TwoPhaseResult<()> {
    if PathBuf::from(ctx.path()).exists() {
        log::debug!("Removing test directory {}", ctx.path());
        fs::remove_dir_all(ctx.path())?;
    }
    Ok(())
}
