use std::path::PathBuf;
use std::sync::Arc;
use twophase::common::{CommitLog, LockTable, MemoryCommitLog, TransactionStatus};
use twophase::errors::{ErrorKind, TwoPhaseResult};
use twophase::transaction::{RecoveryMode, TwoPhaseManager};
use twophase::wal::{encode_frame, WriteAheadLog};
use twophase_int_test::test_util::{
    cleanup, create_test_context, random_path, relation_lock, run_test, session, TestContext,
};

/// A standby reading the primary's log, with its own state directory, locks
/// and commit log.
struct Standby {
    manager: TwoPhaseManager,
    commit_log: MemoryCommitLog,
    path: String,
}

impl Standby {
    fn new(primary: &TestContext) -> TwoPhaseResult<Self> {
        let path = random_path();
        let commit_log = MemoryCommitLog::new();
        let manager = TwoPhaseManager::builder()
            .max_prepared_transactions(16)
            .max_backends(100)
            .state_dir(PathBuf::from(&path).join("twophase"))
            .wal(Arc::new(primary.wal()))
            .lock_manager(Arc::new(LockTable::new()))
            .commit_log(Arc::new(commit_log.clone()) as Arc<dyn CommitLog>)
            .build()?;
        Ok(Standby {
            manager,
            commit_log,
            path,
        })
    }
}

impl Drop for Standby {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.path);
    }
}

#[test]
fn test_standby_follows_primary_and_promotes() {
    run_test(
        || create_test_context(),
        |ctx| {
            let s = session(1);
            let xa = ctx.next_xid();
            let xb = ctx.next_xid();
            ctx.prepare(&s, xa, "a", &[1])?;
            ctx.prepare(&s, xb, "b", &[2])?;

            let standby = Standby::new(&ctx)?;
            let report = standby.manager.start_standby(None)?;
            assert_eq!(report.replay.prepares, 2);
            assert_eq!(report.running_xids, vec![xa, xb]);
            assert_eq!(standby.manager.mode(), RecoveryMode::Standby);
            assert_eq!(standby.manager.locks_held("a")?, vec![relation_lock(1)]);

            ctx.manager().finish_prepared(&s, "a", true, true)?;
            let xc = ctx.next_xid();
            ctx.prepare(&s, xc, "c", &[3])?;

            let outcome = standby.manager.standby_replay()?;
            assert_eq!(outcome.commits, 1);
            assert_eq!(outcome.prepares, 1);
            assert!(!standby.manager.standby_transaction_id_is_prepared(xa));
            assert!(standby.manager.standby_transaction_id_is_prepared(xb));
            assert!(standby.manager.standby_transaction_id_is_prepared(xc));
            assert_eq!(standby.commit_log.status(xa), TransactionStatus::Committed);
            // locks of records replayed after standby start are taken right away
            assert_eq!(standby.manager.locks_held("c")?, vec![relation_lock(3)]);

            let err = standby
                .manager
                .finish_prepared(&s, "b", true, true)
                .unwrap_err();
            assert_eq!(err.kind(), &ErrorKind::InvalidOperation);

            assert_eq!(standby.manager.promote()?, 2);
            assert_eq!(standby.manager.mode(), RecoveryMode::Normal);
            assert_eq!(standby.manager.locks_held("b")?, vec![relation_lock(2)]);

            assert!(standby.manager.finish_prepared(&s, "b", false, true)?);
            assert!(standby.manager.finish_prepared(&s, "c", true, true)?);
            assert!(standby.manager.is_empty());
            assert_eq!(standby.commit_log.status(xb), TransactionStatus::Aborted);
            assert_eq!(standby.commit_log.status(xc), TransactionStatus::Committed);
            Ok(())
        },
        |ctx| cleanup(ctx),
    )
}

#[test]
fn test_standby_waits_for_incomplete_record() {
    run_test(
        || create_test_context(),
        |ctx| {
            ctx.prepare(&session(1), ctx.next_xid(), "before", &[1])?;
            let standby = Standby::new(&ctx)?;
            standby.manager.start_standby(None)?;

            // a record from another subsystem, arriving in two pieces
            let wal = ctx.wal();
            let frame = encode_frame(200, b"not a two-phase record")?;
            let (head, rest) = frame.split_at(frame.len() / 2);
            let arriving_at = wal.end_lsn();
            wal.append(head)?;

            let outcome = standby.manager.standby_replay()?;
            assert_eq!(outcome.torn_tail, Some(arriving_at));
            assert_eq!(outcome.records, 0);
            assert_eq!(wal.end_lsn(), arriving_at.offset(head.len() as u64));

            wal.append(rest)?;
            let outcome = standby.manager.standby_replay()?;
            assert_eq!(outcome.torn_tail, None);
            assert_eq!(outcome.records, 1);
            assert_eq!(outcome.start, arriving_at);
            Ok(())
        },
        |ctx| cleanup(ctx),
    )
}

#[test]
fn test_standby_operations_need_standby_mode() {
    run_test(
        || create_test_context(),
        |ctx| {
            let standby = Standby::new(&ctx)?;
            let err = standby.manager.standby_replay().unwrap_err();
            assert_eq!(err.kind(), &ErrorKind::InvalidOperation);
            let err = standby.manager.promote().unwrap_err();
            assert_eq!(err.kind(), &ErrorKind::InvalidOperation);

            standby.manager.start_standby(None)?;
            let err = standby.manager.start_standby(None).unwrap_err();
            assert_eq!(err.kind(), &ErrorKind::InvalidOperation);
            Ok(())
        },
        |ctx| cleanup(ctx),
    )
}
