use twophase::common::{
    CommitLog, LockDescriptor, LockManager, LockMode, TransactionId, TransactionStatus,
};
use twophase::errors::ErrorKind;
use twophase::transaction::{PrepareRequest, RecoveryMode, RecoveryScanner, ScanMode};
use twophase::wal::WriteAheadLog;
use twophase_int_test::test_util::{
    cleanup, create_test_context, create_test_context_with_capacity, relation_lock, run_test,
    session, DATABASE,
};

// ==================== Survival Tests ====================

#[test]
fn test_prepared_transaction_survives_restart() {
    run_test(
        || create_test_context(),
        |ctx| {
            let s = session(1);
            ctx.prepare(&s, TransactionId(100), "tx1", &[42])?;

            let report = ctx.restart()?;
            assert_eq!(report.recovered, 1);

            let manager = ctx.manager();
            assert_eq!(manager.mode(), RecoveryMode::Normal);
            assert!(manager.is_prepared(TransactionId(100)));
            let info = manager.prepared_transactions();
            assert_eq!(info.len(), 1);
            assert_eq!(info[0].gid, "tx1");
            assert_eq!(manager.locks_held("tx1")?, vec![relation_lock(42)]);

            assert!(manager.finish_prepared(&s, "tx1", true, true)?);
            assert_eq!(
                ctx.commit_log().status(TransactionId(100)),
                TransactionStatus::Committed
            );

            ctx.restart()?;
            assert!(ctx.manager().is_empty());
            assert!(!ctx.manager().is_prepared(TransactionId(100)));
            Ok(())
        },
        |ctx| cleanup(ctx),
    )
}

#[test]
fn test_rollback_is_not_undone_by_restart() {
    run_test(
        || create_test_context(),
        |ctx| {
            let s = session(1);
            let xid = ctx.next_xid();
            ctx.prepare(&s, xid, "rolled-back", &[42])?;
            ctx.manager().finish_prepared(&s, "rolled-back", false, true)?;

            let report = ctx.restart()?;
            assert_eq!(report.replay.aborts, 1);
            assert!(ctx.manager().is_empty());
            assert_eq!(ctx.commit_log().status(xid), TransactionStatus::Aborted);
            Ok(())
        },
        |ctx| cleanup(ctx),
    )
}

#[test]
fn test_only_unfinished_transactions_come_back() {
    run_test(
        || create_test_context(),
        |ctx| {
            let s = session(1);
            let mut xids = Vec::new();
            for i in 0..10u32 {
                let xid = ctx.next_xid();
                ctx.prepare(&s, xid, &format!("gid-{}", i), &[1000 + i])?;
                xids.push(xid);
            }
            let manager = ctx.manager();
            for i in 0..10u32 {
                match i % 3 {
                    0 => assert!(manager.finish_prepared(&s, &format!("gid-{}", i), true, true)?),
                    1 => assert!(manager.finish_prepared(&s, &format!("gid-{}", i), false, true)?),
                    _ => {}
                }
            }

            ctx.restart()?;
            let manager = ctx.manager();
            let mut gids: Vec<String> = manager
                .prepared_transactions()
                .into_iter()
                .map(|info| info.gid)
                .collect();
            gids.sort();
            assert_eq!(gids, vec!["gid-2", "gid-5", "gid-8"]);

            for i in [2u32, 5, 8] {
                let gid = format!("gid-{}", i);
                assert_eq!(manager.locks_held(&gid)?, vec![relation_lock(1000 + i)]);
                assert_eq!(
                    ctx.commit_log().status(xids[i as usize]),
                    TransactionStatus::InProgress
                );
            }
            Ok(())
        },
        |ctx| cleanup(ctx),
    )
}

#[test]
fn test_repeated_restarts_are_stable() {
    run_test(
        || create_test_context(),
        |ctx| {
            let s = session(1);
            ctx.prepare(&s, ctx.next_xid(), "a", &[1])?;
            ctx.prepare(&s, ctx.next_xid(), "b", &[2])?;

            let first = ctx.restart()?;
            let before = ctx.manager().prepared_transactions();
            let second = ctx.restart()?;
            let after = ctx.manager().prepared_transactions();

            assert_eq!(first.recovered, 2);
            assert_eq!(second.recovered, 2);
            assert_eq!(before, after);
            Ok(())
        },
        |ctx| cleanup(ctx),
    )
}

#[test]
fn test_recovered_locks_block_other_sessions() {
    run_test(
        || create_test_context(),
        |ctx| {
            ctx.prepare(&session(1), ctx.next_xid(), "holder", &[42])?;
            ctx.restart()?;

            let other = session(2);
            let exclusive = LockDescriptor::relation(DATABASE, 42, LockMode::Exclusive);
            let err = ctx
                .locks()
                .acquire(other.lock_owner(), &exclusive)
                .unwrap_err();
            assert_eq!(err.kind(), &ErrorKind::LockConflict);

            ctx.manager().finish_prepared(&session(3), "holder", true, true)?;
            ctx.locks().acquire(other.lock_owner(), &exclusive)?;
            Ok(())
        },
        |ctx| cleanup(ctx),
    )
}

#[test]
fn test_prescan_reports_subtransactions() {
    run_test(
        || create_test_context(),
        |ctx| {
            let s = session(1);
            let xid = ctx.next_xid();
            let sub1 = ctx.next_xid();
            let sub2 = ctx.next_xid();
            let request = PrepareRequest::new(xid, "with-subs").with_subxids(vec![sub1, sub2]);
            ctx.manager().prepare(&s, request)?;

            let manager = ctx.crash()?;
            manager.restore_two_phase_data()?;
            RecoveryScanner::new(&manager, ScanMode::Crash).replay(ctx.wal().oldest_lsn())?;
            let (oldest, running) = manager.prescan_prepared_transactions()?;
            assert_eq!(oldest, xid);
            assert_eq!(running, vec![xid, sub1, sub2]);

            manager.recover_prepared_transactions()?;
            let recovered = manager.get(manager.lookup("with-subs")?);
            assert_eq!(recovered.map(|g| g.subxids), Some(vec![sub1, sub2]));
            Ok(())
        },
        |ctx| cleanup(ctx),
    )
}

#[test]
fn test_zero_capacity_disables_prepare() {
    run_test(
        || create_test_context_with_capacity(0),
        |ctx| {
            let err = ctx
                .manager()
                .prepare(&session(1), PrepareRequest::new(ctx.next_xid(), "x"))
                .unwrap_err();
            assert_eq!(err.kind(), &ErrorKind::FeatureDisabled);
            assert!(ctx.manager().is_empty());
            Ok(())
        },
        |ctx| cleanup(ctx),
    )
}
