use twophase::common::{CommitLog, TransactionStatus};
use twophase::wal::WriteAheadLog;
use twophase_int_test::test_util::{cleanup, create_test_context, relation_lock, run_test, session};

#[test]
fn test_state_survives_checkpoints_and_restarts() {
    run_test(
        || create_test_context(),
        |ctx| {
            let s = session(1);
            let xid = ctx.next_xid();
            ctx.prepare(&s, xid, "long-lived", &[7])?;

            for round in 0..3 {
                let stats = ctx.checkpoint()?;
                assert_eq!(stats.files_written, if round == 0 { 1 } else { 0 });
                assert_eq!(ctx.state_file_count(), 1);

                let report = ctx.restart()?;
                assert_eq!(report.recovered, 1);
                assert_eq!(report.restored_files, 1);
                assert_eq!(ctx.manager().locks_held("long-lived")?, vec![relation_lock(7)]);
            }

            assert!(ctx.manager().finish_prepared(&s, "long-lived", true, true)?);
            assert_eq!(ctx.state_file_count(), 0);
            assert_eq!(ctx.commit_log().status(xid), TransactionStatus::Committed);

            ctx.restart()?;
            assert!(ctx.manager().is_empty());
            Ok(())
        },
        |ctx| cleanup(ctx),
    )
}

#[test]
fn test_log_is_retained_for_unflushed_prepares() {
    run_test(
        || create_test_context(),
        |ctx| {
            let s = session(1);
            ctx.prepare(&s, ctx.next_xid(), "old", &[1])?;
            let first = ctx.checkpoint()?;
            assert_eq!(first.retain_from, ctx.wal().end_lsn());

            let second_start = ctx.wal().end_lsn();
            ctx.prepare(&s, ctx.next_xid(), "new", &[2])?;

            // a checkpoint whose redo point predates "new" must keep its record
            let stats = ctx.manager().check_point(second_start)?;
            assert_eq!(stats.files_written, 0);
            assert_eq!(stats.retain_from, second_start);
            assert_eq!(ctx.manager().redo_horizon(), Some(second_start));

            let latest = ctx.checkpoint()?;
            assert_eq!(latest.files_written, 1);
            assert!(latest.retain_from >= first.retain_from);
            assert_eq!(ctx.wal().oldest_lsn(), latest.retain_from);

            let report = ctx.restart()?;
            assert_eq!(report.restored_files, 2);
            assert_eq!(report.recovered, 2);
            Ok(())
        },
        |ctx| cleanup(ctx),
    )
}

#[test]
fn test_mixed_file_and_log_state_recover_together() {
    run_test(
        || create_test_context(),
        |ctx| {
            let s = session(1);
            ctx.prepare(&s, ctx.next_xid(), "in-file", &[1])?;
            ctx.checkpoint()?;
            ctx.prepare(&s, ctx.next_xid(), "in-log", &[2])?;

            let report = ctx.restart()?;
            assert_eq!(report.restored_files, 1);
            assert_eq!(report.replay.prepares, 1);
            assert_eq!(report.recovered, 2);

            let manager = ctx.manager();
            let on_disk: Vec<(String, bool)> = {
                let mut v: Vec<_> = manager
                    .prepared_transactions()
                    .into_iter()
                    .map(|info| (info.gid, info.on_disk))
                    .collect();
                v.sort();
                v
            };
            assert_eq!(
                on_disk,
                vec![("in-file".to_string(), true), ("in-log".to_string(), false)]
            );

            assert!(manager.finish_prepared(&s, "in-file", false, true)?);
            assert!(manager.finish_prepared(&s, "in-log", true, true)?);
            assert_eq!(ctx.state_file_count(), 0);
            Ok(())
        },
        |ctx| cleanup(ctx),
    )
}

#[test]
fn test_finish_after_checkpoint_is_durable() {
    run_test(
        || create_test_context(),
        |ctx| {
            let s = session(1);
            let xid = ctx.next_xid();
            ctx.prepare(&s, xid, "checkpointed", &[3])?;
            ctx.checkpoint()?;
            ctx.manager().finish_prepared(&s, "checkpointed", false, true)?;

            // the ABORT PREPARED record is replayed even though the file is gone
            let report = ctx.restart()?;
            assert_eq!(report.replay.aborts, 1);
            assert_eq!(report.recovered, 0);
            assert_eq!(ctx.commit_log().status(xid), TransactionStatus::Aborted);
            Ok(())
        },
        |ctx| cleanup(ctx),
    )
}
