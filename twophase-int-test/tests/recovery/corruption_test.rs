use std::fs;
use twophase::errors::ErrorKind;
use twophase::transaction::RecoveryMode;
use twophase::wal::frame::FRAME_HEADER_SIZE;
use twophase::wal::WriteAheadLog;
use twophase_int_test::test_util::{cleanup, create_test_context, run_test, session};

#[test]
fn test_damaged_state_file_stops_recovery() {
    run_test(
        || create_test_context(),
        |ctx| {
            let xid = ctx.next_xid();
            ctx.prepare(&session(1), xid, "on-disk", &[42])?;
            let stats = ctx.checkpoint()?;
            assert_eq!(stats.files_written, 1);

            let path = ctx.state_dir().join(format!("{:08X}", xid.0));
            let mut bytes = fs::read(&path)?;
            let last = bytes.len() - 1;
            bytes[last] ^= 0xFF;
            fs::write(&path, bytes)?;

            let err = ctx.restart().unwrap_err();
            assert_eq!(err.kind(), &ErrorKind::CorruptDurableState);
            assert!(err.is_fatal());
            assert_eq!(ctx.manager().mode(), RecoveryMode::Startup);

            // with the damaged file gone the transaction is lost but startup succeeds
            fs::remove_file(&path)?;
            let report = ctx.restart()?;
            assert_eq!(report.recovered, 0);
            assert_eq!(ctx.manager().mode(), RecoveryMode::Normal);
            Ok(())
        },
        |ctx| cleanup(ctx),
    )
}

#[test]
fn test_truncated_state_file_stops_recovery() {
    run_test(
        || create_test_context(),
        |ctx| {
            let xid = ctx.next_xid();
            ctx.prepare(&session(1), xid, "short", &[42])?;
            ctx.checkpoint()?;

            let path = ctx.state_dir().join(format!("{:08X}", xid.0));
            let bytes = fs::read(&path)?;
            fs::write(&path, &bytes[..bytes.len() / 2])?;

            let err = ctx.restart().unwrap_err();
            assert_eq!(err.kind(), &ErrorKind::CorruptDurableState);
            Ok(())
        },
        |ctx| cleanup(ctx),
    )
}

#[test]
fn test_damaged_record_inside_log_stops_recovery() {
    run_test(
        || create_test_context(),
        |ctx| {
            ctx.prepare(&session(1), ctx.next_xid(), "first", &[1])?;
            ctx.prepare(&session(1), ctx.next_xid(), "second", &[2])?;

            let first_payload = ctx.wal().oldest_lsn().offset(FRAME_HEADER_SIZE as u64);
            ctx.wal().corrupt_byte(first_payload)?;

            let err = ctx.restart().unwrap_err();
            assert_eq!(err.kind(), &ErrorKind::TruncatedWalRecord);
            assert!(err.is_fatal());
            assert_eq!(ctx.manager().mode(), RecoveryMode::Startup);
            Ok(())
        },
        |ctx| cleanup(ctx),
    )
}

#[test]
fn test_damaged_length_inside_log_keeps_later_records() {
    run_test(
        || create_test_context(),
        |ctx| {
            ctx.prepare(&session(1), ctx.next_xid(), "tx1", &[1])?;
            ctx.prepare(&session(1), ctx.next_xid(), "tx2", &[2])?;
            let end = ctx.wal().end_lsn();

            // a length byte of the first record's header
            let length_byte = ctx.wal().oldest_lsn().offset(7);
            ctx.wal().corrupt_byte(length_byte)?;

            let err = ctx.restart().unwrap_err();
            assert_eq!(err.kind(), &ErrorKind::TruncatedWalRecord);
            assert_eq!(ctx.manager().mode(), RecoveryMode::Startup);
            assert_eq!(ctx.wal().end_lsn(), end);
            Ok(())
        },
        |ctx| cleanup(ctx),
    )
}

#[test]
fn test_torn_tail_is_cut_and_log_continues() {
    run_test(
        || create_test_context(),
        |ctx| {
            let s = session(1);
            ctx.prepare(&s, ctx.next_xid(), "complete", &[1])?;
            let torn_at = ctx.wal().end_lsn();
            ctx.prepare(&s, ctx.next_xid(), "torn", &[2])?;
            ctx.wal().tear_tail(3);

            let report = ctx.restart()?;
            assert_eq!(report.replay.torn_tail, Some(torn_at));
            assert_eq!(report.recovered, 1);
            assert_eq!(ctx.wal().end_lsn(), torn_at);

            ctx.prepare(&s, ctx.next_xid(), "after-tear", &[3])?;
            let report = ctx.restart()?;
            assert_eq!(report.replay.torn_tail, None);
            assert_eq!(report.recovered, 2);

            let mut gids: Vec<String> = ctx
                .manager()
                .prepared_transactions()
                .into_iter()
                .map(|info| info.gid)
                .collect();
            gids.sort();
            assert_eq!(gids, vec!["after-tear", "complete"]);
            Ok(())
        },
        |ctx| cleanup(ctx),
    )
}

#[test]
fn test_leftover_files_in_state_directory() {
    run_test(
        || create_test_context(),
        |ctx| {
            let temp = ctx.state_dir().join("0000ABCD.tmp");
            let unrelated = ctx.state_dir().join("README");
            fs::write(&temp, b"half written")?;
            fs::write(&unrelated, b"not a state file")?;

            let report = ctx.restart()?;
            assert_eq!(report.restored_files, 0);
            assert!(!temp.exists());
            assert!(unrelated.exists());

            let stats = ctx.checkpoint()?;
            assert_eq!(stats.files_removed, 0);
            assert!(unrelated.exists());
            Ok(())
        },
        |ctx| cleanup(ctx),
    )
}
