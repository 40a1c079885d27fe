use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use twophase::common::{CommitLog, TransactionStatus};
use twophase::errors::ErrorKind;
use twophase_int_test::test_util::{
    cleanup, create_test_context, create_test_context_with_capacity, run_test, session,
};

#[test]
fn test_same_gid_has_one_winner() {
    run_test(
        || create_test_context(),
        |ctx| {
            let handles: Vec<_> = (0..8u32)
                .map(|backend| {
                    let ctx = ctx.clone();
                    thread::spawn(move || {
                        let xid = ctx.next_xid();
                        ctx.prepare(&session(backend + 1), xid, "contended", &[])
                    })
                })
                .collect();

            let mut winners = 0;
            for handle in handles {
                match handle.join().expect("worker panicked") {
                    Ok(_) => winners += 1,
                    Err(e) => assert_eq!(e.kind(), &ErrorKind::DuplicateGlobalId),
                }
            }
            assert_eq!(winners, 1);
            assert_eq!(ctx.manager().len(), 1);
            Ok(())
        },
        |ctx| cleanup(ctx),
    )
}

#[test]
fn test_capacity_holds_under_contention() {
    run_test(
        || create_test_context_with_capacity(4),
        |ctx| {
            let handles: Vec<_> = (0..10u32)
                .map(|i| {
                    let ctx = ctx.clone();
                    thread::spawn(move || {
                        let xid = ctx.next_xid();
                        ctx.prepare(&session(i + 1), xid, &format!("gid-{}", i), &[])
                    })
                })
                .collect();

            let mut prepared = 0;
            let mut rejected = 0;
            for handle in handles {
                match handle.join().expect("worker panicked") {
                    Ok(_) => prepared += 1,
                    Err(e) => {
                        assert_eq!(e.kind(), &ErrorKind::TableFull);
                        rejected += 1;
                    }
                }
            }
            assert_eq!(prepared, 4);
            assert_eq!(rejected, 6);
            assert_eq!(ctx.manager().len(), 4);
            Ok(())
        },
        |ctx| cleanup(ctx),
    )
}

#[test]
fn test_concurrent_finish_commits_once() {
    run_test(
        || create_test_context(),
        |ctx| {
            let xid = ctx.next_xid();
            ctx.prepare(&session(1), xid, "finish-race", &[10])?;

            let handles: Vec<_> = (0..8u32)
                .map(|backend| {
                    let manager = ctx.manager();
                    thread::spawn(move || {
                        manager.finish_prepared(&session(backend + 2), "finish-race", true, false)
                    })
                })
                .collect();

            let mut finished = 0;
            for handle in handles {
                match handle.join().expect("worker panicked") {
                    Ok(true) => finished += 1,
                    Ok(false) => {}
                    Err(e) => assert_eq!(e.kind(), &ErrorKind::Busy),
                }
            }
            assert_eq!(finished, 1);
            assert!(ctx.manager().is_empty());
            assert_eq!(ctx.commit_log().status(xid), TransactionStatus::Committed);
            Ok(())
        },
        |ctx| cleanup(ctx),
    )
}

#[test]
fn test_workload_with_background_checkpoints() {
    run_test(
        || create_test_context(),
        |ctx| {
            let stop = Arc::new(AtomicBool::new(false));
            let checkpointer = {
                let ctx = ctx.clone();
                let stop = stop.clone();
                thread::spawn(move || {
                    let mut passes = 0;
                    while !stop.load(Ordering::Acquire) {
                        ctx.checkpoint()?;
                        passes += 1;
                        thread::yield_now();
                    }
                    Ok::<_, twophase::errors::TwoPhaseError>(passes)
                })
            };

            let workers: Vec<_> = (0..4u32)
                .map(|worker| {
                    let ctx = ctx.clone();
                    thread::spawn(move || {
                        let s = session(worker + 1);
                        for round in 0..25u32 {
                            let gid = format!("w{}-{}", worker, round);
                            let relation = 1000 + worker * 100 + round;
                            ctx.prepare(&s, ctx.next_xid(), &gid, &[relation])?;
                            let commit = round % 2 == 0;
                            assert!(ctx.manager().finish_prepared(&s, &gid, commit, true)?);
                        }
                        Ok::<_, twophase::errors::TwoPhaseError>(())
                    })
                })
                .collect();

            for worker in workers {
                worker.join().expect("worker panicked")?;
            }
            stop.store(true, Ordering::Release);
            checkpointer.join().expect("checkpointer panicked")?;

            assert!(ctx.manager().is_empty());
            ctx.checkpoint()?;
            assert_eq!(ctx.state_file_count(), 0);

            let report = ctx.restart()?;
            assert_eq!(report.recovered, 0);
            assert!(ctx.manager().is_empty());
            Ok(())
        },
        |ctx| cleanup(ctx),
    )
}
