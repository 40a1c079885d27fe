//! Rebuilding the global transaction table after a restart, and keeping it
//! current while replaying a primary's log as a standby.
//!
//! Crash recovery runs four steps in order:
//!
//! 1. [`TwoPhaseManager::restore_two_phase_data`] loads every durable-state
//!    file into the table.
//! 2. A [`RecoveryScanner`] replays the log from the last checkpoint, adding
//!    entries for PREPARE records and removing them for COMMIT-PREPARED and
//!    ABORT-PREPARED records.
//! 3. [`TwoPhaseManager::prescan_prepared_transactions`] drops entries that are
//!    already resolved or that lie in the future, and reports the oldest
//!    transaction id still in flight.
//! 4. [`TwoPhaseManager::recover_prepared_transactions`] reacquires locks and
//!    runs the resource managers' recovery callbacks.

use crate::common::{LockOwner, Lsn, OriginId, ResourcePhase, TransactionId, TransactionStatus};
use crate::errors::{ErrorKind, TwoPhaseError, TwoPhaseResult};
use crate::transaction::global_transaction::{GlobalTransaction, GxactHandle, GxactState};
use crate::transaction::manager::{RecoveryMode, TwoPhaseManager};
use crate::wal::{FinishRecord, PreparedState, TwoPhaseRecord, WalRead, WalReader};
use std::sync::atomic::Ordering;

/// How replay treats the end of the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanMode {
    /// Startup after a crash: a torn tail is cut off so new records follow
    /// the last complete one.
    Crash,
    /// Standby: a torn tail may still be in flight and is read again by the
    /// next replay pass.
    Standby,
}

/// Summary of one replay pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayOutcome {
    pub start: Lsn,
    /// Position after the last complete record applied.
    pub end: Lsn,
    pub records: usize,
    pub prepares: usize,
    pub commits: usize,
    pub aborts: usize,
    /// Start of an incomplete record at the end of the log, if any.
    pub torn_tail: Option<Lsn>,
}

/// Summary of crash recovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    pub restored_files: usize,
    pub replay: ReplayOutcome,
    /// Oldest transaction id still in flight, counting prepared ones.
    pub oldest_active_xid: TransactionId,
    pub recovered: usize,
}

/// Summary of entering standby mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StandbyReport {
    pub restored_files: usize,
    pub replay: ReplayOutcome,
    /// Prepared transactions and their subtransactions, to be treated as
    /// running by readers on the standby.
    pub running_xids: Vec<TransactionId>,
}

/// Replays two-phase records from the write-ahead log into the table.
pub struct RecoveryScanner<'a> {
    manager: &'a TwoPhaseManager,
    mode: ScanMode,
}

impl<'a> RecoveryScanner<'a> {
    pub fn new(manager: &'a TwoPhaseManager, mode: ScanMode) -> Self {
        RecoveryScanner { manager, mode }
    }

    /// Applies every complete record from `from` to the end of the log.
    ///
    /// Replaying the same range twice leaves the table as after one pass.
    ///
    /// # Errors
    ///
    /// A damaged record followed by more data fails with
    /// [`ErrorKind::TruncatedWalRecord`]; a record that does not decode fails
    /// with [`ErrorKind::CorruptDurableState`].
    pub fn replay(&self, from: Lsn) -> TwoPhaseResult<ReplayOutcome> {
        let wal = self.manager.inner.wal.as_ref();
        let mut reader = WalReader::new(wal, from);
        let mut outcome = ReplayOutcome {
            start: from,
            end: from,
            ..Default::default()
        };

        loop {
            match reader.next_frame()? {
                WalRead::End => break,
                WalRead::TornTail(at) => {
                    log::warn!("Record at {} is incomplete, replay ends there", at);
                    outcome.torn_tail = Some(at);
                    if self.mode == ScanMode::Crash {
                        wal.truncate(at)?;
                        log::info!("Truncated WAL at {}", at);
                    }
                    break;
                }
                WalRead::Frame(range, frame) => {
                    let record = TwoPhaseRecord::decode(&frame)?;
                    match record {
                        TwoPhaseRecord::Prepare(state) => {
                            self.redo_prepare(state, range.start, range.end)?;
                            outcome.prepares += 1;
                        }
                        TwoPhaseRecord::CommitPrepared(finish) => {
                            self.redo_finish(&finish, true)?;
                            outcome.commits += 1;
                        }
                        TwoPhaseRecord::AbortPrepared(finish) => {
                            self.redo_finish(&finish, false)?;
                            outcome.aborts += 1;
                        }
                        TwoPhaseRecord::Foreign(kind) => {
                            log::trace!("Skipping record of kind {} at {}", kind, range.start);
                        }
                    }
                    outcome.records += 1;
                    outcome.end = range.end;
                }
            }
        }

        log::debug!(
            "Replayed {} records from {} to {}: {} prepared, {} committed, {} aborted",
            outcome.records,
            outcome.start,
            outcome.end,
            outcome.prepares,
            outcome.commits,
            outcome.aborts
        );
        Ok(outcome)
    }

    fn redo_prepare(&self, state: PreparedState, start: Lsn, end: Lsn) -> TwoPhaseResult<()> {
        let commit_log = &self.manager.inner.commit_log;
        commit_log.advance_next_transaction_id(state.xid);
        for subxid in &state.subxids {
            commit_log.advance_next_transaction_id(*subxid);
        }

        let origin = state.origin;
        let handle = self.manager.prepare_redo_add(&state, start, end, origin)?;
        if self.mode == ScanMode::Standby
            && self.manager.inner.standby_locks_active.load(Ordering::Acquire)
        {
            self.manager.acquire_locks(handle, &state)?;
        }
        Ok(())
    }

    fn redo_finish(&self, finish: &FinishRecord, commit: bool) -> TwoPhaseResult<()> {
        let commit_log = &self.manager.inner.commit_log;
        commit_log.advance_next_transaction_id(finish.xid);
        if commit {
            commit_log.set_committed(finish.xid, &finish.subxids);
        } else {
            commit_log.set_aborted(finish.xid, &finish.subxids);
        }
        self.manager.prepare_redo_remove(finish.xid, false)?;
        Ok(())
    }
}

impl TwoPhaseManager {
    /// Loads every durable-state file into the table.
    ///
    /// Entries created here are marked as in redo and are not usable until
    /// recovered. Returns the number of files loaded.
    ///
    /// # Errors
    ///
    /// A file that fails validation is fatal: [`ErrorKind::CorruptDurableState`].
    pub fn restore_two_phase_data(&self) -> TwoPhaseResult<usize> {
        let mut restored = 0;
        for xid in self.inner.state_files.list()? {
            let state = self.inner.state_files.read(xid)?;
            self.prepare_redo_add(&state, Lsn::INVALID, Lsn::INVALID, state.origin)?;
            restored += 1;
        }
        if restored > 0 {
            log::info!("Restored {} two-phase state files", restored);
        }
        Ok(restored)
    }

    /// Adds a table entry for a prepared transaction found during recovery.
    ///
    /// # Arguments
    ///
    /// * `state` - The prepared state read from a file or a PREPARE record.
    /// * `start` - Start of the PREPARE record, invalid for a state file.
    /// * `end` - End of the PREPARE record, invalid for a state file.
    /// * `origin` - Replication origin the transaction came from.
    ///
    /// # Returns
    ///
    /// The handle of the new entry. If the transaction is already in the table,
    /// because its state file was restored before its PREPARE record was
    /// replayed, the record is ignored and the existing handle is returned.
    pub fn prepare_redo_add(
        &self,
        state: &PreparedState,
        start: Lsn,
        end: Lsn,
        origin: OriginId,
    ) -> TwoPhaseResult<GxactHandle> {
        if let Some(existing) = self.inner.table.find_by_xid(state.xid) {
            if start.is_valid() {
                log::warn!(
                    "Ignoring PREPARE record of transaction {} at {}: transaction is already in the table",
                    state.xid,
                    start
                );
            }
            return Ok(existing);
        }

        let entry = GlobalTransaction::from_redo(state, start, end, origin);
        let handle = self.inner.table.reserve(entry).map_err(|e| match e.kind().clone() {
            kind @ (ErrorKind::TableFull | ErrorKind::FeatureDisabled) => TwoPhaseError::new_with_cause(
                &format!(
                    "cannot recover prepared transaction {}: increase max_prepared_transactions beyond {}",
                    state.xid,
                    self.inner.table.capacity()
                ),
                kind,
                e,
            ),
            _ => TwoPhaseError::new_with_cause(
                &format!("conflicting two-phase state for transaction {}", state.xid),
                ErrorKind::CorruptDurableState,
                e,
            ),
        })?;

        log::debug!(
            "Added prepared transaction {} \"{}\" to the table during recovery",
            state.xid,
            state.gid
        );
        Ok(handle)
    }

    /// Removes the entry of `xid` during recovery.
    ///
    /// Any locks the entry holds are released and its state file is deleted.
    /// Returns `false` if the transaction is not in the table, which is only
    /// logged when `give_warning` is set.
    pub fn prepare_redo_remove(&self, xid: TransactionId, give_warning: bool) -> TwoPhaseResult<bool> {
        let Some(handle) = self.inner.table.find_by_xid(xid) else {
            if give_warning {
                log::warn!("Could not find two-phase state for transaction {} to remove", xid);
            }
            return Ok(false);
        };
        self.forget(handle, give_warning)?;
        log::debug!("Removed prepared transaction {} during recovery", xid);
        Ok(true)
    }

    /// Frees a slot, its locks and its state file.
    fn forget(&self, handle: GxactHandle, give_warning: bool) -> TwoPhaseResult<()> {
        let gxact = self.inner.table.release(handle)?;
        self.inner
            .locks
            .release_all(LockOwner::PreparedTransaction(handle));
        if gxact.on_disk {
            self.inner.state_files.remove(gxact.xid, give_warning)?;
        }
        Ok(())
    }

    /// Validates every recovered entry against the commit log.
    ///
    /// Entries for transactions at or after the commit log's next transaction
    /// id, and entries for transactions already committed or aborted, are
    /// removed with a warning.
    ///
    /// # Returns
    ///
    /// The oldest transaction id still in flight (the commit log's next id if
    /// nothing is prepared) and the ids of the surviving prepared transactions
    /// with their subtransactions.
    pub fn prescan_prepared_transactions(&self) -> TwoPhaseResult<(TransactionId, Vec<TransactionId>)> {
        let next = self.inner.commit_log.next_transaction_id();
        let mut oldest = next;
        let mut xids = Vec::new();

        for (handle, gxact) in self.inner.table.enumerate() {
            let Some(state) = self.validate_recovered(handle, &gxact, next)? else {
                continue;
            };
            for xid in std::iter::once(state.xid).chain(state.subxids.iter().copied()) {
                if xid.precedes(oldest) {
                    oldest = xid;
                }
                xids.push(xid);
            }
        }
        Ok((oldest, xids))
    }

    /// Loads the prepared state of a recovered entry, or removes the entry if
    /// the commit log shows it must not survive.
    fn validate_recovered(
        &self,
        handle: GxactHandle,
        gxact: &GlobalTransaction,
        next: TransactionId,
    ) -> TwoPhaseResult<Option<PreparedState>> {
        if gxact.xid.follows_or_equals(next) {
            log::warn!("Removing future two-phase state for transaction {}", gxact.xid);
            self.forget(handle, true)?;
            return Ok(None);
        }
        match self.inner.commit_log.status(gxact.xid) {
            TransactionStatus::Committed | TransactionStatus::Aborted => {
                log::warn!("Removing stale two-phase state for transaction {}", gxact.xid);
                self.forget(handle, true)?;
                return Ok(None);
            }
            TransactionStatus::InProgress => {}
        }

        let state = self.load_prepared_state(gxact)?;
        if state.gid != gxact.gid {
            return Err(TwoPhaseError::new(
                &format!(
                    "two-phase state of transaction {} records gid \"{}\" instead of \"{}\"",
                    gxact.xid, state.gid, gxact.gid
                ),
                ErrorKind::CorruptDurableState,
            ));
        }
        Ok(Some(state))
    }

    /// Makes every entry left by replay a usable prepared transaction.
    ///
    /// Locks are reacquired under the prepared transaction's owner and the
    /// resource managers' recovery callbacks run. Returns the number of
    /// transactions recovered.
    pub fn recover_prepared_transactions(&self) -> TwoPhaseResult<usize> {
        let mut recovered = 0;
        for (handle, gxact) in self.inner.table.enumerate() {
            if !gxact.in_redo {
                continue;
            }
            let state = self.load_prepared_state(&gxact)?;
            log::info!(
                "Recovering prepared transaction {} \"{}\" from {}",
                gxact.xid,
                gxact.gid,
                if gxact.on_disk {
                    "its state file".to_string()
                } else {
                    format!("WAL at {}", gxact.prepare_start_lsn)
                }
            );

            // locks taken on a standby are taken again from scratch
            self.inner
                .locks
                .release_all(LockOwner::PreparedTransaction(handle));
            self.acquire_locks(handle, &state)?;
            self.inner
                .resources
                .process(state.xid, &state.resources, ResourcePhase::Recover)?;

            self.inner.table.update(handle, |entry| {
                entry.in_redo = false;
                entry.state = GxactState::Prepared;
                entry.locking_backend = None;
                entry.subxids = state.subxids.clone();
            })?;
            recovered += 1;
        }
        Ok(recovered)
    }

    /// Takes the locks recorded in `state` for the prepared transaction.
    pub(crate) fn acquire_locks(&self, handle: GxactHandle, state: &PreparedState) -> TwoPhaseResult<()> {
        let owner = LockOwner::PreparedTransaction(handle);
        for lock in &state.locks {
            self.inner.locks.acquire(owner, lock).map_err(|e| {
                TwoPhaseError::new_with_cause(
                    &format!("could not reacquire lock of prepared transaction {}", state.xid),
                    ErrorKind::InternalError,
                    e,
                )
            })?;
        }
        Ok(())
    }

    /// Prepares recovered entries for read-only use on a standby.
    ///
    /// Like [`Self::prescan_prepared_transactions`], but also reacquires the
    /// locks of surviving transactions and runs the standby recovery callbacks.
    /// PREPARE records replayed afterwards take their locks immediately.
    ///
    /// Returns the surviving transaction ids with their subtransactions.
    pub fn standby_recover_prepared_transactions(&self) -> TwoPhaseResult<Vec<TransactionId>> {
        let next = self.inner.commit_log.next_transaction_id();
        let mut running = Vec::new();
        for (handle, gxact) in self.inner.table.enumerate() {
            let Some(state) = self.validate_recovered(handle, &gxact, next)? else {
                continue;
            };
            self.inner
                .locks
                .release_all(LockOwner::PreparedTransaction(handle));
            self.acquire_locks(handle, &state)?;
            self.inner
                .resources
                .process(state.xid, &state.resources, ResourcePhase::StandbyRecover)?;
            running.push(state.xid);
            running.extend(state.subxids.iter().copied());
        }
        self.inner.standby_locks_active.store(true, Ordering::Release);
        Ok(running)
    }

    /// Returns `true` if `xid` is a prepared transaction known to the standby.
    pub fn standby_transaction_id_is_prepared(&self, xid: TransactionId) -> bool {
        self.inner
            .table
            .find(|gxact| gxact.xid == xid && gxact.is_prepared())
            .is_some()
    }

    /// Runs crash recovery and switches the manager to normal operation.
    ///
    /// # Arguments
    ///
    /// * `from` - Redo point of the last checkpoint. `None` replays the whole
    ///   retained log.
    ///
    /// # Errors
    ///
    /// Fails with [`ErrorKind::InvalidOperation`] unless the manager was just
    /// built. Any fatal error leaves the manager in startup mode.
    pub fn startup_recovery(&self, from: Option<Lsn>) -> TwoPhaseResult<RecoveryReport> {
        self.expect_mode(RecoveryMode::Startup, "run crash recovery")?;
        let from = from.unwrap_or_else(|| self.inner.wal.oldest_lsn());

        let restored_files = self.restore_two_phase_data()?;
        let replay = RecoveryScanner::new(self, ScanMode::Crash).replay(from)?;
        let (oldest_active_xid, _) = self.prescan_prepared_transactions()?;
        let recovered = self.recover_prepared_transactions()?;

        self.set_mode(RecoveryMode::Normal);
        log::info!(
            "Crash recovery done: {} state files, {} records replayed, {} prepared transactions recovered",
            restored_files,
            replay.records,
            recovered
        );
        Ok(RecoveryReport {
            restored_files,
            replay,
            oldest_active_xid,
            recovered,
        })
    }

    /// Enters standby mode: restores state files, replays the log available so
    /// far and reacquires the locks of prepared transactions.
    pub fn start_standby(&self, from: Option<Lsn>) -> TwoPhaseResult<StandbyReport> {
        self.expect_mode(RecoveryMode::Startup, "enter standby mode")?;
        let from = from.unwrap_or_else(|| self.inner.wal.oldest_lsn());

        let restored_files = self.restore_two_phase_data()?;
        let replay = RecoveryScanner::new(self, ScanMode::Standby).replay(from)?;
        let running_xids = self.standby_recover_prepared_transactions()?;
        *self.inner.replay_position.lock() = replay.end;

        self.set_mode(RecoveryMode::Standby);
        log::info!(
            "Standby started at {} with {} prepared transactions",
            replay.end,
            self.len()
        );
        Ok(StandbyReport {
            restored_files,
            replay,
            running_xids,
        })
    }

    /// Replays log records that arrived since the previous pass.
    pub fn standby_replay(&self) -> TwoPhaseResult<ReplayOutcome> {
        self.expect_mode(RecoveryMode::Standby, "replay as a standby")?;
        let mut position = self.inner.replay_position.lock();
        let outcome = RecoveryScanner::new(self, ScanMode::Standby).replay(*position)?;
        *position = outcome.end;
        Ok(outcome)
    }

    /// Ends standby mode: replays the rest of the log, recovers every prepared
    /// transaction and switches to normal operation.
    ///
    /// Returns the number of prepared transactions recovered.
    pub fn promote(&self) -> TwoPhaseResult<usize> {
        self.expect_mode(RecoveryMode::Standby, "promote")?;
        let mut position = self.inner.replay_position.lock();
        let outcome = RecoveryScanner::new(self, ScanMode::Crash).replay(*position)?;
        *position = outcome.end;
        drop(position);

        self.prescan_prepared_transactions()?;
        let recovered = self.recover_prepared_transactions()?;
        self.inner.standby_locks_active.store(false, Ordering::Release);
        self.set_mode(RecoveryMode::Normal);
        log::info!("Promoted with {} prepared transactions", recovered);
        Ok(recovered)
    }
}
