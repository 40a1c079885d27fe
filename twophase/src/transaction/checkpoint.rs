use crate::common::Lsn;
use crate::errors::TwoPhaseResult;
use crate::transaction::manager::{RecoveryMode, TwoPhaseManager};

/// Summary of one checkpoint pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckpointStats {
    /// Prepared transactions moved from the log into state files.
    pub files_written: usize,
    /// Orphaned state files deleted.
    pub files_removed: usize,
    /// The log must be kept from here on. Never after the redo horizon the
    /// checkpoint was run with.
    pub retain_from: Lsn,
}

impl TwoPhaseManager {
    /// Oldest log position still needed to rebuild a prepared transaction
    /// whose state lives only in the log, `None` if there is none.
    ///
    /// Includes transactions that are still being prepared.
    pub fn redo_horizon(&self) -> Option<Lsn> {
        self.inner.table.min_prepare_start_lsn()
    }

    /// Moves the state of long-lived prepared transactions out of the log.
    ///
    /// Every prepared transaction whose PREPARE record ends at or before
    /// `redo_horizon` gets a durable state file, after which its record is no
    /// longer needed. Transactions being finished are skipped. Files are written
    /// outside the table lock; a transaction whose finish began meanwhile has its
    /// new file deleted again. In normal mode state files that belong to no
    /// table entry are removed.
    ///
    /// # Arguments
    ///
    /// * `redo_horizon` - The redo point of the checkpoint being taken.
    ///
    /// # Returns
    ///
    /// Statistics of the pass, including the position from which the log must
    /// be retained. The caller may discard the log before that position.
    pub fn check_point(&self, redo_horizon: Lsn) -> TwoPhaseResult<CheckpointStats> {
        let _guard = self.inner.checkpoint_lock.lock();
        let mut stats = CheckpointStats::default();

        let candidates: Vec<_> = self
            .inner
            .table
            .enumerate()
            .into_iter()
            .filter(|(_, gxact)| {
                gxact.is_prepared()
                    && gxact.locking_backend.is_none()
                    && !gxact.on_disk
                    && gxact.prepare_end_lsn.is_valid()
                    && gxact.prepare_end_lsn <= redo_horizon
            })
            .collect();

        for (handle, gxact) in candidates {
            let state = self.load_prepared_state(&gxact)?;
            self.inner.state_files.write(&state)?;

            // a session that started finishing meanwhile may be reading the
            // PREPARE record, so the log must keep it
            let moved = self
                .inner
                .table
                .update(handle, |entry| {
                    if entry.locking_backend.is_some() {
                        return false;
                    }
                    entry.on_disk = true;
                    entry.prepare_start_lsn = Lsn::INVALID;
                    entry.prepare_end_lsn = Lsn::INVALID;
                    true
                })
                .unwrap_or(false);
            if moved {
                stats.files_written += 1;
            } else {
                log::debug!(
                    "Transaction {} is being finished, dropping its new state file",
                    gxact.xid
                );
                self.inner.state_files.remove(gxact.xid, false)?;
            }
        }

        if stats.files_written > 0 {
            log::info!(
                "{} two-phase state files were written for long-running prepared transactions",
                stats.files_written
            );
        }

        if self.mode() == RecoveryMode::Normal {
            stats.files_removed = self.remove_orphaned_state_files()?;
        }

        stats.retain_from = match self.redo_horizon() {
            Some(horizon) if horizon < redo_horizon => horizon,
            _ => redo_horizon,
        };
        log::debug!(
            "Checkpoint at {} done, log retained from {}",
            redo_horizon,
            stats.retain_from
        );
        Ok(stats)
    }

    /// Deletes state files of transactions that are not in the table.
    fn remove_orphaned_state_files(&self) -> TwoPhaseResult<usize> {
        let mut removed = 0;
        for xid in self.inner.state_files.list()? {
            if self.inner.table.find_by_xid(xid).is_none() {
                log::warn!("Removing orphaned two-phase state file for transaction {}", xid);
                if self.inner.state_files.remove(xid, false)? {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }
}
