use crate::builder::TwoPhaseBuilder;
use crate::common::{
    BackendId, CommitLog, LockDescriptor, LockManager, LockOwner, Lsn, LsnRange, OriginId,
    ResourcePhase, ResourceRecord, ResourceRegistry, TransactionId, VirtualTransactionId, GID_SIZE,
};
use crate::config::TwoPhaseConfig;
use crate::errors::{ErrorKind, TwoPhaseError, TwoPhaseResult};
use crate::transaction::global_transaction::{
    GlobalTransaction, GxactHandle, GxactState, PreparedTransactionInfo,
};
use crate::transaction::session::Session;
use crate::transaction::state_file::StateFileStore;
use crate::transaction::table::GlobalTransactionTable;
use crate::wal::{read_record_at, FinishRecord, PreparedState, TwoPhaseRecord, WriteAheadLog};
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::fmt::{Debug, Formatter};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

/// Operating mode of the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecoveryMode {
    /// Built but not yet recovered; only recovery entry points are allowed.
    Startup,
    /// Replaying a primary's log as a read-only standby.
    Standby,
    /// Accepting prepares and finishes.
    Normal,
}

/// What a session asks to prepare.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrepareRequest {
    pub xid: TransactionId,
    pub gid: String,
    pub subxids: Vec<TransactionId>,
    /// Locks the session holds and hands over to the prepared transaction.
    pub locks: Vec<LockDescriptor>,
    pub resources: Vec<ResourceRecord>,
    pub origin: OriginId,
    pub origin_lsn: Lsn,
}

impl PrepareRequest {
    pub fn new(xid: TransactionId, gid: &str) -> Self {
        PrepareRequest {
            xid,
            gid: gid.to_string(),
            subxids: Vec::new(),
            locks: Vec::new(),
            resources: Vec::new(),
            origin: OriginId::INVALID,
            origin_lsn: Lsn::INVALID,
        }
    }

    pub fn with_subxids(mut self, subxids: Vec<TransactionId>) -> Self {
        self.subxids = subxids;
        self
    }

    pub fn with_locks(mut self, locks: Vec<LockDescriptor>) -> Self {
        self.locks = locks;
        self
    }

    pub fn with_resources(mut self, resources: Vec<ResourceRecord>) -> Self {
        self.resources = resources;
        self
    }

    /// Marks the transaction as replicated from `origin`, up to `origin_lsn`.
    pub fn with_origin(mut self, origin: OriginId, origin_lsn: Lsn) -> Self {
        self.origin = origin;
        self.origin_lsn = origin_lsn;
        self
    }
}

/// How far a PREPARE record got.
enum PrepareWrite {
    Durable(LsnRange),
    /// Nothing of the prepare survives a crash.
    Cancelled(TwoPhaseError),
    /// The record may or may not survive a crash.
    InDoubt(TwoPhaseError),
}

/// The prepared-transaction manager.
///
/// Owns the global transaction table and drives the prepare/finish state
/// machine against the write-ahead log, the lock manager, the commit log and
/// the registered resource managers. Cloning is cheap; clones share the same
/// table.
///
/// A manager starts in [`RecoveryMode::Startup`] and must run
/// [`TwoPhaseManager::startup_recovery`] (or enter standby mode) before it
/// accepts new work.
#[derive(Clone)]
pub struct TwoPhaseManager {
    pub(crate) inner: Arc<TwoPhaseManagerInner>,
}

pub(crate) struct TwoPhaseManagerInner {
    pub(crate) config: TwoPhaseConfig,
    pub(crate) table: GlobalTransactionTable,
    pub(crate) wal: Arc<dyn WriteAheadLog>,
    pub(crate) locks: Arc<dyn LockManager>,
    pub(crate) commit_log: Arc<dyn CommitLog>,
    pub(crate) resources: ResourceRegistry,
    pub(crate) state_files: StateFileStore,
    pub(crate) mode: RwLock<RecoveryMode>,
    /// Where the next standby replay pass starts.
    pub(crate) replay_position: Mutex<Lsn>,
    /// Set once standby recovery has reacquired locks; later PREPARE records
    /// take their locks as they are replayed.
    pub(crate) standby_locks_active: AtomicBool,
    /// Serializes checkpoints.
    pub(crate) checkpoint_lock: Mutex<()>,
}

impl Debug for TwoPhaseManager {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TwoPhaseManager")
            .field("mode", &self.mode())
            .field("prepared", &self.len())
            .field("capacity", &self.inner.table.capacity())
            .field("state_dir", &self.inner.state_files.dir())
            .finish()
    }
}

impl TwoPhaseManager {
    pub(crate) fn new(
        config: TwoPhaseConfig,
        wal: Arc<dyn WriteAheadLog>,
        locks: Arc<dyn LockManager>,
        commit_log: Arc<dyn CommitLog>,
        resources: ResourceRegistry,
        state_files: StateFileStore,
    ) -> Self {
        let table =
            GlobalTransactionTable::new(config.max_prepared_transactions(), config.max_backends());
        let start = wal.oldest_lsn();
        TwoPhaseManager {
            inner: Arc::new(TwoPhaseManagerInner {
                config,
                table,
                wal,
                locks,
                commit_log,
                resources,
                state_files,
                mode: RwLock::new(RecoveryMode::Startup),
                replay_position: Mutex::new(start),
                standby_locks_active: AtomicBool::new(false),
                checkpoint_lock: Mutex::new(()),
            }),
        }
    }

    /// Returns a builder for a new manager.
    pub fn builder() -> TwoPhaseBuilder {
        TwoPhaseBuilder::new()
    }

    /// Bytes of memory the table needs for the given configuration.
    pub fn shared_memory_size(config: &TwoPhaseConfig) -> usize {
        GlobalTransactionTable::estimate_size(config.max_prepared_transactions())
    }

    pub fn config(&self) -> &TwoPhaseConfig {
        &self.inner.config
    }

    pub fn mode(&self) -> RecoveryMode {
        *self.inner.mode.read()
    }

    pub(crate) fn set_mode(&self, mode: RecoveryMode) {
        let mut current = self.inner.mode.write();
        log::debug!("Two-phase manager mode {:?} -> {:?}", *current, mode);
        *current = mode;
    }

    pub(crate) fn expect_mode(&self, expected: RecoveryMode, operation: &str) -> TwoPhaseResult<()> {
        let mode = self.mode();
        if mode != expected {
            return Err(TwoPhaseError::new(
                &format!("cannot {} while the manager is in {:?} mode", operation, mode),
                ErrorKind::InvalidOperation,
            ));
        }
        Ok(())
    }

    /// Number of live entries, preparing or prepared.
    pub fn len(&self) -> usize {
        self.inner.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.table.is_empty()
    }

    /// Prepares a transaction for two-phase commit.
    ///
    /// Reserves a table slot under the request's gid, moves the session's locks
    /// to the prepared transaction, then durably writes the PREPARE record. Once
    /// this returns the transaction survives a crash and only
    /// [`Self::finish_prepared`] can end it.
    ///
    /// # Arguments
    ///
    /// * `session` - The session that ran the transaction and holds its locks.
    /// * `request` - Transaction id, gid, subtransactions, locks and resource
    ///   records of the transaction.
    ///
    /// # Returns
    ///
    /// The handle of the prepared transaction's slot.
    ///
    /// # Errors
    ///
    /// * [`ErrorKind::InvalidGid`] if the gid is too long or contains a NUL
    /// * [`ErrorKind::DuplicateGlobalId`] if the gid is already in use
    /// * [`ErrorKind::TableFull`] or [`ErrorKind::FeatureDisabled`] if no slot
    ///   is available
    /// * [`ErrorKind::LockConflict`] or [`ErrorKind::InvalidOperation`] if the
    ///   locks cannot be handed over
    /// * [`ErrorKind::WalError`] or [`ErrorKind::IOError`] if the record cannot
    ///   be made durable
    ///
    /// On any error the slot is freed and the session keeps its locks, except
    /// when the PREPARE record can neither be flushed nor cancelled durably.
    /// Then the outcome is in doubt: the slot keeps the locks and stays busy
    /// until restart, where replay decides.
    pub fn prepare(&self, session: &Session, request: PrepareRequest) -> TwoPhaseResult<GxactHandle> {
        self.expect_mode(RecoveryMode::Normal, "prepare a transaction")?;
        if !request.xid.is_normal() {
            return Err(TwoPhaseError::new(
                &format!("cannot prepare transaction {}", request.xid),
                ErrorKind::InvalidOperation,
            ));
        }
        validate_gid(&request.gid)?;
        self.inner.resources.validate(&request.resources)?;

        let prepared_at = Utc::now();
        let entry = GlobalTransaction::preparing(
            request.xid,
            &request.gid,
            session,
            prepared_at,
            request.origin,
            request.subxids.clone(),
        );
        let handle = self.inner.table.reserve(entry)?;
        let owner = LockOwner::PreparedTransaction(handle);

        if let Err(e) = self
            .inner
            .locks
            .transfer(session.lock_owner(), owner, &request.locks)
        {
            log::warn!("Could not hand over locks of transaction {}: {}", request.xid, e);
            self.discard_reservation(handle);
            return Err(e);
        }

        // lower bound for the record, keeps checkpoints from discarding it
        let provisional_start = self.inner.wal.end_lsn();
        self.inner
            .table
            .update(handle, |gxact| gxact.prepare_start_lsn = provisional_start)?;

        let state = PreparedState {
            xid: request.xid,
            gid: request.gid.clone(),
            database: session.database(),
            owner: session.user(),
            prepared_at,
            subxids: request.subxids,
            locks: request.locks,
            resources: request.resources,
            origin: request.origin,
            origin_lsn: request.origin_lsn,
        };

        let range = match self.write_prepare_record(&state) {
            PrepareWrite::Durable(range) => range,
            PrepareWrite::Cancelled(e) => {
                if let Err(back) = self
                    .inner
                    .locks
                    .transfer(owner, session.lock_owner(), &state.locks)
                {
                    log::error!("Could not return locks of transaction {}: {}", state.xid, back);
                }
                self.discard_reservation(handle);
                return Err(e);
            }
            PrepareWrite::InDoubt(e) => {
                // the slot and its locks stay reserved until restart decides
                if let Err(ue) = self
                    .inner
                    .table
                    .update(handle, |entry| entry.outcome_in_doubt = true)
                {
                    log::error!("Could not mark {} as in doubt: {}", handle, ue);
                }
                return Err(e);
            }
        };

        self.inner.commit_log.advance_next_transaction_id(state.xid);
        for subxid in &state.subxids {
            self.inner.commit_log.advance_next_transaction_id(*subxid);
        }

        self.inner.table.update(handle, |gxact| {
            gxact.state = GxactState::Prepared;
            gxact.prepare_start_lsn = range.start;
            gxact.prepare_end_lsn = range.end;
            gxact.locking_backend = None;
        })?;

        log::debug!(
            "Prepared transaction {} as \"{}\" at {}",
            state.xid,
            state.gid,
            range.start
        );
        Ok(handle)
    }

    /// Appends and flushes the PREPARE record.
    ///
    /// If the append succeeded but the flush did not, the record may still
    /// reach disk later. A flushed ABORT-PREPARED record right after it makes
    /// sure replay never resurrects a prepare the caller saw fail. If even that
    /// record cannot be made durable the outcome is in doubt.
    fn write_prepare_record(&self, state: &PreparedState) -> PrepareWrite {
        let range = match TwoPhaseRecord::Prepare(state.clone())
            .encode()
            .and_then(|bytes| self.inner.wal.append(&bytes))
        {
            Ok(range) => range,
            Err(e) => return PrepareWrite::Cancelled(e),
        };
        let Err(e) = self.inner.wal.flush(range.end) else {
            return PrepareWrite::Durable(range);
        };
        log::error!("Could not flush PREPARE record of transaction {}: {}", state.xid, e);
        let failed = TwoPhaseError::new_with_cause(
            &format!("could not flush PREPARE record of transaction {}", state.xid),
            ErrorKind::WalError,
            e,
        );

        let cancel = TwoPhaseRecord::AbortPrepared(FinishRecord {
            xid: state.xid,
            gid: state.gid.clone(),
            subxids: state.subxids.clone(),
            prepare_lsn: range.start,
            origin: state.origin,
        });
        let cancelled = cancel
            .encode()
            .and_then(|bytes| self.inner.wal.append(&bytes))
            .and_then(|cancel_range| self.inner.wal.flush(cancel_range.end));
        match cancelled {
            Ok(()) => {
                log::warn!("Cancelled PREPARE record of transaction {}", state.xid);
                PrepareWrite::Cancelled(failed)
            }
            Err(ce) => {
                log::error!(
                    "Could not cancel PREPARE record of transaction {}, its outcome is in doubt until restart: {}",
                    state.xid,
                    ce
                );
                PrepareWrite::InDoubt(failed)
            }
        }
    }

    fn discard_reservation(&self, handle: GxactHandle) {
        if let Err(e) = self.inner.table.release(handle) {
            log::error!("Could not release {}: {}", handle, e);
        }
    }

    /// Commits or rolls back a prepared transaction by gid.
    ///
    /// # Arguments
    ///
    /// * `session` - The finishing session, checked against the owner and
    ///   database of the transaction.
    /// * `gid` - Global identifier of the transaction.
    /// * `commit` - `true` to commit, `false` to roll back.
    /// * `raise_error_if_missing` - If `false`, a missing gid is not an error.
    ///
    /// # Returns
    ///
    /// `true` if the transaction was finished, `false` if it did not exist and
    /// `raise_error_if_missing` was `false`.
    ///
    /// # Errors
    ///
    /// * [`ErrorKind::NotFound`] if the gid is unknown and
    ///   `raise_error_if_missing` is set
    /// * [`ErrorKind::Busy`] if the transaction is still preparing or being
    ///   finished by another session
    /// * [`ErrorKind::PermissionDenied`] if the session is neither owner nor
    ///   superuser
    /// * [`ErrorKind::CorruptDurableState`] if the prepared state cannot be
    ///   read back
    /// * [`ErrorKind::WalError`] if the outcome record cannot be made durable.
    ///   If it was appended but not flushed the transaction stays marked as
    ///   busy until restart, as its outcome is no longer known.
    pub fn finish_prepared(
        &self,
        session: &Session,
        gid: &str,
        commit: bool,
        raise_error_if_missing: bool,
    ) -> TwoPhaseResult<bool> {
        self.expect_mode(RecoveryMode::Normal, "finish a prepared transaction")?;
        let handle = match self.inner.table.lock_for_finish(gid, session) {
            Ok(handle) => handle,
            Err(e) if e.kind() == &ErrorKind::NotFound && !raise_error_if_missing => {
                log::debug!("Prepared transaction \"{}\" does not exist, nothing to finish", gid);
                return Ok(false);
            }
            Err(e) => return Err(e),
        };

        let (gxact, state) = match self.prepare_finish(handle) {
            Ok(loaded) => loaded,
            Err(e) => {
                self.inner.table.unlock(handle);
                return Err(e);
            }
        };

        let record = FinishRecord {
            xid: gxact.xid,
            gid: gxact.gid.clone(),
            subxids: state.subxids.clone(),
            prepare_lsn: gxact.prepare_start_lsn,
            origin: gxact.origin,
        };
        let record = if commit {
            TwoPhaseRecord::CommitPrepared(record)
        } else {
            TwoPhaseRecord::AbortPrepared(record)
        };
        let bytes = match record.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                self.inner.table.unlock(handle);
                return Err(e);
            }
        };
        let range = match self.inner.wal.append(&bytes) {
            Ok(range) => range,
            Err(e) => {
                self.inner.table.unlock(handle);
                return Err(e);
            }
        };
        if let Err(e) = self.inner.wal.flush(range.end) {
            log::error!(
                "Outcome of prepared transaction \"{}\" is in doubt until restart: {}",
                gid,
                e
            );
            if let Err(ue) = self
                .inner
                .table
                .update(handle, |entry| entry.outcome_in_doubt = true)
            {
                log::error!("Could not mark {} as in doubt: {}", handle, ue);
            }
            return Err(TwoPhaseError::new_with_cause(
                &format!("could not flush outcome record of prepared transaction \"{}\"", gid),
                ErrorKind::WalError,
                e,
            ));
        }

        // the outcome is durable from here on
        if commit {
            self.inner.commit_log.set_committed(gxact.xid, &state.subxids);
        } else {
            self.inner.commit_log.set_aborted(gxact.xid, &state.subxids);
        }

        let released = self
            .inner
            .locks
            .release_all(LockOwner::PreparedTransaction(handle));

        let phase = if commit {
            ResourcePhase::PostCommit
        } else {
            ResourcePhase::PostAbort
        };
        if let Err(e) = self.inner.resources.process(gxact.xid, &state.resources, phase) {
            log::error!("Cleanup of prepared transaction \"{}\" failed: {:?}", gid, e);
        }

        let removed = self.inner.table.release(handle)?;
        if removed.on_disk {
            self.inner.state_files.remove(removed.xid, true)?;
        }

        log::debug!(
            "{} prepared transaction {} \"{}\", released {} locks",
            if commit { "Committed" } else { "Rolled back" },
            gxact.xid,
            gid,
            released
        );
        Ok(true)
    }

    fn prepare_finish(&self, handle: GxactHandle) -> TwoPhaseResult<(GlobalTransaction, PreparedState)> {
        let gxact = self.inner.table.get(handle).ok_or_else(|| {
            TwoPhaseError::new(
                &format!("failed to find {} in global transaction table", handle),
                ErrorKind::InternalError,
            )
        })?;
        let state = self.load_prepared_state(&gxact)?;
        Ok((gxact, state))
    }

    /// Reads the prepared state of `gxact` from its state file or from its
    /// PREPARE record.
    pub(crate) fn load_prepared_state(&self, gxact: &GlobalTransaction) -> TwoPhaseResult<PreparedState> {
        if gxact.on_disk {
            return self.inner.state_files.read(gxact.xid);
        }

        let at = gxact.prepare_start_lsn;
        let read = read_record_at(self.inner.wal.as_ref(), at).map_err(|e| {
            log::error!(
                "Could not read two-phase state of transaction {} from WAL at {}: {}",
                gxact.xid,
                at,
                e
            );
            TwoPhaseError::new_with_cause(
                &format!("could not read two-phase state from WAL at {}", at),
                ErrorKind::CorruptDurableState,
                e,
            )
        })?;
        match read {
            (_, TwoPhaseRecord::Prepare(state)) if state.xid == gxact.xid => Ok(state),
            _ => Err(TwoPhaseError::new(
                &format!(
                    "expected two-phase state data for transaction {} is not present in WAL at {}",
                    gxact.xid, at
                ),
                ErrorKind::CorruptDurableState,
            )),
        }
    }

    /// Cleans up after a session whose transaction aborted or which went away.
    ///
    /// A slot the session was still preparing is freed together with any locks
    /// already moved to it. A prepared transaction the session was finishing is
    /// left prepared and becomes available to other sessions again.
    pub fn at_abort(&self, session: &Session) {
        let backend = session.backend_id();
        for (handle, gxact) in self.inner.table.enumerate() {
            if gxact.locking_backend != Some(backend) {
                continue;
            }
            match gxact.state {
                _ if gxact.outcome_in_doubt => {
                    log::warn!(
                        "Transaction {} \"{}\" stays busy, its outcome is in doubt",
                        gxact.xid,
                        gxact.gid
                    );
                }
                GxactState::Preparing => {
                    let released = self
                        .inner
                        .locks
                        .release_all(LockOwner::PreparedTransaction(handle));
                    self.discard_reservation(handle);
                    log::debug!(
                        "Discarded half-prepared transaction {} of backend {}, released {} locks",
                        gxact.xid,
                        backend,
                        released
                    );
                }
                GxactState::Prepared => {
                    self.inner.table.unlock(handle);
                    log::debug!("Backend {} no longer finishing \"{}\"", backend, gxact.gid);
                }
            }
        }
    }

    /// Handle of the live entry with `gid`.
    pub fn lookup(&self, gid: &str) -> TwoPhaseResult<GxactHandle> {
        self.inner.table.lookup(gid)
    }

    /// Copy of the entry behind `handle`.
    pub fn get(&self, handle: GxactHandle) -> Option<GlobalTransaction> {
        self.inner.table.get(handle)
    }

    /// Returns `true` if a prepared transaction with top-level id `xid` exists.
    pub fn is_prepared(&self, xid: TransactionId) -> bool {
        self.inner
            .table
            .find(|gxact| gxact.xid == xid && gxact.is_prepared())
            .is_some()
    }

    /// Transaction id of the prepared transaction whose placeholder backend
    /// runs `vxid`.
    pub fn transaction_id_for_virtual_id(&self, vxid: VirtualTransactionId) -> Option<TransactionId> {
        self.inner
            .table
            .find(|gxact| gxact.is_prepared() && gxact.virtual_transaction_id() == vxid)
            .map(|(_, gxact)| gxact.xid)
    }

    /// Handle of the placeholder process of prepared transaction `xid`.
    pub fn dummy_process_for(&self, xid: TransactionId) -> TwoPhaseResult<GxactHandle> {
        self.inner.table.find_by_xid(xid).ok_or_else(|| {
            TwoPhaseError::new(
                &format!("failed to find global transaction for xid {}", xid),
                ErrorKind::NotFound,
            )
        })
    }

    /// Placeholder backend id of prepared transaction `xid`.
    pub fn dummy_backend_id(&self, xid: TransactionId) -> TwoPhaseResult<BackendId> {
        let handle = self.dummy_process_for(xid)?;
        Ok(self.inner.table.dummy_backend_id(handle.index()))
    }

    /// Locks currently held by the prepared transaction with `gid`.
    pub fn locks_held(&self, gid: &str) -> TwoPhaseResult<Vec<LockDescriptor>> {
        let handle = self.inner.table.lookup(gid)?;
        Ok(self
            .inner
            .locks
            .locks_held_by(LockOwner::PreparedTransaction(handle)))
    }

    /// Monitoring view of every prepared transaction, in table order.
    pub fn prepared_transactions(&self) -> Vec<PreparedTransactionInfo> {
        self.inner
            .table
            .enumerate()
            .into_iter()
            .filter(|(_, gxact)| gxact.is_prepared())
            .map(|(_, gxact)| gxact.info())
            .collect()
    }
}

/// Checks that `gid` fits the fixed-size identifier field.
pub fn validate_gid(gid: &str) -> TwoPhaseResult<()> {
    if gid.len() >= GID_SIZE {
        return Err(TwoPhaseError::new(
            &format!("transaction identifier \"{}\" is too long", gid),
            ErrorKind::InvalidGid,
        ));
    }
    if gid.contains('\0') {
        return Err(TwoPhaseError::new(
            "transaction identifier must not contain NUL characters",
            ErrorKind::InvalidGid,
        ));
    }
    Ok(())
}
