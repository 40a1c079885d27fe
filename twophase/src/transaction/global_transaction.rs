use crate::common::{BackendId, Lsn, Oid, OriginId, TransactionId, VirtualTransactionId};
use crate::transaction::session::Session;
use crate::wal::PreparedState;
use chrono::{DateTime, Utc};
use std::fmt::{Display, Formatter};

/// Stable handle of a slot in the global transaction table.
///
/// The generation changes every time the slot is freed, so a handle kept past
/// the release of its transaction never aliases the next occupant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GxactHandle {
    index: u32,
    generation: u32,
}

impl GxactHandle {
    pub(crate) fn new(index: u32, generation: u32) -> Self {
        GxactHandle { index, generation }
    }

    pub fn index(&self) -> usize {
        self.index as usize
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl Display for GxactHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "slot {}#{}", self.index, self.generation)
    }
}

/// Lifecycle state of a slot. A freed slot has no state at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GxactState {
    /// Reserved by a prepare that has not written its PREPARE record yet.
    Preparing,
    /// Backed by a durable PREPARE record or state file.
    Prepared,
}

/// One entry of the global transaction table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalTransaction {
    pub xid: TransactionId,
    pub gid: String,
    pub state: GxactState,
    pub prepared_at: DateTime<Utc>,
    pub owner: Oid,
    pub database: Oid,
    /// Start of the PREPARE record. Invalid once the state lives in a file.
    /// While preparing it holds a lower bound of where the record will land.
    pub prepare_start_lsn: Lsn,
    /// End of the PREPARE record. Invalid once the state lives in a file.
    pub prepare_end_lsn: Lsn,
    pub origin: OriginId,
    pub subxids: Vec<TransactionId>,
    /// Backend currently preparing or finishing this transaction.
    pub locking_backend: Option<BackendId>,
    /// Placeholder backend owning the transaction once prepared.
    pub dummy_backend_id: BackendId,
    /// A durable-state file backs this entry.
    pub on_disk: bool,
    /// Created by WAL replay and not yet recovered.
    pub in_redo: bool,
    /// An outcome record was appended but could not be flushed. Only replay
    /// after a restart can tell whether it reached the log.
    pub outcome_in_doubt: bool,
}

impl GlobalTransaction {
    /// A new entry for a transaction that `session` is about to prepare.
    pub fn preparing(
        xid: TransactionId,
        gid: &str,
        session: &Session,
        prepared_at: DateTime<Utc>,
        origin: OriginId,
        subxids: Vec<TransactionId>,
    ) -> Self {
        GlobalTransaction {
            xid,
            gid: gid.to_string(),
            state: GxactState::Preparing,
            prepared_at,
            owner: session.user(),
            database: session.database(),
            prepare_start_lsn: Lsn::INVALID,
            prepare_end_lsn: Lsn::INVALID,
            origin,
            subxids,
            locking_backend: Some(session.backend_id()),
            dummy_backend_id: BackendId(0),
            on_disk: false,
            in_redo: false,
            outcome_in_doubt: false,
        }
    }

    /// An entry rebuilt from a PREPARE record or a state file.
    ///
    /// `start` is invalid when the state came from a file.
    pub fn from_redo(state: &PreparedState, start: Lsn, end: Lsn, origin: OriginId) -> Self {
        GlobalTransaction {
            xid: state.xid,
            gid: state.gid.clone(),
            state: GxactState::Prepared,
            prepared_at: state.prepared_at,
            owner: state.owner,
            database: state.database,
            prepare_start_lsn: start,
            prepare_end_lsn: end,
            origin,
            subxids: state.subxids.clone(),
            locking_backend: None,
            dummy_backend_id: BackendId(0),
            on_disk: !start.is_valid(),
            in_redo: true,
            outcome_in_doubt: false,
        }
    }

    pub fn is_prepared(&self) -> bool {
        self.state == GxactState::Prepared
    }

    /// Virtual transaction id of the placeholder backend.
    pub fn virtual_transaction_id(&self) -> VirtualTransactionId {
        VirtualTransactionId {
            backend_id: self.dummy_backend_id,
            local_transaction_id: self.xid.0,
        }
    }

    /// Row of the monitoring view.
    pub fn info(&self) -> PreparedTransactionInfo {
        PreparedTransactionInfo {
            xid: self.xid,
            gid: self.gid.clone(),
            prepared_at: self.prepared_at,
            owner: self.owner,
            database: self.database,
            on_disk: self.on_disk,
        }
    }
}

/// Monitoring view of one prepared transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedTransactionInfo {
    pub xid: TransactionId,
    pub gid: String,
    pub prepared_at: DateTime<Utc>,
    pub owner: Oid,
    pub database: Oid,
    pub on_disk: bool,
}
