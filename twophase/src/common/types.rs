use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// Object identifier used for users and databases.
pub type Oid = u32;

/// A transaction id.
///
/// Id `0` is reserved as the invalid id. Logical age follows the modulo-2^32
/// comparison used for wrapping transaction counters, so
/// [`TransactionId::precedes`] must be used instead of `<` when comparing ids
/// that may be far apart. The derived `Ord` is plain numeric order and only
/// gives sorted collections a stable order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TransactionId(pub u32);

impl TransactionId {
    pub const INVALID: TransactionId = TransactionId(0);
    /// First id handed out to ordinary transactions.
    pub const FIRST_NORMAL: TransactionId = TransactionId(3);

    pub fn is_valid(&self) -> bool {
        self.0 != 0
    }

    pub fn is_normal(&self) -> bool {
        self.0 >= Self::FIRST_NORMAL.0
    }

    /// Returns `true` if `self` is logically older than `other`.
    pub fn precedes(&self, other: TransactionId) -> bool {
        if !self.is_normal() || !other.is_normal() {
            return self.0 < other.0;
        }
        (self.0.wrapping_sub(other.0) as i32) < 0
    }

    /// Returns `true` if `self` is logically newer than or equal to `other`.
    pub fn follows_or_equals(&self, other: TransactionId) -> bool {
        !self.precedes(other)
    }
}

impl Display for TransactionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A position in the write-ahead log.
///
/// `Lsn(0)` is the invalid position; positions are byte offsets and only grow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Lsn(pub u64);

impl Lsn {
    pub const INVALID: Lsn = Lsn(0);

    pub fn is_valid(&self) -> bool {
        self.0 != 0
    }

    pub fn offset(&self, bytes: u64) -> Lsn {
        Lsn(self.0 + bytes)
    }
}

impl Display for Lsn {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:X}/{:X}", self.0 >> 32, self.0 as u32)
    }
}

/// The half-open byte range `[start, end)` occupied by one WAL record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LsnRange {
    pub start: Lsn,
    pub end: Lsn,
}

/// Identifier of a backend (worker serving one session).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BackendId(pub u32);

impl Display for BackendId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Virtual transaction id: the backend plus a backend-local counter.
///
/// The placeholder backend of a prepared transaction uses the transaction id
/// itself as the local id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VirtualTransactionId {
    pub backend_id: BackendId,
    pub local_transaction_id: u32,
}

impl Display for VirtualTransactionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.backend_id, self.local_transaction_id)
    }
}

/// Replication origin tag attached to records replayed from another node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct OriginId(pub u16);

impl OriginId {
    pub const INVALID: OriginId = OriginId(0);

    pub fn is_valid(&self) -> bool {
        self.0 != 0
    }
}
