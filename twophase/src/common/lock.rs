use crate::common::types::{BackendId, Oid, TransactionId};
use crate::errors::{ErrorKind, TwoPhaseError, TwoPhaseResult};
use crate::transaction::GxactHandle;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

/// Who holds a lock.
///
/// A live session owns its locks directly. Once a transaction is prepared its
/// locks are re-tagged to the slot of the prepared transaction, so they survive
/// the session disconnecting and stay visible to conflict checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockOwner {
    Session(BackendId),
    PreparedTransaction(GxactHandle),
}

impl Display for LockOwner {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            LockOwner::Session(backend) => write!(f, "session {}", backend),
            LockOwner::PreparedTransaction(handle) => write!(f, "prepared transaction {}", handle),
        }
    }
}

/// The object a lock protects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LockTag {
    Relation { database: Oid, relation: Oid },
    Tuple { database: Oid, relation: Oid, block: u32, offset: u16 },
    Transaction(TransactionId),
    Object { database: Oid, class: Oid, object: Oid },
}

/// Table-level lock modes, weakest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LockMode {
    AccessShare,
    RowShare,
    RowExclusive,
    ShareUpdateExclusive,
    Share,
    ShareRowExclusive,
    Exclusive,
    AccessExclusive,
}

impl LockMode {
    fn bit(self) -> u16 {
        1 << (self as u16)
    }

    fn conflict_mask(self) -> u16 {
        use LockMode::*;
        let modes: &[LockMode] = match self {
            AccessShare => &[AccessExclusive],
            RowShare => &[Exclusive, AccessExclusive],
            RowExclusive => &[Share, ShareRowExclusive, Exclusive, AccessExclusive],
            ShareUpdateExclusive => &[
                ShareUpdateExclusive,
                Share,
                ShareRowExclusive,
                Exclusive,
                AccessExclusive,
            ],
            Share => &[
                RowExclusive,
                ShareUpdateExclusive,
                ShareRowExclusive,
                Exclusive,
                AccessExclusive,
            ],
            ShareRowExclusive => &[
                RowExclusive,
                ShareUpdateExclusive,
                Share,
                ShareRowExclusive,
                Exclusive,
                AccessExclusive,
            ],
            Exclusive => &[
                RowShare,
                RowExclusive,
                ShareUpdateExclusive,
                Share,
                ShareRowExclusive,
                Exclusive,
                AccessExclusive,
            ],
            AccessExclusive => &[
                AccessShare,
                RowShare,
                RowExclusive,
                ShareUpdateExclusive,
                Share,
                ShareRowExclusive,
                Exclusive,
                AccessExclusive,
            ],
        };
        modes.iter().fold(0, |mask, mode| mask | mode.bit())
    }

    /// Returns `true` if a lock in `self` cannot be granted while `other` is held
    /// by a different owner.
    pub fn conflicts_with(self, other: LockMode) -> bool {
        self.conflict_mask() & other.bit() != 0
    }
}

/// One lock held by a transaction, as recorded in a PREPARE record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LockDescriptor {
    pub tag: LockTag,
    pub mode: LockMode,
}

impl LockDescriptor {
    pub fn new(tag: LockTag, mode: LockMode) -> Self {
        LockDescriptor { tag, mode }
    }

    /// Convenience constructor for a relation lock.
    pub fn relation(database: Oid, relation: Oid, mode: LockMode) -> Self {
        LockDescriptor {
            tag: LockTag::Relation { database, relation },
            mode,
        }
    }
}

/// Contract of the lock manager as seen by the prepared-transaction manager.
///
/// Locks are never waited for here: a conflicting request fails immediately with
/// [`ErrorKind::LockConflict`].
pub trait LockManager: Send + Sync {
    /// Grants `lock` to `owner`.
    fn acquire(&self, owner: LockOwner, lock: &LockDescriptor) -> TwoPhaseResult<()>;

    /// Moves every lock in `locks` from `from` to `to`.
    ///
    /// All-or-nothing: if `from` does not hold one of the locks nothing is moved.
    fn transfer(&self, from: LockOwner, to: LockOwner, locks: &[LockDescriptor]) -> TwoPhaseResult<()>;

    /// Releases every lock held by `owner` and returns how many were released.
    fn release_all(&self, owner: LockOwner) -> usize;

    /// Lists the locks held by `owner`, sorted.
    fn locks_held_by(&self, owner: LockOwner) -> Vec<LockDescriptor>;
}

#[derive(Debug, Clone)]
struct Holder {
    owner: LockOwner,
    mode: LockMode,
    count: u32,
}

/// In-memory lock table.
///
/// The table maps each [`LockTag`] to its current holders. It is cheap to clone;
/// all clones share the same state.
///
/// # Examples
///
/// ```
/// use twophase::common::{BackendId, LockDescriptor, LockManager, LockMode, LockOwner, LockTable};
///
/// let table = LockTable::new();
/// let reader = LockOwner::Session(BackendId(1));
/// let writer = LockOwner::Session(BackendId(2));
/// let lock = LockDescriptor::relation(1, 16384, LockMode::AccessShare);
/// table.acquire(reader, &lock).unwrap();
///
/// let exclusive = LockDescriptor::relation(1, 16384, LockMode::AccessExclusive);
/// assert!(table.acquire(writer, &exclusive).is_err());
/// ```
#[derive(Clone, Default)]
pub struct LockTable {
    locks: Arc<RwLock<HashMap<LockTag, Vec<Holder>>>>,
}

impl LockTable {
    /// Creates a new empty lock table.
    pub fn new() -> Self {
        LockTable {
            locks: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Returns the number of distinct objects currently locked.
    pub fn lock_count(&self) -> usize {
        self.locks.read().len()
    }

    /// Returns the owners currently holding a lock on `tag`.
    pub fn holders_of(&self, tag: &LockTag) -> Vec<(LockOwner, LockMode)> {
        self.locks
            .read()
            .get(tag)
            .map(|holders| holders.iter().map(|h| (h.owner, h.mode)).collect())
            .unwrap_or_default()
    }
}

impl LockManager for LockTable {
    fn acquire(&self, owner: LockOwner, lock: &LockDescriptor) -> TwoPhaseResult<()> {
        let mut locks = self.locks.write();
        let holders = locks.entry(lock.tag).or_default();

        if let Some(conflict) = holders
            .iter()
            .find(|h| h.owner != owner && lock.mode.conflicts_with(h.mode))
        {
            log::debug!(
                "Lock {:?} in mode {:?} for {} conflicts with {} holding {:?}",
                lock.tag,
                lock.mode,
                owner,
                conflict.owner,
                conflict.mode
            );
            return Err(TwoPhaseError::new(
                &format!(
                    "could not obtain lock on {:?} in {:?} mode, held by {}",
                    lock.tag, conflict.mode, conflict.owner
                ),
                ErrorKind::LockConflict,
            ));
        }

        match holders
            .iter_mut()
            .find(|h| h.owner == owner && h.mode == lock.mode)
        {
            Some(holder) => holder.count += 1,
            None => holders.push(Holder {
                owner,
                mode: lock.mode,
                count: 1,
            }),
        }
        Ok(())
    }

    fn transfer(&self, from: LockOwner, to: LockOwner, locks: &[LockDescriptor]) -> TwoPhaseResult<()> {
        let mut table = self.locks.write();

        for lock in locks {
            let held = table
                .get(&lock.tag)
                .map(|holders| holders.iter().any(|h| h.owner == from && h.mode == lock.mode))
                .unwrap_or(false);
            if !held {
                return Err(TwoPhaseError::new(
                    &format!("{} does not hold lock {:?} in {:?} mode", from, lock.tag, lock.mode),
                    ErrorKind::InvalidOperation,
                ));
            }
        }

        for lock in locks {
            let Some(holders) = table.get_mut(&lock.tag) else {
                continue;
            };
            let Some(position) = holders
                .iter()
                .position(|h| h.owner == from && h.mode == lock.mode)
            else {
                // same lock listed twice, already moved
                continue;
            };
            let moved = holders.remove(position);
            match holders.iter_mut().find(|h| h.owner == to && h.mode == lock.mode) {
                Some(existing) => existing.count += moved.count,
                None => holders.push(Holder {
                    owner: to,
                    mode: moved.mode,
                    count: moved.count,
                }),
            }
        }
        Ok(())
    }

    fn release_all(&self, owner: LockOwner) -> usize {
        let mut table = self.locks.write();
        let mut released = 0;
        table.retain(|_, holders| {
            let before = holders.len();
            holders.retain(|h| h.owner != owner);
            released += before - holders.len();
            !holders.is_empty()
        });
        released
    }

    fn locks_held_by(&self, owner: LockOwner) -> Vec<LockDescriptor> {
        let table = self.locks.read();
        let mut held: Vec<LockDescriptor> = table
            .iter()
            .flat_map(|(tag, holders)| {
                holders
                    .iter()
                    .filter(|h| h.owner == owner)
                    .map(|h| LockDescriptor::new(*tag, h.mode))
            })
            .collect();
        held.sort();
        held
    }
}
