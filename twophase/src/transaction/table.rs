use crate::common::{BackendId, Lsn, TransactionId};
use crate::errors::{ErrorKind, TwoPhaseError, TwoPhaseResult};
use crate::transaction::global_transaction::{GlobalTransaction, GxactHandle};
use crate::transaction::session::Session;
use parking_lot::RwLock;

struct Slot {
    generation: u32,
    entry: Option<GlobalTransaction>,
}

struct TableState {
    slots: Vec<Slot>,
    /// Indexes of free slots, popped from the back.
    free: Vec<u32>,
    /// Indexes of occupied slots in the order they were reserved.
    live: Vec<u32>,
}

impl TableState {
    fn entry(&self, handle: GxactHandle) -> Option<&GlobalTransaction> {
        self.slots
            .get(handle.index())
            .filter(|slot| slot.generation == handle.generation())
            .and_then(|slot| slot.entry.as_ref())
    }

    fn entry_mut(&mut self, handle: GxactHandle) -> Option<&mut GlobalTransaction> {
        self.slots
            .get_mut(handle.index())
            .filter(|slot| slot.generation == handle.generation())
            .and_then(|slot| slot.entry.as_mut())
    }

    fn handle_of(&self, index: u32) -> GxactHandle {
        GxactHandle::new(index, self.slots[index as usize].generation)
    }

    fn live_entries(&self) -> impl Iterator<Item = (GxactHandle, &GlobalTransaction)> + '_ {
        self.live.iter().filter_map(move |index| {
            let slot = &self.slots[*index as usize];
            slot.entry
                .as_ref()
                .map(|entry| (GxactHandle::new(*index, slot.generation), entry))
        })
    }
}

/// Fixed-capacity table of global transactions shared by every session.
///
/// All mutations happen under a single writer lock, so duplicate checks and
/// slot allocation are atomic with respect to each other. Entries are handed
/// out as clones; the table is the only place a live entry is mutated.
pub struct GlobalTransactionTable {
    state: RwLock<TableState>,
    capacity: usize,
    max_backends: u32,
}

impl GlobalTransactionTable {
    /// Creates a table with `capacity` free slots.
    ///
    /// Placeholder backend ids of the slots are numbered after `max_backends`.
    pub fn new(capacity: usize, max_backends: u32) -> Self {
        let slots = (0..capacity)
            .map(|_| Slot {
                generation: 0,
                entry: None,
            })
            .collect();
        let free = (0..capacity as u32).rev().collect();
        GlobalTransactionTable {
            state: RwLock::new(TableState {
                slots,
                free,
                live: Vec::with_capacity(capacity),
            }),
            capacity,
            max_backends,
        }
    }

    /// Bytes of memory a table of `capacity` slots needs up front.
    pub fn estimate_size(capacity: usize) -> usize {
        std::mem::size_of::<GlobalTransactionTable>()
            + capacity
                * (std::mem::size_of::<Slot>()
                    + std::mem::size_of::<GlobalTransaction>()
                    + 2 * std::mem::size_of::<u32>())
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of occupied slots.
    pub fn len(&self) -> usize {
        self.state.read().live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Placeholder backend id of the slot at `index`.
    pub fn dummy_backend_id(&self, index: usize) -> BackendId {
        BackendId(self.max_backends + 1 + index as u32)
    }

    /// Places `entry` into a free slot.
    ///
    /// # Arguments
    ///
    /// * `entry` - The entry to insert. Its placeholder backend id is overwritten
    ///   with the one belonging to the chosen slot.
    ///
    /// # Returns
    ///
    /// The handle of the occupied slot.
    ///
    /// # Errors
    ///
    /// * [`ErrorKind::FeatureDisabled`] if the table has no capacity at all
    /// * [`ErrorKind::DuplicateGlobalId`] if a live entry already uses the gid
    /// * [`ErrorKind::InvalidOperation`] if a live entry already uses the xid
    /// * [`ErrorKind::TableFull`] if every slot is occupied
    pub fn reserve(&self, mut entry: GlobalTransaction) -> TwoPhaseResult<GxactHandle> {
        if self.capacity == 0 {
            return Err(TwoPhaseError::new(
                "prepared transactions are disabled, set max_prepared_transactions to a nonzero value",
                ErrorKind::FeatureDisabled,
            ));
        }

        let mut state = self.state.write();
        for (_, live) in state.live_entries() {
            if live.gid == entry.gid {
                return Err(TwoPhaseError::new(
                    &format!("transaction identifier \"{}\" is already in use", entry.gid),
                    ErrorKind::DuplicateGlobalId,
                ));
            }
            if live.xid == entry.xid {
                return Err(TwoPhaseError::new(
                    &format!("transaction {} is already in the global transaction table", entry.xid),
                    ErrorKind::InvalidOperation,
                ));
            }
        }

        let index = state.free.pop().ok_or_else(|| {
            TwoPhaseError::new(
                &format!(
                    "maximum number of prepared transactions reached ({}), increase max_prepared_transactions",
                    self.capacity
                ),
                ErrorKind::TableFull,
            )
        })?;

        entry.dummy_backend_id = self.dummy_backend_id(index as usize);
        state.slots[index as usize].entry = Some(entry);
        state.live.push(index);
        Ok(state.handle_of(index))
    }

    /// Frees the slot behind `handle` and returns the entry it held.
    ///
    /// # Errors
    ///
    /// Fails with [`ErrorKind::InternalError`] if the handle is stale.
    pub fn release(&self, handle: GxactHandle) -> TwoPhaseResult<GlobalTransaction> {
        let mut state = self.state.write();
        let slot = state
            .slots
            .get_mut(handle.index())
            .filter(|slot| slot.generation == handle.generation());
        let entry = match slot {
            Some(slot) => match slot.entry.take() {
                Some(entry) => {
                    slot.generation = slot.generation.wrapping_add(1);
                    entry
                }
                None => return Err(stale_handle(handle)),
            },
            None => return Err(stale_handle(handle)),
        };

        let index = handle.index() as u32;
        state.live.retain(|live| *live != index);
        state.free.push(index);
        Ok(entry)
    }

    /// Finds the live entry with the given gid.
    pub fn lookup(&self, gid: &str) -> TwoPhaseResult<GxactHandle> {
        let state = self.state.read();
        let found = state
            .live_entries()
            .find(|(_, entry)| entry.gid == gid)
            .map(|(handle, _)| handle);
        found.ok_or_else(|| gid_not_found(gid))
    }

    /// Finds the live entry for a top-level transaction id.
    pub fn find_by_xid(&self, xid: TransactionId) -> Option<GxactHandle> {
        let state = self.state.read();
        let found = state
            .live_entries()
            .find(|(_, entry)| entry.xid == xid)
            .map(|(handle, _)| handle);
        found
    }

    /// First live entry matching `predicate`.
    pub fn find<F>(&self, predicate: F) -> Option<(GxactHandle, GlobalTransaction)>
    where
        F: Fn(&GlobalTransaction) -> bool,
    {
        let state = self.state.read();
        let found = state
            .live_entries()
            .find(|(_, entry)| predicate(entry))
            .map(|(handle, entry)| (handle, entry.clone()));
        found
    }

    /// Copy of the entry behind `handle`, `None` if the handle is stale.
    pub fn get(&self, handle: GxactHandle) -> Option<GlobalTransaction> {
        self.state.read().entry(handle).cloned()
    }

    /// Applies `f` to the entry behind `handle` under the writer lock.
    ///
    /// # Errors
    ///
    /// Fails with [`ErrorKind::InternalError`] if the handle is stale.
    pub fn update<R, F>(&self, handle: GxactHandle, f: F) -> TwoPhaseResult<R>
    where
        F: FnOnce(&mut GlobalTransaction) -> R,
    {
        let mut state = self.state.write();
        state
            .entry_mut(handle)
            .map(f)
            .ok_or_else(|| stale_handle(handle))
    }

    /// Snapshot of every live entry in reservation order.
    pub fn enumerate(&self) -> Vec<(GxactHandle, GlobalTransaction)> {
        let state = self.state.read();
        let entries = state
            .live_entries()
            .map(|(handle, entry)| (handle, entry.clone()))
            .collect();
        entries
    }

    /// Smallest PREPARE record start among entries whose state still lives
    /// only in the log.
    pub fn min_prepare_start_lsn(&self) -> Option<Lsn> {
        let state = self.state.read();
        let horizon = state
            .live_entries()
            .filter(|(_, entry)| !entry.on_disk && entry.prepare_start_lsn.is_valid())
            .map(|(_, entry)| entry.prepare_start_lsn)
            .min();
        horizon
    }

    /// Finds the prepared entry with `gid` and marks it as being finished by
    /// `session`.
    ///
    /// # Errors
    ///
    /// * [`ErrorKind::NotFound`] if no live entry has the gid
    /// * [`ErrorKind::Busy`] if the entry is still preparing or another
    ///   session is finishing it
    /// * [`ErrorKind::PermissionDenied`] or [`ErrorKind::InvalidOperation`]
    ///   if the session may not finish it
    pub fn lock_for_finish(&self, gid: &str, session: &Session) -> TwoPhaseResult<GxactHandle> {
        let mut state = self.state.write();
        let handle = state
            .live_entries()
            .find(|(_, entry)| entry.gid == gid)
            .map(|(handle, _)| handle)
            .ok_or_else(|| gid_not_found(gid))?;

        let entry = state.entry_mut(handle).ok_or_else(|| stale_handle(handle))?;
        if entry.outcome_in_doubt {
            return Err(TwoPhaseError::new(
                &format!(
                    "outcome of prepared transaction with identifier \"{}\" is in doubt until restart",
                    gid
                ),
                ErrorKind::Busy,
            ));
        }
        if !entry.is_prepared() {
            return Err(TwoPhaseError::new(
                &format!("prepared transaction with identifier \"{}\" is busy", gid),
                ErrorKind::Busy,
            ));
        }
        if let Some(backend) = entry.locking_backend {
            return Err(TwoPhaseError::new(
                &format!(
                    "prepared transaction with identifier \"{}\" is busy, backend {} is finishing it",
                    gid, backend
                ),
                ErrorKind::Busy,
            ));
        }
        session.check_can_finish(entry)?;

        entry.locking_backend = Some(session.backend_id());
        Ok(handle)
    }

    /// Clears the finishing mark set by [`Self::lock_for_finish`].
    ///
    /// An entry whose outcome is in doubt stays marked.
    pub fn unlock(&self, handle: GxactHandle) {
        let mut state = self.state.write();
        if let Some(entry) = state.entry_mut(handle).filter(|entry| !entry.outcome_in_doubt) {
            entry.locking_backend = None;
        }
    }
}

fn stale_handle(handle: GxactHandle) -> TwoPhaseError {
    TwoPhaseError::new(
        &format!("failed to find {} in global transaction table", handle),
        ErrorKind::InternalError,
    )
}

fn gid_not_found(gid: &str) -> TwoPhaseError {
    TwoPhaseError::new(
        &format!("prepared transaction with identifier \"{}\" does not exist", gid),
        ErrorKind::NotFound,
    )
}
