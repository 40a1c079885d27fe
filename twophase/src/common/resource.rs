use crate::common::types::TransactionId;
use crate::errors::{ErrorKind, TwoPhaseError, TwoPhaseResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;

/// Identifier of a resource manager that contributes state to PREPARE records.
pub type ResourceManagerId = u8;

/// One resource-manager-specific entry embedded in a PREPARE record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRecord {
    pub rmid: ResourceManagerId,
    pub info: u16,
    pub data: Vec<u8>,
}

impl ResourceRecord {
    pub fn new(rmid: ResourceManagerId, info: u16, data: Vec<u8>) -> Self {
        ResourceRecord { rmid, info, data }
    }
}

/// Callbacks a subsystem registers to take part in two-phase commit.
///
/// Each callback receives the records the subsystem attached when the
/// transaction was prepared. `post_commit` and `post_abort` run after the finish
/// record is durable, so their failures cannot change the outcome.
pub trait TwoPhaseResourceManager: Send + Sync {
    fn id(&self) -> ResourceManagerId;

    fn name(&self) -> &str;

    fn post_commit(&self, xid: TransactionId, record: &ResourceRecord) -> TwoPhaseResult<()>;

    fn post_abort(&self, xid: TransactionId, record: &ResourceRecord) -> TwoPhaseResult<()>;

    /// Rebuilds in-memory state for a transaction found prepared at startup.
    fn recover(&self, xid: TransactionId, record: &ResourceRecord) -> TwoPhaseResult<()>;

    /// Rebuilds read-only state on a standby.
    fn standby_recover(&self, _xid: TransactionId, _record: &ResourceRecord) -> TwoPhaseResult<()> {
        Ok(())
    }
}

/// Which callback to run for a set of records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourcePhase {
    PostCommit,
    PostAbort,
    Recover,
    StandbyRecover,
}

/// Registry of resource managers keyed by id.
///
/// Built once by the manager builder and never changed afterwards.
#[derive(Clone, Default)]
pub struct ResourceRegistry {
    managers: Arc<HashMap<ResourceManagerId, Arc<dyn TwoPhaseResourceManager>>>,
}

impl ResourceRegistry {
    pub fn new(managers: Vec<Arc<dyn TwoPhaseResourceManager>>) -> TwoPhaseResult<Self> {
        let mut map: HashMap<ResourceManagerId, Arc<dyn TwoPhaseResourceManager>> = HashMap::new();
        for manager in managers {
            if let Some(existing) = map.get(&manager.id()) {
                return Err(TwoPhaseError::new(
                    &format!(
                        "resource manager id {} is used by both {} and {}",
                        manager.id(),
                        existing.name(),
                        manager.name()
                    ),
                    ErrorKind::ResourceManagerError,
                ));
            }
            map.insert(manager.id(), manager);
        }
        Ok(ResourceRegistry {
            managers: Arc::new(map),
        })
    }

    pub fn get(&self, rmid: ResourceManagerId) -> Option<Arc<dyn TwoPhaseResourceManager>> {
        self.managers.get(&rmid).cloned()
    }

    pub fn len(&self) -> usize {
        self.managers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.managers.is_empty()
    }

    /// Fails with [`ErrorKind::ResourceManagerError`] if a record names an
    /// unregistered resource manager.
    pub fn validate(&self, records: &[ResourceRecord]) -> TwoPhaseResult<()> {
        match records.iter().find(|r| !self.managers.contains_key(&r.rmid)) {
            Some(record) => Err(TwoPhaseError::new(
                &format!("unknown resource manager id {}", record.rmid),
                ErrorKind::ResourceManagerError,
            )),
            None => Ok(()),
        }
    }

    /// Runs the callback for `phase` over every record, in record order.
    ///
    /// Stops at the first failure. A record naming an unknown resource manager
    /// means the state it came from cannot be trusted.
    pub fn process(
        &self,
        xid: TransactionId,
        records: &[ResourceRecord],
        phase: ResourcePhase,
    ) -> TwoPhaseResult<()> {
        for record in records {
            let manager = self.get(record.rmid).ok_or_else(|| {
                TwoPhaseError::new(
                    &format!(
                        "prepared transaction {} references unknown resource manager id {}",
                        xid, record.rmid
                    ),
                    ErrorKind::CorruptDurableState,
                )
            })?;
            let result = match phase {
                ResourcePhase::PostCommit => manager.post_commit(xid, record),
                ResourcePhase::PostAbort => manager.post_abort(xid, record),
                ResourcePhase::Recover => manager.recover(xid, record),
                ResourcePhase::StandbyRecover => manager.standby_recover(xid, record),
            };
            result.map_err(|e| {
                TwoPhaseError::new_with_cause(
                    &format!(
                        "resource manager {} failed during {:?} of transaction {}",
                        manager.name(),
                        phase,
                        xid
                    ),
                    ErrorKind::ResourceManagerError,
                    e,
                )
            })?;
        }
        Ok(())
    }
}

impl Debug for ResourceRegistry {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<(ResourceManagerId, &str)> =
            self.managers.iter().map(|(id, m)| (*id, m.name())).collect();
        names.sort();
        f.debug_struct("ResourceRegistry").field("managers", &names).finish()
    }
}
