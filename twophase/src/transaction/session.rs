use crate::common::{BackendId, LockOwner, Oid};
use crate::errors::{ErrorKind, TwoPhaseError, TwoPhaseResult};
use crate::transaction::global_transaction::GlobalTransaction;

/// Identity of the client session calling into the manager.
///
/// The backend id ties the session to the locks it holds; user and database are
/// checked when the session tries to finish someone else's prepared transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    backend_id: BackendId,
    user: Oid,
    database: Oid,
    superuser: bool,
}

impl Session {
    /// Creates a session for an ordinary user.
    pub fn new(backend_id: BackendId, user: Oid, database: Oid) -> Self {
        Session {
            backend_id,
            user,
            database,
            superuser: false,
        }
    }

    /// Creates a session with superuser privileges.
    pub fn superuser(backend_id: BackendId, user: Oid, database: Oid) -> Self {
        Session {
            backend_id,
            user,
            database,
            superuser: true,
        }
    }

    pub fn backend_id(&self) -> BackendId {
        self.backend_id
    }

    pub fn user(&self) -> Oid {
        self.user
    }

    pub fn database(&self) -> Oid {
        self.database
    }

    pub fn is_superuser(&self) -> bool {
        self.superuser
    }

    /// The owner under which this session's locks are registered.
    pub fn lock_owner(&self) -> LockOwner {
        LockOwner::Session(self.backend_id)
    }

    /// Checks that this session may commit or roll back `gxact`.
    pub(crate) fn check_can_finish(&self, gxact: &GlobalTransaction) -> TwoPhaseResult<()> {
        if gxact.owner != self.user && !self.superuser {
            return Err(TwoPhaseError::new(
                &format!(
                    "permission denied to finish prepared transaction \"{}\": must be owner of prepared transaction",
                    gxact.gid
                ),
                ErrorKind::PermissionDenied,
            ));
        }
        if gxact.database != self.database {
            return Err(TwoPhaseError::new(
                &format!(
                    "prepared transaction \"{}\" belongs to another database, connect to database {} to finish it",
                    gxact.gid, gxact.database
                ),
                ErrorKind::InvalidOperation,
            ));
        }
        Ok(())
    }
}
