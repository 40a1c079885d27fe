use crate::common::{
    CommitLog, LockManager, LockTable, MemoryCommitLog, ResourceRegistry, TwoPhaseResourceManager,
};
use crate::config::TwoPhaseConfig;
use crate::errors::{ErrorKind, TwoPhaseError, TwoPhaseResult};
use crate::transaction::{StateFileStore, TwoPhaseManager};
use crate::wal::WriteAheadLog;
use std::path::Path;
use std::sync::Arc;

/// Builder for a [`TwoPhaseManager`].
///
/// Collects the configuration and the collaborators the manager works with.
/// A configuration error is remembered and reported by [`Self::build`], so
/// setters can be chained without checking each one.
///
/// # Examples
///
/// ```rust
/// use std::sync::Arc;
/// use twophase::builder::TwoPhaseBuilder;
/// use twophase::wal::MemoryWal;
///
/// # fn main() -> twophase::errors::TwoPhaseResult<()> {
/// let dir = std::env::temp_dir().join("twophase-builder-doc");
/// let manager = TwoPhaseBuilder::new()
///     .max_prepared_transactions(8)
///     .state_dir(&dir)
///     .wal(Arc::new(MemoryWal::new()))
///     .build()?;
/// manager.startup_recovery(None)?;
/// assert!(manager.is_empty());
/// # Ok(())
/// # }
/// ```
#[derive(Default)]
pub struct TwoPhaseBuilder {
    error: Option<TwoPhaseError>,
    config: TwoPhaseConfig,
    wal: Option<Arc<dyn WriteAheadLog>>,
    locks: Option<Arc<dyn LockManager>>,
    commit_log: Option<Arc<dyn CommitLog>>,
    resource_managers: Vec<Arc<dyn TwoPhaseResourceManager>>,
}

impl TwoPhaseBuilder {
    /// Creates a builder with default configuration.
    pub fn new() -> Self {
        TwoPhaseBuilder::default()
    }

    /// Uses an existing configuration instead of the default one.
    ///
    /// Settings made on the builder before this call are discarded.
    pub fn config(mut self, config: TwoPhaseConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the capacity of the global transaction table.
    ///
    /// # Arguments
    ///
    /// * `max` - Maximum number of concurrently prepared transactions. Zero
    ///   disables prepared transactions.
    ///
    /// # Returns
    ///
    /// This builder for method chaining.
    pub fn max_prepared_transactions(mut self, max: usize) -> Self {
        if self.error.is_none() {
            if let Err(e) = self.config.set_max_prepared_transactions(max) {
                self.error = Some(e);
            }
        }
        self
    }

    /// Sets the number of regular backends.
    pub fn max_backends(mut self, max: u32) -> Self {
        if self.error.is_none() {
            if let Err(e) = self.config.set_max_backends(max) {
                self.error = Some(e);
            }
        }
        self
    }

    /// Sets the directory of durable-state files.
    pub fn state_dir<P: AsRef<Path>>(mut self, dir: P) -> Self {
        if self.error.is_none() {
            if let Err(e) = self.config.set_state_dir(dir) {
                self.error = Some(e);
            }
        }
        self
    }

    /// Sets the write-ahead log. Required.
    pub fn wal(mut self, wal: Arc<dyn WriteAheadLog>) -> Self {
        self.wal = Some(wal);
        self
    }

    /// Sets the lock manager. Defaults to an in-process [`LockTable`].
    pub fn lock_manager(mut self, locks: Arc<dyn LockManager>) -> Self {
        self.locks = Some(locks);
        self
    }

    /// Sets the commit log. Defaults to a [`MemoryCommitLog`].
    pub fn commit_log(mut self, commit_log: Arc<dyn CommitLog>) -> Self {
        self.commit_log = Some(commit_log);
        self
    }

    /// Registers a resource manager with two-phase callbacks.
    pub fn resource_manager(mut self, manager: Arc<dyn TwoPhaseResourceManager>) -> Self {
        self.resource_managers.push(manager);
        self
    }

    /// Builds the manager.
    ///
    /// The manager starts in startup mode; run
    /// [`TwoPhaseManager::startup_recovery`] or
    /// [`TwoPhaseManager::start_standby`] before using it.
    ///
    /// # Errors
    ///
    /// Returns the first configuration error, or
    /// [`ErrorKind::InvalidOperation`] if no write-ahead log was given, the
    /// state directory is missing or the configuration is already in use.
    pub fn build(self) -> TwoPhaseResult<TwoPhaseManager> {
        if let Some(e) = self.error {
            return Err(e);
        }
        let wal = self.wal.ok_or_else(|| {
            log::error!("A write-ahead log is required to build the two-phase manager");
            TwoPhaseError::new(
                "A write-ahead log is required to build the two-phase manager",
                ErrorKind::InvalidOperation,
            )
        })?;

        self.config.initialize()?;
        let state_dir = self.config.state_dir().ok_or_else(|| {
            TwoPhaseError::new("State directory is not configured", ErrorKind::InvalidOperation)
        })?;
        let state_files = StateFileStore::open(state_dir)?;
        let resources = ResourceRegistry::new(self.resource_managers)?;

        let locks = self.locks.unwrap_or_else(|| {
            log::debug!("No lock manager given, using an in-process lock table");
            Arc::new(LockTable::new())
        });
        let commit_log = self.commit_log.unwrap_or_else(|| {
            log::debug!("No commit log given, using an in-memory commit log");
            Arc::new(MemoryCommitLog::new())
        });

        Ok(TwoPhaseManager::new(
            self.config,
            wal,
            locks,
            commit_log,
            resources,
            state_files,
        ))
    }
}
