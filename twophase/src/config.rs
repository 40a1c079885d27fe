//! Configuration of the prepared-transaction manager.

use crate::common::DEFAULT_MAX_BACKENDS;
use crate::errors::{ErrorKind, TwoPhaseError, TwoPhaseResult};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

/// Public interface for the manager configuration.
///
/// The configuration can be changed freely until the manager that owns it is
/// built; after that every setter fails with [`ErrorKind::InvalidOperation`],
/// because the table capacity is fixed for the lifetime of the manager.
///
/// # Examples
///
/// ```rust
/// use twophase::config::TwoPhaseConfig;
///
/// let config = TwoPhaseConfig::new();
/// config.set_max_prepared_transactions(16).unwrap();
/// config.set_state_dir("/tmp/twophase-doc").unwrap();
/// assert_eq!(config.max_prepared_transactions(), 16);
/// ```
#[derive(Clone)]
pub struct TwoPhaseConfig {
    /// The pointer to implementation. Uses Arc for cheap cloning and thread safety.
    inner: Arc<TwoPhaseConfigInner>,
}

impl Default for TwoPhaseConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl TwoPhaseConfig {
    /// Creates a new configuration with default values.
    ///
    /// Prepared transactions are disabled by default (capacity 0).
    pub fn new() -> Self {
        TwoPhaseConfig {
            inner: Arc::new(TwoPhaseConfigInner::new()),
        }
    }

    /// Maximum number of transactions that can be prepared at the same time.
    pub fn max_prepared_transactions(&self) -> usize {
        self.inner.max_prepared_transactions.load(Ordering::Relaxed)
    }

    /// Sets the table capacity. Zero disables prepared transactions.
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is already in use.
    pub fn set_max_prepared_transactions(&self, max: usize) -> TwoPhaseResult<()> {
        self.inner.check_not_configured("max_prepared_transactions")?;
        self.inner
            .max_prepared_transactions
            .store(max, Ordering::Relaxed);
        Ok(())
    }

    /// Number of regular backends. Placeholder backends of prepared transactions
    /// are numbered after them.
    pub fn max_backends(&self) -> u32 {
        self.inner.max_backends.load(Ordering::Relaxed)
    }

    /// Sets the number of regular backends.
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is already in use or `max` is zero.
    pub fn set_max_backends(&self, max: u32) -> TwoPhaseResult<()> {
        self.inner.check_not_configured("max_backends")?;
        if max == 0 {
            log::error!("max_backends must be at least 1");
            return Err(TwoPhaseError::new(
                "max_backends must be at least 1",
                ErrorKind::InvalidOperation,
            ));
        }
        self.inner.max_backends.store(max, Ordering::Relaxed);
        Ok(())
    }

    /// Directory holding durable-state files, if set.
    pub fn state_dir(&self) -> Option<PathBuf> {
        self.inner.state_dir.get().cloned()
    }

    /// Sets the directory holding durable-state files (can only be set once).
    ///
    /// # Errors
    ///
    /// Returns error if the directory was already set or the path is empty.
    pub fn set_state_dir<P: AsRef<Path>>(&self, dir: P) -> TwoPhaseResult<()> {
        self.inner.check_not_configured("state_dir")?;
        let dir = dir.as_ref();
        if dir.as_os_str().is_empty() {
            log::error!("State directory cannot be empty");
            return Err(TwoPhaseError::new(
                "State directory cannot be empty",
                ErrorKind::InvalidOperation,
            ));
        }
        self.inner.state_dir.set(dir.to_path_buf()).map_err(|_| {
            log::error!("State directory is already set");
            TwoPhaseError::new("State directory is already set", ErrorKind::InvalidOperation)
        })
    }

    /// Returns `true` once the configuration is owned by a manager.
    pub fn is_configured(&self) -> bool {
        self.inner.configured.load(Ordering::Acquire)
    }

    /// Validates the configuration and freezes it.
    pub(crate) fn initialize(&self) -> TwoPhaseResult<()> {
        if self.inner.state_dir.get().is_none() {
            log::error!("State directory is not configured");
            return Err(TwoPhaseError::new(
                "State directory is not configured",
                ErrorKind::InvalidOperation,
            ));
        }
        if self
            .inner
            .configured
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            log::error!("Configuration is already used by another manager");
            return Err(TwoPhaseError::new(
                "Configuration is already used by another manager",
                ErrorKind::InvalidOperation,
            ));
        }
        log::debug!(
            "Two-phase configuration: max_prepared_transactions={}, max_backends={}, state_dir={:?}",
            self.max_prepared_transactions(),
            self.max_backends(),
            self.state_dir()
        );
        Ok(())
    }
}

/// Private implementation of the configuration.
struct TwoPhaseConfigInner {
    /// Set once a manager has been built from this configuration
    configured: AtomicBool,
    /// Capacity of the global transaction table
    max_prepared_transactions: AtomicUsize,
    /// Number of regular backends
    max_backends: AtomicU32,
    /// Directory of durable-state files
    state_dir: OnceLock<PathBuf>,
}

impl TwoPhaseConfigInner {
    fn new() -> Self {
        TwoPhaseConfigInner {
            configured: AtomicBool::new(false),
            max_prepared_transactions: AtomicUsize::new(0),
            max_backends: AtomicU32::new(DEFAULT_MAX_BACKENDS),
            state_dir: OnceLock::new(),
        }
    }

    fn check_not_configured(&self, setting: &str) -> TwoPhaseResult<()> {
        if self.configured.load(Ordering::Acquire) {
            log::error!("{} cannot be changed after initialization", setting);
            return Err(TwoPhaseError::new(
                &format!("{} cannot be changed after initialization", setting),
                ErrorKind::InvalidOperation,
            ));
        }
        Ok(())
    }
}
