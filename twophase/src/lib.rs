//! # twophase - Prepared transactions for a WAL-based storage engine
//!
//! `twophase` keeps track of transactions that have been prepared for
//! two-phase commit: they have durably promised to commit if asked, hold on to
//! their locks, and survive crashes until an explicit commit or rollback.
//!
//! ## Key Features
//!
//! - **Global transaction table**: fixed capacity, unique global identifiers,
//!   one placeholder backend per slot
//! - **Prepare/finish state machine**: ownership checks, lock hand-over,
//!   durable PREPARE and outcome records
//! - **Crash recovery**: state files, log replay, validation against the
//!   commit log, lock reacquisition
//! - **Standby support**: incremental replay and promotion
//! - **Checkpoint integration**: long-lived prepared state moves from the log
//!   into checksummed state files
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use twophase::common::{BackendId, LockDescriptor, LockManager, LockMode, LockTable, TransactionId};
//! use twophase::transaction::{PrepareRequest, Session, TwoPhaseManager};
//! use twophase::wal::MemoryWal;
//!
//! # fn main() -> twophase::errors::TwoPhaseResult<()> {
//! let locks = Arc::new(LockTable::new());
//! let manager = TwoPhaseManager::builder()
//!     .max_prepared_transactions(16)
//!     .state_dir(std::env::temp_dir().join("twophase-quick-start"))
//!     .wal(Arc::new(MemoryWal::new()))
//!     .lock_manager(locks.clone())
//!     .build()?;
//! manager.startup_recovery(None)?;
//!
//! let session = Session::new(BackendId(1), 10, 5);
//! let lock = LockDescriptor::relation(5, 42, LockMode::RowExclusive);
//! locks.acquire(session.lock_owner(), &lock)?;
//!
//! let request = PrepareRequest::new(TransactionId(100), "quick-start").with_locks(vec![lock]);
//! manager.prepare(&session, request)?;
//! assert!(manager.is_prepared(TransactionId(100)));
//!
//! manager.finish_prepared(&session, "quick-start", true, true)?;
//! assert!(manager.is_empty());
//! # Ok(())
//! # }
//! ```
//!
//! ## Module Organization
//!
//! - [`builder`] - Manager builder
//! - [`common`] - Identifiers, lock, commit-log and resource-manager contracts
//! - [`config`] - Manager configuration
//! - [`errors`] - Error types and result definitions
//! - [`transaction`] - Global transaction table, manager, recovery and checkpoints
//! - [`wal`] - Write-ahead log contract and record codec

pub mod builder;
pub mod common;
pub mod config;
pub mod errors;
pub mod transaction;
pub mod wal;
