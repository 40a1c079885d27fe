//! Common types, constants and collaborator contracts.

mod commit_log;
pub mod constants;
mod lock;
mod resource;
mod types;

pub use commit_log::*;
pub use constants::*;
pub use lock::*;
pub use resource::*;
pub use types::*;
