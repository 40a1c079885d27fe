//! The global transaction table and everything that reads or writes it.

mod checkpoint;
mod global_transaction;
mod manager;
mod recovery;
mod session;
mod state_file;
mod table;
#[cfg(test)]
mod test_support;

pub use checkpoint::*;
pub use global_transaction::*;
pub use manager::*;
pub use recovery::*;
pub use session::*;
pub use state_file::*;
pub use table::*;
