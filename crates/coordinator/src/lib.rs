//! Transaction coordinator for InfiniSQL
//!
//! Each transaction gets its own coordinator task that drives partitions
//! through the locking protocol:
//! - primitives lock rows and unique keys, waiting behind other holders
//! - changes are staged on the partitions and kept locally for reads
//! - commit makes them permanent and applies derived index maintenance
//! - the deadlock manager learns about every transaction that both holds
//!   and waits, and may pick it as a victim

mod config;
mod coordinator;
mod error;
mod locks;
mod maintenance;
mod staged;
mod transaction;

pub use config::CoordinatorConfig;
pub use coordinator::Coordinator;
pub use error::{CoordinatorError, Result};
pub use transaction::{Fetched, SelectedRow, TransactionHandle, TransactionState};
