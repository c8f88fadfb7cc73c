//! Cluster runtime for InfiniSQL
//!
//! Starts partitions and the deadlock manager for one in-process cluster
//! and begins transactions against it.

mod cluster;
mod config;
mod error;

pub use cluster::Cluster;
pub use config::ClusterConfig;
pub use error::{Result, RunnerError};

// Re-exported so callers only need this crate
pub use infini_common::{Catalog, FieldId, IndexSpec, LockType, PartitionId, TableId, TableSchema, UuRecord};
pub use infini_coordinator::{CoordinatorConfig, CoordinatorError, SelectedRow, TransactionHandle, TransactionState};
pub use infini_deadlock::DeadlockConfig;
pub use infini_protocol::IndexSearch;
pub use infini_value::{Value, ValueType};
