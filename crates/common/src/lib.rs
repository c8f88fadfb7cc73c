//! Common types for InfiniSQL
//!
//! This crate defines:
//! - Transaction IDs (UUIDv7-based) and the partition-local identifiers
//! - Global row identity (`UuRecord`)
//! - Lock types requested by transactions and lock states replied by partitions
//! - The table catalog shared by partitions and coordinators

mod catalog;
mod ids;
mod lock;
mod record;
mod transaction_id;

pub use catalog::{Catalog, CatalogError, FieldSchema, IndexKind, IndexSpec, TableSchema};
pub use ids::{CommandId, FieldId, PartitionId, RowId, SubtransactionId, TableId};
pub use lock::{LockState, LockType};
pub use record::UuRecord;
pub use transaction_id::TransactionId;
