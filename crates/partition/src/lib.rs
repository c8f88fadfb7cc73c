//! Partition-side lock management for InfiniSQL
//!
//! A partition ("engine") owns a disjoint share of every table's rows and of
//! every index's keys. This crate provides:
//! - `LockQueue`, the FIFO of blocked lock requests shared by rows and index keys
//! - `RowTable`, committed rows plus their staged shadow versions and row locks
//! - `Index`, the unique/non-unique/unordered index over any scalar key type
//! - `PartitionEngine`, the single-threaded actor serving coordinator requests

pub mod engine;
pub mod error;
pub mod index;
pub mod lock_queue;
pub mod row_table;

pub use engine::PartitionEngine;
pub use error::{IndexError, RowLockError};
pub use index::{Index, IndexEntry, IndexGrant, IndexKey, IndexLockTable};
pub use lock_queue::{LockQueue, Requester};
pub use row_table::{FetchedRows, Grant, RowFlags, RowRecord, RowTable};
