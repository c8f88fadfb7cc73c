//! Error types for the coordinator

use infini_common::{CatalogError, FieldId, TableId, UuRecord};
use infini_transport::TransportError;
use infini_value::CodecError;
use thiserror::Error;

/// Coordinator error types
#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("Another primitive is still pending")]
    Pending,

    #[error("Duplicate key in unique index on table {table} field {field}")]
    UniqueConstraint { table: TableId, field: FieldId },

    #[error("Transaction aborted to break a deadlock")]
    Deadlock,

    #[error("Invalid transaction state: {0}")]
    InvalidState(String),

    #[error("Row {0} is not locked for this operation")]
    NotLocked(UuRecord),

    #[error("Row not found: {0}")]
    NotFound(UuRecord),

    #[error("Partition refused request: {0}")]
    Rejected(String),

    #[error("Committed, but partitions refused: {}", .0.join("; "))]
    CommitRefused(Vec<String>),

    #[error("Response timeout")]
    ResponseTimeout,

    #[error("Response channel closed")]
    ResponseChannelClosed,

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),
}

/// Result type for coordinator operations
pub type Result<T> = std::result::Result<T, CoordinatorError>;
