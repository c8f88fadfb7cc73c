//! Error types for partition lock tables
//!
//! Every error here is a refused request: the table is left untouched and
//! the engine reports the refusal back to the requester.

use infini_common::{LockType, RowId, SubtransactionId};
use infini_protocol::EngineCmd;
use infini_value::{Value, ValueType};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum RowLockError {
    #[error("Row not found: {0}")]
    RowNotFound(RowId),

    #[error("Subtransaction {subtransaction} does not hold a lock on row {rowid}")]
    NotHolder {
        rowid: RowId,
        subtransaction: SubtransactionId,
    },

    #[error("Row {rowid} is {actual:?}, expected {expected:?}")]
    LockMismatch {
        rowid: RowId,
        expected: LockType,
        actual: LockType,
    },

    #[error("Row {0} is already deleted")]
    RowDeleted(RowId),
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum IndexError {
    #[error("Operation requires a {expected} index")]
    WrongShape { expected: &'static str },

    #[error("Index over {expected} cannot take key {actual}")]
    TypeMismatch { expected: ValueType, actual: Value },

    #[error("Index does not allow null entries")]
    NullNotAllowed,

    #[error("Subtransaction {subtransaction} does not hold key {key}")]
    NotHolder {
        key: Value,
        subtransaction: SubtransactionId,
    },

    #[error("{0} is not supported on index keys")]
    UnsupportedCommand(EngineCmd),

    #[error("Invalid pattern: {0}")]
    InvalidPattern(String),
}
