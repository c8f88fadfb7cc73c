//! Wait-for graph maintenance messages

use infini_common::{CommandId, FieldId, PartitionId, RowId, TableId, TransactionId};
use infini_value::Value;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Node of the wait-for graph that transactions hold or wait for
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockItem {
    Row {
        table: TableId,
        rowid: RowId,
        engineid: PartitionId,
    },
    Index {
        table: TableId,
        field: FieldId,
        key: Value,
    },
}

impl fmt::Display for LockItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockItem::Row {
                table,
                rowid,
                engineid,
            } => write!(f, "row {}/{}@{}", table, rowid, engineid),
            LockItem::Index { table, field, key } => {
                write!(f, "index {}.{}={}", table, field, key)
            }
        }
    }
}

/// Incremental edge change for a transaction already in the graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeadlockChange {
    AddLocked,
    AddPending,
    RemoveLocked,
    RemovePending,
    PendingToLocked,
}

/// Coordinator-to-deadlock-manager events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DeadlockEvent {
    /// Transaction now both holds and waits; full edge lists
    New {
        transaction: TransactionId,
        pending_cmd_id: CommandId,
        locked: Vec<LockItem>,
        waiting: Vec<LockItem>,
    },
    Change {
        transaction: TransactionId,
        pending_cmd_id: CommandId,
        change: DeadlockChange,
        item: LockItem,
    },
    /// Transaction no longer both holds and waits
    Remove { transaction: TransactionId },
    /// Walk every waiting transaction now
    Sweep,
}

/// Deadlock-manager-to-coordinator abort instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadlockAbort {
    pub transaction: TransactionId,
    pub pending_cmd_id: CommandId,
}
