//! Coordinator-to-partition commands

use infini_common::{CommandId, FieldId, LockType, PartitionId, RowId, TableId, TransactionId};
use infini_value::Value;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Where the coordinator resumes when the reply to a command arrives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Continuation {
    InsertRow,
    InsertUniqueIndex,
    UpdateUniqueIndex,
    UpdateRow,
    ReplaceNewRow,
    ReplaceUniqueIndex,
    ReplaceDeleteRow,
    DeleteRow,
    SelectRows,
    FetchRows,
    IndexSearch,
    IndexSelectRows,
    Unlock,
    Revert,
    Commit,
    CommitReplaced,
    Rollback,
    /// Cleanup whose replies nobody waits for
    Discard,
}

/// Correlates a reply with the primitive and step that caused it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReplyTag {
    pub pending_cmd_id: CommandId,
    pub continuation: Continuation,
}

impl ReplyTag {
    pub fn new(pending_cmd_id: CommandId, continuation: Continuation) -> Self {
        Self {
            pending_cmd_id,
            continuation,
        }
    }
}

/// Location of a row as recorded in an index entry or a forwarder
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RowPointer {
    pub rowid: RowId,
    pub engineid: PartitionId,
}

impl RowPointer {
    pub fn new(rowid: RowId, engineid: PartitionId) -> Self {
        Self { rowid, engineid }
    }
}

/// Terminating commands applied to held or queued locks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EngineCmd {
    Commit,
    Rollback,
    Revert,
    Unlock,
}

impl fmt::Display for EngineCmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EngineCmd::Commit => "COMMITCMD",
            EngineCmd::Rollback => "ROLLBACKCMD",
            EngineCmd::Revert => "REVERTCMD",
            EngineCmd::Unlock => "UNLOCKCMD",
        };
        f.write_str(name)
    }
}

/// Unconditional change to a non-locking index entry, applied at commit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum IndexChange {
    InsertNonunique { key: Value, entry: RowPointer },
    DeleteNonunique { key: Value, entry: RowPointer },
    InsertNull { entry: RowPointer },
    DeleteNull { entry: RowPointer },
    DeleteUnique { key: Value },
    /// Point a committed unique key at a row that moved
    ReplaceUnique { key: Value, entry: RowPointer },
    ReplaceNonunique {
        key: Value,
        old: RowPointer,
        new: RowPointer,
    },
    ReplaceNull { old: RowPointer, new: RowPointer },
}

/// One thing a terminating command acts on
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TerminateItem {
    Row {
        table: TableId,
        rowid: RowId,
    },
    UniqueKey {
        table: TableId,
        field: FieldId,
        key: Value,
    },
    /// Only valid under `EngineCmd::Commit`
    Maintain {
        table: TableId,
        field: FieldId,
        change: IndexChange,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOp {
    Lt,
    Gt,
    Lte,
    Gte,
}

impl CompareOp {
    pub fn matches(self, ordering: std::cmp::Ordering) -> bool {
        use std::cmp::Ordering::*;
        match self {
            CompareOp::Lt => ordering == Less,
            CompareOp::Gt => ordering == Greater,
            CompareOp::Lte => ordering != Greater,
            CompareOp::Gte => ordering != Less,
        }
    }
}

/// Read-only index scan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum IndexSearch {
    All,
    Equal(Value),
    NotEqual(Value),
    In(Vec<Value>),
    NotIn(Vec<Value>),
    Compare(CompareOp, Value),
    Between(Value, Value),
    NotBetween(Value, Value),
    Regex(String),
    Like(String),
    NotLike(String),
    Nulls,
    NotNulls,
}

/// Payload of a coordinator-to-partition request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PartitionCommand {
    /// Insert a row pre-locked for writing; the partition assigns the rowid
    NewRow { table: TableId, payload: Vec<u8> },
    /// Stage and lock a unique-index key for a row
    UniqueIndex {
        table: TableId,
        field: FieldId,
        key: Value,
        entry: RowPointer,
    },
    UpdateRow {
        table: TableId,
        rowid: RowId,
        payload: Vec<u8>,
    },
    DeleteRow { table: TableId, rowid: RowId },
    /// Delete a row that is moving to `forward`
    ReplaceDeleteRow {
        table: TableId,
        rowid: RowId,
        forward: RowPointer,
    },
    SelectRows {
        table: TableId,
        rowids: Vec<RowId>,
        lock: LockType,
    },
    FetchRows {
        table: TableId,
        rowids: Vec<RowId>,
        lock: LockType,
    },
    IndexSearch {
        table: TableId,
        field: FieldId,
        search: IndexSearch,
    },
    Terminate {
        cmd: EngineCmd,
        items: Vec<TerminateItem>,
    },
    /// Forget this transaction's subtransaction; no reply
    EndSubtransaction,
}

impl PartitionCommand {
    pub fn name(&self) -> &'static str {
        match self {
            PartitionCommand::NewRow { .. } => "NEWROW",
            PartitionCommand::UniqueIndex { .. } => "UNIQUEINDEX",
            PartitionCommand::UpdateRow { .. } => "UPDATEROW",
            PartitionCommand::DeleteRow { .. } => "DELETEROW",
            PartitionCommand::ReplaceDeleteRow { .. } => "REPLACEDELETEROW",
            PartitionCommand::SelectRows { .. } => "SELECTROWS",
            PartitionCommand::FetchRows { .. } => "FETCHROWS",
            PartitionCommand::IndexSearch { .. } => "INDEXSEARCH",
            PartitionCommand::Terminate { cmd, .. } => match cmd {
                EngineCmd::Commit => "COMMITCMD",
                EngineCmd::Rollback => "ROLLBACKCMD",
                EngineCmd::Revert => "REVERTCMD",
                EngineCmd::Unlock => "UNLOCKCMD",
            },
            PartitionCommand::EndSubtransaction => "ENDSUBTRANSACTION",
        }
    }
}

/// Envelope for everything a coordinator sends to a partition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionRequest {
    pub transaction: TransactionId,
    pub tag: ReplyTag,
    pub command: PartitionCommand,
}
