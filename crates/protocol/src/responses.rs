//! Partition-to-coordinator replies

use crate::messages::{ReplyTag, RowPointer};
use infini_common::{FieldId, LockState, PartitionId, RowId, SubtransactionId, TableId, TransactionId};
use infini_value::Value;
use serde::{Deserialize, Serialize};

/// A row as returned to a coordinator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReturnRow {
    pub rowid: RowId,
    pub state: LockState,
    /// Committed payload; empty when the row was not returned
    pub payload: Vec<u8>,
    pub previous_subtransaction: Option<SubtransactionId>,
    /// Set when the row is being moved to another partition
    pub forward: Option<RowPointer>,
}

impl ReturnRow {
    /// A row that is not handed out (missing or queued)
    pub fn without_payload(rowid: RowId, state: LockState) -> Self {
        Self {
            rowid,
            state,
            payload: Vec::new(),
            previous_subtransaction: None,
            forward: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ReplyBody {
    /// New row inserted and write-locked
    NewRow { rowid: RowId },
    /// Outcome of a unique-index lock request, or its later resolution
    IndexLock {
        table: TableId,
        field: FieldId,
        key: Value,
        state: LockState,
    },
    /// Single-row acknowledgement or the resolution of a queued row request
    Row { table: TableId, row: ReturnRow },
    /// SELECTROWS result, one entry per requested row
    Rows(Vec<ReturnRow>),
    /// FETCHROWS result: rows handed out now and rows queued
    Fetched {
        rows: Vec<ReturnRow>,
        pending: Vec<RowId>,
    },
    IndexHits(Vec<RowPointer>),
    /// Terminating command applied; `rejected` lists items that were refused
    Terminated { rejected: Vec<String> },
    /// Request refused without touching any state
    Rejected { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionReply {
    pub partition: PartitionId,
    pub transaction: TransactionId,
    pub subtransaction: SubtransactionId,
    pub tag: ReplyTag,
    pub body: ReplyBody,
}
