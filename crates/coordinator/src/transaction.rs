//! Client side of a transaction
//!
//! A `TransactionHandle` turns each primitive into a request to the
//! transaction's coordinator task and waits for its outcome. Handles can be
//! cloned; the coordinator still serves one primitive at a time and answers
//! `Pending` to anything that arrives while one is outstanding.

use crate::error::{CoordinatorError, Result};
use infini_common::{FieldId, LockType, PartitionId, RowId, TableId, TransactionId, UuRecord};
use infini_protocol::IndexSearch;
use infini_transport::TransportError;
use infini_value::Value;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Transaction state in the coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Accepting primitives
    Expanding,
    /// A primitive is outstanding
    Dispatching,
    /// Commit phase has started
    Committing,
    /// Transaction has been committed
    Committed,
    /// Rollback has started
    Aborting,
    /// Transaction has been rolled back
    Aborted,
}

impl TransactionState {
    pub fn is_finished(self) -> bool {
        matches!(self, TransactionState::Committed | TransactionState::Aborted)
    }
}

/// A row returned to the client
#[derive(Debug, Clone, PartialEq)]
pub struct SelectedRow {
    pub uur: UuRecord,
    pub lock: LockType,
    pub values: Vec<Value>,
}

/// Rows handed out by `fetch`, plus the rows still queued
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Fetched {
    pub rows: Vec<SelectedRow>,
    pub pending: Vec<RowId>,
}

#[derive(Debug)]
pub(crate) enum Primitive {
    Insert {
        table: TableId,
        partition: PartitionId,
        values: Vec<Value>,
    },
    Select {
        table: TableId,
        partition: PartitionId,
        rowids: Vec<RowId>,
        lock: LockType,
    },
    Fetch {
        table: TableId,
        partition: PartitionId,
        rowids: Vec<RowId>,
        lock: LockType,
    },
    SelectByIndex {
        table: TableId,
        field: FieldId,
        search: IndexSearch,
        lock: LockType,
    },
    Update {
        uur: UuRecord,
        values: Vec<Value>,
    },
    Replace {
        uur: UuRecord,
        partition: PartitionId,
        values: Vec<Value>,
    },
    Delete {
        uur: UuRecord,
    },
    Unlock {
        uur: UuRecord,
    },
    Revert {
        uur: UuRecord,
    },
    Commit,
    Rollback,
}

impl Primitive {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Primitive::Insert { .. } => "insert",
            Primitive::Select { .. } => "select",
            Primitive::Fetch { .. } => "fetch",
            Primitive::SelectByIndex { .. } => "select by index",
            Primitive::Update { .. } => "update",
            Primitive::Replace { .. } => "replace",
            Primitive::Delete { .. } => "delete",
            Primitive::Unlock { .. } => "unlock",
            Primitive::Revert { .. } => "revert",
            Primitive::Commit => "commit",
            Primitive::Rollback => "rollback",
        }
    }
}

#[derive(Debug)]
pub(crate) enum Outcome {
    Row(UuRecord),
    Rows(Vec<SelectedRow>),
    Fetched(Fetched),
    Done,
}

#[derive(Debug)]
pub(crate) struct Request {
    pub primitive: Primitive,
    pub reply: oneshot::Sender<Result<Outcome>>,
}

/// Client handle for one transaction
#[derive(Clone)]
pub struct TransactionHandle {
    id: TransactionId,
    requests: mpsc::UnboundedSender<Request>,
    state: Arc<Mutex<TransactionState>>,
    timeout: Option<Duration>,
}

impl TransactionHandle {
    pub(crate) fn new(
        id: TransactionId,
        requests: mpsc::UnboundedSender<Request>,
        state: Arc<Mutex<TransactionState>>,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            id,
            requests,
            state,
            timeout,
        }
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    /// Get the current transaction state
    pub fn state(&self) -> TransactionState {
        *self.state.lock()
    }

    /// Insert a row on `partition`; it stays write-locked until the
    /// transaction ends
    pub async fn insert(&self, table: TableId, partition: PartitionId, values: Vec<Value>) -> Result<UuRecord> {
        match self
            .call(Primitive::Insert {
                table,
                partition,
                values,
            })
            .await?
        {
            Outcome::Row(uur) => Ok(uur),
            other => Err(unexpected(other)),
        }
    }

    /// Lock and read rows, waiting for queued locks; rows that do not exist
    /// (or vanish while queued) are left out
    pub async fn select(
        &self,
        table: TableId,
        partition: PartitionId,
        rowids: Vec<RowId>,
        lock: LockType,
    ) -> Result<Vec<SelectedRow>> {
        self.rows(Primitive::Select {
            table,
            partition,
            rowids,
            lock,
        })
        .await
    }

    /// Lock and read rows without waiting; queued rows are listed in
    /// `pending` and are granted to this transaction later
    pub async fn fetch(
        &self,
        table: TableId,
        partition: PartitionId,
        rowids: Vec<RowId>,
        lock: LockType,
    ) -> Result<Fetched> {
        match self
            .call(Primitive::Fetch {
                table,
                partition,
                rowids,
                lock,
            })
            .await?
        {
            Outcome::Fetched(fetched) => Ok(fetched),
            other => Err(unexpected(other)),
        }
    }

    /// Scan an index, then lock and read every row it points at
    pub async fn select_by_index(
        &self,
        table: TableId,
        field: FieldId,
        search: IndexSearch,
        lock: LockType,
    ) -> Result<Vec<SelectedRow>> {
        self.rows(Primitive::SelectByIndex {
            table,
            field,
            search,
            lock,
        })
        .await
    }

    /// Stage new values for a row this transaction holds a write lock on
    pub async fn update(&self, uur: UuRecord, values: Vec<Value>) -> Result<()> {
        self.done(Primitive::Update { uur, values }).await
    }

    /// Move a write-locked row to `partition` with new values
    pub async fn replace(&self, uur: UuRecord, partition: PartitionId, values: Vec<Value>) -> Result<UuRecord> {
        match self
            .call(Primitive::Replace {
                uur,
                partition,
                values,
            })
            .await?
        {
            Outcome::Row(uur) => Ok(uur),
            other => Err(unexpected(other)),
        }
    }

    pub async fn delete(&self, uur: UuRecord) -> Result<()> {
        self.done(Primitive::Delete { uur }).await
    }

    /// Give up a read lock before the transaction ends
    pub async fn unlock(&self, uur: UuRecord) -> Result<()> {
        self.done(Primitive::Unlock { uur }).await
    }

    /// Undo the staged change to a row but keep its write lock
    pub async fn revert(&self, uur: UuRecord) -> Result<()> {
        self.done(Primitive::Revert { uur }).await
    }

    pub async fn commit(&self) -> Result<()> {
        self.done(Primitive::Commit).await
    }

    pub async fn rollback(&self) -> Result<()> {
        self.done(Primitive::Rollback).await
    }

    async fn rows(&self, primitive: Primitive) -> Result<Vec<SelectedRow>> {
        match self.call(primitive).await? {
            Outcome::Rows(rows) => Ok(rows),
            other => Err(unexpected(other)),
        }
    }

    async fn done(&self, primitive: Primitive) -> Result<()> {
        match self.call(primitive).await? {
            Outcome::Done => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn call(&self, primitive: Primitive) -> Result<Outcome> {
        infini_transport::request(&self.requests, |reply| Request { primitive, reply }, self.timeout)
            .await
            .map_err(|e| match e {
                TransportError::Timeout => CoordinatorError::ResponseTimeout,
                _ => CoordinatorError::ResponseChannelClosed,
            })?
    }
}

fn unexpected(outcome: Outcome) -> CoordinatorError {
    CoordinatorError::InvalidState(format!("Unexpected outcome {:?}", outcome))
}
