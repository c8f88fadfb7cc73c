//! Partition actor
//!
//! Owns the row tables and index tables for its share of the data and
//! serves requests one at a time from its mailbox, so none of its state
//! needs a lock. Every request yields a reply to its sender, except
//! ENDSUBTRANSACTION. Releasing a lock may also resolve requests queued by
//! other transactions; those get their own replies carrying the tag they
//! were queued with.

use crate::index::{Index, IndexGrant};
use crate::lock_queue::Requester;
use crate::row_table::{Grant, RowTable};
use infini_common::{Catalog, FieldId, PartitionId, SubtransactionId, TableId, TransactionId};
use infini_protocol::{
    CoordinatorEvent, EngineCmd, Network, PartitionCommand, PartitionReply, PartitionRequest,
    ReplyBody, TerminateItem,
};
use infini_transport::Mailbox;
use infini_value::Value;
use std::collections::HashMap;
use tokio::sync::oneshot;
use tracing::{debug, info, trace, warn};

pub struct PartitionEngine {
    id: PartitionId,
    network: Network,
    tables: HashMap<TableId, RowTable>,
    indices: HashMap<(TableId, FieldId), Index>,
    subtransactions: HashMap<TransactionId, SubtransactionId>,
    next_subtransaction: u64,
}

impl PartitionEngine {
    /// Create a partition with an empty table and index for everything in
    /// the catalog
    pub fn new(id: PartitionId, catalog: &Catalog, network: Network) -> Self {
        let mut tables = HashMap::new();
        let mut indices = HashMap::new();
        for table in catalog.tables() {
            tables.insert(table.id, RowTable::new(table.id));
            for (field, spec) in table.indexed_fields() {
                indices.insert((table.id, field.id), Index::new(field.value_type, spec));
            }
        }

        Self {
            id,
            network,
            tables,
            indices,
            subtransactions: HashMap::new(),
            next_subtransaction: 1,
        }
    }

    pub fn id(&self) -> PartitionId {
        self.id
    }

    pub fn table(&self, table: TableId) -> Option<&RowTable> {
        self.tables.get(&table)
    }

    pub fn index(&self, table: TableId, field: FieldId) -> Option<&Index> {
        self.indices.get(&(table, field))
    }

    /// Subtransaction currently assigned to a transaction, if any
    pub fn subtransaction(&self, transaction: &TransactionId) -> Option<SubtransactionId> {
        self.subtransactions.get(transaction).copied()
    }

    /// Serve requests until shutdown is signalled or every sender is gone
    pub async fn run(
        mut self,
        mut mailbox: Mailbox<PartitionRequest>,
        mut shutdown_rx: oneshot::Receiver<()>,
    ) {
        info!("[partition {}] Started", self.id);

        loop {
            tokio::select! {
                biased;

                _ = &mut shutdown_rx => {
                    info!("[partition {}] Shutdown signal received", self.id);
                    break;
                }

                request = mailbox.recv() => {
                    let Some(request) = request else {
                        debug!("[partition {}] Mailbox closed", self.id);
                        break;
                    };
                    for reply in self.process(request) {
                        self.deliver(reply);
                    }
                }
            }
        }

        info!(
            "[partition {}] Stopped after {} requests",
            self.id,
            mailbox.received()
        );
    }

    fn deliver(&self, reply: PartitionReply) {
        let transaction = reply.transaction;
        if let Err(e) = self
            .network
            .send_to_coordinator(transaction, CoordinatorEvent::Reply(reply))
        {
            // the coordinator finished while this reply was in flight
            debug!(
                "[partition {}] Dropping reply for txn {}: {}",
                self.id,
                transaction.short(),
                e
            );
        }
    }

    fn subtransaction_for(&mut self, transaction: TransactionId) -> SubtransactionId {
        let next = &mut self.next_subtransaction;
        *self.subtransactions.entry(transaction).or_insert_with(|| {
            let id = SubtransactionId(*next);
            *next += 1;
            id
        })
    }

    /// Apply one request and return every reply it causes
    ///
    /// The first reply, when present, answers the request itself; the rest
    /// resolve requests that were queued behind released locks.
    pub fn process(&mut self, request: PartitionRequest) -> Vec<PartitionReply> {
        let PartitionRequest {
            transaction,
            tag,
            command,
        } = request;

        trace!(
            "[partition {}] {} from txn {}",
            self.id,
            command.name(),
            transaction.short()
        );

        if matches!(command, PartitionCommand::EndSubtransaction) {
            if let Some(sub) = self.subtransactions.remove(&transaction) {
                debug!(
                    "[partition {}] Txn {} ended subtransaction {}",
                    self.id,
                    transaction.short(),
                    sub
                );
            }
            return Vec::new();
        }

        let requester = Requester {
            subtransaction: self.subtransaction_for(transaction),
            transaction,
            tag,
        };
        let mut grants = Vec::new();
        let body = self.handle(command, requester, &mut grants);

        let mut replies = Vec::with_capacity(grants.len() + 1);
        replies.push(self.reply(requester, body));
        replies.extend(grants);
        replies
    }

    fn handle(
        &mut self,
        command: PartitionCommand,
        requester: Requester,
        grants: &mut Vec<PartitionReply>,
    ) -> ReplyBody {
        let me = requester.subtransaction;
        let name = command.name();

        let body = match command {
            PartitionCommand::NewRow { table, payload } => match self.tables.get_mut(&table) {
                Some(rows) => ReplyBody::NewRow {
                    rowid: rows.new_row(me, payload),
                },
                None => unknown_table(table),
            },

            PartitionCommand::UniqueIndex {
                table,
                field,
                key,
                entry,
            } => {
                match self.indices.get_mut(&(table, field)) {
                    _ if key.is_null() => rejected("null keys take no unique lock"),
                    Some(index) => match index.check_and_lock(&key, entry, requester) {
                        Ok(state) => ReplyBody::IndexLock {
                            table,
                            field,
                            key,
                            state,
                        },
                        Err(e) => rejected(e),
                    },
                    None => unknown_index(table, field),
                }
            }

            PartitionCommand::UpdateRow {
                table,
                rowid,
                payload,
            } => match self.tables.get_mut(&table) {
                Some(rows) => match rows.update_row(rowid, me, payload) {
                    Ok(row) => ReplyBody::Row { table, row },
                    Err(e) => rejected(e),
                },
                None => unknown_table(table),
            },

            PartitionCommand::DeleteRow { table, rowid } => match self.tables.get_mut(&table) {
                Some(rows) => match rows.delete_row(rowid, me) {
                    Ok(row) => ReplyBody::Row { table, row },
                    Err(e) => rejected(e),
                },
                None => unknown_table(table),
            },

            PartitionCommand::ReplaceDeleteRow {
                table,
                rowid,
                forward,
            } => match self.tables.get_mut(&table) {
                Some(rows) => match rows.replace_delete_row(rowid, me, forward) {
                    Ok(row) => ReplyBody::Row { table, row },
                    Err(e) => rejected(e),
                },
                None => unknown_table(table),
            },

            PartitionCommand::SelectRows {
                table,
                rowids,
                lock,
            } => match self.tables.get_mut(&table) {
                Some(rows) => ReplyBody::Rows(rows.select_rows(&rowids, lock, requester)),
                None => unknown_table(table),
            },

            PartitionCommand::FetchRows {
                table,
                rowids,
                lock,
            } => match self.tables.get_mut(&table) {
                Some(rows) => {
                    let fetched = rows.get_rows(&rowids, lock, requester);
                    ReplyBody::Fetched {
                        rows: fetched.rows,
                        pending: fetched.pending,
                    }
                }
                None => unknown_table(table),
            },

            PartitionCommand::IndexSearch {
                table,
                field,
                search,
            } => match self.indices.get(&(table, field)) {
                Some(index) => match index.search(&search) {
                    Ok(hits) => ReplyBody::IndexHits(hits),
                    Err(e) => rejected(e),
                },
                None => unknown_index(table, field),
            },

            PartitionCommand::Terminate { cmd, items } => {
                let rejected = items
                    .into_iter()
                    .filter_map(|item| self.terminate(cmd, me, item, grants).err())
                    .collect();
                ReplyBody::Terminated { rejected }
            }

            // answered in `process`
            PartitionCommand::EndSubtransaction => ReplyBody::Terminated {
                rejected: Vec::new(),
            },
        };

        if let ReplyBody::Rejected { reason } = &body {
            warn!(
                "[partition {}] Rejected {} from txn {}: {}",
                self.id,
                name,
                requester.transaction.short(),
                reason
            );
        }
        body
    }

    /// Apply a terminating command to one item, queueing replies for any
    /// waiters it resolves
    fn terminate(
        &mut self,
        cmd: EngineCmd,
        me: SubtransactionId,
        item: TerminateItem,
        grants: &mut Vec<PartitionReply>,
    ) -> Result<(), String> {
        match item {
            TerminateItem::Row { table, rowid } => {
                let rows = self
                    .tables
                    .get_mut(&table)
                    .ok_or_else(|| format!("unknown table {}", table))?;
                let resolved = rows
                    .commit_rollback_unlock(rowid, me, cmd)
                    .map_err(|e| format!("{} row {}/{}: {}", cmd, table, rowid, e))?;
                for grant in resolved {
                    grants.push(self.row_grant(table, grant));
                }
            }
            TerminateItem::UniqueKey { table, field, key } => {
                let index = self
                    .indices
                    .get_mut(&(table, field))
                    .ok_or_else(|| format!("no index on {}.{}", table, field))?;
                let resolved = index
                    .commit_rollback(&key, me, cmd)
                    .map_err(|e| format!("{} key {}.{}={}: {}", cmd, table, field, key, e))?;
                for grant in resolved {
                    grants.push(self.index_grant(table, field, &key, grant));
                }
            }
            TerminateItem::Maintain {
                table,
                field,
                change,
            } => {
                if cmd != EngineCmd::Commit {
                    return Err(format!("index maintenance under {}", cmd));
                }
                let index = self
                    .indices
                    .get_mut(&(table, field))
                    .ok_or_else(|| format!("no index on {}.{}", table, field))?;
                index
                    .apply(&change)
                    .map_err(|e| format!("maintain {}.{}: {}", table, field, e))?;
            }
        }
        Ok(())
    }

    fn reply(&self, requester: Requester, body: ReplyBody) -> PartitionReply {
        PartitionReply {
            partition: self.id,
            transaction: requester.transaction,
            subtransaction: requester.subtransaction,
            tag: requester.tag,
            body,
        }
    }

    fn row_grant(&self, table: TableId, grant: Grant) -> PartitionReply {
        debug!(
            "[partition {}] Row {}/{} resolved {} for txn {}",
            self.id,
            table,
            grant.row.rowid,
            grant.row.state,
            grant.requester.transaction.short()
        );
        self.reply(grant.requester, ReplyBody::Row {
            table,
            row: grant.row,
        })
    }

    fn index_grant(&self, table: TableId, field: FieldId, key: &Value, grant: IndexGrant) -> PartitionReply {
        debug!(
            "[partition {}] Key {}.{}={} resolved {} for txn {}",
            self.id,
            table,
            field,
            key,
            grant.state,
            grant.requester.transaction.short()
        );
        self.reply(grant.requester, ReplyBody::IndexLock {
            table,
            field,
            key: key.clone(),
            state: grant.state,
        })
    }
}

fn rejected(e: impl std::fmt::Display) -> ReplyBody {
    ReplyBody::Rejected {
        reason: e.to_string(),
    }
}

fn unknown_table(table: TableId) -> ReplyBody {
    rejected(format!("unknown table {}", table))
}

fn unknown_index(table: TableId, field: FieldId) -> ReplyBody {
    rejected(format!("no index on {}.{}", table, field))
}
