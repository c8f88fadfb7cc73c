//! Transaction coordinator actor
//!
//! One task per transaction, addressed by its transaction id. It serves one
//! primitive at a time: each primitive fans requests out to partitions and
//! waits until every reply, including later grants of queued locks, has
//! come back. Replies carry the id of the primitive that caused them, so
//! anything left over from an earlier primitive is recognised as stale.

use crate::config::CoordinatorConfig;
use crate::error::{CoordinatorError, Result};
use crate::locks::LockTracker;
use crate::maintenance::{index_changes, placement};
use crate::staged::{StagedCommand, StagedRow, StagedRows};
use crate::transaction::{
    Fetched, Outcome, Primitive, Request, SelectedRow, TransactionHandle, TransactionState,
};
use infini_common::{
    Catalog, CommandId, FieldId, LockState, LockType, PartitionId, RowId, TableId, TableSchema,
    TransactionId, UuRecord,
};
use infini_protocol::{
    Continuation, CoordinatorEvent, DeadlockAbort, DeadlockChange, DeadlockEvent, EngineCmd,
    IndexSearch, LockItem, Network, PartitionCommand, PartitionReply, PartitionRequest, ReplyBody,
    ReplyTag, ReturnRow, RowPointer, TerminateItem,
};
use infini_transport::Mailbox;
use infini_value::{RowCodec, Value};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

pub struct Coordinator {
    id: TransactionId,
    network: Network,
    catalog: Arc<Catalog>,
    codec: Arc<dyn RowCodec>,
    state: Arc<Mutex<TransactionState>>,
    requests: mpsc::UnboundedReceiver<Request>,
    events: Mailbox<CoordinatorEvent>,
    client_gone: bool,
    /// Id of the latest primitive
    cmd_id: CommandId,
    /// Set while that primitive is outstanding
    pending: Option<CommandId>,
    staged: StagedRows,
    locks: LockTracker,
    touched: BTreeSet<PartitionId>,
    deadlocked: bool,
}

impl Coordinator {
    /// Start the coordinator task for a new transaction
    pub fn spawn(
        network: Network,
        catalog: Arc<Catalog>,
        codec: Arc<dyn RowCodec>,
        config: &CoordinatorConfig,
    ) -> TransactionHandle {
        let id = TransactionId::new();
        let events = network.coordinators().register(id);
        let (requests_tx, requests) = mpsc::unbounded_channel();
        let state = Arc::new(Mutex::new(TransactionState::Expanding));

        let coordinator = Self {
            id,
            network,
            catalog,
            codec,
            state: state.clone(),
            requests,
            events,
            client_gone: false,
            cmd_id: CommandId(0),
            pending: None,
            staged: StagedRows::default(),
            locks: LockTracker::default(),
            touched: BTreeSet::new(),
            deadlocked: false,
        };
        tokio::spawn(coordinator.run());

        TransactionHandle::new(id, requests_tx, state, config.request_timeout())
    }

    async fn run(mut self) {
        debug!("[txn {}] Started", self.id.short());

        loop {
            tokio::select! {
                request = self.requests.recv() => {
                    let Some(request) = request else {
                        self.client_gone = true;
                        break;
                    };
                    self.serve(request).await;
                }

                event = self.events.recv() => match event {
                    Some(event) => self.on_idle_event(event).await,
                    None => break,
                },
            }
        }

        if !self.state().is_finished() {
            debug!("[txn {}] Handle dropped, rolling back", self.id.short());
            self.begin(TransactionState::Aborting);
            if let Err(e) = self.rollback_all().await {
                warn!("[txn {}] Rollback failed: {}", self.id.short(), e);
            }
        }

        self.network.coordinators().deregister(&self.id);
        debug!(
            "[txn {}] Stopped after {} events",
            self.id.short(),
            self.events.received()
        );
    }

    fn state(&self) -> TransactionState {
        *self.state.lock()
    }

    fn set_state(&self, state: TransactionState) {
        *self.state.lock() = state;
    }

    fn begin(&mut self, state: TransactionState) {
        self.cmd_id = self.cmd_id.next();
        self.pending = Some(self.cmd_id);
        self.set_state(state);
    }

    async fn serve(&mut self, request: Request) {
        let Request { primitive, reply } = request;
        let name = primitive.name();
        let outcome = self.execute(primitive).await;
        if let Err(e) = &outcome {
            debug!("[txn {}] {} failed: {}", self.id.short(), name, e);
        }
        if reply.send(outcome).is_err() {
            debug!("[txn {}] Client stopped waiting for {}", self.id.short(), name);
        }
    }

    async fn execute(&mut self, primitive: Primitive) -> Result<Outcome> {
        let state = self.state();
        match (&primitive, state) {
            (Primitive::Rollback, TransactionState::Aborted) => return Ok(Outcome::Done),
            _ if self.deadlocked => return Err(CoordinatorError::Deadlock),
            (_, TransactionState::Expanding) => {}
            (primitive, state) => {
                return Err(CoordinatorError::InvalidState(format!(
                    "Cannot {} transaction in state {:?}",
                    primitive.name(),
                    state
                )));
            }
        }

        match primitive {
            Primitive::Commit => {
                self.begin(TransactionState::Committing);
                let result = self.commit().await;
                self.pending = None;
                result.map(|_| Outcome::Done)
            }
            Primitive::Rollback => {
                self.begin(TransactionState::Aborting);
                let result = self.rollback_all().await;
                self.pending = None;
                result.map(|_| Outcome::Done)
            }
            primitive => {
                self.begin(TransactionState::Dispatching);
                let result = self.dispatch(primitive).await;
                self.pending = None;
                match result {
                    Err(CoordinatorError::Deadlock) => {
                        self.abort_for_deadlock().await;
                        Err(CoordinatorError::Deadlock)
                    }
                    result => {
                        self.set_state(TransactionState::Expanding);
                        result
                    }
                }
            }
        }
    }

    async fn dispatch(&mut self, primitive: Primitive) -> Result<Outcome> {
        match primitive {
            Primitive::Insert {
                table,
                partition,
                values,
            } => self.insert(table, partition, values).await.map(Outcome::Row),
            Primitive::Select {
                table,
                partition,
                rowids,
                lock,
            } => {
                self.catalog.table(table)?;
                self.lock_rows(table, vec![(partition, rowids)], lock, Continuation::SelectRows)
                    .await
                    .map(Outcome::Rows)
            }
            Primitive::Fetch {
                table,
                partition,
                rowids,
                lock,
            } => self
                .fetch(table, partition, rowids, lock)
                .await
                .map(Outcome::Fetched),
            Primitive::SelectByIndex {
                table,
                field,
                search,
                lock,
            } => self
                .select_by_index(table, field, search, lock)
                .await
                .map(Outcome::Rows),
            Primitive::Update { uur, values } => self.update(uur, values).await.map(|_| Outcome::Done),
            Primitive::Replace {
                uur,
                partition,
                values,
            } => self.replace(uur, partition, values).await.map(Outcome::Row),
            Primitive::Delete { uur } => self.delete(uur).await.map(|_| Outcome::Done),
            Primitive::Unlock { uur } => self.unlock(uur).await.map(|_| Outcome::Done),
            Primitive::Revert { uur } => self.revert(uur).await.map(|_| Outcome::Done),
            Primitive::Commit | Primitive::Rollback => Err(CoordinatorError::InvalidState(
                "Commit and rollback are not dispatched".into(),
            )),
        }
    }

    async fn insert(&mut self, table: TableId, partition: PartitionId, values: Vec<Value>) -> Result<UuRecord> {
        let catalog = self.catalog.clone();
        let schema = catalog.table(table)?;
        schema.validate_row(&values)?;
        let keys = unique_keys(schema, &values);
        let payload = self.codec.encode(&values)?;

        self.send(partition, Continuation::InsertRow, PartitionCommand::NewRow { table, payload })?;
        let rowid = match self.next_reply(Continuation::InsertRow).await?.body {
            ReplyBody::NewRow { rowid } => rowid,
            other => return Err(refused(other)),
        };

        let uur = UuRecord::new(rowid, table, partition);
        self.track(DeadlockChange::AddLocked, row_item(uur));
        self.staged.insert(uur, StagedRow::inserted(values));

        if let Err(e) = self.lock_keys(uur, keys, Continuation::InsertUniqueIndex).await {
            if !matches!(e, CoordinatorError::Deadlock) {
                self.discard_row(uur).await?;
            }
            return Err(e);
        }

        trace!("[txn {}] Inserted {}", self.id.short(), uur);
        Ok(uur)
    }

    async fn fetch(
        &mut self,
        table: TableId,
        partition: PartitionId,
        rowids: Vec<RowId>,
        lock: LockType,
    ) -> Result<Fetched> {
        self.catalog.table(table)?;
        let (mut found, remote) = self.local_rows(table, partition, &rowids, lock);

        let mut pending = Vec::new();
        if !remote.is_empty() {
            self.send(partition, Continuation::FetchRows, PartitionCommand::FetchRows {
                table,
                rowids: remote,
                lock,
            })?;
            let (rows, queued) = match self.next_reply(Continuation::FetchRows).await?.body {
                ReplyBody::Fetched { rows, pending } => (rows, pending),
                other => return Err(refused(other)),
            };

            for rowid in &queued {
                let uur = UuRecord::new(*rowid, table, partition);
                self.track(DeadlockChange::AddPending, row_item(uur));
            }
            pending = queued;

            let mut failure = None;
            for row in rows {
                let uur = UuRecord::new(row.rowid, table, partition);
                match self.settle_row(uur, &row) {
                    Ok(Some(selected)) => {
                        found.insert(uur, selected);
                    }
                    Ok(None) => {}
                    Err(e) => failure = Some(e),
                }
            }
            if let Some(e) = failure {
                return Err(e);
            }
        }

        let rows = rowids
            .iter()
            .filter_map(|rowid| found.remove(&UuRecord::new(*rowid, table, partition)))
            .collect();
        Ok(Fetched { rows, pending })
    }

    async fn select_by_index(
        &mut self,
        table: TableId,
        field: FieldId,
        search: IndexSearch,
        lock: LockType,
    ) -> Result<Vec<SelectedRow>> {
        let catalog = self.catalog.clone();
        let schema = catalog.table(table)?;
        if schema.field(field)?.index.is_none() {
            return Err(CoordinatorError::Rejected(format!(
                "no index on {}.{}",
                table, field
            )));
        }

        let partitions: Vec<PartitionId> = match &search {
            IndexSearch::Equal(key) if !key.is_null() => vec![self.network.partition_for_key(key)],
            IndexSearch::Nulls => vec![self.network.partition_for_null(field)],
            _ => self.network.partition_ids().collect(),
        };
        for partition in &partitions {
            self.send(*partition, Continuation::IndexSearch, PartitionCommand::IndexSearch {
                table,
                field,
                search: search.clone(),
            })?;
        }

        let mut hits: BTreeMap<PartitionId, Vec<RowId>> = BTreeMap::new();
        let mut failure = None;
        for _ in 0..partitions.len() {
            match self.next_reply(Continuation::IndexSearch).await?.body {
                ReplyBody::IndexHits(pointers) => {
                    for pointer in pointers {
                        hits.entry(pointer.engineid).or_default().push(pointer.rowid);
                    }
                }
                other => failure = Some(refused(other)),
            }
        }
        if let Some(e) = failure {
            return Err(e);
        }

        let groups = hits
            .into_iter()
            .map(|(partition, mut rowids)| {
                rowids.sort();
                rowids.dedup();
                (partition, rowids)
            })
            .collect();
        self.lock_rows(table, groups, lock, Continuation::IndexSelectRows)
            .await
    }

    async fn update(&mut self, uur: UuRecord, values: Vec<Value>) -> Result<()> {
        let catalog = self.catalog.clone();
        let schema = catalog.table(uur.tableid)?;
        schema.validate_row(&values)?;
        let row = self
            .staged
            .get(&uur)
            .filter(|row| row.is_writable())
            .ok_or(CoordinatorError::NotLocked(uur))?;

        let committed = self
            .staged
            .origin(uur)
            .map(|(_, original)| unique_keys(schema, original))
            .unwrap_or_default();
        let held = row.keys.clone();
        let wanted = unique_keys(schema, &values);
        let fresh = new_keys(&wanted, &committed, &held);
        let payload = self.codec.encode(&values)?;

        self.lock_keys(uur, fresh.clone(), Continuation::UpdateUniqueIndex)
            .await?;

        self.send(uur.engineid, Continuation::UpdateRow, PartitionCommand::UpdateRow {
            table: uur.tableid,
            rowid: uur.rowid,
            payload,
        })?;
        if let ReplyBody::Rejected { reason } = self.next_reply(Continuation::UpdateRow).await?.body {
            self.release_keys(uur, fresh.into_iter().collect()).await?;
            return Err(CoordinatorError::Rejected(reason));
        }

        let unused = held
            .into_iter()
            .filter(|(field, key)| wanted.get(field) != Some(key))
            .collect();
        self.release_keys(uur, unused).await?;

        let row = self
            .staged
            .get_mut(&uur)
            .ok_or(CoordinatorError::NotLocked(uur))?;
        row.current = Some(values);
        if row.command == StagedCommand::Untouched {
            row.command = StagedCommand::Update;
        }
        Ok(())
    }

    async fn replace(&mut self, uur: UuRecord, partition: PartitionId, values: Vec<Value>) -> Result<UuRecord> {
        let catalog = self.catalog.clone();
        let schema = catalog.table(uur.tableid)?;
        schema.validate_row(&values)?;
        let row = self
            .staged
            .get(&uur)
            .filter(|row| row.is_writable())
            .ok_or(CoordinatorError::NotLocked(uur))?;

        let committed = self
            .staged
            .origin(uur)
            .map(|(_, original)| unique_keys(schema, original))
            .unwrap_or_default();
        let held = row.keys.clone();
        let wanted = unique_keys(schema, &values);
        let fresh = new_keys(&wanted, &committed, &held);
        let payload = self.codec.encode(&values)?;

        self.send(partition, Continuation::ReplaceNewRow, PartitionCommand::NewRow {
            table: uur.tableid,
            payload,
        })?;
        let rowid = match self.next_reply(Continuation::ReplaceNewRow).await?.body {
            ReplyBody::NewRow { rowid } => rowid,
            other => return Err(refused(other)),
        };
        let moved = UuRecord::new(rowid, uur.tableid, partition);
        self.track(DeadlockChange::AddLocked, row_item(moved));
        let mut staged = StagedRow::inserted(values);
        staged.moved_from = Some(uur);
        self.staged.insert(moved, staged);

        if let Err(e) = self.lock_keys(moved, fresh, Continuation::ReplaceUniqueIndex).await {
            if !matches!(e, CoordinatorError::Deadlock) {
                self.discard_row(moved).await?;
            }
            return Err(e);
        }

        self.send(uur.engineid, Continuation::ReplaceDeleteRow, PartitionCommand::ReplaceDeleteRow {
            table: uur.tableid,
            rowid: uur.rowid,
            forward: RowPointer::new(rowid, partition),
        })?;
        if let ReplyBody::Rejected { reason } = self.next_reply(Continuation::ReplaceDeleteRow).await?.body {
            self.discard_row(moved).await?;
            return Err(CoordinatorError::Rejected(reason));
        }

        let mut carried = BTreeMap::new();
        if let Some(old) = self.staged.get_mut(&uur) {
            old.command = StagedCommand::Delete;
            old.moved_to = Some(moved);
            carried = std::mem::take(&mut old.keys);
        }
        // keys the new values still use follow the row
        let (kept, unused): (BTreeMap<_, _>, BTreeMap<_, _>) = carried
            .into_iter()
            .partition(|(field, key)| wanted.get(field) == Some(key));
        if let Some(new) = self.staged.get_mut(&moved) {
            new.keys.extend(kept);
        }
        self.release_keys(uur, unused.into_iter().collect()).await?;

        debug!("[txn {}] Moving {} to {}", self.id.short(), uur, moved);
        Ok(moved)
    }

    async fn delete(&mut self, uur: UuRecord) -> Result<()> {
        let row = self
            .staged
            .get(&uur)
            .filter(|row| row.is_writable())
            .ok_or(CoordinatorError::NotLocked(uur))?;
        if row.command == StagedCommand::Insert {
            return self.discard_row(uur).await;
        }

        self.send(uur.engineid, Continuation::DeleteRow, PartitionCommand::DeleteRow {
            table: uur.tableid,
            rowid: uur.rowid,
        })?;
        if let ReplyBody::Rejected { reason } = self.next_reply(Continuation::DeleteRow).await?.body {
            return Err(CoordinatorError::Rejected(reason));
        }

        let mut keys = Vec::new();
        if let Some(row) = self.staged.get_mut(&uur) {
            row.command = StagedCommand::Delete;
            row.current = None;
            keys = std::mem::take(&mut row.keys).into_iter().collect();
        }
        self.release_keys(uur, keys).await
    }

    async fn unlock(&mut self, uur: UuRecord) -> Result<()> {
        match self.staged.get(&uur) {
            Some(row) if row.lock == LockType::ReadLock => {}
            _ => return Err(CoordinatorError::NotLocked(uur)),
        }
        let item = row_item(uur);
        if self.locks.waits(&item) {
            return Err(CoordinatorError::Pending);
        }

        let rejected = self
            .terminate(EngineCmd::Unlock, Continuation::Unlock, vec![terminate_row(uur)])
            .await?;
        if !rejected.is_empty() {
            return Err(CoordinatorError::Rejected(rejected.join("; ")));
        }
        self.track(DeadlockChange::RemoveLocked, item);
        self.staged.remove(&uur);
        Ok(())
    }

    async fn revert(&mut self, uur: UuRecord) -> Result<()> {
        let row = self
            .staged
            .get(&uur)
            .filter(|row| row.lock == LockType::WriteLock)
            .ok_or(CoordinatorError::NotLocked(uur))?;

        let (command, moved_to) = (row.command, row.moved_to);

        match command {
            StagedCommand::Untouched => Ok(()),
            StagedCommand::Insert => self.discard_row(uur).await,
            StagedCommand::Update | StagedCommand::Delete => {
                // undo any moves first, newest location first
                let mut chain = Vec::new();
                let mut next = moved_to;
                while let Some(moved) = next {
                    if chain.len() > self.staged.len() {
                        break;
                    }
                    chain.push(moved);
                    next = self.staged.get(&moved).and_then(|r| r.moved_to);
                }
                for moved in chain.into_iter().rev() {
                    self.discard_row(moved).await?;
                }

                let rejected = self
                    .terminate(EngineCmd::Revert, Continuation::Revert, vec![terminate_row(uur)])
                    .await?;
                if !rejected.is_empty() {
                    return Err(CoordinatorError::Rejected(rejected.join("; ")));
                }

                let mut keys = Vec::new();
                if let Some(row) = self.staged.get_mut(&uur) {
                    row.command = StagedCommand::Untouched;
                    row.current = None;
                    keys = std::mem::take(&mut row.keys).into_iter().collect();
                }
                self.release_keys(uur, keys).await
            }
        }
    }

    async fn commit(&mut self) -> Result<()> {
        debug!(
            "[txn {}] Committing {} rows on {} partitions",
            self.id.short(),
            self.staged.len(),
            self.touched.len()
        );
        let event = self.locks.detach(self.id);
        self.report(event);

        // requests still queued are withdrawn, not committed
        let waiting: Vec<LockItem> = self.locks.waiting().cloned().collect();
        if !waiting.is_empty() {
            let items = waiting.iter().map(|item| self.terminate_item(item)).collect();
            self.terminate(EngineCmd::Rollback, Continuation::Rollback, items)
                .await?;
            for item in &waiting {
                self.locks.forget(item);
                if let LockItem::Row { table, rowid, engineid } = item {
                    self.staged.remove(&UuRecord::new(*rowid, *table, *engineid));
                }
            }
        }

        let catalog = self.catalog.clone();
        let mut first = Vec::new();
        let mut moved_away = Vec::new();
        for item in self.locks.locked() {
            let terminate = self.terminate_item(item);
            let moved = match item {
                LockItem::Row { table, rowid, engineid } => self
                    .staged
                    .get(&UuRecord::new(*rowid, *table, *engineid))
                    .is_some_and(|row| row.moved_to.is_some()),
                LockItem::Index { .. } => false,
            };
            if moved {
                moved_away.push(terminate);
            } else {
                first.push(terminate);
            }
        }

        for (uur, row) in self.staged.iter() {
            if row.command == StagedCommand::Untouched || row.moved_to.is_some() {
                continue;
            }
            let schema = catalog.table(uur.tableid)?;
            let before = self
                .staged
                .origin(*uur)
                .map(|(at, values)| (pointer(at), values));
            let after = row.visible().map(|values| (pointer(*uur), values));
            let changes = index_changes(schema, before, after, row.moved_from.is_some());
            for (field, change) in changes {
                first.push((
                    placement(&self.network, field, &change),
                    TerminateItem::Maintain {
                        table: uur.tableid,
                        field,
                        change,
                    },
                ));
            }
        }

        let mut rejected = self
            .terminate(EngineCmd::Commit, Continuation::Commit, first)
            .await?;
        // rows that moved go last, once their new location is committed
        rejected.extend(
            self.terminate(EngineCmd::Commit, Continuation::CommitReplaced, moved_away)
                .await?,
        );
        // what partitions accepted stays committed
        self.finish(TransactionState::Committed);
        if !rejected.is_empty() {
            warn!(
                "[txn {}] Committed with {} refused items",
                self.id.short(),
                rejected.len()
            );
            return Err(CoordinatorError::CommitRefused(rejected));
        }
        info!("[txn {}] Committed", self.id.short());
        Ok(())
    }

    /// Roll back every held and queued item
    async fn rollback_all(&mut self) -> Result<()> {
        let event = self.locks.detach(self.id);
        self.report(event);

        let items = self
            .locks
            .items()
            .map(|item| self.terminate_item(item))
            .collect();
        let result = self
            .terminate(EngineCmd::Rollback, Continuation::Rollback, items)
            .await;

        self.finish(TransactionState::Aborted);
        info!("[txn {}] Rolled back", self.id.short());
        result.map(|_| ())
    }

    async fn abort_for_deadlock(&mut self) {
        self.deadlocked = true;
        self.begin(TransactionState::Aborting);
        if let Err(e) = self.rollback_all().await {
            warn!("[txn {}] Rollback after deadlock failed: {}", self.id.short(), e);
        }
        self.pending = None;
    }

    fn finish(&mut self, state: TransactionState) {
        let tag = ReplyTag::new(self.cmd_id, Continuation::Discard);
        for partition in std::mem::take(&mut self.touched) {
            let request = PartitionRequest {
                transaction: self.id,
                tag,
                command: PartitionCommand::EndSubtransaction,
            };
            if let Err(e) = self.network.send_to_partition(partition, request) {
                debug!(
                    "[txn {}] Could not end subtransaction on partition {}: {}",
                    self.id.short(),
                    partition,
                    e
                );
            }
        }
        let event = self.locks.clear(self.id);
        self.report(event);
        self.staged.clear();
        self.set_state(state);
    }

    /// Lock rows on one or more partitions, waiting for queued requests;
    /// results follow the requested order and leave out missing rows
    async fn lock_rows(
        &mut self,
        table: TableId,
        groups: Vec<(PartitionId, Vec<RowId>)>,
        lock: LockType,
        continuation: Continuation,
    ) -> Result<Vec<SelectedRow>> {
        let mut found = HashMap::new();
        let mut order = Vec::new();
        let mut outstanding = 0usize;

        for (partition, rowids) in groups {
            let (local, remote) = self.local_rows(table, partition, &rowids, lock);
            found.extend(local);
            order.extend(rowids.iter().map(|rowid| UuRecord::new(*rowid, table, partition)));
            if remote.is_empty() {
                continue;
            }
            self.send(partition, continuation, PartitionCommand::SelectRows {
                table,
                rowids: remote,
                lock,
            })?;
            outstanding += 1;
        }

        let mut failure = None;
        while outstanding > 0 {
            let reply = self.next_reply(continuation).await?;
            outstanding -= 1;

            let rows = match reply.body {
                ReplyBody::Rows(rows) => rows,
                ReplyBody::Row { row, .. } => vec![row],
                other => {
                    failure = Some(refused(other));
                    continue;
                }
            };
            for row in rows {
                if row.state == LockState::Pending {
                    outstanding += 1;
                }
                let uur = UuRecord::new(row.rowid, table, reply.partition);
                match self.settle_row(uur, &row) {
                    Ok(Some(selected)) => {
                        found.insert(uur, selected);
                    }
                    Ok(None) => {}
                    Err(e) => failure = Some(e),
                }
            }
        }
        if let Some(e) = failure {
            return Err(e);
        }

        Ok(order.iter().filter_map(|uur| found.remove(uur)).collect())
    }

    /// Split requested rows into those answered from the staged rows and
    /// those the partition has to lock
    fn local_rows(
        &self,
        table: TableId,
        partition: PartitionId,
        rowids: &[RowId],
        lock: LockType,
    ) -> (HashMap<UuRecord, SelectedRow>, Vec<RowId>) {
        let mut local = HashMap::new();
        let mut remote = Vec::new();
        let mut seen = HashSet::new();
        for rowid in rowids {
            if !seen.insert(*rowid) {
                continue;
            }
            let uur = UuRecord::new(*rowid, table, partition);
            match self.staged.get(&uur) {
                Some(row) if row.covers(lock) => {
                    if let Some(values) = row.visible() {
                        local.insert(uur, SelectedRow {
                            uur,
                            lock: row.lock,
                            values: values.to_vec(),
                        });
                    }
                }
                _ => remote.push(*rowid),
            }
        }
        (local, remote)
    }

    /// Record what a partition said about one row; returns the row when it
    /// was handed out
    fn settle_row(&mut self, uur: UuRecord, row: &ReturnRow) -> Result<Option<SelectedRow>> {
        let item = row_item(uur);
        let lock = match row.state {
            LockState::NotFound => return Ok(None),
            LockState::Pending => {
                if self.locks.waits(&item) {
                    // queued already; the wait now belongs to this primitive
                    let event = self.locks.resync(self.id, self.cmd_id);
                    self.report(event);
                } else {
                    self.track(DeadlockChange::AddPending, item);
                }
                return Ok(None);
            }
            LockState::PendingToNoLock => {
                self.track(DeadlockChange::RemovePending, item);
                return Ok(None);
            }
            LockState::NoLock => LockType::NoLock,
            LockState::ReadLock | LockState::WriteLock => {
                self.track(DeadlockChange::AddLocked, item);
                row.state.lock_type().unwrap_or(LockType::NoLock)
            }
            LockState::PendingToReadLock | LockState::PendingToWriteLock => {
                self.track(DeadlockChange::PendingToLocked, item);
                row.state.lock_type().unwrap_or(LockType::NoLock)
            }
            state => {
                warn!(
                    "[txn {}] Row {} answered with index state {}",
                    self.id.short(),
                    uur,
                    state
                );
                return Ok(None);
            }
        };

        let committed = self.codec.decode(&row.payload)?;
        if lock == LockType::NoLock {
            return Ok(Some(SelectedRow {
                uur,
                lock,
                values: committed,
            }));
        }

        self.staged.lock(uur, lock, committed);
        Ok(self.staged.get(&uur).and_then(|staged| {
            staged.visible().map(|values| SelectedRow {
                uur,
                lock: staged.lock,
                values: values.to_vec(),
            })
        }))
    }

    /// Stage and lock unique keys for the row at `uur`, waiting for queued
    /// keys; on a duplicate the keys locked here are given back
    async fn lock_keys(
        &mut self,
        uur: UuRecord,
        keys: BTreeMap<FieldId, Value>,
        continuation: Continuation,
    ) -> Result<()> {
        let table = uur.tableid;
        let entry = pointer(uur);
        for (field, key) in &keys {
            let partition = self.network.partition_for_key(key);
            self.send(partition, continuation, PartitionCommand::UniqueIndex {
                table,
                field: *field,
                key: key.clone(),
                entry,
            })?;
        }

        let mut outstanding = keys.len();
        let mut locked = Vec::new();
        let mut failure = None;
        while outstanding > 0 {
            let reply = self.next_reply(continuation).await?;
            outstanding -= 1;

            let (field, key, state) = match reply.body {
                ReplyBody::IndexLock {
                    field, key, state, ..
                } => (field, key, state),
                other => {
                    failure = Some(refused(other));
                    continue;
                }
            };
            let item = key_item(table, field, key.clone());
            match state {
                LockState::IndexLock | LockState::PendingToIndexLock => {
                    let change = if state == LockState::IndexLock {
                        DeadlockChange::AddLocked
                    } else {
                        DeadlockChange::PendingToLocked
                    };
                    self.track(change, item);
                    locked.push((field, key));
                }
                LockState::IndexPending if self.locks.holds(&item) => {
                    // ours already, through another staged row
                    debug!(
                        "[txn {}] Key {}.{}={} already staged for {:?}",
                        self.id.short(),
                        table,
                        field,
                        key,
                        self.key_owner(table, field, &key)
                    );
                    failure = Some(CoordinatorError::UniqueConstraint { table, field });
                }
                LockState::IndexPending => {
                    self.track(DeadlockChange::AddPending, item);
                    outstanding += 1;
                }
                LockState::NoLock | LockState::PendingToIndexNoLock => {
                    if state == LockState::PendingToIndexNoLock {
                        self.track(DeadlockChange::RemovePending, item);
                    }
                    debug!(
                        "[txn {}] Key {}.{}={} already committed",
                        self.id.short(),
                        table,
                        field,
                        key
                    );
                    failure = Some(CoordinatorError::UniqueConstraint { table, field });
                }
                state => {
                    failure = Some(CoordinatorError::InvalidState(format!(
                        "Unexpected index state {}",
                        state
                    )));
                }
            }
        }

        match failure {
            None => {
                if let Some(row) = self.staged.get_mut(&uur) {
                    row.keys.extend(locked);
                }
                Ok(())
            }
            Some(e) => {
                self.release_keys(uur, locked).await?;
                Err(e)
            }
        }
    }

    /// Staged row that holds a unique key
    fn key_owner(&self, table: TableId, field: FieldId, key: &Value) -> Option<UuRecord> {
        self.staged
            .iter()
            .find(|(uur, row)| uur.tableid == table && row.keys.get(&field) == Some(key))
            .map(|(uur, _)| *uur)
    }

    /// Roll back unique keys staged for the row at `uur`
    async fn release_keys(&mut self, uur: UuRecord, keys: Vec<(FieldId, Value)>) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let items = keys
            .iter()
            .map(|(field, key)| self.terminate_item(&key_item(uur.tableid, *field, key.clone())))
            .collect();
        self.terminate(EngineCmd::Rollback, Continuation::Rollback, items)
            .await?;
        for (field, key) in keys {
            self.track(DeadlockChange::RemoveLocked, key_item(uur.tableid, field, key));
        }
        Ok(())
    }

    /// Throw away a row this transaction inserted, with its unique keys
    async fn discard_row(&mut self, uur: UuRecord) -> Result<()> {
        let keys: Vec<(FieldId, Value)> = self
            .staged
            .get(&uur)
            .map(|row| row.keys.clone().into_iter().collect())
            .unwrap_or_default();

        let mut items = vec![terminate_row(uur)];
        items.extend(
            keys.iter()
                .map(|(field, key)| self.terminate_item(&key_item(uur.tableid, *field, key.clone()))),
        );
        let rejected = self
            .terminate(EngineCmd::Rollback, Continuation::Rollback, items)
            .await?;

        self.track(DeadlockChange::RemoveLocked, row_item(uur));
        for (field, key) in keys {
            self.track(DeadlockChange::RemoveLocked, key_item(uur.tableid, field, key));
        }
        if let Some(row) = self.staged.remove(&uur)
            && let Some(previous) = row.moved_from
            && let Some(old) = self.staged.get_mut(&previous)
        {
            old.moved_to = None;
        }

        if rejected.is_empty() {
            Ok(())
        } else {
            Err(CoordinatorError::Rejected(rejected.join("; ")))
        }
    }

    /// Send one terminating command per partition and wait for every reply;
    /// returns the items partitions refused
    async fn terminate(
        &mut self,
        cmd: EngineCmd,
        continuation: Continuation,
        items: Vec<(PartitionId, TerminateItem)>,
    ) -> Result<Vec<String>> {
        let mut by_partition: BTreeMap<PartitionId, Vec<TerminateItem>> = BTreeMap::new();
        for (partition, item) in items {
            by_partition.entry(partition).or_default().push(item);
        }

        let count = by_partition.len();
        for (partition, items) in by_partition {
            self.send(partition, continuation, PartitionCommand::Terminate { cmd, items })?;
        }

        let mut rejected = Vec::new();
        for _ in 0..count {
            match self.next_reply(continuation).await?.body {
                ReplyBody::Terminated { rejected: refused } => rejected.extend(refused),
                ReplyBody::Rejected { reason } => rejected.push(reason),
                other => rejected.push(format!("unexpected reply {:?}", other)),
            }
        }
        for reason in &rejected {
            warn!("[txn {}] {} refused: {}", self.id.short(), cmd, reason);
        }
        Ok(rejected)
    }

    fn terminate_item(&self, item: &LockItem) -> (PartitionId, TerminateItem) {
        match item {
            LockItem::Row {
                table,
                rowid,
                engineid,
            } => (*engineid, TerminateItem::Row {
                table: *table,
                rowid: *rowid,
            }),
            LockItem::Index { table, field, key } => (
                self.network.partition_for_key(key),
                TerminateItem::UniqueKey {
                    table: *table,
                    field: *field,
                    key: key.clone(),
                },
            ),
        }
    }

    fn send(&mut self, partition: PartitionId, continuation: Continuation, command: PartitionCommand) -> Result<()> {
        let pending_cmd_id = self.pending.unwrap_or(self.cmd_id);
        trace!(
            "[txn {}] {} to partition {} for command {}",
            self.id.short(),
            command.name(),
            partition,
            pending_cmd_id
        );
        self.touched.insert(partition);
        self.network.send_to_partition(partition, PartitionRequest {
            transaction: self.id,
            tag: ReplyTag::new(pending_cmd_id, continuation),
            command,
        })?;
        Ok(())
    }

    /// Wait for the next reply to the pending primitive at `continuation`
    ///
    /// Stale replies are absorbed, other primitives are refused with
    /// `Pending`, and an abort aimed at this primitive ends the wait.
    async fn next_reply(&mut self, continuation: Continuation) -> Result<PartitionReply> {
        loop {
            tokio::select! {
                event = self.events.recv() => {
                    let Some(event) = event else {
                        return Err(CoordinatorError::ResponseChannelClosed);
                    };
                    match event {
                        CoordinatorEvent::Reply(reply)
                            if Some(reply.tag.pending_cmd_id) == self.pending
                                && reply.tag.continuation == continuation =>
                        {
                            return Ok(reply);
                        }
                        CoordinatorEvent::Reply(reply) => self.absorb_late(reply),
                        CoordinatorEvent::Abort(abort)
                            if Some(abort.pending_cmd_id) == self.pending
                                && self.state() == TransactionState::Dispatching =>
                        {
                            info!(
                                "[txn {}] Chosen as deadlock victim during command {}",
                                self.id.short(),
                                abort.pending_cmd_id
                            );
                            return Err(CoordinatorError::Deadlock);
                        }
                        CoordinatorEvent::Abort(abort) => self.ignore_abort(abort),
                    }
                }

                request = self.requests.recv(), if !self.client_gone => match request {
                    Some(request) => {
                        debug!(
                            "[txn {}] Refusing {} while command {} is pending",
                            self.id.short(),
                            request.primitive.name(),
                            self.cmd_id
                        );
                        let _ = request.reply.send(Err(CoordinatorError::Pending));
                    }
                    None => self.client_gone = true,
                },
            }
        }
    }

    async fn on_idle_event(&mut self, event: CoordinatorEvent) {
        match event {
            CoordinatorEvent::Reply(reply) => self.absorb_late(reply),
            CoordinatorEvent::Abort(abort)
                if abort.pending_cmd_id == self.cmd_id
                    && self.state() == TransactionState::Expanding
                    && self.locks.pending_count() > 0 =>
            {
                info!(
                    "[txn {}] Chosen as deadlock victim while idle",
                    self.id.short()
                );
                self.abort_for_deadlock().await;
            }
            CoordinatorEvent::Abort(abort) => self.ignore_abort(abort),
        }
    }

    fn ignore_abort(&mut self, abort: DeadlockAbort) {
        debug!(
            "[txn {}] Ignoring abort for command {}, now at {}",
            self.id.short(),
            abort.pending_cmd_id,
            self.cmd_id
        );
        // the manager dropped us from its graph when it picked us
        let event = self.locks.resync(self.id, self.cmd_id);
        self.report(event);
    }

    /// Account for a reply to an earlier primitive, such as a lock granted
    /// after `fetch` returned
    fn absorb_late(&mut self, reply: PartitionReply) {
        match reply.body {
            ReplyBody::Row { table, row } if row.state.is_transition() => {
                let uur = UuRecord::new(row.rowid, table, reply.partition);
                if let Err(e) = self.settle_row(uur, &row) {
                    warn!("[txn {}] Late grant on {}: {}", self.id.short(), uur, e);
                }
            }
            ReplyBody::IndexLock {
                table,
                field,
                key,
                state,
            } if state.is_transition() => {
                let change = if state == LockState::PendingToIndexLock {
                    DeadlockChange::PendingToLocked
                } else {
                    DeadlockChange::RemovePending
                };
                self.track(change, key_item(table, field, key));
            }
            body => trace!(
                "[txn {}] Dropping stale reply for command {}: {:?}",
                self.id.short(),
                reply.tag.pending_cmd_id,
                body
            ),
        }
    }

    fn track(&mut self, change: DeadlockChange, item: LockItem) {
        let event = self.locks.record(self.id, self.cmd_id, change, item);
        self.report(event);
    }

    fn report(&self, event: Option<DeadlockEvent>) {
        let Some(event) = event else {
            return;
        };
        if let Err(e) = self.network.send_to_deadlock(event) {
            trace!("[txn {}] No deadlock manager: {}", self.id.short(), e);
        }
    }
}

fn row_item(uur: UuRecord) -> LockItem {
    LockItem::Row {
        table: uur.tableid,
        rowid: uur.rowid,
        engineid: uur.engineid,
    }
}

fn key_item(table: TableId, field: FieldId, key: Value) -> LockItem {
    LockItem::Index { table, field, key }
}

fn terminate_row(uur: UuRecord) -> (PartitionId, TerminateItem) {
    (uur.engineid, TerminateItem::Row {
        table: uur.tableid,
        rowid: uur.rowid,
    })
}

fn pointer(uur: UuRecord) -> RowPointer {
    RowPointer::new(uur.rowid, uur.engineid)
}

/// Non-null values of the row's unique-indexed fields
fn unique_keys(schema: &TableSchema, values: &[Value]) -> BTreeMap<FieldId, Value> {
    schema
        .indexed_fields()
        .filter(|(_, spec)| spec.kind.is_unique())
        .filter_map(|(field, _)| {
            values
                .get(field.id.0 as usize)
                .filter(|value| !value.is_null())
                .map(|value| (field.id, value.clone()))
        })
        .collect()
}

/// Keys that need a lock: neither committed for this row nor already held
fn new_keys(
    wanted: &BTreeMap<FieldId, Value>,
    committed: &BTreeMap<FieldId, Value>,
    held: &BTreeMap<FieldId, Value>,
) -> BTreeMap<FieldId, Value> {
    wanted
        .iter()
        .filter(|(field, key)| committed.get(*field) != Some(*key) && held.get(*field) != Some(*key))
        .map(|(field, key)| (*field, key.clone()))
        .collect()
}

fn refused(body: ReplyBody) -> CoordinatorError {
    match body {
        ReplyBody::Rejected { reason } => CoordinatorError::Rejected(reason),
        other => CoordinatorError::InvalidState(format!("Unexpected reply {:?}", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use infini_common::IndexSpec;
    use infini_partition::PartitionEngine;
    use infini_value::{CborCodec, ValueType};
    use std::time::Duration;
    use tokio::sync::oneshot;

    const PEOPLE: TableId = TableId(1);
    const ID: FieldId = FieldId(0);
    const CITY: FieldId = FieldId(1);

    struct Cluster {
        network: Network,
        catalog: Arc<Catalog>,
        _shutdown: Vec<oneshot::Sender<()>>,
    }

    impl Cluster {
        fn start(partitions: u32) -> Self {
            let catalog = Arc::new(
                Catalog::new().with_table(
                    TableSchema::new(PEOPLE, "people")
                        .with_field("id", ValueType::Int, Some(IndexSpec::unique().not_null()))
                        .with_field("city", ValueType::Str, Some(IndexSpec::nonunique()))
                        .with_field("name", ValueType::Str, None),
                ),
            );
            let network = Network::new(partitions);
            let mut shutdown = Vec::new();
            for id in network.partition_ids() {
                let engine = PartitionEngine::new(id, &catalog, network.clone());
                let mailbox = network.partitions().register(id);
                let (tx, rx) = oneshot::channel();
                tokio::spawn(engine.run(mailbox, rx));
                shutdown.push(tx);
            }
            Self {
                network,
                catalog,
                _shutdown: shutdown,
            }
        }

        fn begin(&self) -> TransactionHandle {
            Coordinator::spawn(
                self.network.clone(),
                self.catalog.clone(),
                Arc::new(CborCodec),
                &CoordinatorConfig::default(),
            )
        }

        async fn seed(&self, partition: u32, values: Vec<Value>) -> UuRecord {
            let txn = self.begin();
            let uur = txn.insert(PEOPLE, PartitionId(partition), values).await.unwrap();
            txn.commit().await.unwrap();
            uur
        }

        async fn lookup(&self, field: FieldId, key: Value) -> Vec<SelectedRow> {
            let txn = self.begin();
            let rows = txn
                .select_by_index(PEOPLE, field, IndexSearch::Equal(key), LockType::ReadLock)
                .await
                .unwrap();
            txn.commit().await.unwrap();
            rows
        }
    }

    fn person(id: i64, city: &str, name: &str) -> Vec<Value> {
        vec![Value::Int(id), Value::string(city), Value::string(name)]
    }

    #[tokio::test]
    async fn test_insert_reads_own_write_then_commits() {
        let cluster = Cluster::start(2);
        let txn = cluster.begin();

        let uur = txn
            .insert(PEOPLE, PartitionId(0), person(1, "Oslo", "ann"))
            .await
            .unwrap();
        let rows = txn
            .select(PEOPLE, PartitionId(0), vec![uur.rowid], LockType::ReadLock)
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].lock, LockType::WriteLock);
        assert_eq!(rows[0].values, person(1, "Oslo", "ann"));

        txn.commit().await.unwrap();
        assert_eq!(txn.state(), TransactionState::Committed);

        let rows = cluster.lookup(CITY, Value::string("Oslo")).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].uur, uur);
        assert_eq!(rows[0].values, person(1, "Oslo", "ann"));
    }

    #[tokio::test]
    async fn test_duplicate_key_is_refused_and_row_discarded() {
        let cluster = Cluster::start(2);
        cluster.seed(0, person(1, "Oslo", "ann")).await;

        let txn = cluster.begin();
        let result = txn.insert(PEOPLE, PartitionId(1), person(1, "Oslo", "bo")).await;
        assert!(matches!(
            result,
            Err(CoordinatorError::UniqueConstraint { table: PEOPLE, field: ID })
        ));
        assert_eq!(txn.state(), TransactionState::Expanding);

        txn.insert(PEOPLE, PartitionId(1), person(2, "Oslo", "bo"))
            .await
            .unwrap();
        txn.commit().await.unwrap();

        assert_eq!(cluster.lookup(CITY, Value::string("Oslo")).await.len(), 2);
        assert_eq!(cluster.lookup(ID, Value::Int(1)).await[0].values, person(1, "Oslo", "ann"));
    }

    #[tokio::test]
    async fn test_primitive_refused_while_one_is_pending() {
        let cluster = Cluster::start(1);
        let uur = cluster.seed(0, person(1, "Oslo", "ann")).await;

        let holder = cluster.begin();
        holder
            .select(PEOPLE, PartitionId(0), vec![uur.rowid], LockType::WriteLock)
            .await
            .unwrap();

        let waiter = cluster.begin();
        let blocked = {
            let waiter = waiter.clone();
            tokio::spawn(async move {
                waiter
                    .select(PEOPLE, PartitionId(0), vec![uur.rowid], LockType::WriteLock)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let refused = waiter.update(uur, person(1, "Rome", "ann")).await;
        assert!(matches!(refused, Err(CoordinatorError::Pending)));

        holder.commit().await.unwrap();
        let rows = blocked.await.unwrap().unwrap();
        assert_eq!(rows[0].lock, LockType::WriteLock);

        waiter.rollback().await.unwrap();
        assert_eq!(waiter.state(), TransactionState::Aborted);
    }

    #[tokio::test]
    async fn test_update_moves_unique_key() {
        let cluster = Cluster::start(3);
        cluster.seed(0, person(1, "Oslo", "ann")).await;

        let txn = cluster.begin();
        let rows = txn
            .select_by_index(PEOPLE, ID, IndexSearch::Equal(Value::Int(1)), LockType::WriteLock)
            .await
            .unwrap();
        txn.update(rows[0].uur, person(2, "Oslo", "ann")).await.unwrap();
        txn.commit().await.unwrap();

        assert!(cluster.lookup(ID, Value::Int(1)).await.is_empty());
        let rows = cluster.lookup(ID, Value::Int(2)).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].values, person(2, "Oslo", "ann"));

        // the old key is free again
        cluster.seed(1, person(1, "Rome", "bo")).await;
    }

    #[tokio::test]
    async fn test_update_needs_write_lock() {
        let cluster = Cluster::start(1);
        let uur = cluster.seed(0, person(1, "Oslo", "ann")).await;

        let txn = cluster.begin();
        txn.select(PEOPLE, PartitionId(0), vec![uur.rowid], LockType::ReadLock)
            .await
            .unwrap();
        let result = txn.update(uur, person(1, "Rome", "ann")).await;
        assert!(matches!(result, Err(CoordinatorError::NotLocked(row)) if row == uur));
        txn.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn test_replace_moves_row_between_partitions() {
        let cluster = Cluster::start(2);
        let uur = cluster.seed(0, person(5, "Oslo", "ann")).await;

        let txn = cluster.begin();
        txn.select(PEOPLE, PartitionId(0), vec![uur.rowid], LockType::WriteLock)
            .await
            .unwrap();
        let moved = txn
            .replace(uur, PartitionId(1), person(5, "Rome", "bo"))
            .await
            .unwrap();
        assert_eq!(moved.engineid, PartitionId(1));
        txn.commit().await.unwrap();

        let reader = cluster.begin();
        let old = reader
            .select(PEOPLE, PartitionId(0), vec![uur.rowid], LockType::ReadLock)
            .await
            .unwrap();
        assert!(old.is_empty());
        reader.commit().await.unwrap();

        let rows = cluster.lookup(ID, Value::Int(5)).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].uur, moved);
        assert_eq!(rows[0].values, person(5, "Rome", "bo"));
        assert!(cluster.lookup(CITY, Value::string("Oslo")).await.is_empty());
        assert_eq!(cluster.lookup(CITY, Value::string("Rome")).await.len(), 1);
    }

    #[tokio::test]
    async fn test_delete_of_own_insert_leaves_nothing() {
        let cluster = Cluster::start(2);
        let txn = cluster.begin();
        let uur = txn
            .insert(PEOPLE, PartitionId(0), person(9, "Oslo", "ann"))
            .await
            .unwrap();
        txn.delete(uur).await.unwrap();
        txn.commit().await.unwrap();

        assert!(cluster.lookup(ID, Value::Int(9)).await.is_empty());
        assert!(cluster.lookup(CITY, Value::string("Oslo")).await.is_empty());
        cluster.seed(1, person(9, "Rome", "bo")).await;
    }

    #[tokio::test]
    async fn test_revert_keeps_lock_and_drops_change() {
        let cluster = Cluster::start(2);
        let uur = cluster.seed(0, person(3, "Oslo", "ann")).await;

        let txn = cluster.begin();
        txn.select(PEOPLE, PartitionId(0), vec![uur.rowid], LockType::WriteLock)
            .await
            .unwrap();
        txn.update(uur, person(4, "Rome", "ann")).await.unwrap();
        txn.revert(uur).await.unwrap();

        let rows = txn
            .select(PEOPLE, PartitionId(0), vec![uur.rowid], LockType::WriteLock)
            .await
            .unwrap();
        assert_eq!(rows[0].values, person(3, "Oslo", "ann"));
        assert_eq!(rows[0].lock, LockType::WriteLock);
        txn.commit().await.unwrap();

        // key 4 was given back by the revert
        cluster.seed(1, person(4, "Rome", "bo")).await;
        assert_eq!(cluster.lookup(ID, Value::Int(3)).await[0].values, person(3, "Oslo", "ann"));
    }

    #[tokio::test]
    async fn test_unique_waiter_follows_holder_outcome() {
        let cluster = Cluster::start(2);

        let first = cluster.begin();
        first
            .insert(PEOPLE, PartitionId(0), person(7, "Oslo", "ann"))
            .await
            .unwrap();
        let second = cluster.begin();
        let blocked = {
            let second = second.clone();
            tokio::spawn(async move {
                second
                    .insert(PEOPLE, PartitionId(1), person(7, "Rome", "bo"))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        first.rollback().await.unwrap();

        let uur = blocked.await.unwrap().unwrap();
        second.commit().await.unwrap();
        assert_eq!(cluster.lookup(ID, Value::Int(7)).await[0].uur, uur);

        let third = cluster.begin();
        third
            .select_by_index(PEOPLE, ID, IndexSearch::Equal(Value::Int(7)), LockType::WriteLock)
            .await
            .unwrap();
        let fourth = cluster.begin();
        let blocked = {
            let fourth = fourth.clone();
            tokio::spawn(async move {
                fourth
                    .insert(PEOPLE, PartitionId(0), person(8, "Oslo", "cy"))
                    .await
            })
        };
        // an unrelated key does not wait
        blocked.await.unwrap().unwrap();
        third.commit().await.unwrap();
        fourth.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_unique_waiter_refused_after_holder_commits() {
        let cluster = Cluster::start(2);

        let first = cluster.begin();
        first
            .insert(PEOPLE, PartitionId(0), person(7, "Oslo", "ann"))
            .await
            .unwrap();
        let second = cluster.begin();
        let blocked = {
            let second = second.clone();
            tokio::spawn(async move {
                second
                    .insert(PEOPLE, PartitionId(1), person(7, "Rome", "bo"))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        first.commit().await.unwrap();

        let result = blocked.await.unwrap();
        assert!(matches!(result, Err(CoordinatorError::UniqueConstraint { field: ID, .. })));
        second.commit().await.unwrap();
        assert!(cluster.lookup(CITY, Value::string("Rome")).await.is_empty());
    }

    #[tokio::test]
    async fn test_finished_transaction_refuses_primitives() {
        let cluster = Cluster::start(1);
        let txn = cluster.begin();
        txn.commit().await.unwrap();

        assert!(matches!(txn.commit().await, Err(CoordinatorError::InvalidState(_))));
        assert!(matches!(txn.rollback().await, Err(CoordinatorError::InvalidState(_))));

        let aborted = cluster.begin();
        aborted.rollback().await.unwrap();
        aborted.rollback().await.unwrap();
        assert!(matches!(
            aborted.insert(PEOPLE, PartitionId(0), person(1, "Oslo", "ann")).await,
            Err(CoordinatorError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_fetch_reports_queued_rows_and_absorbs_grant() {
        let cluster = Cluster::start(1);
        let a = cluster.seed(0, person(1, "Oslo", "ann")).await;
        let b = cluster.seed(0, person(2, "Oslo", "bo")).await;

        let holder = cluster.begin();
        holder
            .select(PEOPLE, PartitionId(0), vec![b.rowid], LockType::WriteLock)
            .await
            .unwrap();

        let txn = cluster.begin();
        let fetched = txn
            .fetch(PEOPLE, PartitionId(0), vec![a.rowid, b.rowid], LockType::WriteLock)
            .await
            .unwrap();
        assert_eq!(fetched.rows.len(), 1);
        assert_eq!(fetched.rows[0].uur, a);
        assert_eq!(fetched.pending, vec![b.rowid]);

        holder.commit().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // the late grant made the row writable without another round trip
        txn.update(b, person(2, "Rome", "bo")).await.unwrap();
        txn.commit().await.unwrap();
        assert_eq!(cluster.lookup(CITY, Value::string("Rome")).await.len(), 1);
    }

    #[tokio::test]
    async fn test_select_after_fetch_takes_over_the_queued_request() {
        let cluster = Cluster::start(1);
        let row = cluster.seed(0, person(1, "Oslo", "ann")).await;

        let holder = cluster.begin();
        holder
            .select(PEOPLE, PartitionId(0), vec![row.rowid], LockType::WriteLock)
            .await
            .unwrap();

        let txn = cluster.begin();
        let fetched = txn
            .fetch(PEOPLE, PartitionId(0), vec![row.rowid], LockType::ReadLock)
            .await
            .unwrap();
        assert_eq!(fetched.pending, vec![row.rowid]);

        let blocked = {
            let txn = txn.clone();
            tokio::spawn(async move {
                txn.select(PEOPLE, PartitionId(0), vec![row.rowid], LockType::WriteLock)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!blocked.is_finished());

        holder.commit().await.unwrap();
        let rows = tokio::time::timeout(Duration::from_secs(2), blocked)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].lock, LockType::WriteLock);
        txn.commit().await.unwrap();

        // nothing of txn is left queued on the row
        let next = cluster.begin();
        let rows = tokio::time::timeout(
            Duration::from_secs(1),
            next.select(PEOPLE, PartitionId(0), vec![row.rowid], LockType::WriteLock),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(rows[0].lock, LockType::WriteLock);
        next.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_unique_key_cannot_be_reused_within_transaction() {
        let cluster = Cluster::start(2);
        let txn = cluster.begin();
        let first = txn
            .insert(PEOPLE, PartitionId(0), person(5, "Oslo", "a"))
            .await
            .unwrap();

        let err = txn
            .insert(PEOPLE, PartitionId(1), person(5, "Oslo", "b"))
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::UniqueConstraint { field: ID, .. }));

        let other = txn
            .insert(PEOPLE, PartitionId(1), person(6, "Oslo", "c"))
            .await
            .unwrap();
        let err = txn.update(other, person(5, "Oslo", "c")).await.unwrap_err();
        assert!(matches!(err, CoordinatorError::UniqueConstraint { field: ID, .. }));
        assert_eq!(txn.state(), TransactionState::Expanding);

        txn.commit().await.unwrap();
        let rows = cluster.lookup(ID, Value::Int(5)).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].uur, first);
        assert_eq!(rows[0].values, person(5, "Oslo", "a"));
        assert_eq!(cluster.lookup(ID, Value::Int(6)).await.len(), 1);
    }

    #[tokio::test]
    async fn test_commit_reports_refused_items() {
        let cluster = Cluster::start(1);
        let row = cluster.seed(0, person(1, "Oslo", "ann")).await;

        let txn = cluster.begin();
        txn.select(PEOPLE, PartitionId(0), vec![row.rowid], LockType::WriteLock)
            .await
            .unwrap();
        txn.update(row, person(1, "Oslo", "anna")).await.unwrap();

        // release the row behind the coordinator's back
        cluster
            .network
            .send_to_partition(PartitionId(0), PartitionRequest {
                transaction: txn.id(),
                tag: ReplyTag::new(CommandId(0), Continuation::Discard),
                command: PartitionCommand::Terminate {
                    cmd: EngineCmd::Rollback,
                    items: vec![TerminateItem::Row {
                        table: PEOPLE,
                        rowid: row.rowid,
                    }],
                },
            })
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        match txn.commit().await {
            Err(CoordinatorError::CommitRefused(refused)) => assert_eq!(refused.len(), 1),
            other => panic!("expected a refused commit, got {:?}", other),
        }
        assert_eq!(txn.state(), TransactionState::Committed);
        let rows = cluster.lookup(ID, Value::Int(1)).await;
        assert_eq!(rows[0].values, person(1, "Oslo", "ann"));
    }
}
