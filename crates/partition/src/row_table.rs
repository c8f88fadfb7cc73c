//! Row lock table for one table on one partition
//!
//! Committed rows live in `rows`. While a row is write-locked, staged
//! payloads live in a parallel shadow map keyed by the same rowid, and only
//! reach `rows` when the holder commits. Blocked requests wait in a
//! per-row `LockQueue`.

use crate::error::RowLockError;
use crate::lock_queue::{LockQueue, Requester};
use infini_common::{LockState, LockType, RowId, SubtransactionId, TableId};
use infini_protocol::{EngineCmd, ReturnRow, RowPointer};
use std::collections::{HashMap, HashSet};

type Result<T> = std::result::Result<T, RowLockError>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RowFlags {
    pub is_deleted: bool,
    pub is_inserted: bool,
    pub is_replace_delete: bool,
}

/// A committed row and its lock state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowRecord {
    pub rowid: RowId,
    pub flags: RowFlags,
    pub lock: LockType,
    pub write_holder: Option<SubtransactionId>,
    pub read_holders: HashSet<SubtransactionId>,
    pub payload: Vec<u8>,
    pub previous_subtransaction: Option<SubtransactionId>,
}

impl RowRecord {
    fn holds_write(&self, subtransaction: SubtransactionId) -> bool {
        self.lock == LockType::WriteLock && self.write_holder == Some(subtransaction)
    }

    fn release_write(&mut self) {
        self.write_holder = None;
        self.lock = if self.read_holders.is_empty() {
            LockType::NoLock
        } else {
            LockType::ReadLock
        };
    }

    fn release_read(&mut self, subtransaction: SubtransactionId) {
        self.read_holders.remove(&subtransaction);
        if self.read_holders.is_empty() && self.lock == LockType::ReadLock {
            self.lock = LockType::NoLock;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RowWaiter {
    requester: Requester,
    lock: LockType,
}

/// Queued request that has just been resolved
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grant {
    pub requester: Requester,
    pub row: ReturnRow,
}

/// Result of `get_rows`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchedRows {
    pub rows: Vec<ReturnRow>,
    pub pending: Vec<RowId>,
}

enum RowOutcome {
    Granted(ReturnRow),
    Pending,
    NotFound,
    /// NOLOCK read of a row that is mid-insert
    Skipped,
}

pub struct RowTable {
    table: TableId,
    rows: HashMap<RowId, RowRecord>,
    shadow: HashMap<RowId, Vec<u8>>,
    forwarders: HashMap<RowId, RowPointer>,
    queues: HashMap<RowId, LockQueue<RowWaiter>>,
    next_rowid: u64,
}

impl RowTable {
    pub fn new(table: TableId) -> Self {
        Self {
            table,
            rows: HashMap::new(),
            shadow: HashMap::new(),
            forwarders: HashMap::new(),
            queues: HashMap::new(),
            next_rowid: 1,
        }
    }

    pub fn table(&self) -> TableId {
        self.table
    }

    pub fn row(&self, rowid: RowId) -> Option<&RowRecord> {
        self.rows.get(&rowid)
    }

    pub fn shadow(&self, rowid: RowId) -> Option<&[u8]> {
        self.shadow.get(&rowid).map(Vec::as_slice)
    }

    pub fn forwarder(&self, rowid: RowId) -> Option<RowPointer> {
        self.forwarders.get(&rowid).copied()
    }

    pub fn queue_len(&self, rowid: RowId) -> usize {
        self.queues.get(&rowid).map_or(0, LockQueue::len)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Read rows, handing out granted rows now and reporting queued ones
    ///
    /// Rows that do not exist, and NOLOCK reads of rows mid-insert, are left
    /// out of both lists.
    pub fn get_rows(&mut self, rowids: &[RowId], lock: LockType, requester: Requester) -> FetchedRows {
        let mut fetched = FetchedRows::default();
        for &rowid in rowids {
            match self.lock_row(rowid, lock, requester) {
                RowOutcome::Granted(row) => fetched.rows.push(row),
                RowOutcome::Pending => fetched.pending.push(rowid),
                RowOutcome::NotFound | RowOutcome::Skipped => {}
            }
        }
        fetched
    }

    /// Lock-aware read answering one entry per requested row
    pub fn select_rows(&mut self, rowids: &[RowId], lock: LockType, requester: Requester) -> Vec<ReturnRow> {
        rowids
            .iter()
            .map(|&rowid| match self.lock_row(rowid, lock, requester) {
                RowOutcome::Granted(row) => row,
                RowOutcome::Pending => ReturnRow::without_payload(rowid, LockState::Pending),
                RowOutcome::NotFound | RowOutcome::Skipped => {
                    ReturnRow::without_payload(rowid, LockState::NotFound)
                }
            })
            .collect()
    }

    /// Insert a row write-locked by its creator
    pub fn new_row(&mut self, subtransaction: SubtransactionId, payload: Vec<u8>) -> RowId {
        let rowid = RowId(self.next_rowid);
        self.next_rowid += 1;

        self.shadow.insert(rowid, payload.clone());
        self.rows.insert(
            rowid,
            RowRecord {
                rowid,
                flags: RowFlags {
                    is_inserted: true,
                    ..RowFlags::default()
                },
                lock: LockType::WriteLock,
                write_holder: Some(subtransaction),
                read_holders: HashSet::new(),
                payload,
                previous_subtransaction: None,
            },
        );
        rowid
    }

    /// Stage a new payload for a row the caller has write-locked
    pub fn update_row(&mut self, rowid: RowId, subtransaction: SubtransactionId, payload: Vec<u8>) -> Result<ReturnRow> {
        let row = self.write_locked(rowid, subtransaction)?;
        if row.flags.is_deleted {
            return Err(RowLockError::RowDeleted(rowid));
        }
        self.shadow.insert(rowid, payload.clone());

        Ok(ReturnRow {
            rowid,
            state: LockState::WriteLock,
            payload,
            previous_subtransaction: None,
            forward: None,
        })
    }

    /// Flag a write-locked row for deletion at commit
    pub fn delete_row(&mut self, rowid: RowId, subtransaction: SubtransactionId) -> Result<ReturnRow> {
        let row = self.write_locked(rowid, subtransaction)?;
        if row.flags.is_deleted {
            return Err(RowLockError::RowDeleted(rowid));
        }
        row.flags.is_deleted = true;
        let returned = ReturnRow {
            rowid,
            state: LockState::WriteLock,
            payload: row.payload.clone(),
            previous_subtransaction: row.previous_subtransaction,
            forward: None,
        };
        self.shadow.remove(&rowid);
        Ok(returned)
    }

    /// Delete a row that is moving to another location, leaving a forwarder
    pub fn replace_delete_row(
        &mut self,
        rowid: RowId,
        subtransaction: SubtransactionId,
        forward: RowPointer,
    ) -> Result<ReturnRow> {
        let mut returned = self.delete_row(rowid, subtransaction)?;
        if let Some(row) = self.rows.get_mut(&rowid) {
            row.flags.is_replace_delete = true;
        }
        self.forwarders.insert(rowid, forward);
        returned.forward = Some(forward);
        Ok(returned)
    }

    /// Terminate a lock held (or requested) by `subtransaction` on a row
    ///
    /// Returns the queued requests resolved as a consequence.
    pub fn commit_rollback_unlock(
        &mut self,
        rowid: RowId,
        subtransaction: SubtransactionId,
        cmd: EngineCmd,
    ) -> Result<Vec<Grant>> {
        match cmd {
            EngineCmd::Commit => self.commit(rowid, subtransaction),
            EngineCmd::Rollback => self.rollback(rowid, subtransaction),
            EngineCmd::Unlock => self.unlock(rowid, subtransaction),
            EngineCmd::Revert => self.revert(rowid, subtransaction),
        }
    }

    fn commit(&mut self, rowid: RowId, subtransaction: SubtransactionId) -> Result<Vec<Grant>> {
        let row = self
            .rows
            .get_mut(&rowid)
            .ok_or(RowLockError::RowNotFound(rowid))?;

        if row.lock == LockType::ReadLock {
            if !row.read_holders.contains(&subtransaction) {
                return Err(RowLockError::NotHolder {
                    rowid,
                    subtransaction,
                });
            }
            row.release_read(subtransaction);
            return Ok(self.process_queue(rowid));
        }

        if !row.holds_write(subtransaction) {
            return Err(RowLockError::NotHolder {
                rowid,
                subtransaction,
            });
        }

        if row.flags.is_deleted {
            return Ok(self.destroy_row(rowid));
        }

        if let Some(staged) = self.shadow.remove(&rowid) {
            row.payload = staged;
        }
        row.previous_subtransaction = Some(subtransaction);
        row.flags = RowFlags::default();
        row.release_write();
        Ok(self.process_queue(rowid))
    }

    fn rollback(&mut self, rowid: RowId, subtransaction: SubtransactionId) -> Result<Vec<Grant>> {
        let Some(row) = self.rows.get_mut(&rowid) else {
            // already destroyed, which also drained its queue
            return Ok(Vec::new());
        };

        // queued upgrades go first so releasing the read lock cannot grant them
        let dequeued = self.queues.get_mut(&rowid).map_or(0, |queue| {
            queue.remove_where(|w| w.requester.subtransaction == subtransaction)
        });

        if row.holds_write(subtransaction) {
            if row.flags.is_inserted {
                return Ok(self.destroy_row(rowid));
            }
            row.flags = RowFlags::default();
            row.release_write();
            self.shadow.remove(&rowid);
            self.forwarders.remove(&rowid);
            return Ok(self.process_queue(rowid));
        }

        if row.lock == LockType::ReadLock && row.read_holders.contains(&subtransaction) {
            row.release_read(subtransaction);
            return Ok(self.process_queue(rowid));
        }

        if dequeued > 0 {
            return Ok(self.process_queue(rowid));
        }

        if row.lock == LockType::WriteLock {
            return Err(RowLockError::NotHolder {
                rowid,
                subtransaction,
            });
        }
        Ok(Vec::new())
    }

    fn unlock(&mut self, rowid: RowId, subtransaction: SubtransactionId) -> Result<Vec<Grant>> {
        let row = self
            .rows
            .get_mut(&rowid)
            .ok_or(RowLockError::RowNotFound(rowid))?;
        if row.lock != LockType::ReadLock {
            return Err(RowLockError::LockMismatch {
                rowid,
                expected: LockType::ReadLock,
                actual: row.lock,
            });
        }
        if !row.read_holders.contains(&subtransaction) {
            return Err(RowLockError::NotHolder {
                rowid,
                subtransaction,
            });
        }
        row.release_read(subtransaction);
        Ok(self.process_queue(rowid))
    }

    /// Undo the staged change but keep the write lock
    fn revert(&mut self, rowid: RowId, subtransaction: SubtransactionId) -> Result<Vec<Grant>> {
        let row = self.write_locked(rowid, subtransaction)?;
        if row.flags.is_inserted {
            return Ok(self.destroy_row(rowid));
        }
        row.flags = RowFlags::default();
        self.shadow.remove(&rowid);
        self.forwarders.remove(&rowid);
        Ok(self.process_queue(rowid))
    }

    fn write_locked(&mut self, rowid: RowId, subtransaction: SubtransactionId) -> Result<&mut RowRecord> {
        let row = self
            .rows
            .get_mut(&rowid)
            .ok_or(RowLockError::RowNotFound(rowid))?;
        if row.lock != LockType::WriteLock {
            return Err(RowLockError::LockMismatch {
                rowid,
                expected: LockType::WriteLock,
                actual: row.lock,
            });
        }
        if row.write_holder != Some(subtransaction) {
            return Err(RowLockError::NotHolder {
                rowid,
                subtransaction,
            });
        }
        Ok(row)
    }

    /// Per-row lock state machine shared by every read path
    fn lock_row(&mut self, rowid: RowId, lock: LockType, requester: Requester) -> RowOutcome {
        let me = requester.subtransaction;
        let Some(row) = self.rows.get_mut(&rowid) else {
            return RowOutcome::NotFound;
        };

        let granted = match (lock, row.lock) {
            (LockType::NoLock, _) => {
                if row.flags.is_inserted && row.write_holder != Some(me) {
                    return RowOutcome::Skipped;
                }
                LockState::NoLock
            }
            (LockType::ReadLock, LockType::NoLock) => {
                row.lock = LockType::ReadLock;
                row.read_holders.insert(me);
                LockState::ReadLock
            }
            (LockType::ReadLock, LockType::ReadLock) => {
                row.read_holders.insert(me);
                LockState::ReadLock
            }
            (LockType::WriteLock, LockType::NoLock) => {
                row.lock = LockType::WriteLock;
                row.write_holder = Some(me);
                LockState::WriteLock
            }
            (LockType::WriteLock, LockType::ReadLock)
                if row.read_holders.len() == 1 && row.read_holders.contains(&me) =>
            {
                row.read_holders.clear();
                row.lock = LockType::WriteLock;
                row.write_holder = Some(me);
                LockState::WriteLock
            }
            (_, LockType::WriteLock) if row.write_holder == Some(me) => LockState::WriteLock,
            (_, LockType::WriteLock) if row.flags.is_inserted => return RowOutcome::NotFound,
            _ => {
                let queue = self.queues.entry(rowid).or_default();
                // asking again while queued moves the answer to the new request
                match queue.find_mut(|w| w.requester.subtransaction == me) {
                    Some(waiter) => {
                        waiter.requester = requester;
                        if lock == LockType::WriteLock {
                            waiter.lock = lock;
                        }
                    }
                    None => queue.push(RowWaiter { requester, lock }),
                }
                return RowOutcome::Pending;
            }
        };

        RowOutcome::Granted(self.return_row(rowid, granted))
    }

    fn return_row(&self, rowid: RowId, state: LockState) -> ReturnRow {
        match self.rows.get(&rowid) {
            Some(row) => ReturnRow {
                rowid,
                state,
                payload: row.payload.clone(),
                previous_subtransaction: row.previous_subtransaction,
                forward: self.forwarders.get(&rowid).copied(),
            },
            None => ReturnRow::without_payload(rowid, state),
        }
    }

    /// Remove a row for good and answer everyone still waiting on it
    fn destroy_row(&mut self, rowid: RowId) -> Vec<Grant> {
        self.rows.remove(&rowid);
        self.shadow.remove(&rowid);
        self.forwarders.remove(&rowid);

        self.queues
            .remove(&rowid)
            .map(|mut queue| queue.drain())
            .unwrap_or_default()
            .into_iter()
            .map(|waiter| Grant {
                requester: waiter.requester,
                row: ReturnRow::without_payload(rowid, LockState::PendingToNoLock),
            })
            .collect()
    }

    /// Grant waiters from the front of the queue while they are compatible
    fn process_queue(&mut self, rowid: RowId) -> Vec<Grant> {
        let mut grants = Vec::new();
        let Some(queue) = self.queues.get_mut(&rowid) else {
            return grants;
        };
        let Some(row) = self.rows.get_mut(&rowid) else {
            return grants;
        };

        while let Some(waiter) = queue.front().copied() {
            let me = waiter.requester.subtransaction;
            let grantable = match waiter.lock {
                LockType::NoLock => true,
                LockType::ReadLock => row.lock != LockType::WriteLock,
                LockType::WriteLock => match row.lock {
                    LockType::NoLock => true,
                    LockType::ReadLock => row.read_holders.iter().all(|h| *h == me),
                    LockType::WriteLock => false,
                },
            };
            if !grantable {
                break;
            }
            queue.pop();

            match waiter.lock {
                LockType::NoLock => {}
                LockType::ReadLock => {
                    row.lock = LockType::ReadLock;
                    row.read_holders.insert(me);
                }
                LockType::WriteLock => {
                    row.read_holders.clear();
                    row.lock = LockType::WriteLock;
                    row.write_holder = Some(me);
                }
            }

            grants.push(Grant {
                requester: waiter.requester,
                row: ReturnRow {
                    rowid,
                    state: LockState::pending_granted(waiter.lock),
                    payload: row.payload.clone(),
                    previous_subtransaction: row.previous_subtransaction,
                    forward: self.forwarders.get(&rowid).copied(),
                },
            });
        }

        if queue.is_empty() {
            self.queues.remove(&rowid);
        }
        grants
    }
}
