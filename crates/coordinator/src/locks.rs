//! Held and awaited lock items, mirrored to the deadlock manager
//!
//! The deadlock manager only tracks a transaction while it both holds and
//! waits for something. The tracker sends the full edge lists the moment
//! both sets become non-empty, deltas while they stay that way, and a
//! removal as soon as either empties.

use infini_common::{CommandId, TransactionId};
use infini_protocol::{DeadlockChange, DeadlockEvent, LockItem};
use std::collections::HashSet;

#[derive(Debug, Default)]
pub struct LockTracker {
    locked: HashSet<LockItem>,
    waiting: HashSet<LockItem>,
    reported: bool,
    /// Set once the transaction is finishing; nothing is reported after
    detached: bool,
}

impl LockTracker {
    pub fn lock_count(&self) -> usize {
        self.locked.len()
    }

    pub fn pending_count(&self) -> usize {
        self.waiting.len()
    }

    pub fn holds(&self, item: &LockItem) -> bool {
        self.locked.contains(item)
    }

    pub fn waits(&self, item: &LockItem) -> bool {
        self.waiting.contains(item)
    }

    pub fn locked(&self) -> impl Iterator<Item = &LockItem> {
        self.locked.iter()
    }

    pub fn waiting(&self) -> impl Iterator<Item = &LockItem> {
        self.waiting.iter()
    }

    /// Every item held or waited for, each once
    pub fn items(&self) -> impl Iterator<Item = &LockItem> {
        self.locked
            .iter()
            .chain(self.waiting.iter().filter(|i| !self.locked.contains(*i)))
    }

    /// Whether the deadlock manager currently tracks this transaction
    pub fn is_reported(&self) -> bool {
        self.reported
    }

    /// Apply one change; returns the event the deadlock manager needs, if any
    pub fn record(
        &mut self,
        transaction: TransactionId,
        pending_cmd_id: CommandId,
        change: DeadlockChange,
        item: LockItem,
    ) -> Option<DeadlockEvent> {
        let applied = match change {
            DeadlockChange::AddLocked => self.locked.insert(item.clone()).then_some(change),
            DeadlockChange::AddPending => self.waiting.insert(item.clone()).then_some(change),
            DeadlockChange::RemoveLocked => self.locked.remove(&item).then_some(change),
            DeadlockChange::RemovePending => self.waiting.remove(&item).then_some(change),
            DeadlockChange::PendingToLocked => {
                let was_waiting = self.waiting.remove(&item);
                let added = self.locked.insert(item.clone());
                match (was_waiting, added) {
                    (true, _) => Some(DeadlockChange::PendingToLocked),
                    (false, true) => Some(DeadlockChange::AddLocked),
                    (false, false) => None,
                }
            }
        };
        let change = applied?;
        self.report(transaction, pending_cmd_id, Some((change, item)))
    }

    /// Forget that the deadlock manager tracks us and report afresh if needed
    pub fn resync(&mut self, transaction: TransactionId, pending_cmd_id: CommandId) -> Option<DeadlockEvent> {
        self.reported = false;
        self.report(transaction, pending_cmd_id, None)
    }

    /// Stop reporting; the deadlock manager forgets the transaction
    pub fn detach(&mut self, transaction: TransactionId) -> Option<DeadlockEvent> {
        self.detached = true;
        std::mem::take(&mut self.reported).then_some(DeadlockEvent::Remove { transaction })
    }

    /// Drop an item without reporting it
    pub fn forget(&mut self, item: &LockItem) {
        self.locked.remove(item);
        self.waiting.remove(item);
    }

    /// Drop everything; the transaction has finished
    pub fn clear(&mut self, transaction: TransactionId) -> Option<DeadlockEvent> {
        self.locked.clear();
        self.waiting.clear();
        std::mem::take(&mut self.reported).then_some(DeadlockEvent::Remove { transaction })
    }

    fn report(
        &mut self,
        transaction: TransactionId,
        pending_cmd_id: CommandId,
        delta: Option<(DeadlockChange, LockItem)>,
    ) -> Option<DeadlockEvent> {
        if self.detached {
            return None;
        }
        let both = !self.locked.is_empty() && !self.waiting.is_empty();
        match (self.reported, both) {
            (true, true) => delta.map(|(change, item)| DeadlockEvent::Change {
                transaction,
                pending_cmd_id,
                change,
                item,
            }),
            (false, true) => {
                self.reported = true;
                Some(DeadlockEvent::New {
                    transaction,
                    pending_cmd_id,
                    locked: self.locked.iter().cloned().collect(),
                    waiting: self.waiting.iter().cloned().collect(),
                })
            }
            (true, false) => {
                self.reported = false;
                Some(DeadlockEvent::Remove { transaction })
            }
            (false, false) => None,
        }
    }
}
