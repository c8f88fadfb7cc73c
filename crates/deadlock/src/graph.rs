//! Global wait-for graph
//!
//! Edges are kept in four maps so both directions can be followed in
//! constant time: transaction to items it holds, transaction to items it
//! waits for, item to holders, item to waiters. Every mutation updates a
//! forward map and its mirror together.

use infini_common::{CommandId, TransactionId};
use infini_protocol::{DeadlockChange, LockItem};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Default)]
pub struct WaitForGraph {
    locked: HashMap<TransactionId, HashSet<LockItem>>,
    waiting: HashMap<TransactionId, HashSet<LockItem>>,
    lockers: HashMap<LockItem, HashSet<TransactionId>>,
    waiters: HashMap<LockItem, HashSet<TransactionId>>,
    /// Pending command of each tracked transaction, echoed back on abort
    returns: HashMap<TransactionId, CommandId>,
}

#[derive(Default)]
struct Walk {
    visited: HashSet<TransactionId>,
    on_path: HashSet<TransactionId>,
}

impl WaitForGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tracked transactions
    pub fn len(&self) -> usize {
        self.returns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.returns.is_empty()
    }

    pub fn contains(&self, transaction: &TransactionId) -> bool {
        self.returns.contains_key(transaction)
    }

    pub fn pending_cmd_id(&self, transaction: &TransactionId) -> Option<CommandId> {
        self.returns.get(transaction).copied()
    }

    pub fn holds(&self, transaction: &TransactionId, item: &LockItem) -> bool {
        self.locked
            .get(transaction)
            .is_some_and(|items| items.contains(item))
    }

    pub fn waits(&self, transaction: &TransactionId, item: &LockItem) -> bool {
        self.waiting
            .get(transaction)
            .is_some_and(|items| items.contains(item))
    }

    pub fn lockers(&self, item: &LockItem) -> impl Iterator<Item = &TransactionId> {
        self.lockers.get(item).into_iter().flatten()
    }

    pub fn waiters(&self, item: &LockItem) -> impl Iterator<Item = &TransactionId> {
        self.waiters.get(item).into_iter().flatten()
    }

    /// Item nodes with at least one edge
    pub fn item_count(&self) -> usize {
        self.lockers
            .keys()
            .chain(self.waiters.keys().filter(|i| !self.lockers.contains_key(*i)))
            .count()
    }

    /// Start tracking a transaction with its full edge lists
    ///
    /// A transaction already tracked is replaced.
    pub fn insert_transaction(
        &mut self,
        transaction: TransactionId,
        pending_cmd_id: CommandId,
        locked: impl IntoIterator<Item = LockItem>,
        waiting: impl IntoIterator<Item = LockItem>,
    ) {
        self.remove_transaction(&transaction);
        self.returns.insert(transaction, pending_cmd_id);
        self.locked.insert(transaction, HashSet::new());
        self.waiting.insert(transaction, HashSet::new());
        for item in locked {
            self.add_locked(transaction, item);
        }
        for item in waiting {
            self.add_waiting(transaction, item);
        }
    }

    /// Apply one edge delta; ignored for untracked transactions
    pub fn apply_change(
        &mut self,
        transaction: TransactionId,
        pending_cmd_id: CommandId,
        change: DeadlockChange,
        item: LockItem,
    ) -> bool {
        if !self.contains(&transaction) {
            return false;
        }
        self.returns.insert(transaction, pending_cmd_id);
        match change {
            DeadlockChange::AddLocked => self.add_locked(transaction, item),
            DeadlockChange::AddPending => self.add_waiting(transaction, item),
            DeadlockChange::RemoveLocked => self.remove_locked(transaction, &item),
            DeadlockChange::RemovePending => self.remove_waiting(transaction, &item),
            DeadlockChange::PendingToLocked => {
                self.remove_waiting(transaction, &item);
                self.add_locked(transaction, item);
            }
        }
        true
    }

    /// Forget a transaction and every edge touching it
    pub fn remove_transaction(&mut self, transaction: &TransactionId) -> bool {
        let tracked = self.returns.remove(transaction).is_some();
        for item in self.locked.remove(transaction).unwrap_or_default() {
            detach(&mut self.lockers, &item, transaction);
        }
        for item in self.waiting.remove(transaction).unwrap_or_default() {
            detach(&mut self.waiters, &item, transaction);
        }
        tracked
    }

    /// Tracked transactions that wait for something, in id order
    pub fn waiting_transactions(&self) -> Vec<TransactionId> {
        let mut txns: Vec<_> = self
            .waiting
            .iter()
            .filter(|(_, items)| !items.is_empty())
            .map(|(txn, _)| *txn)
            .collect();
        txns.sort();
        txns
    }

    /// Walk wait edges from `origin` and return the transaction at which a
    /// cycle closes, if any
    ///
    /// When `origin` is on the cycle it is the one returned. A transaction
    /// reached twice along different paths is not a cycle; only a return to
    /// a transaction still on the current path is.
    pub fn find_cycle(&self, origin: TransactionId) -> Option<TransactionId> {
        let mut walk = Walk::default();
        self.visit(origin, &mut walk)
    }

    fn visit(&self, transaction: TransactionId, walk: &mut Walk) -> Option<TransactionId> {
        if walk.on_path.contains(&transaction) {
            return Some(transaction);
        }
        if !walk.visited.insert(transaction) {
            return None;
        }
        let items = self.waiting.get(&transaction)?;

        walk.on_path.insert(transaction);
        for item in items {
            let Some(holders) = self.lockers.get(item) else {
                continue;
            };
            // waiting to upgrade a lock you share is not waiting on yourself
            for holder in holders.iter().filter(|h| **h != transaction) {
                if let Some(victim) = self.visit(*holder, walk) {
                    return Some(victim);
                }
            }
        }
        walk.on_path.remove(&transaction);
        None
    }

    fn add_locked(&mut self, transaction: TransactionId, item: LockItem) {
        self.lockers
            .entry(item.clone())
            .or_default()
            .insert(transaction);
        self.locked.entry(transaction).or_default().insert(item);
    }

    fn add_waiting(&mut self, transaction: TransactionId, item: LockItem) {
        self.waiters
            .entry(item.clone())
            .or_default()
            .insert(transaction);
        self.waiting.entry(transaction).or_default().insert(item);
    }

    fn remove_locked(&mut self, transaction: TransactionId, item: &LockItem) {
        if let Some(items) = self.locked.get_mut(&transaction) {
            items.remove(item);
        }
        detach(&mut self.lockers, item, &transaction);
    }

    fn remove_waiting(&mut self, transaction: TransactionId, item: &LockItem) {
        if let Some(items) = self.waiting.get_mut(&transaction) {
            items.remove(item);
        }
        detach(&mut self.waiters, item, &transaction);
    }
}

fn detach(map: &mut HashMap<LockItem, HashSet<TransactionId>>, item: &LockItem, transaction: &TransactionId) {
    if let Some(txns) = map.get_mut(item) {
        txns.remove(transaction);
        if txns.is_empty() {
            map.remove(item);
        }
    }
}
