//! Locking index table generic over its key type
//!
//! UNIQUE and UNORDERED indices hold one locking entry per key; a key with a
//! holder is staged by that subtransaction, a key without one is committed.
//! NONUNIQUE indices are a plain multimap that is only ever changed at commit.
//! Null entries are kept apart from keyed entries for every shape.

use super::IndexGrant;
use super::key::IndexKey;
use crate::error::IndexError;
use crate::lock_queue::{LockQueue, Requester};
use infini_common::{IndexKind, IndexSpec, LockState, SubtransactionId};
use infini_protocol::{EngineCmd, IndexChange, RowPointer};
use infini_value::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};

pub(crate) type Result<T> = std::result::Result<T, IndexError>;

/// Locking entry of a UNIQUE or UNORDERED index
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    pub pointer: RowPointer,
    /// Staging subtransaction; `None` once committed
    pub holder: Option<SubtransactionId>,
    pub previous_subtransaction: Option<SubtransactionId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) struct IndexWaiter {
    requester: Requester,
    pointer: RowPointer,
}

/// Exactly one container is live, chosen by the index kind
#[derive(Debug)]
pub(super) enum Entries<K> {
    Unique(BTreeMap<K, IndexEntry>),
    Unordered(HashMap<K, IndexEntry>),
    NonUnique(BTreeMap<K, BTreeSet<RowPointer>>),
}

impl<K: IndexKey> Entries<K> {
    fn new(kind: IndexKind) -> Self {
        match kind {
            IndexKind::Unique => Entries::Unique(BTreeMap::new()),
            IndexKind::Unordered => Entries::Unordered(HashMap::new()),
            IndexKind::NonUnique => Entries::NonUnique(BTreeMap::new()),
        }
    }

    fn get(&self, key: &K) -> Result<Option<&IndexEntry>> {
        match self {
            Entries::Unique(map) => Ok(map.get(key)),
            Entries::Unordered(map) => Ok(map.get(key)),
            Entries::NonUnique(_) => Err(IndexError::WrongShape { expected: "unique" }),
        }
    }

    fn get_mut(&mut self, key: &K) -> Result<Option<&mut IndexEntry>> {
        match self {
            Entries::Unique(map) => Ok(map.get_mut(key)),
            Entries::Unordered(map) => Ok(map.get_mut(key)),
            Entries::NonUnique(_) => Err(IndexError::WrongShape { expected: "unique" }),
        }
    }

    fn insert(&mut self, key: K, entry: IndexEntry) -> Result<()> {
        match self {
            Entries::Unique(map) => map.insert(key, entry),
            Entries::Unordered(map) => map.insert(key, entry),
            Entries::NonUnique(_) => return Err(IndexError::WrongShape { expected: "unique" }),
        };
        Ok(())
    }

    fn remove(&mut self, key: &K) -> Result<Option<IndexEntry>> {
        match self {
            Entries::Unique(map) => Ok(map.remove(key)),
            Entries::Unordered(map) => Ok(map.remove(key)),
            Entries::NonUnique(_) => Err(IndexError::WrongShape { expected: "unique" }),
        }
    }

    fn multimap(&mut self) -> Result<&mut BTreeMap<K, BTreeSet<RowPointer>>> {
        match self {
            Entries::NonUnique(map) => Ok(map),
            _ => Err(IndexError::WrongShape {
                expected: "non-unique",
            }),
        }
    }
}

/// Index over one field of one table, for the keys this partition owns
#[derive(Debug)]
pub struct IndexLockTable<K> {
    spec: IndexSpec,
    pub(super) entries: Entries<K>,
    pub(super) nulls: BTreeSet<RowPointer>,
    queues: HashMap<K, LockQueue<IndexWaiter>>,
}

impl<K: IndexKey> IndexLockTable<K> {
    pub fn new(spec: IndexSpec) -> Self {
        Self {
            spec,
            entries: Entries::new(spec.kind),
            nulls: BTreeSet::new(),
            queues: HashMap::new(),
        }
    }

    pub fn spec(&self) -> IndexSpec {
        self.spec
    }

    pub(super) fn key(value: &Value) -> Result<K> {
        K::from_value(value).ok_or_else(|| IndexError::TypeMismatch {
            expected: K::VALUE_TYPE,
            actual: value.clone(),
        })
    }

    /// Locking entry for `key`, if the index is unique and has one
    pub fn entry(&self, key: &Value) -> Option<IndexEntry> {
        let key = K::from_value(key)?;
        self.entries.get(&key).ok().flatten().copied()
    }

    pub fn queue_len(&self, key: &Value) -> usize {
        K::from_value(key)
            .and_then(|k| self.queues.get(&k))
            .map_or(0, LockQueue::len)
    }

    pub fn nulls(&self) -> impl Iterator<Item = &RowPointer> {
        self.nulls.iter()
    }

    /// Stage `key` for the requester, or queue behind its current holder
    ///
    /// Answers INDEXLOCK when staged, INDEXPENDINGLOCK when the requester
    /// already holds it or now waits for it, and NOLOCK when the key is
    /// committed (a unique violation).
    pub fn check_and_lock(&mut self, key: &Value, pointer: RowPointer, requester: Requester) -> Result<LockState> {
        let key = Self::key(key)?;
        let me = requester.subtransaction;

        let holder = match self.entries.get(&key)? {
            None => {
                self.entries.insert(
                    key,
                    IndexEntry {
                        pointer,
                        holder: Some(me),
                        previous_subtransaction: None,
                    },
                )?;
                return Ok(LockState::IndexLock);
            }
            Some(entry) => entry.holder,
        };

        match holder {
            Some(h) if h == me => Ok(LockState::IndexPending),
            Some(_) => {
                self.queues
                    .entry(key)
                    .or_default()
                    .push(IndexWaiter { requester, pointer });
                Ok(LockState::IndexPending)
            }
            None => Ok(LockState::NoLock),
        }
    }

    /// Release `key` on behalf of its holder, resolving queued requests
    pub fn commit_rollback(&mut self, key: &Value, subtransaction: SubtransactionId, cmd: EngineCmd) -> Result<Vec<IndexGrant>> {
        let typed = Self::key(key)?;
        match cmd {
            EngineCmd::Commit => self.commit(typed, subtransaction, key),
            EngineCmd::Rollback => self.rollback(typed, subtransaction, key),
            EngineCmd::Revert | EngineCmd::Unlock => Err(IndexError::UnsupportedCommand(cmd)),
        }
    }

    fn commit(&mut self, key: K, subtransaction: SubtransactionId, raw: &Value) -> Result<Vec<IndexGrant>> {
        let entry = self
            .entries
            .get_mut(&key)?
            .filter(|e| e.holder == Some(subtransaction))
            .ok_or_else(|| IndexError::NotHolder {
                key: raw.clone(),
                subtransaction,
            })?;
        entry.holder = None;
        entry.previous_subtransaction = Some(subtransaction);

        // the key is now taken for good
        Ok(self
            .queues
            .remove(&key)
            .map(|mut q| q.drain())
            .unwrap_or_default()
            .into_iter()
            .map(|w| IndexGrant {
                requester: w.requester,
                state: LockState::PendingToIndexNoLock,
            })
            .collect())
    }

    fn rollback(&mut self, key: K, subtransaction: SubtransactionId, raw: &Value) -> Result<Vec<IndexGrant>> {
        if let Some(queue) = self.queues.get_mut(&key) {
            if queue.remove_where(|w| w.requester.subtransaction == subtransaction) > 0 {
                if queue.is_empty() {
                    self.queues.remove(&key);
                }
                return Ok(Vec::new());
            }
        }

        let holder = match self.entries.get(&key)? {
            None => return Ok(Vec::new()),
            Some(entry) => entry.holder,
        };
        if holder != Some(subtransaction) {
            return Err(IndexError::NotHolder {
                key: raw.clone(),
                subtransaction,
            });
        }
        self.entries.remove(&key)?;

        let Some(queue) = self.queues.get_mut(&key) else {
            return Ok(Vec::new());
        };
        let Some(next) = queue.pop() else {
            self.queues.remove(&key);
            return Ok(Vec::new());
        };
        if queue.is_empty() {
            self.queues.remove(&key);
        }

        self.entries.insert(
            key,
            IndexEntry {
                pointer: next.pointer,
                holder: Some(next.requester.subtransaction),
                previous_subtransaction: None,
            },
        )?;
        Ok(vec![IndexGrant {
            requester: next.requester,
            state: LockState::PendingToIndexLock,
        }])
    }

    /// Apply a non-locking change at commit
    pub fn apply(&mut self, change: &IndexChange) -> Result<()> {
        match change {
            IndexChange::InsertNonunique { key, entry } => {
                let key = Self::key(key)?;
                self.entries.multimap()?.entry(key).or_default().insert(*entry);
            }
            IndexChange::DeleteNonunique { key, entry } => {
                let key = Self::key(key)?;
                let map = self.entries.multimap()?;
                if let Some(set) = map.get_mut(&key) {
                    set.remove(entry);
                    if set.is_empty() {
                        map.remove(&key);
                    }
                }
            }
            IndexChange::ReplaceNonunique { key, old, new } => {
                let key = Self::key(key)?;
                let set = self.entries.multimap()?.entry(key).or_default();
                set.remove(old);
                set.insert(*new);
            }
            IndexChange::InsertNull { entry } => {
                if self.spec.not_null {
                    return Err(IndexError::NullNotAllowed);
                }
                self.nulls.insert(*entry);
            }
            IndexChange::DeleteNull { entry } => {
                self.nulls.remove(entry);
            }
            IndexChange::ReplaceNull { old, new } => {
                if self.nulls.remove(old) {
                    self.nulls.insert(*new);
                }
            }
            IndexChange::DeleteUnique { key } => {
                let key = Self::key(key)?;
                self.entries.remove(&key)?;
            }
            IndexChange::ReplaceUnique { key, entry } => {
                let key = Self::key(key)?;
                if let Some(existing) = self.entries.get_mut(&key)? {
                    existing.pointer = *entry;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use infini_common::{CommandId, PartitionId, RowId, TransactionId};
    use infini_protocol::{Continuation, ReplyTag};

    fn requester(sub: u64) -> Requester {
        Requester {
            subtransaction: SubtransactionId(sub),
            transaction: TransactionId::new(),
            tag: ReplyTag::new(CommandId(sub), Continuation::InsertUniqueIndex),
        }
    }

    fn ptr(rowid: u64) -> RowPointer {
        RowPointer::new(RowId(rowid), PartitionId(0))
    }

    #[test]
    fn test_first_locker_wins() {
        let mut index = IndexLockTable::<String>::new(IndexSpec::unique());
        let key = Value::string("alice");

        assert_eq!(
            index.check_and_lock(&key, ptr(1), requester(1)),
            Ok(LockState::IndexLock)
        );
        assert_eq!(
            index.check_and_lock(&key, ptr(2), requester(2)),
            Ok(LockState::IndexPending)
        );
        assert_eq!(index.queue_len(&key), 1);

        let entry = index.entry(&key).unwrap();
        assert_eq!(entry.holder, Some(SubtransactionId(1)));
        assert_eq!(entry.pointer, ptr(1));
    }

    #[test]
    fn test_same_holder_revisit() {
        let mut index = IndexLockTable::<i64>::new(IndexSpec::unique());
        index.check_and_lock(&Value::Int(5), ptr(1), requester(1)).unwrap();
        assert_eq!(
            index.check_and_lock(&Value::Int(5), ptr(1), requester(1)),
            Ok(LockState::IndexPending)
        );
        assert_eq!(index.queue_len(&Value::Int(5)), 0);
    }

    #[test]
    fn test_commit_then_violation() {
        let mut index = IndexLockTable::<i64>::new(IndexSpec::unique());
        let key = Value::Int(42);
        index.check_and_lock(&key, ptr(1), requester(1)).unwrap();
        index.check_and_lock(&key, ptr(2), requester(2)).unwrap();

        let grants = index
            .commit_rollback(&key, SubtransactionId(1), EngineCmd::Commit)
            .unwrap();
        assert_eq!(grants.len(), 1);
        assert_eq!(grants[0].state, LockState::PendingToIndexNoLock);
        assert_eq!(grants[0].requester.subtransaction, SubtransactionId(2));

        let entry = index.entry(&key).unwrap();
        assert_eq!(entry.holder, None);
        assert_eq!(entry.previous_subtransaction, Some(SubtransactionId(1)));

        assert_eq!(
            index.check_and_lock(&key, ptr(3), requester(3)),
            Ok(LockState::NoLock)
        );
    }

    #[test]
    fn test_rollback_hands_key_to_next_waiter() {
        let mut index = IndexLockTable::<u64>::new(IndexSpec::unordered());
        let key = Value::UInt(7);
        index.check_and_lock(&key, ptr(1), requester(1)).unwrap();
        index.check_and_lock(&key, ptr(2), requester(2)).unwrap();
        index.check_and_lock(&key, ptr(3), requester(3)).unwrap();

        let grants = index
            .commit_rollback(&key, SubtransactionId(1), EngineCmd::Rollback)
            .unwrap();
        assert_eq!(grants.len(), 1);
        assert_eq!(grants[0].state, LockState::PendingToIndexLock);

        let entry = index.entry(&key).unwrap();
        assert_eq!(entry.holder, Some(SubtransactionId(2)));
        assert_eq!(entry.pointer, ptr(2));
        assert_eq!(index.queue_len(&key), 1);
    }

    #[test]
    fn test_rollback_without_waiters_erases_key() {
        let mut index = IndexLockTable::<bool>::new(IndexSpec::unique());
        let key = Value::Bool(true);
        index.check_and_lock(&key, ptr(1), requester(1)).unwrap();
        index
            .commit_rollback(&key, SubtransactionId(1), EngineCmd::Rollback)
            .unwrap();
        assert!(index.entry(&key).is_none());

        assert_eq!(
            index.commit_rollback(&key, SubtransactionId(1), EngineCmd::Rollback),
            Ok(vec![])
        );
        assert_eq!(
            index.check_and_lock(&key, ptr(2), requester(2)),
            Ok(LockState::IndexLock)
        );
    }

    #[test]
    fn test_rollback_of_queued_waiter() {
        let mut index = IndexLockTable::<char>::new(IndexSpec::unique());
        let key = Value::Char('q');
        index.check_and_lock(&key, ptr(1), requester(1)).unwrap();
        index.check_and_lock(&key, ptr(2), requester(2)).unwrap();

        assert_eq!(
            index.commit_rollback(&key, SubtransactionId(2), EngineCmd::Rollback),
            Ok(vec![])
        );
        assert_eq!(index.queue_len(&key), 0);
        assert_eq!(index.entry(&key).unwrap().holder, Some(SubtransactionId(1)));
    }

    #[test]
    fn test_wrong_holder_refused() {
        let mut index = IndexLockTable::<i64>::new(IndexSpec::unique());
        let key = Value::Int(1);
        index.check_and_lock(&key, ptr(1), requester(1)).unwrap();

        assert!(matches!(
            index.commit_rollback(&key, SubtransactionId(9), EngineCmd::Commit),
            Err(IndexError::NotHolder { .. })
        ));
        assert!(matches!(
            index.commit_rollback(&key, SubtransactionId(9), EngineCmd::Rollback),
            Err(IndexError::NotHolder { .. })
        ));
        assert_eq!(
            index.commit_rollback(&key, SubtransactionId(1), EngineCmd::Revert),
            Err(IndexError::UnsupportedCommand(EngineCmd::Revert))
        );
        assert_eq!(index.entry(&key).unwrap().holder, Some(SubtransactionId(1)));
    }

    #[test]
    fn test_shape_and_type_checks() {
        let mut nonunique = IndexLockTable::<i64>::new(IndexSpec::nonunique());
        assert_eq!(
            nonunique.check_and_lock(&Value::Int(1), ptr(1), requester(1)),
            Err(IndexError::WrongShape { expected: "unique" })
        );

        let mut unique = IndexLockTable::<i64>::new(IndexSpec::unique());
        assert!(matches!(
            unique.check_and_lock(&Value::string("x"), ptr(1), requester(1)),
            Err(IndexError::TypeMismatch { .. })
        ));
        assert_eq!(
            unique.apply(&IndexChange::InsertNonunique {
                key: Value::Int(1),
                entry: ptr(1),
            }),
            Err(IndexError::WrongShape {
                expected: "non-unique"
            })
        );
    }

    #[test]
    fn test_nonunique_maintenance() {
        let mut index = IndexLockTable::<i64>::new(IndexSpec::nonunique());
        index
            .apply(&IndexChange::InsertNonunique {
                key: Value::Int(3),
                entry: ptr(1),
            })
            .unwrap();
        index
            .apply(&IndexChange::InsertNonunique {
                key: Value::Int(3),
                entry: ptr(2),
            })
            .unwrap();
        index
            .apply(&IndexChange::ReplaceNonunique {
                key: Value::Int(3),
                old: ptr(1),
                new: ptr(9),
            })
            .unwrap();
        index
            .apply(&IndexChange::DeleteNonunique {
                key: Value::Int(3),
                entry: ptr(2),
            })
            .unwrap();

        match &index.entries {
            Entries::NonUnique(map) => {
                let set: Vec<_> = map[&3].iter().copied().collect();
                assert_eq!(set, vec![ptr(9)]);
            }
            _ => panic!("expected a multimap"),
        }
    }

    #[test]
    fn test_null_entries() {
        let mut index = IndexLockTable::<String>::new(IndexSpec::nonunique());
        index.apply(&IndexChange::InsertNull { entry: ptr(1) }).unwrap();
        index
            .apply(&IndexChange::ReplaceNull {
                old: ptr(1),
                new: ptr(2),
            })
            .unwrap();
        assert_eq!(index.nulls().copied().collect::<Vec<_>>(), vec![ptr(2)]);

        let mut strict = IndexLockTable::<String>::new(IndexSpec::unique().not_null());
        assert_eq!(
            strict.apply(&IndexChange::InsertNull { entry: ptr(1) }),
            Err(IndexError::NullNotAllowed)
        );
    }

    #[test]
    fn test_replace_unique_moves_pointer() {
        let mut index = IndexLockTable::<i64>::new(IndexSpec::unique());
        let key = Value::Int(10);
        index.check_and_lock(&key, ptr(1), requester(1)).unwrap();
        index
            .commit_rollback(&key, SubtransactionId(1), EngineCmd::Commit)
            .unwrap();

        index
            .apply(&IndexChange::ReplaceUnique {
                key: key.clone(),
                entry: RowPointer::new(RowId(5), PartitionId(3)),
            })
            .unwrap();
        assert_eq!(
            index.entry(&key).unwrap().pointer,
            RowPointer::new(RowId(5), PartitionId(3))
        );

        index.apply(&IndexChange::DeleteUnique { key: key.clone() }).unwrap();
        assert!(index.entry(&key).is_none());
    }
}
