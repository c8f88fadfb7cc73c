//! Index lock tables
//!
//! One `IndexLockTable<K>` exists per indexed field on each partition. The
//! field's column type picks `K` when the catalog is loaded; `Index` erases
//! it so the engine can keep every field's table in one map.

mod key;
mod search;
mod table;

pub use key::IndexKey;
pub use search::like_to_regex;
pub use table::{IndexEntry, IndexLockTable};

use crate::error::IndexError;
use crate::lock_queue::Requester;
use infini_common::{IndexSpec, LockState, SubtransactionId};
use infini_protocol::{EngineCmd, IndexChange, IndexSearch, RowPointer};
use infini_value::{FloatKey, Value, ValueType};

/// Queued index request that has just been resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexGrant {
    pub requester: Requester,
    pub state: LockState,
}

#[derive(Debug)]
pub enum Index {
    Int(IndexLockTable<i64>),
    UInt(IndexLockTable<u64>),
    Bool(IndexLockTable<bool>),
    Float(IndexLockTable<FloatKey>),
    Char(IndexLockTable<char>),
    Str(IndexLockTable<String>),
}

macro_rules! dispatch {
    ($index:expr, $table:ident => $body:expr) => {
        match $index {
            Index::Int($table) => $body,
            Index::UInt($table) => $body,
            Index::Bool($table) => $body,
            Index::Float($table) => $body,
            Index::Char($table) => $body,
            Index::Str($table) => $body,
        }
    };
}

impl Index {
    pub fn new(value_type: ValueType, spec: IndexSpec) -> Self {
        match value_type {
            ValueType::Int => Index::Int(IndexLockTable::new(spec)),
            ValueType::UInt => Index::UInt(IndexLockTable::new(spec)),
            ValueType::Bool => Index::Bool(IndexLockTable::new(spec)),
            ValueType::Float => Index::Float(IndexLockTable::new(spec)),
            ValueType::Char => Index::Char(IndexLockTable::new(spec)),
            ValueType::Str => Index::Str(IndexLockTable::new(spec)),
        }
    }

    pub fn spec(&self) -> IndexSpec {
        dispatch!(self, t => t.spec())
    }

    pub fn value_type(&self) -> ValueType {
        match self {
            Index::Int(_) => ValueType::Int,
            Index::UInt(_) => ValueType::UInt,
            Index::Bool(_) => ValueType::Bool,
            Index::Float(_) => ValueType::Float,
            Index::Char(_) => ValueType::Char,
            Index::Str(_) => ValueType::Str,
        }
    }

    pub fn check_and_lock(
        &mut self,
        key: &Value,
        pointer: RowPointer,
        requester: Requester,
    ) -> Result<LockState, IndexError> {
        dispatch!(self, t => t.check_and_lock(key, pointer, requester))
    }

    pub fn commit_rollback(
        &mut self,
        key: &Value,
        subtransaction: SubtransactionId,
        cmd: EngineCmd,
    ) -> Result<Vec<IndexGrant>, IndexError> {
        dispatch!(self, t => t.commit_rollback(key, subtransaction, cmd))
    }

    pub fn apply(&mut self, change: &IndexChange) -> Result<(), IndexError> {
        dispatch!(self, t => t.apply(change))
    }

    pub fn search(&self, search: &IndexSearch) -> Result<Vec<RowPointer>, IndexError> {
        dispatch!(self, t => t.search(search))
    }

    pub fn entry(&self, key: &Value) -> Option<IndexEntry> {
        dispatch!(self, t => t.entry(key))
    }

    pub fn queue_len(&self, key: &Value) -> usize {
        dispatch!(self, t => t.queue_len(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use infini_common::{CommandId, PartitionId, RowId, TransactionId};
    use infini_protocol::{Continuation, ReplyTag};

    #[test]
    fn test_column_type_selects_key() {
        let index = Index::new(ValueType::Float, IndexSpec::unique());
        assert_eq!(index.value_type(), ValueType::Float);
        assert_eq!(index.spec(), IndexSpec::unique());
    }

    #[test]
    fn test_float_keys_lock() {
        let mut index = Index::new(ValueType::Float, IndexSpec::unique());
        let requester = Requester {
            subtransaction: SubtransactionId(4),
            transaction: TransactionId::new(),
            tag: ReplyTag::new(CommandId(1), Continuation::InsertUniqueIndex),
        };
        let pointer = RowPointer::new(RowId(1), PartitionId(0));

        assert_eq!(
            index.check_and_lock(&Value::Float(2.5), pointer, requester),
            Ok(LockState::IndexLock)
        );
        assert_eq!(
            index.entry(&Value::Float(2.5)).map(|e| e.holder),
            Some(Some(SubtransactionId(4)))
        );
        assert!(matches!(
            index.check_and_lock(&Value::Int(2), pointer, requester),
            Err(IndexError::TypeMismatch {
                expected: ValueType::Float,
                ..
            })
        ));
    }

    #[test]
    fn test_negative_zero_collides_with_zero() {
        let mut index = Index::new(ValueType::Float, IndexSpec::unique());
        let requester = |sub| Requester {
            subtransaction: SubtransactionId(sub),
            transaction: TransactionId::new(),
            tag: ReplyTag::new(CommandId(1), Continuation::InsertUniqueIndex),
        };
        let pointer = RowPointer::new(RowId(1), PartitionId(0));

        assert_eq!(
            index.check_and_lock(&Value::Float(0.0), pointer, requester(4)),
            Ok(LockState::IndexLock)
        );
        index
            .commit_rollback(&Value::Float(0.0), SubtransactionId(4), EngineCmd::Commit)
            .unwrap();
        assert_eq!(
            index.check_and_lock(&Value::Float(-0.0), pointer, requester(5)),
            Ok(LockState::NoLock)
        );
    }
}
