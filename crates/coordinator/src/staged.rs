//! Rows this transaction has locked or changed
//!
//! Doubles as the read-your-own-writes cache: a row already staged here is
//! served locally instead of being locked again.

use infini_common::{FieldId, LockType, UuRecord};
use infini_value::Value;
use std::collections::{BTreeMap, HashMap};

/// Pending change to a staged row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StagedCommand {
    /// Locked but unchanged
    Untouched,
    Insert,
    Update,
    Delete,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StagedRow {
    pub lock: LockType,
    pub command: StagedCommand,
    /// Committed field values; `None` for rows this transaction inserted
    pub original: Option<Vec<Value>>,
    /// Staged field values for inserts and updates
    pub current: Option<Vec<Value>>,
    /// Unique keys this transaction locked on behalf of the row
    pub keys: BTreeMap<FieldId, Value>,
    pub moved_to: Option<UuRecord>,
    pub moved_from: Option<UuRecord>,
}

impl StagedRow {
    pub fn locked(lock: LockType, original: Vec<Value>) -> Self {
        Self {
            lock,
            command: StagedCommand::Untouched,
            original: Some(original),
            current: None,
            keys: BTreeMap::new(),
            moved_to: None,
            moved_from: None,
        }
    }

    pub fn inserted(values: Vec<Value>) -> Self {
        Self {
            lock: LockType::WriteLock,
            command: StagedCommand::Insert,
            original: None,
            current: Some(values),
            keys: BTreeMap::new(),
            moved_to: None,
            moved_from: None,
        }
    }

    /// Values this transaction sees; `None` once deleted
    pub fn visible(&self) -> Option<&[Value]> {
        match self.command {
            StagedCommand::Delete => None,
            StagedCommand::Insert | StagedCommand::Update => self.current.as_deref(),
            StagedCommand::Untouched => self.original.as_deref(),
        }
    }

    /// Whether a request for `lock` can be answered from here
    pub fn covers(&self, lock: LockType) -> bool {
        match lock {
            LockType::NoLock => true,
            LockType::ReadLock => self.lock != LockType::NoLock,
            LockType::WriteLock => self.lock == LockType::WriteLock,
        }
    }

    pub fn is_writable(&self) -> bool {
        self.lock == LockType::WriteLock && self.command != StagedCommand::Delete
    }
}

/// Staged rows keyed by identity
#[derive(Debug, Default)]
pub struct StagedRows {
    rows: HashMap<UuRecord, StagedRow>,
}

impl StagedRows {
    pub fn get(&self, uur: &UuRecord) -> Option<&StagedRow> {
        self.rows.get(uur)
    }

    pub fn get_mut(&mut self, uur: &UuRecord) -> Option<&mut StagedRow> {
        self.rows.get_mut(uur)
    }

    pub fn insert(&mut self, uur: UuRecord, row: StagedRow) {
        self.rows.insert(uur, row);
    }

    pub fn remove(&mut self, uur: &UuRecord) -> Option<StagedRow> {
        self.rows.remove(uur)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&UuRecord, &StagedRow)> {
        self.rows.iter()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn clear(&mut self) {
        self.rows.clear();
    }

    /// Record a lock granted by a partition, keeping any existing change
    pub fn lock(&mut self, uur: UuRecord, lock: LockType, original: Vec<Value>) {
        match self.rows.get_mut(&uur) {
            Some(row) => {
                if lock == LockType::WriteLock {
                    row.lock = LockType::WriteLock;
                }
            }
            None => {
                self.rows.insert(uur, StagedRow::locked(lock, original));
            }
        }
    }

    /// Committed location and values a row started from, following moves
    /// back to the first staged location
    pub fn origin(&self, uur: UuRecord) -> Option<(UuRecord, &[Value])> {
        let mut at = uur;
        // a chain of moves cannot be longer than the map
        for _ in 0..=self.rows.len() {
            let row = self.rows.get(&at)?;
            match row.moved_from {
                Some(previous) => at = previous,
                None => return row.original.as_deref().map(|values| (at, values)),
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use infini_common::{PartitionId, RowId, TableId};

    fn uur(rowid: u64, partition: u32) -> UuRecord {
        UuRecord::new(RowId(rowid), TableId(1), PartitionId(partition))
    }

    #[test]
    fn test_visibility_follows_command() {
        let mut row = StagedRow::locked(LockType::WriteLock, vec![Value::Int(1)]);
        assert_eq!(row.visible(), Some(&[Value::Int(1)][..]));

        row.command = StagedCommand::Update;
        row.current = Some(vec![Value::Int(2)]);
        assert_eq!(row.visible(), Some(&[Value::Int(2)][..]));

        row.command = StagedCommand::Delete;
        assert_eq!(row.visible(), None);
        assert!(!row.is_writable());
    }

    #[test]
    fn test_lock_coverage() {
        let read = StagedRow::locked(LockType::ReadLock, vec![]);
        assert!(read.covers(LockType::ReadLock));
        assert!(!read.covers(LockType::WriteLock));
        assert!(StagedRow::inserted(vec![]).covers(LockType::WriteLock));
    }

    #[test]
    fn test_lock_upgrades_but_keeps_changes() {
        let mut staged = StagedRows::default();
        staged.lock(uur(1, 0), LockType::ReadLock, vec![Value::Int(1)]);
        staged.lock(uur(1, 0), LockType::WriteLock, vec![Value::Int(9)]);

        let row = staged.get(&uur(1, 0)).unwrap();
        assert_eq!(row.lock, LockType::WriteLock);
        assert_eq!(row.original, Some(vec![Value::Int(1)]));
    }

    #[test]
    fn test_origin_follows_moves() {
        let mut staged = StagedRows::default();
        let mut first = StagedRow::locked(LockType::WriteLock, vec![Value::Int(1)]);
        first.command = StagedCommand::Delete;
        first.moved_to = Some(uur(5, 1));
        staged.insert(uur(1, 0), first);

        let mut second = StagedRow::inserted(vec![Value::Int(2)]);
        second.moved_from = Some(uur(1, 0));
        staged.insert(uur(5, 1), second);

        assert_eq!(staged.origin(uur(5, 1)), Some((uur(1, 0), &[Value::Int(1)][..])));
        assert_eq!(staged.origin(uur(7, 0)), None);

        staged.insert(uur(8, 0), StagedRow::inserted(vec![]));
        assert_eq!(staged.origin(uur(8, 0)), None);
    }
}
