//! Read-only index scans
//!
//! Scans never take locks. They return every entry whose key matches,
//! staged or committed; the caller locks the rows it wants afterwards.

use super::key::IndexKey;
use super::table::{Entries, IndexLockTable, Result};
use crate::error::IndexError;
use infini_protocol::{CompareOp, IndexSearch, RowPointer};
use infini_value::{Value, ValueType};
use regex::Regex;
use std::collections::BTreeSet;
use std::ops::{Bound, RangeBounds};
use tracing::warn;

/// Translate a SQL LIKE pattern into an anchored regular expression
pub fn like_to_regex(pattern: &str) -> String {
    let mut out = String::from("(?s)^");
    let mut buf = [0u8; 4];
    for c in pattern.chars() {
        match c {
            '%' => out.push_str(".*"),
            '_' => out.push('.'),
            c => out.push_str(&regex::escape(c.encode_utf8(&mut buf))),
        }
    }
    out.push('$');
    out
}

fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|e| IndexError::InvalidPattern(e.to_string()))
}

impl<K: IndexKey> IndexLockTable<K> {
    pub fn search(&self, search: &IndexSearch) -> Result<Vec<RowPointer>> {
        let hits = match search {
            IndexSearch::All => {
                let mut hits = self.collect_where(|_| true);
                hits.extend(self.nulls.iter().copied());
                hits
            }
            IndexSearch::NotNulls => self.collect_where(|_| true),
            IndexSearch::Nulls => self.nulls.iter().copied().collect(),
            IndexSearch::Equal(v) => match self.scan_key(v) {
                Some(k) => self.collect_range((Bound::Included(&k), Bound::Included(&k))),
                None => Vec::new(),
            },
            IndexSearch::NotEqual(v) => match self.scan_key(v) {
                Some(k) => self.collect_where(|key| *key != k),
                None => Vec::new(),
            },
            IndexSearch::In(values) => {
                let keys: BTreeSet<K> = values.iter().filter_map(|v| self.scan_key(v)).collect();
                self.collect_where(|key| keys.contains(key))
            }
            IndexSearch::NotIn(values) => {
                let keys: BTreeSet<K> = values.iter().filter_map(|v| self.scan_key(v)).collect();
                self.collect_where(|key| !keys.contains(key))
            }
            IndexSearch::Compare(op, v) => match self.scan_key(v) {
                Some(k) => {
                    let range = match op {
                        CompareOp::Lt => (Bound::Unbounded, Bound::Excluded(&k)),
                        CompareOp::Lte => (Bound::Unbounded, Bound::Included(&k)),
                        CompareOp::Gt => (Bound::Excluded(&k), Bound::Unbounded),
                        CompareOp::Gte => (Bound::Included(&k), Bound::Unbounded),
                    };
                    self.collect_range(range)
                }
                None => Vec::new(),
            },
            IndexSearch::Between(lo, hi) => match (self.scan_key(lo), self.scan_key(hi)) {
                (Some(lo), Some(hi)) if lo <= hi => {
                    self.collect_range((Bound::Included(&lo), Bound::Included(&hi)))
                }
                _ => Vec::new(),
            },
            IndexSearch::NotBetween(lo, hi) => match (self.scan_key(lo), self.scan_key(hi)) {
                (Some(lo), Some(hi)) => self.collect_where(|key| *key < lo || *key > hi),
                _ => Vec::new(),
            },
            IndexSearch::Regex(pattern) => {
                let re = compile(pattern)?;
                self.collect_text(|text| re.is_match(text))
            }
            IndexSearch::Like(pattern) => {
                let re = compile(&like_to_regex(pattern))?;
                self.collect_text(|text| re.is_match(text))
            }
            IndexSearch::NotLike(pattern) => {
                let re = compile(&like_to_regex(pattern))?;
                self.collect_text(|text| !re.is_match(text))
            }
        };
        Ok(hits)
    }

    /// Key for a scan operand; mismatched operands match nothing
    fn scan_key(&self, value: &Value) -> Option<K> {
        let key = K::from_value(value);
        if key.is_none() {
            warn!(
                "Index scan over {} keys given operand {}, no match",
                K::VALUE_TYPE,
                value
            );
        }
        key
    }

    fn collect_text(&self, keep: impl Fn(&str) -> bool) -> Vec<RowPointer> {
        if !matches!(K::VALUE_TYPE, ValueType::Char | ValueType::Str) {
            warn!("Pattern scan over {} keys, no match", K::VALUE_TYPE);
            return Vec::new();
        }
        self.collect_where(|key| key.text().is_some_and(|t| keep(&t)))
    }

    fn collect_where(&self, keep: impl Fn(&K) -> bool) -> Vec<RowPointer> {
        match &self.entries {
            Entries::Unique(map) => map
                .iter()
                .filter(|(k, _)| keep(k))
                .map(|(_, e)| e.pointer)
                .collect(),
            Entries::Unordered(map) => map
                .iter()
                .filter(|(k, _)| keep(k))
                .map(|(_, e)| e.pointer)
                .collect(),
            Entries::NonUnique(map) => map
                .iter()
                .filter(|(k, _)| keep(k))
                .flat_map(|(_, set)| set.iter().copied())
                .collect(),
        }
    }

    fn collect_range(&self, range: (Bound<&K>, Bound<&K>)) -> Vec<RowPointer> {
        match &self.entries {
            Entries::Unique(map) => map.range::<K, _>(range).map(|(_, e)| e.pointer).collect(),
            Entries::NonUnique(map) => map
                .range::<K, _>(range)
                .flat_map(|(_, set)| set.iter().copied())
                .collect(),
            Entries::Unordered(_) => self.collect_where(|key| range.contains(key)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock_queue::Requester;
    use infini_common::{
        CommandId, IndexSpec, PartitionId, RowId, SubtransactionId, TransactionId,
    };
    use infini_protocol::{Continuation, EngineCmd, IndexChange, ReplyTag};

    fn ptr(rowid: u64) -> RowPointer {
        RowPointer::new(RowId(rowid), PartitionId(0))
    }

    fn rowids(hits: Vec<RowPointer>) -> Vec<u64> {
        let mut ids: Vec<u64> = hits.into_iter().map(|p| p.rowid.0).collect();
        ids.sort();
        ids
    }

    fn committed_unique<K: IndexKey>(spec: IndexSpec, keys: &[Value]) -> IndexLockTable<K> {
        let mut index = IndexLockTable::<K>::new(spec);
        for (i, key) in keys.iter().enumerate() {
            let requester = Requester {
                subtransaction: SubtransactionId(1),
                transaction: TransactionId::new(),
                tag: ReplyTag::new(CommandId(1), Continuation::InsertUniqueIndex),
            };
            index
                .check_and_lock(key, ptr(i as u64 + 1), requester)
                .unwrap();
            index
                .commit_rollback(key, SubtransactionId(1), EngineCmd::Commit)
                .unwrap();
        }
        index
    }

    fn ints() -> IndexLockTable<i64> {
        let keys: Vec<Value> = [10, 20, 30, 40].into_iter().map(Value::Int).collect();
        let mut index = committed_unique::<i64>(IndexSpec::unique(), &keys);
        index.apply(&IndexChange::InsertNull { entry: ptr(99) }).unwrap();
        index
    }

    #[test]
    fn test_like_translation() {
        assert_eq!(like_to_regex("a%b_"), "(?s)^a.*b.$");
        assert_eq!(like_to_regex("1.5%"), "(?s)^1\\.5.*$");
    }

    #[test]
    fn test_equality_scans() {
        let index = ints();
        assert_eq!(rowids(index.search(&IndexSearch::Equal(Value::Int(20))).unwrap()), vec![2]);
        assert_eq!(
            rowids(index.search(&IndexSearch::NotEqual(Value::Int(20))).unwrap()),
            vec![1, 3, 4]
        );
        assert_eq!(
            rowids(
                index
                    .search(&IndexSearch::In(vec![Value::Int(10), Value::Int(40), Value::Int(7)]))
                    .unwrap()
            ),
            vec![1, 4]
        );
        assert_eq!(
            rowids(index.search(&IndexSearch::NotIn(vec![Value::Int(10)])).unwrap()),
            vec![2, 3, 4]
        );
    }

    #[test]
    fn test_range_scans() {
        let index = ints();
        assert_eq!(
            rowids(index.search(&IndexSearch::Compare(CompareOp::Lt, Value::Int(30))).unwrap()),
            vec![1, 2]
        );
        assert_eq!(
            rowids(index.search(&IndexSearch::Compare(CompareOp::Gte, Value::Int(30))).unwrap()),
            vec![3, 4]
        );
        assert_eq!(
            rowids(
                index
                    .search(&IndexSearch::Between(Value::Int(15), Value::Int(30)))
                    .unwrap()
            ),
            vec![2, 3]
        );
        assert_eq!(
            rowids(
                index
                    .search(&IndexSearch::NotBetween(Value::Int(15), Value::Int(30)))
                    .unwrap()
            ),
            vec![1, 4]
        );
        // inverted bounds are empty rather than a panic
        assert!(
            index
                .search(&IndexSearch::Between(Value::Int(30), Value::Int(15)))
                .unwrap()
                .is_empty()
        );
    }

    #[test]
    fn test_null_scans() {
        let index = ints();
        assert_eq!(rowids(index.search(&IndexSearch::Nulls).unwrap()), vec![99]);
        assert_eq!(rowids(index.search(&IndexSearch::NotNulls).unwrap()), vec![1, 2, 3, 4]);
        assert_eq!(rowids(index.search(&IndexSearch::All).unwrap()), vec![1, 2, 3, 4, 99]);
    }

    #[test]
    fn test_unordered_scans_filter() {
        let keys: Vec<Value> = [5u64, 1, 9].into_iter().map(Value::UInt).collect();
        let index = committed_unique::<u64>(IndexSpec::unordered(), &keys);
        assert_eq!(
            rowids(index.search(&IndexSearch::Compare(CompareOp::Gt, Value::UInt(4))).unwrap()),
            vec![1, 3]
        );
        assert_eq!(
            rowids(index.search(&IndexSearch::Equal(Value::UInt(1))).unwrap()),
            vec![2]
        );
    }

    #[test]
    fn test_pattern_scans() {
        let keys: Vec<Value> = ["apple", "apricot", "banana", "a.c"]
            .into_iter()
            .map(Value::string)
            .collect();
        let index = committed_unique::<String>(IndexSpec::unique(), &keys);

        assert_eq!(
            rowids(index.search(&IndexSearch::Like("ap%".into())).unwrap()),
            vec![1, 2]
        );
        assert_eq!(
            rowids(index.search(&IndexSearch::Like("a_c".into())).unwrap()),
            vec![4]
        );
        assert_eq!(
            rowids(index.search(&IndexSearch::NotLike("ap%".into())).unwrap()),
            vec![3, 4]
        );
        assert_eq!(
            rowids(index.search(&IndexSearch::Regex("an+a$".into())).unwrap()),
            vec![3]
        );
        assert!(matches!(
            index.search(&IndexSearch::Regex("(".into())),
            Err(IndexError::InvalidPattern(_))
        ));
    }

    #[test]
    fn test_mismatched_operands_match_nothing() {
        let index = ints();
        assert!(index.search(&IndexSearch::Equal(Value::string("10"))).unwrap().is_empty());
        assert!(index.search(&IndexSearch::Like("1%".into())).unwrap().is_empty());
    }
}
