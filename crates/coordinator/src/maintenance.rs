//! Index maintenance derived at commit
//!
//! Non-unique and null entries are never locked, so they are written only
//! when the transaction commits. Unique keys that changed were already
//! staged and locked by the primitive that changed them; here they only
//! need the committed old key removed, or the entry pointed at a row that
//! moved.

use infini_common::{FieldId, PartitionId, TableSchema};
use infini_protocol::{IndexChange, Network, RowPointer};
use infini_value::Value;

/// A row's committed image or its staged image, with the place it lives
pub type RowImage<'a> = (RowPointer, &'a [Value]);

/// Index changes turning `before` into `after` for every indexed field;
/// `moved` is set when the row now lives somewhere else than where its
/// unique keys were staged
pub fn index_changes(
    schema: &TableSchema,
    before: Option<RowImage<'_>>,
    after: Option<RowImage<'_>>,
    moved: bool,
) -> Vec<(FieldId, IndexChange)> {
    let mut changes = Vec::new();
    for (field, spec) in schema.indexed_fields() {
        let at = field.id.0 as usize;
        let old = before.and_then(|(ptr, values)| values.get(at).map(|v| (ptr, v)));
        let new = after.and_then(|(ptr, values)| values.get(at).map(|v| (ptr, v)));
        let unique = spec.kind.is_unique();

        let mut push = |change| changes.push((field.id, change));
        match (old, new) {
            (Some((old_ptr, o)), Some((new_ptr, n))) if o == n => {
                if old_ptr == new_ptr {
                    continue;
                }
                push(if o.is_null() {
                    IndexChange::ReplaceNull {
                        old: old_ptr,
                        new: new_ptr,
                    }
                } else if unique {
                    IndexChange::ReplaceUnique {
                        key: o.clone(),
                        entry: new_ptr,
                    }
                } else {
                    IndexChange::ReplaceNonunique {
                        key: o.clone(),
                        old: old_ptr,
                        new: new_ptr,
                    }
                });
            }
            (old, new) => {
                if let Some((old_ptr, o)) = old {
                    push(if o.is_null() {
                        IndexChange::DeleteNull { entry: old_ptr }
                    } else if unique {
                        IndexChange::DeleteUnique { key: o.clone() }
                    } else {
                        IndexChange::DeleteNonunique {
                            key: o.clone(),
                            entry: old_ptr,
                        }
                    });
                }
                if let Some((new_ptr, n)) = new {
                    if n.is_null() {
                        push(IndexChange::InsertNull { entry: new_ptr });
                    } else if unique {
                        // the staged key may still point where the row was
                        // when it got locked
                        if moved {
                            push(IndexChange::ReplaceUnique {
                                key: n.clone(),
                                entry: new_ptr,
                            });
                        }
                    } else {
                        push(IndexChange::InsertNonunique {
                            key: n.clone(),
                            entry: new_ptr,
                        });
                    }
                }
            }
        }
    }
    changes
}

/// Partition that owns the entry a change touches
pub fn placement(network: &Network, field: FieldId, change: &IndexChange) -> PartitionId {
    match change {
        IndexChange::InsertNonunique { key, .. }
        | IndexChange::DeleteNonunique { key, .. }
        | IndexChange::DeleteUnique { key }
        | IndexChange::ReplaceUnique { key, .. }
        | IndexChange::ReplaceNonunique { key, .. } => network.partition_for_key(key),
        IndexChange::InsertNull { .. }
        | IndexChange::DeleteNull { .. }
        | IndexChange::ReplaceNull { .. } => network.partition_for_null(field),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use infini_common::{IndexSpec, RowId, TableId};
    use infini_value::ValueType;

    fn schema() -> TableSchema {
        TableSchema::new(TableId(1), "people")
            .with_field("id", ValueType::Int, Some(IndexSpec::unique()))
            .with_field("city", ValueType::Str, Some(IndexSpec::nonunique()))
            .with_field("note", ValueType::Str, None)
    }

    fn ptr(rowid: u64, partition: u32) -> RowPointer {
        RowPointer::new(RowId(rowid), PartitionId(partition))
    }

    fn row(id: Value, city: Value) -> Vec<Value> {
        vec![id, city, Value::string("x")]
    }

    #[test]
    fn test_insert_writes_unlocked_entries_only() {
        let new = row(Value::Int(1), Value::string("Oslo"));
        let changes = index_changes(&schema(), None, Some((ptr(1, 0), &new)), false);
        assert_eq!(
            changes,
            vec![(
                FieldId(1),
                IndexChange::InsertNonunique {
                    key: Value::string("Oslo"),
                    entry: ptr(1, 0),
                }
            )]
        );
    }

    #[test]
    fn test_insert_with_nulls() {
        let new = row(Value::Null, Value::Null);
        let changes = index_changes(&schema(), None, Some((ptr(1, 0), &new)), false);
        assert_eq!(
            changes,
            vec![
                (FieldId(0), IndexChange::InsertNull { entry: ptr(1, 0) }),
                (FieldId(1), IndexChange::InsertNull { entry: ptr(1, 0) }),
            ]
        );
    }

    #[test]
    fn test_update_moves_changed_keys() {
        let old = row(Value::Int(1), Value::string("Oslo"));
        let new = row(Value::Int(2), Value::string("Oslo"));
        let changes = index_changes(&schema(), Some((ptr(1, 0), &old)), Some((ptr(1, 0), &new)), false);
        assert_eq!(
            changes,
            vec![(FieldId(0), IndexChange::DeleteUnique { key: Value::Int(1) })]
        );

        let new = row(Value::Int(1), Value::string("Rome"));
        let changes = index_changes(&schema(), Some((ptr(1, 0), &old)), Some((ptr(1, 0), &new)), false);
        assert_eq!(
            changes,
            vec![
                (
                    FieldId(1),
                    IndexChange::DeleteNonunique {
                        key: Value::string("Oslo"),
                        entry: ptr(1, 0),
                    }
                ),
                (
                    FieldId(1),
                    IndexChange::InsertNonunique {
                        key: Value::string("Rome"),
                        entry: ptr(1, 0),
                    }
                ),
            ]
        );
    }

    #[test]
    fn test_delete_removes_everything() {
        let old = row(Value::Int(1), Value::Null);
        let changes = index_changes(&schema(), Some((ptr(1, 0), &old)), None, false);
        assert_eq!(
            changes,
            vec![
                (FieldId(0), IndexChange::DeleteUnique { key: Value::Int(1) }),
                (FieldId(1), IndexChange::DeleteNull { entry: ptr(1, 0) }),
            ]
        );
    }

    #[test]
    fn test_moved_row_repoints_entries() {
        let old = row(Value::Int(1), Value::string("Oslo"));
        let new = row(Value::Int(3), Value::string("Oslo"));
        let changes = index_changes(&schema(), Some((ptr(1, 0), &old)), Some((ptr(7, 2), &new)), true);
        assert_eq!(
            changes,
            vec![
                (FieldId(0), IndexChange::DeleteUnique { key: Value::Int(1) }),
                (
                    FieldId(0),
                    IndexChange::ReplaceUnique {
                        key: Value::Int(3),
                        entry: ptr(7, 2),
                    }
                ),
                (
                    FieldId(1),
                    IndexChange::ReplaceNonunique {
                        key: Value::string("Oslo"),
                        old: ptr(1, 0),
                        new: ptr(7, 2),
                    }
                ),
            ]
        );
    }

    #[test]
    fn test_moved_insert_repoints_inherited_key() {
        let new = row(Value::Int(4), Value::Null);
        let changes = index_changes(&schema(), None, Some((ptr(3, 1), &new)), true);
        assert_eq!(
            changes[0],
            (
                FieldId(0),
                IndexChange::ReplaceUnique {
                    key: Value::Int(4),
                    entry: ptr(3, 1),
                }
            )
        );
        assert_eq!(changes[1], (FieldId(1), IndexChange::InsertNull { entry: ptr(3, 1) }));
    }

    #[test]
    fn test_placement() {
        let network = Network::new(4);
        let key = Value::Int(42);
        assert_eq!(
            placement(&network, FieldId(1), &IndexChange::DeleteUnique { key: key.clone() }),
            network.partition_for_key(&key)
        );
        assert_eq!(
            placement(&network, FieldId(6), &IndexChange::InsertNull { entry: ptr(1, 0) }),
            PartitionId(2)
        );
    }
}
