//! Table catalog shared by every actor
//!
//! The catalog is built once before the cluster starts and handed to each
//! partition and coordinator behind an `Arc`. Nothing mutates it afterwards.

use crate::{FieldId, TableId};
use infini_value::{Value, ValueType};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum CatalogError {
    #[error("Unknown table: {0}")]
    UnknownTable(TableId),

    #[error("Unknown field {field} in table {table}")]
    UnknownField { table: TableId, field: FieldId },

    #[error("Table {table} expects {expected} fields, got {actual}")]
    Arity {
        table: TableId,
        expected: usize,
        actual: usize,
    },

    #[error("Field {field} of table {table} expects {expected}, got {actual}")]
    TypeMismatch {
        table: TableId,
        field: FieldId,
        expected: ValueType,
        actual: Value,
    },

    #[error("Field {field} of table {table} may not be null")]
    NullNotAllowed { table: TableId, field: FieldId },
}

/// Index shape on a field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IndexKind {
    /// Ordered, one row per key, locking
    Unique,
    /// Ordered multimap, never locked
    NonUnique,
    /// Hashed, one row per key, locking
    Unordered,
}

impl IndexKind {
    /// Whether entries take part in the locking protocol
    pub fn is_unique(self) -> bool {
        matches!(self, IndexKind::Unique | IndexKind::Unordered)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSpec {
    pub kind: IndexKind,
    pub not_null: bool,
}

impl IndexSpec {
    pub fn unique() -> Self {
        Self {
            kind: IndexKind::Unique,
            not_null: false,
        }
    }

    pub fn nonunique() -> Self {
        Self {
            kind: IndexKind::NonUnique,
            not_null: false,
        }
    }

    pub fn unordered() -> Self {
        Self {
            kind: IndexKind::Unordered,
            not_null: false,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.not_null = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSchema {
    pub id: FieldId,
    pub name: String,
    pub value_type: ValueType,
    pub index: Option<IndexSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    pub id: TableId,
    pub name: String,
    pub fields: Vec<FieldSchema>,
}

impl TableSchema {
    pub fn new(id: TableId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            fields: Vec::new(),
        }
    }

    /// Append a field; field ids follow declaration order
    pub fn with_field(
        mut self,
        name: impl Into<String>,
        value_type: ValueType,
        index: Option<IndexSpec>,
    ) -> Self {
        let id = FieldId(self.fields.len() as u32);
        self.fields.push(FieldSchema {
            id,
            name: name.into(),
            value_type,
            index,
        });
        self
    }

    pub fn field(&self, field: FieldId) -> Result<&FieldSchema, CatalogError> {
        self.fields
            .get(field.0 as usize)
            .ok_or(CatalogError::UnknownField {
                table: self.id,
                field,
            })
    }

    /// Fields that carry an index
    pub fn indexed_fields(&self) -> impl Iterator<Item = (&FieldSchema, IndexSpec)> {
        self.fields
            .iter()
            .filter_map(|f| f.index.map(|spec| (f, spec)))
    }

    /// Check arity, field types and not-null index constraints of a row
    pub fn validate_row(&self, row: &[Value]) -> Result<(), CatalogError> {
        if row.len() != self.fields.len() {
            return Err(CatalogError::Arity {
                table: self.id,
                expected: self.fields.len(),
                actual: row.len(),
            });
        }

        for (field, value) in self.fields.iter().zip(row) {
            if !value.fits(field.value_type) {
                return Err(CatalogError::TypeMismatch {
                    table: self.id,
                    field: field.id,
                    expected: field.value_type,
                    actual: value.clone(),
                });
            }
            if value.is_null() && field.index.is_some_and(|spec| spec.not_null) {
                return Err(CatalogError::NullNotAllowed {
                    table: self.id,
                    field: field.id,
                });
            }
        }

        Ok(())
    }
}

/// All tables known to the cluster
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Catalog {
    tables: BTreeMap<TableId, TableSchema>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table(mut self, table: TableSchema) -> Self {
        self.tables.insert(table.id, table);
        self
    }

    pub fn table(&self, id: TableId) -> Result<&TableSchema, CatalogError> {
        self.tables.get(&id).ok_or(CatalogError::UnknownTable(id))
    }

    pub fn tables(&self) -> impl Iterator<Item = &TableSchema> {
        self.tables.values()
    }
}
