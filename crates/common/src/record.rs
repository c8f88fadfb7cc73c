use crate::{PartitionId, RowId, TableId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Globally unique row identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UuRecord {
    pub rowid: RowId,
    pub tableid: TableId,
    pub engineid: PartitionId,
}

impl UuRecord {
    pub fn new(rowid: RowId, tableid: TableId, engineid: PartitionId) -> Self {
        Self {
            rowid,
            tableid,
            engineid,
        }
    }
}

impl fmt::Display for UuRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "row {} table {} partition {}",
            self.rowid, self.tableid, self.engineid
        )
    }
}
