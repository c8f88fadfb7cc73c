//! Partition-local and schema identifiers

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! numeric_id {
    ($(#[$meta:meta])* $name:ident($inner:ty)) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        pub struct $name(pub $inner);

        impl $name {
            pub fn get(self) -> $inner {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<$inner> for $name {
            fn from(v: $inner) -> Self {
                Self(v)
            }
        }
    };
}

numeric_id!(
    /// A transaction's lock-holder token inside one partition
    SubtransactionId(u64)
);
numeric_id!(
    /// Partition ("engine") identifier
    PartitionId(u32)
);
numeric_id!(TableId(u32));
numeric_id!(FieldId(u32));
numeric_id!(
    /// Row identifier, unique within one table on one partition
    RowId(u64)
);
numeric_id!(
    /// Identifies one pending primitive of a transaction; replies carrying a
    /// stale id are discarded
    CommandId(u64)
);

impl CommandId {
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}
