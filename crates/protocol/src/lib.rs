//! Protocol definitions for partition, coordinator and deadlock-manager traffic
//!
//! This crate defines the typed messages every InfiniSQL actor exchanges and
//! the `Network` address book that routes them over the in-memory transport.

pub mod deadlock;
pub mod messages;
pub mod network;
pub mod responses;

pub use deadlock::{DeadlockAbort, DeadlockChange, DeadlockEvent, LockItem};
pub use messages::{
    CompareOp, Continuation, EngineCmd, IndexChange, IndexSearch, PartitionCommand,
    PartitionRequest, ReplyTag, RowPointer, TerminateItem,
};
pub use network::{CoordinatorEvent, Network};
pub use responses::{PartitionReply, ReplyBody, ReturnRow};
