//! Cross-partition deadlock detection for InfiniSQL
//!
//! No single partition can see a cycle that spans partitions, so every
//! coordinator that both holds and waits for locks reports its edges here.
//! The manager keeps a global wait-for graph, walks it on every new wait and
//! on a periodic sweep, and tells one coordinator per cycle to abort.

pub mod config;
pub mod graph;
pub mod manager;

pub use config::DeadlockConfig;
pub use graph::WaitForGraph;
pub use manager::DeadlockManager;
