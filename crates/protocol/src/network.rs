//! Address book for every actor in one cluster

use crate::{DeadlockAbort, DeadlockEvent, PartitionReply, PartitionRequest};
use infini_common::{FieldId, PartitionId, TransactionId};
use infini_transport::{Registry, Result};
use infini_value::Value;
use std::hash::{DefaultHasher, Hash, Hasher};

/// Everything another actor may send to a transaction coordinator
#[derive(Debug, Clone, PartialEq)]
pub enum CoordinatorEvent {
    Reply(PartitionReply),
    Abort(DeadlockAbort),
}

/// Routes for partitions, coordinators (addressed by transaction id) and the
/// single deadlock manager
#[derive(Clone)]
pub struct Network {
    partitions: Registry<PartitionId, PartitionRequest>,
    coordinators: Registry<TransactionId, CoordinatorEvent>,
    deadlock: Registry<(), DeadlockEvent>,
    partition_count: u32,
}

impl Network {
    pub fn new(partition_count: u32) -> Self {
        Self {
            partitions: Registry::new(),
            coordinators: Registry::new(),
            deadlock: Registry::new(),
            partition_count: partition_count.max(1),
        }
    }

    pub fn partition_count(&self) -> u32 {
        self.partition_count
    }

    pub fn partition_ids(&self) -> impl Iterator<Item = PartitionId> + use<> {
        (0..self.partition_count).map(PartitionId)
    }

    pub fn partitions(&self) -> &Registry<PartitionId, PartitionRequest> {
        &self.partitions
    }

    pub fn coordinators(&self) -> &Registry<TransactionId, CoordinatorEvent> {
        &self.coordinators
    }

    pub fn deadlock(&self) -> &Registry<(), DeadlockEvent> {
        &self.deadlock
    }

    pub fn send_to_partition(&self, partition: PartitionId, request: PartitionRequest) -> Result<()> {
        self.partitions.send(&partition, request)
    }

    pub fn send_to_coordinator(&self, transaction: TransactionId, event: CoordinatorEvent) -> Result<()> {
        self.coordinators.send(&transaction, event)
    }

    pub fn send_to_deadlock(&self, event: DeadlockEvent) -> Result<()> {
        self.deadlock.send(&(), event)
    }

    /// Partition owning the index entry for a non-null key
    pub fn partition_for_key(&self, key: &Value) -> PartitionId {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        PartitionId((hasher.finish() % u64::from(self.partition_count)) as u32)
    }

    /// Partition owning the null entries of an indexed field
    pub fn partition_for_null(&self, field: FieldId) -> PartitionId {
        PartitionId(field.0 % self.partition_count)
    }
}
