//! Subscriber partitioning.
//!
//! Every subscriber maps to exactly one partition, and each partition is drained
//! by one task, so all mutations of a subscriber are applied in arrival order
//! without locking. The mapping hashes the subscriber id with blake3 and is stable
//! across processes and restarts.

use quotagate_policy::SubscriberId;

use crate::event::AccountingEvent;

/// Work item for a partition.
#[derive(Clone, Debug)]
pub enum PartitionMessage {
    /// Ingest an accounting record.
    Event(AccountingEvent),
    /// Re-run rollover and resolution without new usage.
    Reevaluate(SubscriberId),
}

impl PartitionMessage {
    /// Subscriber the message belongs to.
    pub fn subscriber(&self) -> SubscriberId {
        match self {
            PartitionMessage::Event(event) => event.subscriber_id,
            PartitionMessage::Reevaluate(id) => *id,
        }
    }
}

/// Maps subscribers to partitions.
#[derive(Clone, Copy, Debug)]
pub struct PartitionRouter {
    partitions: usize,
}

impl PartitionRouter {
    /// Creates a router over `partitions` partitions (at least one).
    pub fn new(partitions: usize) -> Self {
        Self {
            partitions: partitions.max(1),
        }
    }

    /// Number of partitions.
    pub fn partitions(&self) -> usize {
        self.partitions
    }

    /// Partition owning `subscriber`.
    pub fn partition_for(&self, subscriber: SubscriberId) -> usize {
        let hash = blake3::hash(&subscriber.as_u64().to_le_bytes());
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&hash.as_bytes()[..8]);
        (u64::from_le_bytes(prefix) % self.partitions as u64) as usize
    }
}
