use std::time::Duration;

use async_trait::async_trait;

use crate::{OutboxMessage, Result};

/// A consumer registered in the outbox consumer group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerInfo {
    pub name: String,
    /// Entries delivered to this consumer and not yet acknowledged.
    pub pending: u64,
    pub idle: Duration,
}

/// Read side of the outbox stream, as used by the forwarder.
///
/// Every read hands entries to this instance's consumer. An entry stays
/// pending until [`OutboxStorage::acknowledge`] is called for it; if that
/// never happens it is eventually returned by
/// [`OutboxStorage::read_orphaned_batch`] on some consumer.
#[async_trait]
pub trait OutboxStorage: Send + Sync {
    /// Name of the consumer this instance reads as.
    fn consumer_name(&self) -> &str;

    /// Creates the stream and consumer group if they do not exist yet.
    async fn initialize(&self) -> Result<()>;

    /// Reads up to one batch of entries never delivered to any consumer.
    ///
    /// Returns `None`, never an empty batch, when nothing is available.
    async fn read_next_batch(&self) -> Result<Option<Vec<OutboxMessage>>>;

    /// Claims up to one batch of entries that have been pending longer than
    /// the orphaned message timeout.
    async fn read_orphaned_batch(&self) -> Result<Option<Vec<OutboxMessage>>>;

    /// Removes a delivered entry from the pending list.
    async fn acknowledge(&self, message: &OutboxMessage) -> Result<()>;

    /// Copies a message that can never be delivered to the dead letter
    /// stream and acknowledges it, so it is not read or reclaimed again.
    async fn dead_letter(&self, message: &OutboxMessage, reason: &str) -> Result<()>;

    /// Trims the stream to approximately `max_len` entries, oldest first.
    /// Returns the number of entries removed.
    async fn trim(&self, max_len: usize) -> Result<u64>;

    /// Trims entries that are older than every pending or undelivered entry.
    /// Returns the number of entries removed.
    async fn trim_acknowledged(&self) -> Result<u64>;

    /// Consumers idle for longer than the idle consumer timeout.
    async fn list_idle_consumers(&self) -> Result<Vec<ConsumerInfo>>;

    /// Deletes a consumer from the group.
    async fn remove_consumer(&self, name: &str) -> Result<()>;

    /// Number of entries delivered to any consumer and not yet acknowledged.
    async fn pending_count(&self) -> Result<u64>;
}
