use transaction::{ScopedOperation, TransactionScope};

use crate::TransportMessage;
use crate::message::entry_fields;

/// Appends outgoing messages to the outbox stream.
#[derive(Debug, Clone)]
pub struct RedisOutboxQueue {
    outbox_name: String,
}

impl RedisOutboxQueue {
    pub fn new(outbox_name: impl Into<String>) -> Self {
        Self {
            outbox_name: outbox_name.into(),
        }
    }

    pub fn outbox_name(&self) -> &str {
        &self.outbox_name
    }

    /// Enlists an `XADD` of the message in `scope`.
    ///
    /// Nothing is sent here. In a transactional scope the entry becomes
    /// visible to the forwarder only when the scope commits.
    #[tracing::instrument(skip(self, message, scope), fields(outbox = %self.outbox_name))]
    pub async fn enqueue(
        &self,
        destination: &str,
        message: &TransportMessage,
        scope: &mut TransactionScope,
    ) -> transaction::Result<()> {
        let mut cmd = redis::cmd("XADD");
        cmd.arg(&self.outbox_name).arg("*");
        for (field, value) in entry_fields(destination, message) {
            cmd.arg(field).arg(value);
        }

        scope.run(ScopedOperation::new("outbox enqueue", cmd)).await?;
        metrics::counter!("outbox_messages_enqueued_total").increment(1);
        Ok(())
    }
}
