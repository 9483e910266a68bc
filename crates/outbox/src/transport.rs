use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;
use transaction::TransactionScope;

use crate::{RedisOutboxQueue, TransportError, TransportMessage};

/// Sends messages to a destination address.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends `message` to `destination`.
    ///
    /// `scope` is the transaction of the unit of work the send belongs to,
    /// if any. Plain transports ignore it.
    async fn send(
        &self,
        destination: &str,
        message: TransportMessage,
        scope: Option<&mut TransactionScope>,
    ) -> Result<(), TransportError>;
}

/// Transport decorator that routes sends made inside a transaction into the
/// outbox stream.
///
/// A send with a scope is enqueued in that scope and reaches `inner` later,
/// through the forwarder, once the scope commits. A send without a scope
/// goes straight to `inner`.
pub struct OutboxTransport<T> {
    inner: T,
    queue: RedisOutboxQueue,
}

impl<T: Transport> OutboxTransport<T> {
    pub fn new(inner: T, queue: RedisOutboxQueue) -> Self {
        Self { inner, queue }
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }
}

#[async_trait]
impl<T: Transport> Transport for OutboxTransport<T> {
    async fn send(
        &self,
        destination: &str,
        message: TransportMessage,
        scope: Option<&mut TransactionScope>,
    ) -> Result<(), TransportError> {
        match scope {
            Some(scope) => {
                self.queue.enqueue(destination, &message, scope).await?;
                Ok(())
            }
            None => self.inner.send(destination, message, None).await,
        }
    }
}

/// A message recorded by [`InMemoryTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub destination: String,
    pub message: TransportMessage,
}

/// Transport that records sends in memory, for testing.
#[derive(Debug, Clone, Default)]
pub struct InMemoryTransport {
    sent: Arc<RwLock<Vec<SentMessage>>>,
    failures: Arc<AtomicUsize>,
    rejections: Arc<AtomicUsize>,
    attempts: Arc<AtomicUsize>,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` sends fail with [`TransportError::Unavailable`].
    pub fn fail_next(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }

    /// Makes the next `count` sends fail with [`TransportError::Rejected`].
    /// Rejections are applied after pending [`InMemoryTransport::fail_next`]
    /// failures.
    pub fn reject_next(&self, count: usize) {
        self.rejections.store(count, Ordering::SeqCst);
    }

    /// Number of sends attempted, failed ones included.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Messages sent so far, in send order.
    pub async fn sent(&self) -> Vec<SentMessage> {
        self.sent.read().await.clone()
    }

    pub async fn sent_count(&self) -> usize {
        self.sent.read().await.len()
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn send(
        &self,
        destination: &str,
        message: TransportMessage,
        _scope: Option<&mut TransactionScope>,
    ) -> Result<(), TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if take_one(&self.failures) {
            return Err(TransportError::Unavailable(format!(
                "{destination} is down"
            )));
        }
        if take_one(&self.rejections) {
            return Err(TransportError::Rejected(format!(
                "{destination} refused the message"
            )));
        }

        self.sent.write().await.push(SentMessage {
            destination: destination.to_string(),
            message,
        });
        Ok(())
    }
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}
