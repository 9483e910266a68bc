//! Transactional outbox on a Redis stream.
//!
//! Outgoing messages are appended to a stream inside the same
//! [`transaction::TransactionScope`] as the state change that produced them
//! ([`RedisOutboxQueue`], usually through the [`OutboxTransport`] decorator).
//! An [`OutboxForwarder`] reads them back through a consumer group, sends
//! them through the real transport and acknowledges each one only after the
//! send succeeded. Entries left pending by a crashed consumer are reclaimed
//! after a timeout, so delivery is at least once.

pub mod config;
pub mod error;
pub mod forwarder;
pub mod memory;
pub mod message;
pub mod queue;
pub mod retry;
pub mod store;
pub mod stream;
pub mod transport;

pub use config::{OutboxConfig, TrimStrategy};
pub use error::{OutboxError, Result, TransportError};
pub use forwarder::{ForwarderState, OutboxForwarder};
pub use memory::InMemoryOutboxStorage;
pub use message::{OutboxMessage, TransportMessage};
pub use queue::RedisOutboxQueue;
pub use retry::{RetryError, RetryPolicy};
pub use store::{ConsumerInfo, OutboxStorage};
pub use stream::RedisOutboxStorage;
pub use transport::{InMemoryTransport, OutboxTransport, SentMessage, Transport};
