use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::store::{ConsumerInfo, OutboxStorage};
use crate::{OutboxConfig, OutboxMessage, Result, TransportMessage};

struct Pending {
    consumer: String,
    since: Instant,
}

#[derive(Default)]
struct Stream {
    next_seq: u64,
    entries: BTreeMap<u64, (String, TransportMessage)>,
    last_delivered: u64,
    pending: BTreeMap<u64, Pending>,
    consumers: HashMap<String, Instant>,
    dead_letters: Vec<(OutboxMessage, String)>,
}

impl Stream {
    fn message(&self, seq: u64) -> Option<OutboxMessage> {
        let (destination, message) = self.entries.get(&seq)?;
        Some(OutboxMessage {
            id: format!("{seq}-0"),
            destination_address: destination.clone(),
            headers: message.headers.clone(),
            body: message.body.clone(),
        })
    }

    fn touch(&mut self, consumer: &str) {
        self.consumers.insert(consumer.to_string(), Instant::now());
    }
}

fn parse_seq(id: &str) -> Option<u64> {
    id.strip_suffix("-0")?.parse().ok()
}

/// In-memory outbox storage for testing.
///
/// Models a stream with one consumer group. Clones made with
/// [`InMemoryOutboxStorage::as_consumer`] share the stream but read as a
/// different consumer, which is how crashed consumers are simulated.
/// Idle and orphan timeouts follow `tokio::time`, so tests can drive them
/// with a paused clock.
#[derive(Clone)]
pub struct InMemoryOutboxStorage {
    config: Arc<OutboxConfig>,
    consumer: String,
    stream: Arc<Mutex<Stream>>,
}

impl InMemoryOutboxStorage {
    /// Creates an empty stream read as `config.consumer_name`.
    pub fn new(config: OutboxConfig) -> Self {
        Self {
            consumer: config.consumer_name.clone(),
            config: Arc::new(config),
            stream: Arc::new(Mutex::new(Stream {
                next_seq: 1,
                ..Stream::default()
            })),
        }
    }

    /// Returns a handle to the same stream that reads as another consumer.
    pub fn as_consumer(&self, name: impl Into<String>) -> Self {
        Self {
            config: Arc::clone(&self.config),
            consumer: name.into(),
            stream: Arc::clone(&self.stream),
        }
    }

    /// Appends a message, as a committed enqueue would.
    pub async fn push(&self, destination: &str, message: TransportMessage) -> String {
        let mut stream = self.stream.lock().await;
        let seq = stream.next_seq;
        stream.next_seq += 1;
        stream
            .entries
            .insert(seq, (destination.to_string(), message));
        format!("{seq}-0")
    }

    /// Number of entries physically in the stream.
    pub async fn len(&self) -> usize {
        self.stream.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Messages moved to the dead letter stream, with the reason.
    pub async fn dead_letters(&self) -> Vec<(OutboxMessage, String)> {
        self.stream.lock().await.dead_letters.clone()
    }

    /// Names of the consumers registered in the group.
    pub async fn consumers(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .stream
            .lock()
            .await
            .consumers
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}

#[async_trait]
impl OutboxStorage for InMemoryOutboxStorage {
    fn consumer_name(&self) -> &str {
        &self.consumer
    }

    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    async fn read_next_batch(&self) -> Result<Option<Vec<OutboxMessage>>> {
        let mut stream = self.stream.lock().await;
        stream.touch(&self.consumer);

        let seqs: Vec<u64> = stream
            .entries
            .range(stream.last_delivered + 1..)
            .take(self.config.batch_size)
            .map(|(seq, _)| *seq)
            .collect();
        let Some(&last) = seqs.last() else {
            return Ok(None);
        };

        stream.last_delivered = last;
        let now = Instant::now();
        let mut batch = Vec::with_capacity(seqs.len());
        for seq in seqs {
            stream.pending.insert(
                seq,
                Pending {
                    consumer: self.consumer.clone(),
                    since: now,
                },
            );
            batch.extend(stream.message(seq));
        }
        Ok(Some(batch))
    }

    async fn read_orphaned_batch(&self) -> Result<Option<Vec<OutboxMessage>>> {
        let mut stream = self.stream.lock().await;
        stream.touch(&self.consumer);

        let timeout = self.config.orphaned_message_timeout;
        let now = Instant::now();
        let seqs: Vec<u64> = stream
            .pending
            .iter()
            .filter(|(_, pending)| now.duration_since(pending.since) >= timeout)
            .take(self.config.batch_size)
            .map(|(seq, _)| *seq)
            .collect();

        let mut batch = Vec::with_capacity(seqs.len());
        for seq in seqs {
            match stream.message(seq) {
                Some(message) => {
                    stream.pending.insert(
                        seq,
                        Pending {
                            consumer: self.consumer.clone(),
                            since: now,
                        },
                    );
                    batch.push(message);
                }
                None => {
                    stream.pending.remove(&seq);
                }
            }
        }
        Ok((!batch.is_empty()).then_some(batch))
    }

    async fn acknowledge(&self, message: &OutboxMessage) -> Result<()> {
        if let Some(seq) = parse_seq(&message.id) {
            self.stream.lock().await.pending.remove(&seq);
        }
        Ok(())
    }

    async fn dead_letter(&self, message: &OutboxMessage, reason: &str) -> Result<()> {
        let mut stream = self.stream.lock().await;
        if let Some(seq) = parse_seq(&message.id) {
            stream.pending.remove(&seq);
        }
        stream
            .dead_letters
            .push((message.clone(), reason.to_string()));
        Ok(())
    }

    async fn trim(&self, max_len: usize) -> Result<u64> {
        let mut stream = self.stream.lock().await;
        let excess = stream.entries.len().saturating_sub(max_len);
        let doomed: Vec<u64> = stream.entries.keys().take(excess).copied().collect();
        for seq in &doomed {
            stream.entries.remove(seq);
        }
        Ok(doomed.len() as u64)
    }

    async fn trim_acknowledged(&self) -> Result<u64> {
        let mut stream = self.stream.lock().await;
        let threshold = stream
            .pending
            .keys()
            .next()
            .copied()
            .unwrap_or(stream.last_delivered + 1);
        let kept = stream.entries.split_off(&threshold);
        let removed = std::mem::replace(&mut stream.entries, kept);
        Ok(removed.len() as u64)
    }

    async fn list_idle_consumers(&self) -> Result<Vec<ConsumerInfo>> {
        let stream = self.stream.lock().await;
        let now = Instant::now();
        let mut idle: Vec<ConsumerInfo> = stream
            .consumers
            .iter()
            .map(|(name, seen)| ConsumerInfo {
                name: name.clone(),
                pending: stream
                    .pending
                    .values()
                    .filter(|p| &p.consumer == name)
                    .count() as u64,
                idle: now.duration_since(*seen),
            })
            .filter(|consumer| consumer.idle > self.config.idle_consumer_timeout)
            .collect();
        idle.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(idle)
    }

    async fn remove_consumer(&self, name: &str) -> Result<()> {
        let mut stream = self.stream.lock().await;
        stream.consumers.remove(name);
        stream.pending.retain(|_, pending| pending.consumer != name);
        Ok(())
    }

    async fn pending_count(&self) -> Result<u64> {
        Ok(self.stream.lock().await.pending.len() as u64)
    }
}
