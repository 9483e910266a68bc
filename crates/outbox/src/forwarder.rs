//! Background forwarding of outbox entries.
//!
//! The forwarder runs up to three independent loops against one stream:
//!
//! - **forwarding**: reads new entries through the consumer group, sends each
//!   through the transport and acknowledges it after the send succeeded.
//!   A full batch is followed immediately by the next read, so a backlog is
//!   drained without waiting for the next tick.
//! - **orphan reclaim**: claims entries left pending by other consumers for
//!   longer than the orphaned message timeout and forwards them the same way.
//! - **cleanup**: removes idle consumers that hold no pending entries and
//!   trims the stream.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::retry::RetryError;
use crate::{
    OutboxConfig, OutboxMessage, OutboxStorage, Result, RetryPolicy, Transport, TransportError,
    TrimStrategy,
};

/// What the forwarding loop is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwarderState {
    Stopped,
    /// Waiting for new entries.
    Polling,
    /// Forwarding a batch.
    Draining,
}

impl ForwarderState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Polling,
            2 => Self::Draining,
            _ => Self::Stopped,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Source {
    New,
    Orphaned,
}

#[derive(Debug, PartialEq, Eq)]
enum BatchOutcome {
    Completed,
    /// A send or acknowledgement failed. The rest of the batch stays pending.
    Aborted,
    Cancelled,
}

#[derive(Debug, PartialEq, Eq)]
enum DrainOutcome {
    /// Nothing left to read.
    Idle,
    Aborted,
    Cancelled,
}

struct Inner<S, T> {
    storage: S,
    transport: T,
    config: OutboxConfig,
    retry: RetryPolicy,
    state: AtomicU8,
}

impl<S: OutboxStorage, T: Transport> Inner<S, T> {
    fn set_state(&self, state: ForwarderState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    async fn read(&self, source: Source) -> Result<Option<Vec<OutboxMessage>>> {
        match source {
            Source::New => self.storage.read_next_batch().await,
            Source::Orphaned => self.storage.read_orphaned_batch().await,
        }
    }

    /// Forwards batches from `source` until a read comes back empty.
    async fn drain(
        &self,
        source: Source,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<DrainOutcome> {
        loop {
            if *shutdown.borrow() {
                return Ok(DrainOutcome::Cancelled);
            }

            let batch = tokio::select! {
                batch = self.read(source) => batch?,
                _ = shutdown.changed() => return Ok(DrainOutcome::Cancelled),
            };
            let Some(batch) = batch else {
                return Ok(DrainOutcome::Idle);
            };

            if source == Source::New {
                self.set_state(ForwarderState::Draining);
            } else {
                info!(count = batch.len(), "Reclaimed orphaned outbox entries");
            }

            match self.forward_batch(batch, shutdown).await {
                BatchOutcome::Completed => continue,
                BatchOutcome::Aborted => return Ok(DrainOutcome::Aborted),
                BatchOutcome::Cancelled => return Ok(DrainOutcome::Cancelled),
            }
        }
    }

    async fn forward_batch(
        &self,
        batch: Vec<OutboxMessage>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> BatchOutcome {
        for message in &batch {
            let sent = self
                .retry
                .execute_while(
                    || {
                        self.transport.send(
                            &message.destination_address,
                            message.to_transport_message(),
                            None,
                        )
                    },
                    TransportError::is_transient,
                    shutdown,
                )
                .await;

            match sent {
                Ok(()) => {}
                Err(RetryError::Exhausted { attempts, last }) => {
                    metrics::counter!("outbox_send_failures_total").increment(1);
                    error!(
                        id = %message.id,
                        destination = %message.destination_address,
                        attempts,
                        error = %last,
                        "Giving up on outbox entry, leaving it pending"
                    );
                    return BatchOutcome::Aborted;
                }
                Err(RetryError::Permanent { error: rejection, .. }) => {
                    let reason = rejection.to_string();
                    if let Err(e) = self.storage.dead_letter(message, &reason).await {
                        warn!(id = %message.id, error = %e, "Failed to dead-letter rejected entry");
                        return BatchOutcome::Aborted;
                    }
                    metrics::counter!("outbox_messages_rejected_total").increment(1);
                    warn!(
                        id = %message.id,
                        destination = %message.destination_address,
                        reason = %reason,
                        "Outbox entry rejected by transport, moved to dead letter stream"
                    );
                    continue;
                }
                Err(RetryError::Cancelled) => return BatchOutcome::Cancelled,
            }

            if let Err(e) = self.storage.acknowledge(message).await {
                warn!(id = %message.id, error = %e, "Failed to acknowledge forwarded entry");
                return BatchOutcome::Aborted;
            }
            metrics::counter!("outbox_messages_forwarded_total").increment(1);
            debug!(id = %message.id, destination = %message.destination_address, "Forwarded outbox entry");
        }
        BatchOutcome::Completed
    }

    async fn cleanup(&self) -> Result<()> {
        for consumer in self.storage.list_idle_consumers().await? {
            if consumer.name == self.storage.consumer_name() {
                continue;
            }
            if consumer.pending > 0 {
                debug!(
                    consumer = %consumer.name,
                    pending = consumer.pending,
                    "Idle consumer still owns pending entries, keeping it"
                );
                continue;
            }

            self.storage.remove_consumer(&consumer.name).await?;
            metrics::counter!("outbox_consumers_removed_total").increment(1);
            info!(consumer = %consumer.name, idle = ?consumer.idle, "Removed idle outbox consumer");
        }

        let trimmed = match self.config.trim_strategy {
            TrimStrategy::MaxLength => self.storage.trim(self.config.trim_size).await?,
            TrimStrategy::AcknowledgedOnly => self.storage.trim_acknowledged().await?,
        };
        if trimmed > 0 {
            metrics::counter!("outbox_entries_trimmed_total").increment(trimmed);
            debug!(trimmed, "Trimmed outbox stream");
        }
        Ok(())
    }
}

fn ticker(period: std::time::Duration) -> Interval {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

/// Waits for the next tick. Returns `false` if shutdown was signalled first.
async fn tick(interval: &mut Interval, shutdown: &mut watch::Receiver<bool>) -> bool {
    if *shutdown.borrow() {
        return false;
    }
    tokio::select! {
        _ = interval.tick() => true,
        _ = shutdown.changed() => false,
    }
}

async fn forwarding_loop<S: OutboxStorage, T: Transport>(
    inner: Arc<Inner<S, T>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let blocking = inner.config.use_blocking_read;
    let period = inner.config.forwarding_interval;
    let mut interval = ticker(period);
    let mut pause = !blocking;

    loop {
        inner.set_state(ForwarderState::Polling);
        if pause {
            // In blocking mode the read itself waits, so the ticker only
            // spaces out retries after a failure.
            if blocking {
                interval.reset();
            }
            if !tick(&mut interval, &mut shutdown).await {
                break;
            }
        }

        match inner.drain(Source::New, &mut shutdown).await {
            Ok(DrainOutcome::Idle) => pause = !blocking,
            Ok(DrainOutcome::Aborted) => pause = true,
            Ok(DrainOutcome::Cancelled) => break,
            Err(e) => {
                warn!(error = %e, "Failed to read outbox entries");
                pause = true;
            }
        }
        if blocking {
            tokio::task::yield_now().await;
        }
    }

    inner.set_state(ForwarderState::Stopped);
    info!("Outbox forwarding loop stopped");
}

async fn orphan_loop<S: OutboxStorage, T: Transport>(
    inner: Arc<Inner<S, T>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = ticker(inner.config.orphaned_forwarding_interval);
    while tick(&mut interval, &mut shutdown).await {
        match inner.drain(Source::Orphaned, &mut shutdown).await {
            Ok(DrainOutcome::Cancelled) => break,
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Failed to reclaim orphaned outbox entries"),
        }
    }
    info!("Outbox orphan reclaim loop stopped");
}

async fn cleanup_loop<S: OutboxStorage, T: Transport>(
    inner: Arc<Inner<S, T>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = ticker(inner.config.cleanup_interval);
    while tick(&mut interval, &mut shutdown).await {
        if let Err(e) = inner.cleanup().await {
            warn!(error = %e, "Outbox cleanup failed");
        }
    }
    info!("Outbox cleanup loop stopped");
}

struct Running {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

/// Forwards outbox entries from `S` to the transport `T` in the background.
///
/// # Example
///
/// ```ignore
/// let storage = RedisOutboxStorage::connect(&provider, config.clone()).await?;
/// let mut forwarder = OutboxForwarder::new(storage, transport, config)?;
/// forwarder.start().await?;
/// // ...
/// forwarder.stop().await;
/// ```
pub struct OutboxForwarder<S, T> {
    inner: Arc<Inner<S, T>>,
    running: Option<Running>,
}

impl<S, T> OutboxForwarder<S, T>
where
    S: OutboxStorage + 'static,
    T: Transport + 'static,
{
    /// Creates a stopped forwarder with the default send retry policy.
    /// Fails if `config` is invalid.
    pub fn new(storage: S, transport: T, config: OutboxConfig) -> Result<Self> {
        Self::with_retry_policy(storage, transport, config, RetryPolicy::default_send())
    }

    /// Creates a stopped forwarder that retries unavailable transports with
    /// `retry`. Rejected sends are never retried.
    pub fn with_retry_policy(
        storage: S,
        transport: T,
        config: OutboxConfig,
        retry: RetryPolicy,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(Inner {
                storage,
                transport,
                config,
                retry,
                state: AtomicU8::new(ForwarderState::Stopped as u8),
            }),
            running: None,
        })
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.inner.retry
    }

    pub fn config(&self) -> &OutboxConfig {
        &self.inner.config
    }

    pub fn storage(&self) -> &S {
        &self.inner.storage
    }

    pub fn state(&self) -> ForwarderState {
        ForwarderState::from_u8(self.inner.state.load(Ordering::SeqCst))
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Number of entries delivered to any consumer and not yet acknowledged.
    pub async fn pending_count(&self) -> Result<u64> {
        self.inner.storage.pending_count().await
    }

    /// Initializes the stream and spawns the enabled loops.
    ///
    /// Calling `start` on a running forwarder does nothing.
    pub async fn start(&mut self) -> Result<()> {
        if self.running.is_some() {
            return Ok(());
        }

        self.inner.storage.initialize().await?;

        let config = &self.inner.config;
        let (shutdown, receiver) = watch::channel(false);
        let mut tasks = Vec::new();
        if config.forwarding_enabled {
            self.inner.set_state(ForwarderState::Polling);
            tasks.push(tokio::spawn(forwarding_loop(
                Arc::clone(&self.inner),
                receiver.clone(),
            )));
        }
        if config.orphaned_forwarding_enabled {
            tasks.push(tokio::spawn(orphan_loop(
                Arc::clone(&self.inner),
                receiver.clone(),
            )));
        }
        if config.cleanup_enabled {
            tasks.push(tokio::spawn(cleanup_loop(Arc::clone(&self.inner), receiver)));
        }

        info!(
            outbox = %config.outbox_name,
            consumer = %self.inner.storage.consumer_name(),
            blocking = config.use_blocking_read,
            loops = tasks.len(),
            "Outbox forwarder started"
        );
        self.running = Some(Running { shutdown, tasks });
        Ok(())
    }

    /// Signals every loop to stop and waits for them to finish.
    ///
    /// Entries claimed but not yet acknowledged stay pending and are picked
    /// up later by orphan reclaim.
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };

        let _ = running.shutdown.send(true);
        for result in futures_util::future::join_all(running.tasks).await {
            if let Err(e) = result {
                warn!(error = %e, "Outbox forwarder task failed");
            }
        }
        self.inner.set_state(ForwarderState::Stopped);
        info!(outbox = %self.inner.config.outbox_name, "Outbox forwarder stopped");
    }
}

impl<S, T> Drop for OutboxForwarder<S, T> {
    fn drop(&mut self) {
        if let Some(running) = self.running.take() {
            let _ = running.shutdown.send(true);
        }
    }
}
