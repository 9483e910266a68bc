use std::time::Duration;

use crate::{OutboxError, Result};

/// How the cleanup loop bounds the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrimStrategy {
    /// Approximate `MAXLEN` trim to `trim_size` entries. Entries are dropped
    /// by age regardless of acknowledgement, so a forwarder outage longer
    /// than `trim_size` messages loses undelivered entries.
    #[default]
    MaxLength,
    /// Approximate `MINID` trim below the oldest entry that is still pending
    /// or not yet delivered. Never drops an unsent entry, but the stream
    /// grows without bound while the forwarder is down.
    AcknowledgedOnly,
}

/// Outbox stream and forwarder settings.
///
/// Reads from environment variables (see [`OutboxConfig::from_env`]):
/// - `OUTBOX_CONSUMER_GROUP` — consumer group (default: `"outbox-consumer"`)
/// - `OUTBOX_CONSUMER_NAME` — consumer name (default: random UUID)
/// - `OUTBOX_BATCH_SIZE` — messages per read (default: `100`)
/// - `OUTBOX_FORWARDING_INTERVAL_MS` — polling interval or blocking timeout (default: `5000`)
/// - `OUTBOX_BLOCKING_READ` — block on a dedicated connection (default: `true`)
/// - `OUTBOX_TRIM_SIZE` — approximate stream length kept (default: `1000`)
#[derive(Debug, Clone)]
pub struct OutboxConfig {
    pub outbox_name: String,
    pub consumer_group: String,
    pub consumer_name: String,
    pub batch_size: usize,

    pub forwarding_enabled: bool,
    pub forwarding_interval: Duration,
    pub use_blocking_read: bool,

    pub orphaned_forwarding_enabled: bool,
    pub orphaned_forwarding_interval: Duration,
    pub orphaned_message_timeout: Duration,

    pub cleanup_enabled: bool,
    pub cleanup_interval: Duration,
    pub idle_consumer_timeout: Duration,
    pub trim_size: usize,
    pub trim_strategy: TrimStrategy,
}

impl OutboxConfig {
    /// Creates a configuration for the stream `outbox_name` with defaults.
    pub fn new(outbox_name: impl Into<String>) -> Self {
        Self {
            outbox_name: outbox_name.into(),
            consumer_group: "outbox-consumer".to_string(),
            consumer_name: uuid::Uuid::new_v4().to_string(),
            batch_size: 100,
            forwarding_enabled: true,
            forwarding_interval: Duration::from_secs(5),
            use_blocking_read: true,
            orphaned_forwarding_enabled: true,
            orphaned_forwarding_interval: Duration::from_secs(1),
            orphaned_message_timeout: Duration::from_secs(30),
            cleanup_enabled: true,
            cleanup_interval: Duration::from_secs(60),
            idle_consumer_timeout: Duration::from_secs(15 * 60),
            trim_size: 1000,
            trim_strategy: TrimStrategy::MaxLength,
        }
    }

    /// Creates a configuration for the outbox of the bus named `bus_name`,
    /// stored in the stream `<bus_name>-outbox`.
    pub fn for_bus(bus_name: &str) -> Self {
        Self::new(format!("{bus_name}-outbox"))
    }

    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env(outbox_name: impl Into<String>) -> Self {
        let defaults = Self::new(outbox_name);
        Self {
            consumer_group: std::env::var("OUTBOX_CONSUMER_GROUP")
                .unwrap_or_else(|_| defaults.consumer_group.clone()),
            consumer_name: std::env::var("OUTBOX_CONSUMER_NAME")
                .unwrap_or_else(|_| defaults.consumer_name.clone()),
            batch_size: env_parse("OUTBOX_BATCH_SIZE").unwrap_or(defaults.batch_size),
            forwarding_interval: env_parse("OUTBOX_FORWARDING_INTERVAL_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.forwarding_interval),
            use_blocking_read: env_parse("OUTBOX_BLOCKING_READ")
                .unwrap_or(defaults.use_blocking_read),
            trim_size: env_parse("OUTBOX_TRIM_SIZE").unwrap_or(defaults.trim_size),
            ..defaults
        }
    }

    pub fn with_consumer_group(mut self, group: impl Into<String>) -> Self {
        self.consumer_group = group.into();
        self
    }

    pub fn with_consumer_name(mut self, name: impl Into<String>) -> Self {
        self.consumer_name = name.into();
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_forwarding_interval(mut self, interval: Duration) -> Self {
        self.forwarding_interval = interval;
        self
    }

    /// Switches between blocking reads on a dedicated connection and
    /// interval polling.
    pub fn with_blocking_read(mut self, enabled: bool) -> Self {
        self.use_blocking_read = enabled;
        self
    }

    pub fn with_forwarding(mut self, enabled: bool) -> Self {
        self.forwarding_enabled = enabled;
        self
    }

    pub fn with_orphaned_forwarding(mut self, enabled: bool) -> Self {
        self.orphaned_forwarding_enabled = enabled;
        self
    }

    pub fn with_orphaned_forwarding_interval(mut self, interval: Duration) -> Self {
        self.orphaned_forwarding_interval = interval;
        self
    }

    pub fn with_orphaned_message_timeout(mut self, timeout: Duration) -> Self {
        self.orphaned_message_timeout = timeout;
        self
    }

    pub fn with_cleanup(mut self, enabled: bool) -> Self {
        self.cleanup_enabled = enabled;
        self
    }

    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    pub fn with_idle_consumer_timeout(mut self, timeout: Duration) -> Self {
        self.idle_consumer_timeout = timeout;
        self
    }

    pub fn with_trim_size(mut self, trim_size: usize) -> Self {
        self.trim_size = trim_size;
        self
    }

    pub fn with_trim_strategy(mut self, strategy: TrimStrategy) -> Self {
        self.trim_strategy = strategy;
        self
    }

    /// Name of the stream that receives entries that cannot be decoded.
    pub fn dead_letter_name(&self) -> String {
        format!("{}:dead-letter", self.outbox_name)
    }

    pub fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("outbox name", &self.outbox_name),
            ("consumer group", &self.consumer_group),
            ("consumer name", &self.consumer_name),
        ] {
            if value.trim().is_empty() {
                return Err(OutboxError::InvalidConfig(format!("{field} cannot be blank")));
            }
        }

        if self.batch_size == 0 {
            return Err(OutboxError::InvalidConfig(
                "batch size must be at least 1".to_string(),
            ));
        }

        for (field, value) in [
            ("forwarding interval", self.forwarding_interval),
            ("orphaned forwarding interval", self.orphaned_forwarding_interval),
            ("orphaned message timeout", self.orphaned_message_timeout),
            ("cleanup interval", self.cleanup_interval),
            ("idle consumer timeout", self.idle_consumer_timeout),
        ] {
            if value < Duration::from_secs(1) {
                return Err(OutboxError::InvalidConfig(format!(
                    "{field} must be at least one second, got {value:?}"
                )));
            }
        }

        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}
