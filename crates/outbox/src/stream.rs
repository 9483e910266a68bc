use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::streams::{
    StreamId, StreamInfoConsumersReply, StreamInfoGroupsReply, StreamReadOptions, StreamReadReply,
};
use redis::{AsyncCommands, RedisResult, Value};
use tracing::{debug, error, info, warn};
use transaction::RedisProvider;

use crate::message::{decode_entry, entry_fields};
use crate::store::{ConsumerInfo, OutboxStorage};
use crate::{OutboxConfig, OutboxError, OutboxMessage, Result};

/// A stream entry before it is decoded.
struct RawEntry {
    id: String,
    fields: Vec<(String, Value)>,
}

impl From<StreamId> for RawEntry {
    fn from(entry: StreamId) -> Self {
        Self {
            id: entry.id,
            fields: entry.map.into_iter().collect(),
        }
    }
}

/// Outbox storage on a Redis stream with one consumer group.
///
/// In blocking mode reads go through a dedicated connection so that a
/// blocked `XREADGROUP` never delays other commands.
pub struct RedisOutboxStorage {
    config: OutboxConfig,
    connection: MultiplexedConnection,
    reader: Option<MultiplexedConnection>,
}

impl RedisOutboxStorage {
    /// Validates the configuration and opens the blocking reader connection
    /// when blocking reads are enabled.
    pub async fn connect(provider: &RedisProvider, config: OutboxConfig) -> Result<Self> {
        config.validate()?;

        let reader = if config.use_blocking_read {
            let timeout = (config.forwarding_interval * 2).max(Duration::from_secs(5));
            Some(provider.dedicated_connection(timeout).await?)
        } else {
            None
        };

        Ok(Self {
            connection: provider.connection(),
            reader,
            config,
        })
    }

    pub fn config(&self) -> &OutboxConfig {
        &self.config
    }

    fn name(&self) -> &str {
        &self.config.outbox_name
    }

    fn group(&self) -> &str {
        &self.config.consumer_group
    }

    /// Decodes a batch, moving undecodable entries to the dead letter stream.
    async fn decode_batch(&self, entries: Vec<RawEntry>) -> Result<Option<Vec<OutboxMessage>>> {
        let mut batch = Vec::with_capacity(entries.len());
        for entry in entries {
            match decode_entry(&entry.id, &entry.fields) {
                Ok(message) => batch.push(message),
                Err(reason) => {
                    let fields = entry
                        .fields
                        .iter()
                        .filter_map(|(field, value)| {
                            let bytes = redis::from_redis_value::<Vec<u8>>(value).ok()?;
                            Some((field.clone(), bytes))
                        })
                        .collect();
                    self.move_to_dead_letter(&entry.id, fields, "corrupted", &reason)
                        .await?;
                }
            }
        }
        Ok((!batch.is_empty()).then_some(batch))
    }

    /// Copies an entry to the dead letter stream and acknowledges it, in one
    /// transaction.
    async fn move_to_dead_letter(
        &self,
        id: &str,
        fields: Vec<(String, Vec<u8>)>,
        cause: &'static str,
        reason: &str,
    ) -> Result<()> {
        let dead_letter = self.config.dead_letter_name();
        error!(
            id,
            cause,
            reason,
            outbox = %self.name(),
            dead_letter = %dead_letter,
            "outbox entry moved to dead letter stream"
        );

        let mut add = redis::cmd("XADD");
        add.arg(&dead_letter)
            .arg("*")
            .arg("reason")
            .arg(reason)
            .arg("source-id")
            .arg(id);
        for (field, value) in fields {
            add.arg(field).arg(value);
        }

        let mut pipe = redis::pipe();
        pipe.atomic()
            .add_command(add)
            .ignore()
            .cmd("XACK")
            .arg(self.name())
            .arg(self.group())
            .arg(id)
            .ignore();
        let _: () = pipe.query_async(&mut self.connection.clone()).await?;

        metrics::counter!("outbox_messages_dead_lettered_total", "cause" => cause).increment(1);
        Ok(())
    }
}

/// Parses the claimed entries of an `XAUTOCLAIM` reply.
///
/// Entries deleted while pending come back as nil and are skipped.
fn parse_autoclaim(reply: Value) -> Result<Vec<RawEntry>> {
    let Value::Array(mut parts) = reply else {
        return Err(unexpected_reply("XAUTOCLAIM", &reply));
    };
    if parts.len() < 2 {
        return Err(unexpected_reply("XAUTOCLAIM", &Value::Array(parts)));
    }
    let Value::Array(items) = parts.swap_remove(1) else {
        return Ok(Vec::new());
    };

    let mut entries = Vec::with_capacity(items.len());
    for item in items {
        let Value::Array(pair) = item else {
            continue;
        };
        let mut pair = pair.into_iter();
        let (Some(id), Some(fields)) = (pair.next(), pair.next()) else {
            continue;
        };
        let id: String = redis::from_redis_value(&id)?;
        let fields = match fields {
            Value::Array(flat) => {
                let mut fields = Vec::with_capacity(flat.len() / 2);
                let mut flat = flat.into_iter();
                while let (Some(name), Some(value)) = (flat.next(), flat.next()) {
                    fields.push((redis::from_redis_value::<String>(&name)?, value));
                }
                fields
            }
            Value::Map(pairs) => pairs
                .into_iter()
                .map(|(name, value)| Ok((redis::from_redis_value::<String>(&name)?, value)))
                .collect::<RedisResult<Vec<_>>>()?,
            _ => continue,
        };
        entries.push(RawEntry { id, fields });
    }
    Ok(entries)
}

fn unexpected_reply(command: &str, reply: &Value) -> OutboxError {
    OutboxError::Redis(redis::RedisError::from((
        redis::ErrorKind::TypeError,
        "unexpected reply",
        format!("{command}: {reply:?}"),
    )))
}

/// Smallest stream id greater than `id`.
fn next_stream_id(id: &str) -> Option<String> {
    let (ms, seq) = id.split_once('-')?;
    let ms: u64 = ms.parse().ok()?;
    let seq: u64 = seq.parse().ok()?;
    Some(match seq.checked_add(1) {
        Some(seq) => format!("{ms}-{seq}"),
        None => format!("{}-0", ms + 1),
    })
}

fn is_error_code(err: &redis::RedisError, code: &str) -> bool {
    err.code() == Some(code)
}

#[async_trait]
impl OutboxStorage for RedisOutboxStorage {
    fn consumer_name(&self) -> &str {
        &self.config.consumer_name
    }

    async fn initialize(&self) -> Result<()> {
        let mut conn = self.connection.clone();
        let created: RedisResult<()> = conn
            .xgroup_create_mkstream(self.name(), self.group(), "0")
            .await;

        match created {
            Ok(()) => {
                info!(outbox = %self.name(), group = %self.group(), "created outbox consumer group");
                Ok(())
            }
            Err(err) if is_error_code(&err, "BUSYGROUP") => {
                debug!(outbox = %self.name(), group = %self.group(), "outbox consumer group exists");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn read_next_batch(&self) -> Result<Option<Vec<OutboxMessage>>> {
        let mut options = StreamReadOptions::default()
            .group(self.group(), self.consumer_name())
            .count(self.config.batch_size);
        let mut conn = match &self.reader {
            Some(reader) => {
                options = options.block(self.config.forwarding_interval.as_millis() as usize);
                reader.clone()
            }
            None => self.connection.clone(),
        };

        let reply: RedisResult<Option<StreamReadReply>> = conn
            .xread_options(&[self.name()], &[">"], &options)
            .await;
        let reply = match reply {
            Ok(reply) => reply,
            Err(err) if is_error_code(&err, "NOGROUP") => {
                warn!(outbox = %self.name(), "outbox consumer group missing, recreating");
                self.initialize().await?;
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        };

        let entries: Vec<RawEntry> = reply
            .map(|reply| {
                reply
                    .keys
                    .into_iter()
                    .flat_map(|key| key.ids)
                    .map(RawEntry::from)
                    .collect()
            })
            .unwrap_or_default();
        if entries.is_empty() {
            return Ok(None);
        }

        self.decode_batch(entries).await
    }

    async fn read_orphaned_batch(&self) -> Result<Option<Vec<OutboxMessage>>> {
        let reply: Value = redis::cmd("XAUTOCLAIM")
            .arg(self.name())
            .arg(self.group())
            .arg(self.consumer_name())
            .arg(self.config.orphaned_message_timeout.as_millis() as u64)
            .arg("0-0")
            .arg("COUNT")
            .arg(self.config.batch_size)
            .query_async(&mut self.connection.clone())
            .await?;

        let entries = parse_autoclaim(reply)?;
        if entries.is_empty() {
            return Ok(None);
        }

        metrics::counter!("outbox_messages_reclaimed_total").increment(entries.len() as u64);
        self.decode_batch(entries).await
    }

    async fn acknowledge(&self, message: &OutboxMessage) -> Result<()> {
        let mut conn = self.connection.clone();
        let acked: i64 = conn.xack(self.name(), self.group(), &[&message.id]).await?;
        if acked == 0 {
            debug!(id = %message.id, "outbox entry was already acknowledged");
        }
        Ok(())
    }

    async fn dead_letter(&self, message: &OutboxMessage, reason: &str) -> Result<()> {
        let fields = entry_fields(&message.destination_address, &message.to_transport_message());
        self.move_to_dead_letter(&message.id, fields, "rejected", reason)
            .await
    }

    async fn trim(&self, max_len: usize) -> Result<u64> {
        let trimmed: u64 = redis::cmd("XTRIM")
            .arg(self.name())
            .arg("MAXLEN")
            .arg("~")
            .arg(max_len)
            .query_async(&mut self.connection.clone())
            .await?;
        Ok(trimmed)
    }

    async fn trim_acknowledged(&self) -> Result<u64> {
        let mut conn = self.connection.clone();

        let groups: StreamInfoGroupsReply = conn.xinfo_groups(self.name()).await?;
        let Some(group) = groups
            .groups
            .into_iter()
            .find(|group| group.name == self.config.consumer_group)
        else {
            return Ok(0);
        };

        let (pending, oldest_pending, _, _): (u64, Option<String>, Option<String>, Value) =
            redis::cmd("XPENDING")
                .arg(self.name())
                .arg(self.group())
                .query_async(&mut conn)
                .await?;

        let threshold = match oldest_pending {
            Some(id) if pending > 0 => id,
            _ => match next_stream_id(&group.last_delivered_id) {
                Some(id) => id,
                None => return Ok(0),
            },
        };

        let trimmed: u64 = redis::cmd("XTRIM")
            .arg(self.name())
            .arg("MINID")
            .arg("~")
            .arg(&threshold)
            .query_async(&mut conn)
            .await?;
        Ok(trimmed)
    }

    async fn list_idle_consumers(&self) -> Result<Vec<ConsumerInfo>> {
        let mut conn = self.connection.clone();
        let reply: StreamInfoConsumersReply =
            conn.xinfo_consumers(self.name(), self.group()).await?;

        Ok(reply
            .consumers
            .into_iter()
            .map(|consumer| ConsumerInfo {
                name: consumer.name,
                pending: consumer.pending as u64,
                idle: Duration::from_millis(consumer.idle as u64),
            })
            .filter(|consumer| consumer.idle > self.config.idle_consumer_timeout)
            .collect())
    }

    async fn remove_consumer(&self, name: &str) -> Result<()> {
        let mut conn = self.connection.clone();
        let _: i64 = conn
            .xgroup_delconsumer(self.name(), self.group(), name)
            .await?;
        Ok(())
    }

    async fn pending_count(&self) -> Result<u64> {
        let (pending, _, _, _): (u64, Option<String>, Option<String>, Value) =
            redis::cmd("XPENDING")
                .arg(self.name())
                .arg(self.group())
                .query_async(&mut self.connection.clone())
                .await?;
        Ok(pending)
    }
}
