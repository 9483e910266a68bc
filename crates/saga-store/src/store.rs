use async_trait::async_trait;
use common::{Revision, SagaId};
use redis::{AsyncCommands, Cmd, Value};
use transaction::{
    ConcurrencyConflict, RedisProvider, ScopedOperation, TransactionError, TransactionScope,
};

use crate::index::{self, IndexKey};
use crate::{Result, SagaData, SagaRecord, SagaStoreConfig, SagaStoreError, scripts};

/// Storage contract for saga instances.
///
/// Reads go straight to the store. Writes are enlisted in the given
/// [`TransactionScope`]: in an immediate scope a conflict is returned by the
/// call itself, in a transactional scope it is returned by the scope's
/// commit. In both cases the in-memory record's revision has already been
/// advanced, so after any failure the caller must reload before retrying.
#[async_trait]
pub trait SagaStorage: Send + Sync {
    /// Loads a saga by id.
    async fn find_by_id<T: SagaData>(&self, id: SagaId) -> Result<Option<SagaRecord<T>>>;

    /// Loads the saga whose correlation property currently has `value`.
    ///
    /// A property named `id` (any case) is a lookup by id.
    async fn find_by_property<T: SagaData>(
        &self,
        property: &str,
        value: &str,
    ) -> Result<Option<SagaRecord<T>>>;

    /// Stores a new saga and indexes the given correlation properties.
    ///
    /// The record must be at revision 0 and is moved to revision 1. Fails
    /// with [`ConcurrencyConflict::AlreadyExists`] if the id is taken.
    async fn insert<T: SagaData>(
        &self,
        scope: &mut TransactionScope,
        record: &mut SagaRecord<T>,
        correlation_properties: &[&str],
    ) -> Result<()>;

    /// Replaces a stored saga and re-indexes its correlation properties.
    ///
    /// Succeeds only if the stored revision still equals the record's
    /// revision; the record then moves to the next revision. Index entries
    /// for values the saga no longer has are removed.
    async fn update<T: SagaData>(
        &self,
        scope: &mut TransactionScope,
        record: &mut SagaRecord<T>,
        correlation_properties: &[&str],
    ) -> Result<()>;

    /// Removes a saga and every index entry pointing at it.
    async fn delete<T: SagaData>(
        &self,
        scope: &mut TransactionScope,
        record: &SagaRecord<T>,
    ) -> Result<()>;
}

/// Redis-backed saga storage.
#[derive(Clone)]
pub struct RedisSagaStore {
    provider: RedisProvider,
    config: SagaStoreConfig,
}

impl RedisSagaStore {
    /// Creates a store, validating the configuration.
    pub fn new(provider: RedisProvider, config: SagaStoreConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { provider, config })
    }

    pub fn config(&self) -> &SagaStoreConfig {
        &self.config
    }

    fn index_keys_for<T: SagaData>(
        &self,
        type_key: &str,
        data: &T,
        properties: &[&str],
    ) -> Vec<IndexKey> {
        let shards = self.config.shards_for(T::SAGA_TYPE);
        index::index_keys(type_key, data, properties, shards)
    }

    async fn load<T: SagaData>(&self, key: &str, id: SagaId) -> Result<Option<SagaRecord<T>>> {
        let mut conn = self.provider.connection();
        let (revision, data): (Option<i64>, Option<String>) = redis::cmd("HMGET")
            .arg(key)
            .arg("rev")
            .arg("dat")
            .query_async(&mut conn)
            .await?;

        let Some(data) = data else {
            return Ok(None);
        };
        let revision = revision
            .ok_or_else(|| SagaStoreError::InvalidSaga(format!("{key} has no revision")))?;

        Ok(Some(SagaRecord {
            id,
            revision: Revision::new(revision),
            data: serde_json::from_str(&data)?,
        }))
    }
}

fn ensure_id<T>(record: &SagaRecord<T>) -> Result<()> {
    if record.id.is_nil() {
        return Err(SagaStoreError::InvalidSaga(format!(
            "saga data of type {} has an uninitialized id",
            std::any::type_name::<T>()
        )));
    }
    Ok(())
}

/// Precondition for an insert: the record key must not exist yet.
fn absent(key: &str) -> (Cmd, impl FnOnce(Value) -> transaction::Result<()> + Send + 'static) {
    let mut read = redis::cmd("EXISTS");
    read.arg(key);
    let key = key.to_string();
    let check = move |reply: Value| match redis::from_redis_value::<i64>(&reply)? {
        0 => Ok(()),
        _ => {
            metrics::counter!("saga_store_conflicts_total", "operation" => "insert").increment(1);
            Err(ConcurrencyConflict::AlreadyExists { key }.into())
        }
    };
    (read, check)
}

/// Precondition for an update: the record must be stored at `expected`.
fn at_revision(
    key: &str,
    expected: Revision,
) -> (Cmd, impl FnOnce(Value) -> transaction::Result<()> + Send + 'static) {
    let mut read = redis::cmd("HGET");
    read.arg(key).arg("rev");
    let key = key.to_string();
    let check = move |reply: Value| {
        let conflict = match redis::from_redis_value::<Option<i64>>(&reply)? {
            Some(stored) if stored == expected.as_i64() => return Ok(()),
            Some(stored) => ConcurrencyConflict::RevisionMismatch {
                key,
                expected,
                actual: Revision::new(stored),
            },
            None => ConcurrencyConflict::Missing { key },
        };
        metrics::counter!("saga_store_conflicts_total", "operation" => "update").increment(1);
        Err(conflict.into())
    };
    (read, check)
}

fn unexpected(operation: &'static str, reply: impl std::fmt::Debug) -> TransactionError {
    TransactionError::UnexpectedReply {
        operation,
        detail: format!("{reply:?}"),
    }
}

#[async_trait]
impl SagaStorage for RedisSagaStore {
    #[tracing::instrument(skip(self), fields(saga_type = T::SAGA_TYPE))]
    async fn find_by_id<T: SagaData>(&self, id: SagaId) -> Result<Option<SagaRecord<T>>> {
        let key = index::saga_key(&index::type_key::<T>(), id);
        self.load(&key, id).await
    }

    #[tracing::instrument(skip(self), fields(saga_type = T::SAGA_TYPE))]
    async fn find_by_property<T: SagaData>(
        &self,
        property: &str,
        value: &str,
    ) -> Result<Option<SagaRecord<T>>> {
        if index::is_id_property(property) {
            return match value.parse::<SagaId>() {
                Ok(id) => self.find_by_id(id).await,
                Err(_) => Ok(None),
            };
        }

        let type_key = index::type_key::<T>();
        let shards = self.config.shards_for(T::SAGA_TYPE);
        let entry = IndexKey::for_value(&type_key, property, value, shards);

        let mut conn = self.provider.connection();
        let target: Option<String> = conn.hget(&entry.key, &entry.hash_field).await?;
        let Some(key) = target else {
            return Ok(None);
        };
        let id = index::id_from_saga_key(&key).ok_or_else(|| {
            SagaStoreError::InvalidSaga(format!("index {} points at {key}", entry.key))
        })?;

        self.load(&key, id).await
    }

    #[tracing::instrument(skip_all, fields(saga_type = T::SAGA_TYPE, saga_id = %record.id))]
    async fn insert<T: SagaData>(
        &self,
        scope: &mut TransactionScope,
        record: &mut SagaRecord<T>,
        correlation_properties: &[&str],
    ) -> Result<()> {
        ensure_id(record)?;
        if !record.is_new() {
            return Err(SagaStoreError::InvalidSaga(format!(
                "attempted to insert saga {} at revision {}, but revision must be 0 on first insert",
                record.id, record.revision
            )));
        }

        let type_key = index::type_key::<T>();
        let key = index::saga_key(&type_key, record.id);
        let index_keys = self.index_keys_for(&type_key, &record.data, correlation_properties);
        let data = serde_json::to_string(&record.data)?;
        let index_list = serde_json::to_string(&index_keys)?;

        record.revision = record.revision.next();

        let mut cmd = redis::cmd("EVAL");
        cmd.arg(scripts::INSERT)
            .arg(1 + index_keys.len())
            .arg(&key);
        for entry in &index_keys {
            cmd.arg(&entry.key);
        }
        cmd.arg(data).arg(index_list);
        for entry in &index_keys {
            cmd.arg(&entry.hash_field);
        }

        let (read, guard) = absent(&key);
        let operation = ScopedOperation::new("saga insert", cmd)
            .with_guard(key.clone(), read, guard)
            .with_check(move |reply| {
                match redis::from_redis_value::<i64>(&reply)? {
                    1 => Ok(()),
                    0 => {
                        metrics::counter!("saga_store_conflicts_total", "operation" => "insert")
                            .increment(1);
                        Err(ConcurrencyConflict::AlreadyExists { key }.into())
                    }
                    other => Err(unexpected("saga insert", other)),
                }
            });
        scope.run(operation).await?;

        metrics::counter!("saga_store_writes_total", "operation" => "insert").increment(1);
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(saga_type = T::SAGA_TYPE, saga_id = %record.id))]
    async fn update<T: SagaData>(
        &self,
        scope: &mut TransactionScope,
        record: &mut SagaRecord<T>,
        correlation_properties: &[&str],
    ) -> Result<()> {
        ensure_id(record)?;

        let type_key = index::type_key::<T>();
        let key = index::saga_key(&type_key, record.id);
        let index_keys = self.index_keys_for(&type_key, &record.data, correlation_properties);
        let data = serde_json::to_string(&record.data)?;
        let index_list = serde_json::to_string(&index_keys)?;

        let expected = record.revision;
        record.revision = record.revision.next();

        let mut cmd = redis::cmd("EVAL");
        cmd.arg(scripts::UPDATE)
            .arg(1 + index_keys.len())
            .arg(&key);
        for entry in &index_keys {
            cmd.arg(&entry.key);
        }
        cmd.arg(record.revision.as_i64()).arg(data).arg(index_list);
        for entry in &index_keys {
            cmd.arg(&entry.hash_field);
        }

        let (read, guard) = at_revision(&key, expected);
        let operation = ScopedOperation::new("saga update", cmd)
            .with_guard(key.clone(), read, guard)
            .with_check(move |reply| {
                let (status, stored) = redis::from_redis_value::<(i64, i64)>(&reply)?;
                let conflict = match status {
                    1 => return Ok(()),
                    0 => ConcurrencyConflict::RevisionMismatch {
                        key,
                        expected,
                        actual: Revision::new(stored),
                    },
                    -1 => ConcurrencyConflict::Missing { key },
                    _ => return Err(unexpected("saga update", (status, stored))),
                };
                metrics::counter!("saga_store_conflicts_total", "operation" => "update").increment(1);
                Err(conflict.into())
            });
        scope.run(operation).await?;

        metrics::counter!("saga_store_writes_total", "operation" => "update").increment(1);
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(saga_type = T::SAGA_TYPE, saga_id = %record.id))]
    async fn delete<T: SagaData>(
        &self,
        scope: &mut TransactionScope,
        record: &SagaRecord<T>,
    ) -> Result<()> {
        let key = index::saga_key(&index::type_key::<T>(), record.id);

        let mut cmd = redis::cmd("EVAL");
        cmd.arg(scripts::DELETE).arg(1).arg(&key);
        scope
            .run(ScopedOperation::new("saga delete", cmd).with_check(|reply| {
                redis::from_redis_value::<i64>(&reply)?;
                Ok(())
            }))
            .await?;

        metrics::counter!("saga_store_writes_total", "operation" => "delete").increment(1);
        Ok(())
    }
}
