use std::collections::HashMap;

use crate::{Result, SagaStoreError};

/// Index sharding settings.
///
/// Reads from environment variables:
/// - `SAGA_INDEX_SHARDS` — shard count for every saga type (default: `1`)
#[derive(Debug, Clone)]
pub struct SagaStoreConfig {
    pub default_shards: u32,
    pub shard_overrides: HashMap<String, u32>,
}

impl SagaStoreConfig {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self {
            default_shards: std::env::var("SAGA_INDEX_SHARDS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(1),
            shard_overrides: HashMap::new(),
        }
    }

    /// Sets the shard count used by saga types without an override.
    pub fn with_shards(mut self, shards: u32) -> Self {
        self.default_shards = shards;
        self
    }

    /// Sets the shard count for one saga type.
    ///
    /// Changing the count of a type that already has stored sagas makes
    /// their existing index entries unreachable.
    pub fn with_type_shards(mut self, saga_type: impl Into<String>, shards: u32) -> Self {
        self.shard_overrides.insert(saga_type.into(), shards);
        self
    }

    /// Shard count for a saga type.
    pub fn shards_for(&self, saga_type: &str) -> u32 {
        self.shard_overrides
            .get(saga_type)
            .copied()
            .unwrap_or(self.default_shards)
    }

    pub fn validate(&self) -> Result<()> {
        if self.default_shards == 0 {
            return Err(SagaStoreError::InvalidConfig(
                "shard count must be at least 1".to_string(),
            ));
        }
        if let Some((saga_type, _)) = self.shard_overrides.iter().find(|(_, n)| **n == 0) {
            return Err(SagaStoreError::InvalidConfig(format!(
                "shard count for {saga_type} must be at least 1"
            )));
        }
        Ok(())
    }
}

impl Default for SagaStoreConfig {
    fn default() -> Self {
        Self {
            default_shards: 1,
            shard_overrides: HashMap::new(),
        }
    }
}
