//! Key layout for saga records and their correlation indexes.

use common::{SagaId, murmur3_32, to_kebab_case};
use serde::{Deserialize, Serialize};

use crate::SagaData;

/// Seed for the shard hash. Changing it re-routes every existing index entry.
pub const SHARD_SEED: u32 = 42;

/// Location of one index entry: the shard hash and the field within it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IndexKey {
    pub key: String,
    #[serde(rename = "hashField")]
    pub hash_field: String,
}

impl IndexKey {
    /// Computes the index location of `value` for a saga type and property.
    ///
    /// The shard is chosen by hashing the value, so a lookup recomputes the
    /// same shard as the write.
    pub fn for_value(type_key: &str, property: &str, value: &str, shards: u32) -> Self {
        let property = property.to_lowercase();
        let shard = shard_for(value, shards);
        Self {
            key: format!("index:{type_key}:{property}:{shard}"),
            hash_field: format!("{type_key}:{property}:{value}"),
        }
    }
}

/// Kebab-case type segment used in every key of a saga type.
pub fn type_key<T: SagaData>() -> String {
    to_kebab_case(T::SAGA_TYPE)
}

/// Primary key of a saga record.
pub fn saga_key(type_key: &str, id: SagaId) -> String {
    format!("saga:{type_key}:{id}")
}

/// Recovers the saga id from a primary key.
pub fn id_from_saga_key(key: &str) -> Option<SagaId> {
    key.strip_prefix("saga:")?.rsplit_once(':')?.1.parse().ok()
}

/// Shard number of a correlated value.
pub fn shard_for(value: &str, shards: u32) -> u32 {
    murmur3_32(value.as_bytes(), SHARD_SEED) % shards.max(1)
}

/// A property named `id` addresses the primary key and is never indexed.
pub fn is_id_property(property: &str) -> bool {
    property.eq_ignore_ascii_case("id")
}

/// Index entries for the given correlation properties of `data`.
///
/// Id properties and unset values are skipped, and each property is indexed
/// at most once.
pub fn index_keys<T: SagaData>(
    type_key: &str,
    data: &T,
    properties: &[&str],
    shards: u32,
) -> Vec<IndexKey> {
    let mut keys: Vec<IndexKey> = Vec::with_capacity(properties.len());
    for property in properties.iter().filter(|p| !is_id_property(p)) {
        let Some(value) = data.correlation_value(property) else {
            continue;
        };
        let key = IndexKey::for_value(type_key, property, &value, shards);
        if !keys.contains(&key) {
            keys.push(key);
        }
    }
    keys
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize)]
    struct TestSaga {
        correlation_id: String,
        customer: Option<String>,
    }

    impl SagaData for TestSaga {
        const SAGA_TYPE: &'static str = "TestSaga";

        fn correlation_value(&self, property: &str) -> Option<String> {
            match property {
                "CorrelationId" => Some(self.correlation_id.clone()),
                "Customer" => self.customer.clone(),
                _ => None,
            }
        }
    }

    #[test]
    fn index_key_layout() {
        let key = IndexKey::for_value("test-saga", "CorrelationId", "abc", 10);
        assert_eq!(key.key, "index:test-saga:correlationid:6");
        assert_eq!(key.hash_field, "test-saga:correlationid:abc");
    }

    #[test]
    fn shard_is_stable_and_bounded() {
        assert_eq!(shard_for("order-1", 10), 9);
        assert_eq!(shard_for("order-2", 10), 3);
        assert_eq!(shard_for("hello", 16), 1);
        for value in ["a", "bb", "ccc", "dddd", "eeeee"] {
            assert!(shard_for(value, 7) < 7);
        }
    }

    #[test]
    fn single_shard_always_zero() {
        assert_eq!(shard_for("anything", 1), 0);
        assert_eq!(shard_for("anything", 0), 0);
    }

    #[test]
    fn saga_key_round_trips_id() {
        let id = SagaId::new();
        let key = saga_key(&type_key::<TestSaga>(), id);
        assert_eq!(key, format!("saga:test-saga:{id}"));
        assert_eq!(id_from_saga_key(&key), Some(id));
        assert_eq!(id_from_saga_key("index:test-saga:x:0"), None);
    }

    #[test]
    fn id_property_is_case_insensitive() {
        assert!(is_id_property("Id"));
        assert!(is_id_property("ID"));
        assert!(!is_id_property("OrderId"));
    }

    #[test]
    fn index_keys_skip_id_unset_and_repeated_properties() {
        let data = TestSaga {
            correlation_id: "abc".to_string(),
            customer: None,
        };
        let keys = index_keys(
            "test-saga",
            &data,
            &["Id", "CorrelationId", "Customer", "CorrelationId"],
            10,
        );
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].hash_field, "test-saga:correlationid:abc");
    }

    #[test]
    fn stored_index_list_format() {
        let keys = vec![IndexKey::for_value("test-saga", "Customer", "c-1", 1)];
        let json = serde_json::to_string(&keys).unwrap();
        assert_eq!(
            json,
            r#"[{"key":"index:test-saga:customer:0","hashField":"test-saga:customer:c-1"}]"#
        );
    }
}
