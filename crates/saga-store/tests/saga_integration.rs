//! Redis integration tests for the saga store
//!
//! These tests use a shared Redis container for efficiency.
//! Run with:
//!
//! ```bash
//! cargo test -p saga-store --test saga_integration
//! ```

use std::sync::Arc;

use outbox::{RedisOutboxQueue, TransportMessage};
use redis::AsyncCommands;
use saga_store::{
    RedisSagaStore, Revision, SagaData, SagaId, SagaRecord, SagaStorage, SagaStoreConfig,
    SagaStoreError,
};
use serde::{Deserialize, Serialize};
use serial_test::serial;
use testcontainers::{ContainerAsync, ImageExt, runners::AsyncRunner};
use testcontainers_modules::redis::Redis;
use tokio::sync::OnceCell;
use transaction::{ConcurrencyConflict, RedisProvider, RedisSettings, UnitOfWork};

/// Shared container info - container stays alive for all tests
struct ContainerInfo {
    #[allow(dead_code)] // Container must stay alive for tests
    container: ContainerAsync<Redis>,
    url: String,
}

static CONTAINER: OnceCell<Arc<ContainerInfo>> = OnceCell::const_new();

async fn get_container_info() -> Arc<ContainerInfo> {
    CONTAINER
        .get_or_init(|| async {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
                .with_test_writer()
                .try_init();

            let container = Redis::default().with_tag("7.2").start().await.unwrap();
            let host = container.get_host().await.unwrap();
            let port = container.get_host_port_ipv4(6379).await.unwrap();

            Arc::new(ContainerInfo {
                container,
                url: format!("redis://{}:{}", host, port),
            })
        })
        .await
        .clone()
}

/// Get a fresh store on a flushed database
async fn get_test_store(shards: u32) -> (RedisProvider, RedisSagaStore) {
    let info = get_container_info().await;
    let provider = RedisProvider::connect(&RedisSettings::new(info.url.clone()))
        .await
        .unwrap();

    let _: () = redis::cmd("FLUSHDB")
        .query_async(&mut provider.connection())
        .await
        .unwrap();

    let store = RedisSagaStore::new(
        provider.clone(),
        SagaStoreConfig::default().with_shards(shards),
    )
    .unwrap();
    (provider, store)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct OrderSaga {
    correlation_id: String,
    customer: Option<String>,
    step: u32,
}

impl SagaData for OrderSaga {
    const SAGA_TYPE: &'static str = "OrderSaga";

    fn correlation_value(&self, property: &str) -> Option<String> {
        match property {
            "CorrelationId" => Some(self.correlation_id.clone()),
            "Customer" => self.customer.clone(),
            _ => None,
        }
    }
}

const PROPERTIES: &[&str] = &["Id", "CorrelationId", "Customer"];

fn order(correlation_id: &str, customer: Option<&str>) -> SagaRecord<OrderSaga> {
    SagaRecord::new(
        SagaId::new(),
        OrderSaga {
            correlation_id: correlation_id.to_string(),
            customer: customer.map(str::to_string),
            step: 0,
        },
    )
}

#[tokio::test]
#[serial]
async fn insert_then_find_by_id() {
    let (provider, store) = get_test_store(1).await;
    let mut record = order("abc", None);

    let mut scope = provider.without_transaction();
    store
        .insert(&mut scope, &mut record, PROPERTIES)
        .await
        .unwrap();
    assert_eq!(record.revision, Revision::first());

    let loaded = store
        .find_by_id::<OrderSaga>(record.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(loaded.revision, Revision::first());
    assert_eq!(loaded.data, record.data);
    assert_eq!(loaded.id, record.id);
}

#[tokio::test]
#[serial]
async fn find_by_property_matches_find_by_id() {
    let (provider, store) = get_test_store(10).await;
    let mut record = order("abc", Some("customer-1"));

    let mut scope = provider.without_transaction();
    store
        .insert(&mut scope, &mut record, PROPERTIES)
        .await
        .unwrap();

    let by_id = store.find_by_id::<OrderSaga>(record.id).await.unwrap();
    let by_correlation = store
        .find_by_property::<OrderSaga>("CorrelationId", "abc")
        .await
        .unwrap();
    let by_customer = store
        .find_by_property::<OrderSaga>("Customer", "customer-1")
        .await
        .unwrap();
    let by_id_property = store
        .find_by_property::<OrderSaga>("id", &record.id.to_string())
        .await
        .unwrap();

    assert!(by_id.is_some());
    assert_eq!(by_correlation, by_id);
    assert_eq!(by_customer, by_id);
    assert_eq!(by_id_property, by_id);
}

#[tokio::test]
#[serial]
async fn index_entry_lands_in_hashed_shard() {
    let (provider, store) = get_test_store(10).await;
    let mut record = order("abc", None);

    let mut scope = provider.without_transaction();
    store
        .insert(&mut scope, &mut record, PROPERTIES)
        .await
        .unwrap();

    let target: Option<String> = provider
        .connection()
        .hget("index:order-saga:correlationid:6", "order-saga:correlationid:abc")
        .await
        .unwrap();
    assert_eq!(target, Some(format!("saga:order-saga:{}", record.id)));
}

#[tokio::test]
#[serial]
async fn unknown_values_are_not_found() {
    let (_provider, store) = get_test_store(4).await;

    assert!(
        store
            .find_by_property::<OrderSaga>("CorrelationId", "missing")
            .await
            .unwrap()
            .is_none()
    );
    assert!(
        store
            .find_by_property::<OrderSaga>("Id", "not-a-uuid")
            .await
            .unwrap()
            .is_none()
    );
    assert!(
        store
            .find_by_id::<OrderSaga>(SagaId::new())
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
#[serial]
async fn duplicate_insert_is_rejected_and_first_record_kept() {
    let (provider, store) = get_test_store(1).await;
    let mut first = order("abc", None);
    let mut scope = provider.without_transaction();
    store
        .insert(&mut scope, &mut first, PROPERTIES)
        .await
        .unwrap();

    let mut second = SagaRecord::new(
        first.id,
        OrderSaga {
            correlation_id: "other".to_string(),
            customer: None,
            step: 9,
        },
    );
    let err = store
        .insert(&mut scope, &mut second, PROPERTIES)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SagaStoreError::Conflict(ConcurrencyConflict::AlreadyExists { .. })
    ));

    let loaded = store
        .find_by_id::<OrderSaga>(first.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(loaded.data, first.data);
    assert!(
        store
            .find_by_property::<OrderSaga>("CorrelationId", "other")
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
#[serial]
async fn insert_validation() {
    let (provider, store) = get_test_store(1).await;
    let mut scope = provider.without_transaction();

    let mut nil = order("abc", None);
    nil.id = SagaId::from_uuid(uuid::Uuid::nil());
    assert!(matches!(
        store.insert(&mut scope, &mut nil, PROPERTIES).await,
        Err(SagaStoreError::InvalidSaga(_))
    ));

    let mut stored = order("abc", None);
    stored.revision = Revision::new(3);
    assert!(matches!(
        store.insert(&mut scope, &mut stored, PROPERTIES).await,
        Err(SagaStoreError::InvalidSaga(_))
    ));
}

#[tokio::test]
#[serial]
async fn concurrent_updates_one_wins() {
    let (provider, store) = get_test_store(1).await;
    let mut record = order("abc", None);
    let mut scope = provider.without_transaction();
    store
        .insert(&mut scope, &mut record, PROPERTIES)
        .await
        .unwrap();

    let mut copy_a = store
        .find_by_id::<OrderSaga>(record.id)
        .await
        .unwrap()
        .unwrap();
    let mut copy_b = copy_a.clone();
    copy_a.data.step = 1;
    copy_b.data.step = 2;

    store
        .update(&mut scope, &mut copy_a, PROPERTIES)
        .await
        .unwrap();
    assert_eq!(copy_a.revision, Revision::new(2));

    let err = store
        .update(&mut scope, &mut copy_b, PROPERTIES)
        .await
        .unwrap_err();
    match err {
        SagaStoreError::Conflict(ConcurrencyConflict::RevisionMismatch {
            expected, actual, ..
        }) => {
            assert_eq!(expected, Revision::first());
            assert_eq!(actual, Revision::new(2));
        }
        other => panic!("expected revision mismatch, got {other:?}"),
    }

    let loaded = store
        .find_by_id::<OrderSaga>(record.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(loaded.data.step, 1);
    assert_eq!(loaded.revision, Revision::new(2));
}

#[tokio::test]
#[serial]
async fn parallel_updates_from_same_revision() {
    let (provider, store) = get_test_store(1).await;
    let mut record = order("abc", None);
    store
        .insert(&mut provider.without_transaction(), &mut record, PROPERTIES)
        .await
        .unwrap();

    let attempts = (0..8).map(|step| {
        let store = store.clone();
        let provider = provider.clone();
        let mut copy = record.clone();
        async move {
            copy.data.step = step;
            let mut scope = provider.without_transaction();
            store.update(&mut scope, &mut copy, PROPERTIES).await
        }
    });
    let results = futures_util::future::join_all(attempts).await;

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(
        results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| matches!(e, SagaStoreError::Conflict(_)))
    );
}

#[tokio::test]
#[serial]
async fn concurrent_inserts_one_wins() {
    let (provider, store) = get_test_store(4).await;
    let id = SagaId::new();

    let attempts = (0..8u32).map(|step| {
        let store = store.clone();
        let provider = provider.clone();
        async move {
            let mut record = SagaRecord::new(
                id,
                OrderSaga {
                    correlation_id: format!("order-{step}"),
                    customer: None,
                    step,
                },
            );
            let mut scope = provider.without_transaction();
            let result = store.insert(&mut scope, &mut record, PROPERTIES).await;
            (step, result)
        }
    });
    let results = futures_util::future::join_all(attempts).await;

    let winners: Vec<u32> = results
        .iter()
        .filter(|(_, result)| result.is_ok())
        .map(|(step, _)| *step)
        .collect();
    assert_eq!(winners.len(), 1, "exactly one insert must succeed: {results:?}");
    for (_, result) in &results {
        if let Err(err) = result {
            assert!(
                matches!(
                    err,
                    SagaStoreError::Conflict(ConcurrencyConflict::AlreadyExists { .. })
                ),
                "unexpected error {err:?}"
            );
        }
    }

    let winner = winners[0];
    let loaded = store.find_by_id::<OrderSaga>(id).await.unwrap().unwrap();
    assert_eq!(loaded.data.step, winner);
    assert_eq!(loaded.revision, Revision::first());

    let found = store
        .find_by_property::<OrderSaga>("CorrelationId", &format!("order-{winner}"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found.id, id);
    assert_eq!(found.data, loaded.data);
    for step in (0..8u32).filter(|&step| step != winner) {
        assert!(
            store
                .find_by_property::<OrderSaga>("CorrelationId", &format!("order-{step}"))
                .await
                .unwrap()
                .is_none()
        );
    }
}

#[tokio::test]
#[serial]
async fn update_moves_changed_index_entries() {
    let (provider, store) = get_test_store(8).await;
    let mut record = order("abc", Some("customer-1"));
    let mut scope = provider.without_transaction();
    store
        .insert(&mut scope, &mut record, PROPERTIES)
        .await
        .unwrap();

    record.data.correlation_id = "xyz".to_string();
    record.data.customer = None;
    store
        .update(&mut scope, &mut record, PROPERTIES)
        .await
        .unwrap();

    let found = store
        .find_by_property::<OrderSaga>("CorrelationId", "xyz")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found.id, record.id);
    assert!(
        store
            .find_by_property::<OrderSaga>("CorrelationId", "abc")
            .await
            .unwrap()
            .is_none()
    );
    assert!(
        store
            .find_by_property::<OrderSaga>("Customer", "customer-1")
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
#[serial]
async fn update_of_missing_saga_is_a_conflict() {
    let (provider, store) = get_test_store(1).await;
    let mut record = order("abc", None);
    record.revision = Revision::first();

    let err = store
        .update(&mut provider.without_transaction(), &mut record, PROPERTIES)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SagaStoreError::Conflict(ConcurrencyConflict::Missing { .. })
    ));
}

#[tokio::test]
#[serial]
async fn delete_removes_record_and_index_entries() {
    let (provider, store) = get_test_store(10).await;
    let mut record = order("abc", Some("customer-1"));
    let mut scope = provider.without_transaction();
    store
        .insert(&mut scope, &mut record, PROPERTIES)
        .await
        .unwrap();

    store.delete(&mut scope, &record).await.unwrap();

    assert!(
        store
            .find_by_id::<OrderSaga>(record.id)
            .await
            .unwrap()
            .is_none()
    );
    assert!(
        store
            .find_by_property::<OrderSaga>("CorrelationId", "abc")
            .await
            .unwrap()
            .is_none()
    );
    let remaining: i64 = provider
        .connection()
        .hlen("index:order-saga:correlationid:6")
        .await
        .unwrap();
    assert_eq!(remaining, 0);
}

#[tokio::test]
#[serial]
async fn delete_keeps_index_entries_taken_over_by_another_saga() {
    let (provider, store) = get_test_store(1).await;
    let mut scope = provider.without_transaction();

    let mut first = order("shared", None);
    store
        .insert(&mut scope, &mut first, PROPERTIES)
        .await
        .unwrap();
    let mut second = order("shared", None);
    store
        .insert(&mut scope, &mut second, PROPERTIES)
        .await
        .unwrap();

    store.delete(&mut scope, &first).await.unwrap();

    let found = store
        .find_by_property::<OrderSaga>("CorrelationId", "shared")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found.id, second.id);
}

#[tokio::test]
#[serial]
async fn transactional_writes_commit_together() {
    let (provider, store) = get_test_store(4).await;
    let mut first = order("one", None);
    let mut second = order("two", None);

    let mut uow = UnitOfWork::begin(&provider);
    {
        let mut scope = uow.get_for_scope();
        store
            .insert(&mut scope, &mut first, PROPERTIES)
            .await
            .unwrap();
        store
            .insert(&mut scope, &mut second, PROPERTIES)
            .await
            .unwrap();
    }
    assert!(
        store
            .find_by_id::<OrderSaga>(first.id)
            .await
            .unwrap()
            .is_none()
    );

    uow.commit().await.unwrap();

    assert!(
        store
            .find_by_property::<OrderSaga>("CorrelationId", "one")
            .await
            .unwrap()
            .is_some()
    );
    assert!(
        store
            .find_by_property::<OrderSaga>("CorrelationId", "two")
            .await
            .unwrap()
            .is_some()
    );
}

#[tokio::test]
#[serial]
async fn stale_update_in_transaction_fails_on_commit() {
    let (provider, store) = get_test_store(1).await;
    let mut record = order("abc", None);
    store
        .insert(&mut provider.without_transaction(), &mut record, PROPERTIES)
        .await
        .unwrap();

    let mut stale = record.clone();
    record.data.step = 1;
    store
        .update(&mut provider.without_transaction(), &mut record, PROPERTIES)
        .await
        .unwrap();

    let mut scope = provider.with_transaction();
    stale.data.step = 5;
    store
        .update(&mut scope, &mut stale, PROPERTIES)
        .await
        .unwrap();
    let err = scope.commit().await.unwrap_err();
    assert!(matches!(
        err.as_conflict(),
        Some(ConcurrencyConflict::RevisionMismatch { .. })
    ));

    let loaded = store
        .find_by_id::<OrderSaga>(record.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(loaded.data.step, 1);
}

#[tokio::test]
#[serial]
async fn stale_update_discards_outbox_message_of_same_unit_of_work() {
    let (provider, store) = get_test_store(1).await;
    let queue = RedisOutboxQueue::new("orders-outbox");
    let mut record = order("abc", None);
    store
        .insert(&mut provider.without_transaction(), &mut record, PROPERTIES)
        .await
        .unwrap();

    let mut stale = record.clone();
    record.data.step = 1;
    store
        .update(&mut provider.without_transaction(), &mut record, PROPERTIES)
        .await
        .unwrap();

    let mut uow = UnitOfWork::begin(&provider);
    {
        let mut scope = uow.get_for_scope();
        stale.data.step = 5;
        store
            .update(&mut scope, &mut stale, PROPERTIES)
            .await
            .unwrap();
        queue
            .enqueue("billing", &TransportMessage::new(Default::default(), "step 5"), &mut scope)
            .await
            .unwrap();
    }

    let err = uow.commit().await.unwrap_err();
    assert!(matches!(
        err.as_conflict(),
        Some(ConcurrencyConflict::RevisionMismatch { expected, actual, .. })
            if *expected == Revision::first() && *actual == Revision::new(2)
    ));

    let length: usize = provider.connection().xlen("orders-outbox").await.unwrap();
    assert_eq!(length, 0);
    let loaded = store
        .find_by_id::<OrderSaga>(record.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(loaded.data.step, 1);
}

#[tokio::test]
#[serial]
async fn current_update_commits_with_outbox_message() {
    let (provider, store) = get_test_store(1).await;
    let queue = RedisOutboxQueue::new("orders-outbox");
    let mut record = order("abc", None);
    store
        .insert(&mut provider.without_transaction(), &mut record, PROPERTIES)
        .await
        .unwrap();

    let mut uow = UnitOfWork::begin(&provider);
    {
        let mut scope = uow.get_for_scope();
        record.data.step = 1;
        store
            .update(&mut scope, &mut record, PROPERTIES)
            .await
            .unwrap();
        queue
            .enqueue("billing", &TransportMessage::new(Default::default(), "step 1"), &mut scope)
            .await
            .unwrap();
    }
    uow.commit().await.unwrap();

    let length: usize = provider.connection().xlen("orders-outbox").await.unwrap();
    assert_eq!(length, 1);
    let loaded = store
        .find_by_id::<OrderSaga>(record.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(loaded.revision, Revision::new(2));
}

#[tokio::test]
#[serial]
async fn correlation_scenario_with_ten_shards() {
    let (provider, store) = get_test_store(10).await;
    let mut scope = provider.without_transaction();

    let mut s1 = order("abc", None);
    store.insert(&mut scope, &mut s1, PROPERTIES).await.unwrap();

    let found = store
        .find_by_property::<OrderSaga>("CorrelationId", "abc")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found.id, s1.id);

    let mut current = found.clone();
    let mut stale = found;
    current.data.step = 1;
    store
        .update(&mut scope, &mut current, PROPERTIES)
        .await
        .unwrap();
    stale.data.step = 2;
    assert!(matches!(
        store.update(&mut scope, &mut stale, PROPERTIES).await,
        Err(SagaStoreError::Conflict(
            ConcurrencyConflict::RevisionMismatch { .. }
        ))
    ));

    store.delete(&mut scope, &current).await.unwrap();
    assert!(
        store
            .find_by_property::<OrderSaga>("CorrelationId", "abc")
            .await
            .unwrap()
            .is_none()
    );
}
