use criterion::{Criterion, criterion_group, criterion_main};
use saga_store::SagaData;
use saga_store::index::{IndexKey, index_keys, shard_for};
use serde::{Deserialize, Serialize};
use std::hint::black_box;

#[derive(Serialize, Deserialize)]
struct OrderSaga {
    order_id: String,
    customer_id: String,
    shipment_id: Option<String>,
}

impl SagaData for OrderSaga {
    const SAGA_TYPE: &'static str = "OrderSaga";

    fn correlation_value(&self, property: &str) -> Option<String> {
        match property {
            "OrderId" => Some(self.order_id.clone()),
            "CustomerId" => Some(self.customer_id.clone()),
            "ShipmentId" => self.shipment_id.clone(),
            _ => None,
        }
    }
}

fn bench_shard_for(c: &mut Criterion) {
    c.bench_function("index/shard_for", |b| {
        b.iter(|| shard_for(black_box("order-7f3c2a91-5d4e-4b8f"), black_box(64)));
    });
}

fn bench_index_key(c: &mut Criterion) {
    c.bench_function("index/index_key", |b| {
        b.iter(|| {
            IndexKey::for_value(
                black_box("order-saga"),
                black_box("OrderId"),
                black_box("order-7f3c2a91-5d4e-4b8f"),
                64,
            )
        });
    });
}

fn bench_index_keys_for_saga(c: &mut Criterion) {
    let saga = OrderSaga {
        order_id: "order-7f3c2a91-5d4e-4b8f".to_string(),
        customer_id: "customer-12".to_string(),
        shipment_id: Some("shipment-99".to_string()),
    };

    c.bench_function("index/index_keys_three_properties", |b| {
        b.iter(|| {
            index_keys(
                "order-saga",
                black_box(&saga),
                &["Id", "OrderId", "CustomerId", "ShipmentId"],
                64,
            )
        });
    });
}

criterion_group!(
    benches,
    bench_shard_for,
    bench_index_key,
    bench_index_keys_for_saga
);
criterion_main!(benches);
