//! Shared fixtures for the storage integration tests.

use std::sync::Arc;

use serde_json::{Value, json};
use tessera_storage::{
    BackendKind, Clock, KvStore, ManualClock, MemoryKvStore, Storage, StorageOptions,
    TableDefinition,
};
use tessera_telemetry::{LogConfig, LogFormat, setup_logging};

/// Both backends, for tests that must hold on either.
#[allow(dead_code)]
pub const BACKENDS: [BackendKind; 2] = [BackendKind::Indexed, BackendKind::Flat];

/// Route storage events to the test output. Safe to call from every test.
pub fn init_tracing() {
    let config = LogConfig::new("warn")
        .with_directive("tessera_storage=debug")
        .with_format(LogFormat::Compact)
        .without_ansi();
    // Only the first call in a test binary installs the subscriber.
    let _ = setup_logging(&config);
}

/// `users` keyed by `id` with `age` and `city` indexed, `orders` keyed by
/// `orderId` with `userId` indexed.
#[allow(dead_code)]
pub fn options(backend: BackendKind) -> StorageOptions {
    StorageOptions::new(
        backend,
        "app",
        1,
        [
            (
                "users",
                TableDefinition::keyed("id")
                    .with_index("age")
                    .with_index("city"),
            ),
            ("orders", TableDefinition::keyed("orderId").with_index("userId")),
        ],
    )
}

/// A storage handle over in-memory backing and the system clock.
#[allow(dead_code)]
pub async fn open(backend: BackendKind) -> Storage {
    init_tracing();
    Storage::open(options(backend)).await.unwrap()
}

/// A storage handle driven by a manual clock starting at one million ms.
#[allow(dead_code)]
pub async fn open_with_clock(backend: BackendKind) -> (Storage, Arc<ManualClock>) {
    init_tracing();
    let clock = Arc::new(ManualClock::new(1_000_000));
    let storage = Storage::open(options(backend).with_clock(clock.clone() as Arc<dyn Clock>))
        .await
        .unwrap();
    (storage, clock)
}

/// A flat storage handle plus direct access to the store beneath it.
#[allow(dead_code)]
pub async fn open_flat_with_store() -> (Storage, Arc<MemoryKvStore>) {
    init_tracing();
    let kv = Arc::new(MemoryKvStore::new());
    let storage = Storage::open(
        options(BackendKind::Flat).with_kv_store(kv.clone() as Arc<dyn KvStore>),
    )
    .await
    .unwrap();
    (storage, kv)
}

/// Four users across three cities.
#[allow(dead_code)]
pub fn users() -> Vec<Value> {
    vec![
        json!({ "id": 1, "name": "Alice", "age": 30, "city": "Paris" }),
        json!({ "id": 2, "name": "Bob", "age": 25, "city": "London" }),
        json!({ "id": 3, "name": "Chloe", "age": 35, "city": "Paris" }),
        json!({ "id": 4, "name": "Dmitri", "age": 28, "city": "Berlin" }),
    ]
}

/// `id` fields of `records`, in order.
#[allow(dead_code)]
pub fn ids(records: &[Value]) -> Vec<i64> {
    records.iter().filter_map(|r| r["id"].as_i64()).collect()
}
