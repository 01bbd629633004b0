//! End-to-end tests for the query coordinator.
//!
//! Drives a [`Coordinator`] over an [`InMemoryStore`] with tokio's paused
//! clock, so throttle spacing and backoff are observed exactly.
//!
//! Run with: `cargo test --test coordinator`

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::time::Instant;

use query_coordinator::{
    codes, Coordinator, CoordinatorConfig, DataCallback, DetachFn, ErrorCallback, InMemoryStore,
    Operation, Query, RemoteStore, StoreError,
};

// =============================================================================
// Helpers
// =============================================================================

/// 10 delivered orders plus a few that are still pending.
fn seeded_orders() -> Arc<InMemoryStore> {
    let store = Arc::new(InMemoryStore::new());
    for i in 0..10 {
        store.insert("orders", &format!("d{i:02}"), json!({"status": "delivered", "total": i * 10}));
    }
    for i in 0..3 {
        store.insert("orders", &format!("p{i:02}"), json!({"status": "pending", "total": i}));
    }
    store
}

fn coordinator(store: &Arc<InMemoryStore>) -> Arc<Coordinator> {
    Arc::new(Coordinator::new(store.clone(), CoordinatorConfig::default()).unwrap())
}

fn delivered() -> Query {
    Query::collection("orders").where_eq("status", "delivered")
}

fn collector() -> (DataCallback, Arc<Mutex<Vec<Value>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    (Arc::new(move |v| sink.lock().push(v)), seen)
}

fn error_counter() -> (ErrorCallback, Arc<Mutex<Vec<StoreError>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    (Arc::new(move |e| sink.lock().push(e)), seen)
}

// =============================================================================
// Deduplication
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_identical_reads_in_one_tick_share_one_call() {
    let store = seeded_orders();
    let coordinator = coordinator(&store);

    let (a, b) = tokio::join!(coordinator.fetch(delivered()), coordinator.fetch(delivered()));
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(store.execute_calls(), 1);
    assert_eq!(a.as_array().map(Vec::len), Some(10));
    assert_eq!(a, b);
    assert!(coordinator.stats().is_idle());
}

#[tokio::test(start_paused = true)]
async fn test_many_concurrent_callers_one_call() {
    let store = seeded_orders();
    store.set_latency(Duration::from_millis(30));
    let coordinator = coordinator(&store);

    let mut handles = Vec::new();
    for _ in 0..25 {
        let coordinator = coordinator.clone();
        handles.push(tokio::spawn(async move { coordinator.fetch(delivered()).await }));
    }

    let mut results = Vec::new();
    for h in handles {
        results.push(h.await.unwrap().unwrap());
    }
    assert_eq!(store.execute_calls(), 1);
    assert!(results.windows(2).all(|w| w[0] == w[1]));
}

#[tokio::test(start_paused = true)]
async fn test_shared_error_reaches_every_waiter() {
    let store = seeded_orders();
    store.inject_error(StoreError::permission_denied("missing read role"));
    let coordinator = coordinator(&store);

    let (a, b) = tokio::join!(coordinator.fetch(delivered()), coordinator.fetch(delivered()));

    let expected = StoreError::permission_denied("missing read role");
    assert_eq!(a.unwrap_err(), expected);
    assert_eq!(b.unwrap_err(), expected);
    assert_eq!(store.execute_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_settled_read_is_dispatched_again() {
    let store = seeded_orders();
    let coordinator = coordinator(&store);

    coordinator.fetch(delivered()).await.unwrap();
    store.insert("orders", "d10", json!({"status": "delivered", "total": 5}));
    let second = coordinator.fetch(delivered()).await.unwrap();

    assert_eq!(store.execute_calls(), 2);
    assert_eq!(second.as_array().map(Vec::len), Some(11));
}

#[tokio::test(start_paused = true)]
async fn test_writes_are_never_collapsed() {
    let store = Arc::new(InMemoryStore::new());
    let coordinator = coordinator(&store);

    let (a, b) = tokio::join!(
        coordinator.set("counters", "c1", json!({"n": 1})),
        coordinator.set("counters", "c1", json!({"n": 1})),
    );
    a.unwrap();
    b.unwrap();

    assert_eq!(store.execute_calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_get_is_deduplicated_per_document() {
    let store = seeded_orders();
    let coordinator = coordinator(&store);

    let (a, b, c) = tokio::join!(
        coordinator.get("orders", "d01"),
        coordinator.get("orders", "d01"),
        coordinator.get("orders", "d02"),
    );

    assert_eq!(a.unwrap(), b.unwrap());
    assert_eq!(c.unwrap()["id"], "d02");
    assert_eq!(store.execute_calls(), 2);
}

// =============================================================================
// Serialization & Throttle
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_distinct_reads_are_serialized() {
    let store = seeded_orders();
    store.set_latency(Duration::from_millis(10));
    let coordinator = coordinator(&store);

    let mut handles = Vec::new();
    for i in 0..6 {
        let coordinator = coordinator.clone();
        handles.push(tokio::spawn(async move {
            coordinator
                .fetch(Query::collection("orders").where_eq("total", i * 10))
                .await
        }));
    }
    for h in handles {
        h.await.unwrap().unwrap();
    }

    assert_eq!(store.execute_calls(), 6);
    assert_eq!(store.peak_concurrency(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_dispatch_starts_are_spaced() {
    let store = seeded_orders();
    let coordinator = coordinator(&store);
    let interval = coordinator.config().min_dispatch_interval();

    let start = Instant::now();
    let mut handles = Vec::new();
    for i in 0..5 {
        let coordinator = coordinator.clone();
        handles.push(tokio::spawn(async move {
            coordinator.get("orders", &format!("d{i:02}")).await
        }));
    }
    for h in handles {
        h.await.unwrap().unwrap();
    }

    // Five starts, four gaps of at least one interval
    assert!(start.elapsed() >= interval * 4);
}

#[tokio::test(start_paused = true)]
async fn test_reads_and_writes_share_the_chain() {
    let store = seeded_orders();
    store.set_latency(Duration::from_millis(5));
    let coordinator = coordinator(&store);

    let reader = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { coordinator.fetch(delivered()).await })
    };
    let writer = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            coordinator
                .batch(vec![
                    Operation::Set {
                        collection: "orders".into(),
                        id: "n1".into(),
                        data: json!({"status": "pending"}),
                    },
                    Operation::Delete {
                        collection: "orders".into(),
                        id: "p00".into(),
                    },
                ])
                .await
        })
    };

    reader.await.unwrap().unwrap();
    writer.await.unwrap().unwrap();
    assert_eq!(store.peak_concurrency(), 1);
    assert_eq!(store.len("orders"), 13);
}

// =============================================================================
// Retries
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_transient_failures_are_retried() {
    let store = seeded_orders();
    store.inject_errors(StoreError::internal("INTERNAL ASSERTION FAILED: Unexpected state"), 2);
    let coordinator = coordinator(&store);

    let start = Instant::now();
    let orders = coordinator.fetch(delivered()).await.unwrap();

    assert_eq!(orders.as_array().map(Vec::len), Some(10));
    assert_eq!(store.execute_calls(), 3);
    // 200ms + 400ms of backoff
    assert!(start.elapsed() >= Duration::from_millis(600));
}

#[tokio::test(start_paused = true)]
async fn test_writes_follow_configured_retry_settings() {
    let store = Arc::new(InMemoryStore::new());
    let mut config = CoordinatorConfig::default();
    config.retry.max_retries = 0;
    let coordinator = Coordinator::new(store.clone(), config).unwrap();

    store.inject_errors(StoreError::internal("INTERNAL ASSERTION FAILED: Unexpected state"), 2);
    let err = coordinator.set("counters", "c1", json!({"n": 1})).await.unwrap_err();

    assert_eq!(err.code, codes::INTERNAL);
    assert_eq!(store.execute_calls(), 1);
    assert_eq!(store.len("counters"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_write_backoff_uses_configured_base_delay() {
    let store = Arc::new(InMemoryStore::new());
    let mut config = CoordinatorConfig::default();
    config.retry.base_delay_ms = 4_000;
    let coordinator = Coordinator::new(store.clone(), config).unwrap();

    store.inject_errors(StoreError::internal("INTERNAL ASSERTION FAILED: Unexpected state"), 2);
    let start = Instant::now();
    coordinator.set("counters", "c1", json!({"n": 1})).await.unwrap();

    assert_eq!(store.execute_calls(), 3);
    // 4s + 8s, never clamped
    assert!(start.elapsed() >= Duration::from_secs(12));
    assert!(start.elapsed() < Duration::from_secs(13));
}

#[tokio::test(start_paused = true)]
async fn test_abandoned_queued_write_leaves_stats_idle() {
    let store = Arc::new(InMemoryStore::new());
    store.set_latency(Duration::from_millis(500));
    let coordinator = coordinator(&store);

    let first = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { coordinator.set("counters", "c1", json!({"n": 1})).await })
    };
    tokio::task::yield_now().await;

    let abandoned = tokio::time::timeout(
        Duration::from_millis(50),
        coordinator.set("counters", "c2", json!({"n": 2})),
    )
    .await;
    assert!(abandoned.is_err());

    first.await.unwrap().unwrap();
    let stats = coordinator.stats();
    assert_eq!(stats.queued_dispatches, 0);
    assert!(stats.is_idle());
    assert_eq!(store.len("counters"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_other_errors_propagate_unmodified() {
    let store = seeded_orders();
    let coordinator = coordinator(&store);

    let err = coordinator.get("orders", "nope").await.unwrap_err();

    assert_eq!(err.code, codes::NOT_FOUND);
    assert_eq!(store.execute_calls(), 1);
}

// =============================================================================
// Listeners
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_shared_listener_sees_writes() {
    let store = seeded_orders();
    let coordinator = coordinator(&store);
    let (on_data, seen) = collector();
    let (on_error, _) = error_counter();

    let first = coordinator
        .subscribe(delivered(), on_data.clone(), on_error.clone())
        .await
        .unwrap();
    let second = coordinator
        .subscribe(delivered(), on_data, on_error)
        .await
        .unwrap();
    assert_eq!(store.subscribe_calls(), 1);

    seen.lock().clear();
    coordinator
        .set("orders", "d10", json!({"status": "delivered", "total": 1}))
        .await
        .unwrap();

    // One store listener, two consumers
    let seen = seen.lock();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0].as_array().map(Vec::len), Some(11));
    drop(seen);

    first.detach();
    second.detach();
    assert_eq!(store.active_listeners(), 0);
    assert_eq!(store.detach_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_listener_attachments_are_spaced() {
    let store = seeded_orders();
    let coordinator = coordinator(&store);
    let interval = coordinator.config().min_listener_interval();
    let (on_data, _) = collector();
    let (on_error, _) = error_counter();

    let start = Instant::now();
    let a = coordinator
        .subscribe(delivered(), on_data.clone(), on_error.clone())
        .await
        .unwrap();
    let b = coordinator
        .subscribe(Query::collection("customers"), on_data, on_error)
        .await
        .unwrap();

    assert!(start.elapsed() >= interval);
    assert_eq!(store.subscribe_calls(), 2);
    assert_eq!(coordinator.stats().active_listeners, 2);
    drop((a, b));
    assert_eq!(coordinator.stats().active_listeners, 0);
}

#[tokio::test(start_paused = true)]
async fn test_listener_error_filtering() {
    let store = seeded_orders();
    let coordinator = coordinator(&store);
    let (on_data, _) = collector();
    let (on_error, errors) = error_counter();

    let _handle = coordinator
        .subscribe(delivered(), on_data, on_error)
        .await
        .unwrap();

    store.emit_error("orders", StoreError::internal("INTERNAL ASSERTION FAILED: Unexpected state"));
    store.emit_error("orders", StoreError::internal("AsyncQueue is already failed"));
    assert!(errors.lock().is_empty());

    store.emit_error("orders", StoreError::permission_denied("rules changed"));
    assert_eq!(errors.lock().as_slice(), &[StoreError::permission_denied("rules changed")]);
}

#[tokio::test(start_paused = true)]
async fn test_failed_subscribe_leaves_no_entry() {
    struct RefusingStore {
        inner: InMemoryStore,
        attempts: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl RemoteStore for RefusingStore {
        async fn execute(&self, op: &Operation) -> Result<Value, StoreError> {
            self.inner.execute(op).await
        }

        async fn subscribe(
            &self,
            _query: &Query,
            _on_data: DataCallback,
            _on_error: ErrorCallback,
        ) -> Result<DetachFn, StoreError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::permission_denied("listeners disabled"))
        }

        async fn disable_network(&self) -> Result<(), StoreError> {
            self.inner.disable_network().await
        }

        async fn enable_network(&self) -> Result<(), StoreError> {
            self.inner.enable_network().await
        }
    }

    let store = Arc::new(RefusingStore {
        inner: InMemoryStore::new(),
        attempts: AtomicUsize::new(0),
    });
    let coordinator = Coordinator::new(store.clone(), CoordinatorConfig::default()).unwrap();
    let (on_data, _) = collector();
    let (on_error, _) = error_counter();

    let err = coordinator
        .subscribe(delivered(), on_data, on_error)
        .await
        .unwrap_err();

    assert_eq!(err, StoreError::permission_denied("listeners disabled"));
    assert_eq!(store.attempts.load(Ordering::SeqCst), 1);
    assert_eq!(coordinator.stats().active_listeners, 0);
}
