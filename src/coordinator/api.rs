// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Application-facing API: reads, writes and listeners.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use crate::listener::ListenerHandle;
use crate::query_key::Query;
use crate::resilience::classify::{classify, ErrorClass};
use crate::storage::traits::{DataCallback, ErrorCallback, Operation, StoreError};

use super::Coordinator;

impl Coordinator {
    // ═══════════════════════════════════════════════════════════════════════════
    // API: Reads & Writes
    // ═══════════════════════════════════════════════════════════════════════════

    /// Run `op` through the full pipeline.
    ///
    /// Reads (`Query`, `Get`) are deduplicated: a caller asking for a key
    /// that is already in flight waits for that call instead of starting
    /// another. Writes are dispatched individually every time.
    pub async fn execute(&self, op: Operation) -> Result<Value, StoreError> {
        match op.read_key() {
            Some(key) => {
                let pipeline = Arc::clone(&self.pipeline);
                self.in_flight
                    .execute(key, move || async move { pipeline.dispatch(&op).await })
                    .await
            }
            None => self.pipeline.dispatch(&op).await,
        }
    }

    /// Run a multi-document query.
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// # use query_coordinator::{Coordinator, Direction, Query};
    /// # async fn example(coordinator: &Coordinator) {
    /// let recent = coordinator
    ///     .fetch(
    ///         Query::collection("orders")
    ///             .where_eq("status", "delivered")
    ///             .order_by("created_at", Direction::Desc)
    ///             .limit(20),
    ///     )
    ///     .await;
    /// # }
    /// ```
    pub async fn fetch(&self, query: Query) -> Result<Value, StoreError> {
        self.execute(Operation::Query(query)).await
    }

    /// Read a single document.
    pub async fn get(&self, collection: &str, id: &str) -> Result<Value, StoreError> {
        self.execute(Operation::Get {
            collection: collection.to_string(),
            id: id.to_string(),
        })
        .await
    }

    pub async fn set(&self, collection: &str, id: &str, data: Value) -> Result<Value, StoreError> {
        self.execute(Operation::Set {
            collection: collection.to_string(),
            id: id.to_string(),
            data,
        })
        .await
    }

    /// Merge `fields` into an existing document.
    pub async fn update(&self, collection: &str, id: &str, fields: Value) -> Result<Value, StoreError> {
        self.execute(Operation::Update {
            collection: collection.to_string(),
            id: id.to_string(),
            fields,
        })
        .await
    }

    pub async fn delete(&self, collection: &str, id: &str) -> Result<Value, StoreError> {
        self.execute(Operation::Delete {
            collection: collection.to_string(),
            id: id.to_string(),
        })
        .await
    }

    /// Apply a group of writes as one dispatch.
    pub async fn batch(&self, ops: Vec<Operation>) -> Result<Value, StoreError> {
        self.execute(Operation::Batch(ops)).await
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // API: Listeners
    // ═══════════════════════════════════════════════════════════════════════════

    /// Listen to `query`, sharing the subscription with every other consumer
    /// of the same query.
    ///
    /// The returned handle detaches this consumer when dropped or when
    /// [`ListenerHandle::detach`] is called. Transient and queue-corruption
    /// errors on the stream are logged and not passed to `on_error`.
    pub async fn subscribe(
        &self,
        query: Query,
        on_data: DataCallback,
        on_error: ErrorCallback,
    ) -> Result<ListenerHandle, StoreError> {
        let key = query.key().to_string();
        let pipeline = Arc::clone(&self.pipeline);

        self.listeners
            .attach(key, on_data, on_error, move |data, error| async move {
                pipeline.breaker.gate().await;
                match pipeline.store.subscribe(&query, data, error).await {
                    Ok(detach) => Ok(detach),
                    Err(err) => {
                        if classify(&err) == ErrorClass::QueueCorruption {
                            warn!(key = %query.key(), "Queue corruption while attaching listener");
                            pipeline.breaker.trip(&pipeline.store);
                        } else {
                            debug!(key = %query.key(), error = %err, "Listener attach failed");
                        }
                        Err(err)
                    }
                }
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoordinatorConfig;
    use crate::storage::memory::InMemoryStore;
    use parking_lot::Mutex;
    use serde_json::json;

    fn coordinator(store: Arc<InMemoryStore>) -> Coordinator {
        Coordinator::new(store, CoordinatorConfig::default()).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_and_set_roundtrip_through_store() {
        let store = Arc::new(InMemoryStore::new());
        let coordinator = coordinator(store.clone());

        coordinator
            .set("customers", "c1", json!({"name": "Acme"}))
            .await
            .unwrap();
        let doc = coordinator.get("customers", "c1").await.unwrap();

        assert_eq!(doc["name"], "Acme");
        assert_eq!(store.execute_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_and_delete() {
        let store = Arc::new(InMemoryStore::new());
        store.insert("customers", "c1", json!({"name": "Acme", "tier": "gold"}));
        let coordinator = coordinator(store.clone());

        coordinator
            .update("customers", "c1", json!({"tier": "platinum"}))
            .await
            .unwrap();
        let doc = coordinator.get("customers", "c1").await.unwrap();
        assert_eq!(doc["tier"], "platinum");
        assert_eq!(doc["name"], "Acme");

        coordinator.delete("customers", "c1").await.unwrap();
        assert_eq!(store.len("customers"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_shares_store_listener() {
        let store = Arc::new(InMemoryStore::new());
        store.insert("orders", "o1", json!({"status": "delivered"}));
        let coordinator = coordinator(store.clone());

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let on_data: DataCallback = Arc::new(move |v| sink.lock().push(v));
        let on_error: ErrorCallback = Arc::new(|_| {});

        let query = Query::collection("orders").where_eq("status", "delivered");
        let a = coordinator
            .subscribe(query.clone(), on_data.clone(), on_error.clone())
            .await
            .unwrap();
        let b = coordinator
            .subscribe(query, on_data, on_error)
            .await
            .unwrap();

        assert_eq!(store.subscribe_calls(), 1);
        assert_eq!(coordinator.stats().active_listeners, 1);
        // One initial snapshot from the store, one replayed to the late joiner
        assert_eq!(seen.lock().len(), 2);

        drop(a);
        assert_eq!(store.active_listeners(), 1);
        drop(b);
        assert_eq!(store.active_listeners(), 0);
        assert_eq!(store.detach_calls(), 1);
    }
}
