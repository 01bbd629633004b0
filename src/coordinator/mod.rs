// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Query coordinator.
//!
//! The [`Coordinator`] is the single object application code talks to. It
//! ties together every protection this crate offers around a [`RemoteStore`]:
//! - In-flight deduplication of identical reads
//! - A FIFO, throttled dispatch chain for queries and writes
//! - A second, independent chain for listener attachments
//! - Classification-aware retries for transient failures
//! - A corruption circuit breaker with background self-heal
//! - Reference-counted listeners with race-free teardown
//!
//! # Read path
//!
//! ```text
//! fetch(query) → QueryKey → InFlight (join | start) → query turn → throttle
//!              → breaker gate → retry → store.execute → fan-out → release turn
//! ```
//!
//! Writes take the same path minus deduplication.
//!
//! # Example
//!
//! ```rust,no_run
//! use query_coordinator::{Coordinator, CoordinatorConfig, InMemoryStore, Query};
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let store = Arc::new(InMemoryStore::new());
//! let coordinator = Coordinator::new(store, CoordinatorConfig::default())
//!     .expect("valid config");
//!
//! let delivered = coordinator
//!     .fetch(Query::collection("orders").where_eq("status", "delivered"))
//!     .await
//!     .expect("query failed");
//! println!("{delivered}");
//! # }
//! ```

mod api;
mod dispatch;
mod types;

pub use types::CoordinatorStats;

use std::sync::Arc;

use serde_json::Value;
use tracing::info;

use crate::config::{ConfigError, CoordinatorConfig};
use crate::dedup::InFlight;
use crate::listener::ListenerRegistry;
use crate::resilience::circuit_breaker::CircuitBreaker;
use crate::resilience::retry::RetryConfig;
use crate::storage::traits::RemoteStore;
use crate::throttle::DispatchChain;

use dispatch::Pipeline;

/// Coordinates every call the application makes to a remote document store.
///
/// Construct one per store connection and share it (by reference or `Arc`)
/// with every call site. Two coordinators over the same store client do not
/// know about each other and defeat the serialization.
///
/// # Thread Safety
///
/// The coordinator is `Send + Sync`. All methods take `&self`.
pub struct Coordinator {
    config: CoordinatorConfig,

    /// Everything a dispatch needs; shared with spawned dedup tasks
    pipeline: Arc<Pipeline>,

    /// Wait-lists for reads in flight
    in_flight: InFlight<Value>,

    /// Shared listeners, attached through their own chain
    listeners: ListenerRegistry,
}

impl Coordinator {
    /// Create a coordinator in front of `store`.
    ///
    /// Fails only if `config` does not pass [`CoordinatorConfig::validate`].
    pub fn new(store: Arc<dyn RemoteStore>, config: CoordinatorConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let breaker = CircuitBreaker::new(
            "store",
            config.circuit_breaker_cooldown(),
            config.reset_pause(),
        );
        let pipeline = Pipeline {
            store,
            breaker,
            queries: DispatchChain::new("queries", config.min_dispatch_interval()),
            retry: RetryConfig::from_settings(config.retry.max_retries, config.retry.base_delay()),
            max_corruption_recoveries: config.max_corruption_recoveries,
        };
        let listeners = ListenerRegistry::new(DispatchChain::new(
            "listeners",
            config.min_listener_interval(),
        ));

        info!(
            dispatch_interval_ms = config.min_dispatch_interval_ms,
            listener_interval_ms = config.min_listener_interval_ms,
            cooldown_ms = config.circuit_breaker_cooldown_ms,
            "Query coordinator created"
        );

        Ok(Self {
            config,
            pipeline: Arc::new(pipeline),
            in_flight: InFlight::new(),
            listeners,
        })
    }

    #[must_use]
    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// The store this coordinator dispatches to
    #[must_use]
    pub fn store(&self) -> &Arc<dyn RemoteStore> {
        &self.pipeline.store
    }

    #[must_use]
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.pipeline.breaker
    }

    #[must_use]
    pub fn listeners(&self) -> &ListenerRegistry {
        &self.listeners
    }

    /// Snapshot of in-flight, listener and breaker state.
    #[must_use]
    pub fn stats(&self) -> CoordinatorStats {
        CoordinatorStats {
            in_flight: self.in_flight.len(),
            active_listeners: self.listeners.len(),
            queued_dispatches: self.pipeline.queries.queued(),
            circuit_state: self.pipeline.breaker.state(),
            circuit_trips: self.pipeline.breaker.trips(),
        }
    }
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::circuit_breaker::CircuitState;
    use crate::storage::memory::InMemoryStore;

    #[test]
    fn test_invalid_config_rejected() {
        let config = CoordinatorConfig {
            circuit_breaker_cooldown_ms: 0,
            ..Default::default()
        };
        let err = Coordinator::new(Arc::new(InMemoryStore::new()), config).unwrap_err();
        assert_eq!(err, ConfigError::ZeroCooldown);
    }

    #[tokio::test]
    async fn test_fresh_coordinator_stats() {
        let coordinator =
            Coordinator::new(Arc::new(InMemoryStore::new()), CoordinatorConfig::default()).unwrap();
        let stats = coordinator.stats();
        assert!(stats.is_idle());
        assert_eq!(stats.active_listeners, 0);
        assert_eq!(stats.circuit_state, CircuitState::Closed);
        assert_eq!(stats.circuit_trips, 0);
    }
}
