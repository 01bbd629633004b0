//! # Query Coordinator
//!
//! A coordination and resilience layer between application code and a remote
//! document store whose client misbehaves under concurrent load.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Application call sites                   │
//! │  • fetch() / get() / set() / batch()                       │
//! │  • subscribe() → ListenerHandle                            │
//! └─────────────────────────────────────────────────────────────┘
//!               │ reads                          │ listeners
//!               ▼                                ▼
//! ┌──────────────────────────────┐  ┌──────────────────────────────┐
//! │   InFlight deduplication     │  │  ListenerRegistry            │
//! │  • one call per QueryKey     │  │  • ref-counted subscriptions │
//! └──────────────────────────────┘  │  • deferred teardown         │
//!               │                   └──────────────────────────────┘
//!               ▼                                │
//! ┌──────────────────────────────┐  ┌──────────────────────────────┐
//! │   "queries" DispatchChain    │  │  "listeners" DispatchChain   │
//! │  • FIFO, one at a time       │  │  • FIFO, one at a time       │
//! │  • minimum spacing           │  │  • minimum spacing           │
//! └──────────────────────────────┘  └──────────────────────────────┘
//!               │                                │
//!               ▼                                ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │          CircuitBreaker gate  →  with_retry (transient)     │
//! │  • queue corruption opens the breaker, self-heal in bg     │
//! │  • offline → enable_network() + one retry                  │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//!                      dyn RemoteStore
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use query_coordinator::{Coordinator, CoordinatorConfig, InMemoryStore, Query};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let store = Arc::new(InMemoryStore::new());
//!     store.insert("orders", "o-1", json!({"status": "delivered", "total": 120}));
//!
//!     let coordinator = Coordinator::new(store, CoordinatorConfig::default())
//!         .expect("valid config");
//!
//!     let orders = coordinator
//!         .fetch(Query::collection("orders").where_eq("status", "delivered"))
//!         .await
//!         .expect("query failed");
//!     println!("{orders}");
//! }
//! ```
//!
//! ## Modules
//!
//! - [`coordinator`]: The [`Coordinator`] wiring everything together
//! - [`query_key`]: Query builder and canonical [`QueryKey`]s
//! - [`dedup`]: In-flight request deduplication
//! - [`throttle`]: FIFO, rate-limited dispatch chains
//! - [`listener`]: Reference-counted listener registry
//! - [`resilience`]: Error classification, retry, circuit breaker
//! - [`storage`]: The [`RemoteStore`] contract and [`InMemoryStore`]

pub mod config;
pub mod coordinator;
pub mod dedup;
pub mod listener;
pub mod metrics;
pub mod query_key;
pub mod resilience;
pub mod storage;
pub mod throttle;

pub use config::{ConfigError, CoordinatorConfig, RetrySettings};
pub use coordinator::{Coordinator, CoordinatorStats};
pub use dedup::InFlight;
pub use listener::{ListenerHandle, ListenerPhase, ListenerRegistry};
pub use metrics::LatencyTimer;
pub use query_key::{Clause, Direction, FilterOp, Query, QueryKey};
pub use resilience::circuit_breaker::{CircuitBreaker, CircuitState};
pub use resilience::classify::{classify, ErrorClass};
pub use resilience::retry::{with_retry, RetryConfig};
pub use storage::memory::InMemoryStore;
pub use storage::traits::{codes, DataCallback, DetachFn, ErrorCallback, Operation, RemoteStore, StoreError};
pub use throttle::{DispatchChain, DispatchTurn};
