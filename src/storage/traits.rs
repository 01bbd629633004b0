use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::query_key::{Query, QueryKey};

/// Well-known error codes emitted by the remote store.
pub mod codes {
    pub const INTERNAL: &str = "internal";
    pub const ABORTED: &str = "aborted";
    pub const UNAVAILABLE: &str = "unavailable";
    pub const NOT_FOUND: &str = "not-found";
    pub const PERMISSION_DENIED: &str = "permission-denied";
    pub const INVALID_ARGUMENT: &str = "invalid-argument";
    pub const FAILED_PRECONDITION: &str = "failed-precondition";
    pub const UNKNOWN: &str = "unknown";
}

/// Error surfaced by the remote store.
///
/// `code` is a stable discriminant; `message` is free text. Both are
/// inspected by [`crate::resilience::classify`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{code}: {message}")]
pub struct StoreError {
    pub code: String,
    pub message: String,
}

impl StoreError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(codes::INTERNAL, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(codes::UNAVAILABLE, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(codes::NOT_FOUND, message)
    }

    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::new(codes::PERMISSION_DENIED, message)
    }
}

/// One request/response operation against the remote store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// Multi-document read
    Query(Query),
    /// Single-document read
    Get { collection: String, id: String },
    /// Create or overwrite a document
    Set { collection: String, id: String, data: Value },
    /// Merge fields into an existing document
    Update { collection: String, id: String, fields: Value },
    Delete { collection: String, id: String },
    /// Atomic group of writes
    Batch(Vec<Operation>),
}

impl Operation {
    /// Dedup key for reads. Writes have no key and are never collapsed.
    #[must_use]
    pub fn read_key(&self) -> Option<QueryKey> {
        match self {
            Self::Query(query) => Some(query.key()),
            Self::Get { collection, id } => Some(QueryKey::document(collection, id)),
            _ => None,
        }
    }

    /// Short label for logs and metrics
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Query(_) => "query",
            Self::Get { .. } => "get",
            Self::Set { .. } => "set",
            Self::Update { .. } => "update",
            Self::Delete { .. } => "delete",
            Self::Batch(_) => "batch",
        }
    }
}

/// Tears down a live subscription. Called at most once.
pub type DetachFn = Box<dyn FnOnce() + Send>;

/// Receives each snapshot delivered by a subscription.
pub type DataCallback = Arc<dyn Fn(Value) + Send + Sync>;

/// Receives errors delivered by a subscription.
pub type ErrorCallback = Arc<dyn Fn(StoreError) + Send + Sync>;

/// The remote document store, as seen by the coordinator.
///
/// Implementations wrap the vendor client. The coordinator assumes the client
/// is intolerant of concurrent use and never calls it in parallel on the same
/// chain.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Run a single read, write or batch.
    async fn execute(&self, op: &Operation) -> Result<Value, StoreError>;

    /// Attach a streaming listener. `on_data` may fire many times.
    async fn subscribe(
        &self,
        query: &Query,
        on_data: DataCallback,
        on_error: ErrorCallback,
    ) -> Result<DetachFn, StoreError>;

    async fn disable_network(&self) -> Result<(), StoreError>;

    async fn enable_network(&self) -> Result<(), StoreError>;

    /// Bounce the transport: disable, pause, re-enable.
    async fn reset_connectivity(&self, pause: Duration) -> Result<(), StoreError> {
        self.disable_network().await?;
        tokio::time::sleep(pause).await;
        self.enable_network().await
    }
}
