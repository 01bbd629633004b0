// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-flight request deduplication.
//!
//! Collapses concurrent identical reads into one underlying call. The first
//! caller for a [`QueryKey`] starts the call; everyone who asks for the same
//! key before it settles joins the wait-list and receives a clone of the same
//! outcome, success or error. Once the call settles the entry is gone, so the
//! next request for that key starts a fresh call.
//!
//! The underlying call runs on its own task. A joined caller therefore still
//! gets its answer if the caller that started the call is dropped.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::debug;

use crate::query_key::QueryKey;
use crate::storage::traits::{codes, StoreError};

type Waiters<T> = Vec<oneshot::Sender<Result<T, StoreError>>>;

/// Wait-lists keyed by query, one per in-flight call.
pub struct InFlight<T> {
    entries: Arc<DashMap<QueryKey, Waiters<T>>>,
}

impl<T> InFlight<T>
where
    T: Clone + Send + 'static,
{
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
        }
    }

    /// Keys with a call in progress
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn is_in_flight(&self, key: &QueryKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Run `factory` for `key`, or join the call already running for it.
    ///
    /// `factory` is only invoked when no call for `key` is in flight.
    pub async fn execute<F, Fut>(&self, key: QueryKey, factory: F) -> Result<T, StoreError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, StoreError>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();

        let leader = match self.entries.entry(key.clone()) {
            Entry::Occupied(mut waiting) => {
                waiting.get_mut().push(tx);
                false
            }
            Entry::Vacant(slot) => {
                slot.insert(vec![tx]);
                true
            }
        };

        if leader {
            crate::metrics::set_in_flight(self.entries.len());
            let call = factory();
            let mut cleanup = EntryCleanup {
                entries: Arc::clone(&self.entries),
                key: Some(key),
            };
            tokio::spawn(async move {
                let result = call.await;
                let waiters = cleanup.take();
                debug!(waiters = waiters.len(), ok = result.is_ok(), "In-flight call settled");
                for waiter in waiters {
                    // A waiter that went away does not need the result
                    let _ = waiter.send(result.clone());
                }
            });
        } else {
            debug!(key = %key, "Joined in-flight call");
            crate::metrics::record_dedup_join();
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(StoreError::new(
                codes::UNKNOWN,
                "in-flight call ended without a result",
            )),
        }
    }
}

impl<T> Default for InFlight<T>
where
    T: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Removes the wait-list when the call settles, or if its task unwinds.
struct EntryCleanup<T> {
    entries: Arc<DashMap<QueryKey, Waiters<T>>>,
    key: Option<QueryKey>,
}

impl<T> EntryCleanup<T> {
    fn take(&mut self) -> Waiters<T> {
        let waiters = self
            .key
            .take()
            .and_then(|key| self.entries.remove(&key))
            .map(|(_, waiters)| waiters)
            .unwrap_or_default();
        crate::metrics::set_in_flight(self.entries.len());
        waiters
    }
}

impl<T> Drop for EntryCleanup<T> {
    fn drop(&mut self) {
        if self.key.is_some() {
            // Dropping the senders wakes every waiter with an error
            drop(self.take());
        }
    }
}
