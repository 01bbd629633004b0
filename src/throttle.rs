// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Dispatch throttle and global serializer.
//!
//! A [`DispatchChain`] hands out one [`DispatchTurn`] at a time, in the order
//! callers asked for it, and keeps successive dispatch starts at least
//! `min_interval` apart. The coordinator runs two independent chains: one for
//! queries and writes, one for listener attachments.
//!
//! ```text
//! caller A ──acquire──► [turn A] ──dispatch──► release
//! caller B ──acquire──────────────(queued)───► wait min_interval ► [turn B] ...
//! caller C ──acquire──────────────(queued)──────────────────────────────────►
//! ```
//!
//! Serialization is total: there is never more than one dispatch in progress
//! per chain.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::{sleep, Instant};
use tracing::debug;

/// A FIFO, rate-limited dispatch lane.
pub struct DispatchChain {
    name: &'static str,
    min_interval: Duration,
    /// Start time of the most recent dispatch. The mutex is the turn itself;
    /// tokio's mutex grants the lock in request order.
    last_dispatch: Mutex<Option<Instant>>,
    queued: AtomicUsize,
}

/// Exclusive right to dispatch on a chain. Dropping it passes the turn on.
pub struct DispatchTurn<'a> {
    _guard: MutexGuard<'a, Option<Instant>>,
}

impl DispatchChain {
    pub fn new(name: &'static str, min_interval: Duration) -> Self {
        Self {
            name,
            min_interval,
            last_dispatch: Mutex::new(None),
            queued: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    #[must_use]
    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Callers currently waiting for a turn
    #[must_use]
    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::Relaxed)
    }

    /// Wait for this caller's turn, then for the minimum spacing since the
    /// previous dispatch started.
    pub async fn acquire(&self) -> DispatchTurn<'_> {
        let queued_at = Instant::now();
        let waiting = Queued::enter(&self.queued);
        let mut last = self.last_dispatch.lock().await;
        drop(waiting);

        if let Some(prev) = *last {
            let since = prev.elapsed();
            if since < self.min_interval {
                let wait = self.min_interval - since;
                debug!(chain = self.name, ?wait, "Throttling dispatch");
                sleep(wait).await;
            }
        }

        let now = Instant::now();
        *last = Some(now);
        crate::metrics::record_dispatch(self.name, now - queued_at);

        DispatchTurn { _guard: last }
    }

    /// Run `f` inside a turn.
    pub async fn run<F, Fut, T>(&self, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _turn = self.acquire().await;
        f().await
    }
}

/// Counts a caller as queued until dropped, so an abandoned `acquire`
/// future still leaves the queue.
struct Queued<'a>(&'a AtomicUsize);

impl<'a> Queued<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(counter)
    }
}

impl Drop for Queued<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for DispatchChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchChain")
            .field("name", &self.name)
            .field("min_interval", &self.min_interval)
            .field("queued", &self.queued())
            .finish()
    }
}
