// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Circuit breaker for client queue corruption.
//!
//! Unlike a classic breaker, this one never rejects. Queue corruption is a
//! known client defect that clears on its own once the transport is bounced,
//! so an open breaker only adds latency:
//!
//! - **Closed**: dispatches pass through [`CircuitBreaker::gate`] untouched.
//! - **Open**: the next dispatch sleeps out the rest of the cooldown, then
//!   closes the breaker and proceeds. Closing is evaluated lazily; there is
//!   no background timer.
//!
//! Tripping the breaker spawns a best-effort [`RemoteStore::reset_connectivity`]
//! without making the caller wait for it.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::storage::traits::RemoteStore;

/// Circuit breaker state for metrics/monitoring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed = 0,
    Open = 1,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
        }
    }
}

#[derive(Debug, Default)]
struct BreakerState {
    /// `Some` while open
    opened_at: Option<Instant>,
}

/// A named corruption breaker, one per remote-store connection.
pub struct CircuitBreaker {
    name: String,
    cooldown: Duration,
    reset_pause: Duration,
    state: Mutex<BreakerState>,
    /// Set while a connectivity reset task is running
    resetting: Arc<AtomicBool>,
    trips: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, cooldown: Duration, reset_pause: Duration) -> Self {
        Self {
            name: name.into(),
            cooldown,
            reset_pause,
            state: Mutex::new(BreakerState::default()),
            resetting: Arc::new(AtomicBool::new(false)),
            trips: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    #[must_use]
    pub fn state(&self) -> CircuitState {
        if self.state.lock().opened_at.is_some() {
            CircuitState::Open
        } else {
            CircuitState::Closed
        }
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state() == CircuitState::Open
    }

    /// Number of times the breaker has been tripped
    #[must_use]
    pub fn trips(&self) -> u64 {
        self.trips.load(Ordering::Relaxed)
    }

    /// Open the breaker and start a background connectivity reset.
    ///
    /// Tripping an already-open breaker restarts the cooldown. At most one
    /// reset task runs at a time.
    pub fn trip(&self, store: &Arc<dyn RemoteStore>) {
        {
            let mut state = self.state.lock();
            state.opened_at = Some(Instant::now());
        }
        self.trips.fetch_add(1, Ordering::Relaxed);
        warn!(circuit = %self.name, cooldown = ?self.cooldown, "Queue corruption detected, circuit opened");
        crate::metrics::set_circuit_state(&self.name, CircuitState::Open as u8);
        crate::metrics::record_circuit_trip(&self.name);

        if self.resetting.swap(true, Ordering::AcqRel) {
            debug!(circuit = %self.name, "Connectivity reset already running");
            return;
        }

        let store = Arc::clone(store);
        let resetting = Arc::clone(&self.resetting);
        let name = self.name.clone();
        let pause = self.reset_pause;
        tokio::spawn(async move {
            match store.reset_connectivity(pause).await {
                Ok(()) => {
                    info!(circuit = %name, "Connectivity reset completed");
                    crate::metrics::record_self_heal(&name, "success");
                }
                Err(e) => {
                    error!(circuit = %name, error = %e, "Connectivity reset failed");
                    crate::metrics::record_self_heal(&name, "failure");
                }
            }
            resetting.store(false, Ordering::Release);
        });
    }

    /// Wait until the breaker allows a dispatch.
    ///
    /// Returns immediately when closed. When open, sleeps for whatever is
    /// left of the cooldown and then closes. The state is re-read after
    /// every sleep, so a trip during the wait extends it.
    pub async fn gate(&self) {
        loop {
            let remaining = {
                let mut state = self.state.lock();
                let Some(opened_at) = state.opened_at else {
                    return;
                };
                let elapsed = opened_at.elapsed();
                if elapsed >= self.cooldown {
                    state.opened_at = None;
                    None
                } else {
                    Some(self.cooldown - elapsed)
                }
            };

            match remaining {
                None => {
                    info!(circuit = %self.name, "Cooldown elapsed, circuit closed");
                    crate::metrics::set_circuit_state(&self.name, CircuitState::Closed as u8);
                    return;
                }
                Some(wait) => {
                    debug!(circuit = %self.name, ?wait, "Circuit open, waiting out cooldown");
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("trips", &self.trips())
            .finish()
    }
}
