// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The dispatch pipeline shared by reads and writes.
//!
//! One dispatch holds a single turn on the query chain for its whole life,
//! including retries, breaker cooldowns and the offline retry. Nothing else
//! reaches the store from this chain until it finishes.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::metrics::{self, LatencyTimer};
use crate::resilience::circuit_breaker::CircuitBreaker;
use crate::resilience::classify::{classify, ErrorClass};
use crate::resilience::retry::{with_retry, RetryConfig};
use crate::storage::traits::{Operation, RemoteStore, StoreError};
use crate::throttle::DispatchChain;

pub(super) struct Pipeline {
    pub(super) store: Arc<dyn RemoteStore>,
    pub(super) breaker: CircuitBreaker,
    pub(super) queries: DispatchChain,
    pub(super) retry: RetryConfig,
    pub(super) max_corruption_recoveries: u32,
}

impl Pipeline {
    /// Run `op` against the store under a query-chain turn.
    pub(super) async fn dispatch(&self, op: &Operation) -> Result<Value, StoreError> {
        let kind = op.kind();

        let _timer = LatencyTimer::new(kind);
        let _turn = self.queries.acquire().await;

        let mut recoveries = 0u32;
        let mut offline_retried = false;

        loop {
            self.breaker.gate().await;

            let err = match with_retry(kind, &self.retry, || self.store.execute(op)).await {
                Ok(value) => {
                    if offline_retried {
                        info!(operation = kind, "Recovered after re-enabling network");
                        metrics::record_offline_recovery("success");
                    }
                    metrics::record_operation(kind, "success");
                    return Ok(value);
                }
                Err(err) => err,
            };

            match classify(&err) {
                ErrorClass::QueueCorruption => {
                    self.breaker.trip(&self.store);
                    if recoveries >= self.max_corruption_recoveries {
                        warn!(
                            operation = kind,
                            recoveries,
                            error = %err,
                            "Queue still corrupted, giving up"
                        );
                        metrics::record_operation(kind, "failure");
                        return Err(err);
                    }
                    recoveries += 1;
                    warn!(
                        operation = kind,
                        attempt = recoveries,
                        max = self.max_corruption_recoveries,
                        "Queue corruption, re-dispatching after cooldown"
                    );
                }
                ErrorClass::Offline if !offline_retried => {
                    offline_retried = true;
                    if let Err(enable_err) = self.store.enable_network().await {
                        warn!(operation = kind, error = %enable_err, "Could not re-enable network");
                        metrics::record_offline_recovery("failure");
                        metrics::record_operation(kind, "failure");
                        return Err(err);
                    }
                    debug!(operation = kind, "Client offline, network re-enabled, retrying once");
                }
                class => {
                    if offline_retried && class == ErrorClass::Offline {
                        metrics::record_offline_recovery("failure");
                    }
                    metrics::record_operation(kind, "failure");
                    return Err(err);
                }
            }
        }
    }
}
