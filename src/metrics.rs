// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for the query coordinator.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The host application is responsible for installing an exporter.
//!
//! # Metric Naming Convention
//! - `query_coordinator_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `chain`: queries, listeners
//! - `operation`: query, get, set, update, delete, batch
//! - `class`: transient, queue_corruption, offline, other

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

/// Record the outcome of a coordinated operation
pub fn record_operation(operation: &str, status: &str) {
    counter!(
        "query_coordinator_operations_total",
        "operation" => operation.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record end-to-end operation latency (queueing included)
pub fn record_latency(operation: &str, duration: Duration) {
    histogram!(
        "query_coordinator_operation_seconds",
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

// ═══════════════════════════════════════════════════════════════════════════
// DISPATCH - Serializer and throttle
// ═══════════════════════════════════════════════════════════════════════════

/// Record a dispatch turn being granted, with how long the caller queued
pub fn record_dispatch(chain: &str, waited: Duration) {
    counter!(
        "query_coordinator_dispatches_total",
        "chain" => chain.to_string()
    )
    .increment(1);
    histogram!(
        "query_coordinator_dispatch_wait_seconds",
        "chain" => chain.to_string()
    )
    .record(waited.as_secs_f64());
}

// ═══════════════════════════════════════════════════════════════════════════
// DEDUPLICATION
// ═══════════════════════════════════════════════════════════════════════════

/// Set number of keys with a call in flight
pub fn set_in_flight(count: usize) {
    gauge!("query_coordinator_in_flight").set(count as f64);
}

/// Record a caller joining an existing in-flight call
pub fn record_dedup_join() {
    counter!("query_coordinator_dedup_joins_total").increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// ERRORS AND RETRIES
// ═══════════════════════════════════════════════════════════════════════════

/// Record a failed store call, by classification
pub fn record_store_error(operation: &str, class: &str) {
    counter!(
        "query_coordinator_store_errors_total",
        "operation" => operation.to_string(),
        "class" => class.to_string()
    )
    .increment(1);
}

/// Record a retry being scheduled
pub fn record_retry(operation: &str) {
    counter!(
        "query_coordinator_retries_total",
        "operation" => operation.to_string()
    )
    .increment(1);
}

/// Record an offline re-enable-and-retry attempt
pub fn record_offline_recovery(outcome: &str) {
    counter!(
        "query_coordinator_offline_recoveries_total",
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// CIRCUIT BREAKER - Resilience metrics
// ═══════════════════════════════════════════════════════════════════════════

/// Set circuit breaker state (0 = closed, 1 = open)
pub fn set_circuit_state(circuit: &str, state: u8) {
    gauge!(
        "query_coordinator_circuit_breaker_state",
        "circuit" => circuit.to_string()
    )
    .set(state as f64);
}

/// Record the breaker opening on queue corruption
pub fn record_circuit_trip(circuit: &str) {
    counter!(
        "query_coordinator_circuit_breaker_trips_total",
        "circuit" => circuit.to_string()
    )
    .increment(1);
}

/// Record a background connectivity reset finishing
pub fn record_self_heal(circuit: &str, outcome: &str) {
    counter!(
        "query_coordinator_self_heal_total",
        "circuit" => circuit.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// LISTENERS
// ═══════════════════════════════════════════════════════════════════════════

/// Set number of live listener entries
pub fn set_active_listeners(count: usize) {
    gauge!("query_coordinator_active_listeners").set(count as f64);
}

/// Record a subscription error and whether it reached the application
pub fn record_listener_error(class: &str, outcome: &str) {
    counter!(
        "query_coordinator_listener_errors_total",
        "class" => class.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record a physical listener teardown (`immediate` or `deferred`)
pub fn record_listener_detach(mode: &str) {
    counter!(
        "query_coordinator_listener_detaches_total",
        "mode" => mode.to_string()
    )
    .increment(1);
}

/// A timing guard that records latency on drop
pub struct LatencyTimer {
    operation: &'static str,
    start: Instant,
}

impl LatencyTimer {
    /// Start a new latency timer
    pub fn new(operation: &'static str) -> Self {
        Self {
            operation,
            start: Instant::now(),
        }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_latency(self.operation, self.start.elapsed());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics_util::debugging::{DebugValue, DebuggingRecorder};

    fn counter_value(recorder: &DebuggingRecorder, name: &str) -> u64 {
        recorder
            .snapshotter()
            .snapshot()
            .into_vec()
            .into_iter()
            .filter(|(key, _, _, _)| key.key().name() == name)
            .map(|(_, _, _, value)| match value {
                DebugValue::Counter(n) => n,
                _ => 0,
            })
            .sum()
    }

    #[test]
    fn test_counters_reach_recorder() {
        let recorder = DebuggingRecorder::new();
        metrics::with_local_recorder(&recorder, || {
            record_dedup_join();
            record_dedup_join();
            record_circuit_trip("store");
        });

        assert_eq!(counter_value(&recorder, "query_coordinator_dedup_joins_total"), 2);
        assert_eq!(counter_value(&recorder, "query_coordinator_circuit_breaker_trips_total"), 1);
    }

    #[test]
    fn test_record_without_recorder_is_noop() {
        record_operation("query", "success");
        record_latency("query", Duration::from_millis(5));
        record_dispatch("queries", Duration::from_millis(50));
        record_store_error("query", "transient");
        record_retry("query");
        record_offline_recovery("success");
        set_circuit_state("store", 1);
        record_self_heal("store", "failure");
        set_in_flight(3);
        set_active_listeners(2);
        record_listener_error("other", "forwarded");
        record_listener_detach("deferred");
    }

    #[test]
    fn test_latency_timer() {
        {
            let _timer = LatencyTimer::new("query");
            std::thread::sleep(Duration::from_micros(10));
        }
        // Timer recorded on drop
    }
}
