//! Public types for the query coordinator.

use crate::resilience::circuit_breaker::CircuitState;

/// Point-in-time view of the coordinator's internal state.
///
/// Returned by [`super::Coordinator::stats()`]. All fields are read without
/// waiting on any dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordinatorStats {
    /// Read keys with a call currently in flight
    pub in_flight: usize,
    /// Listener entries currently held by the registry
    pub active_listeners: usize,
    /// Callers waiting for a turn on the query chain
    pub queued_dispatches: usize,
    pub circuit_state: CircuitState,
    /// Total breaker trips since the coordinator was created
    pub circuit_trips: u64,
}

impl CoordinatorStats {
    /// Nothing in flight and nothing queued
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.in_flight == 0 && self.queued_dispatches == 0
    }
}

impl std::fmt::Display for CoordinatorStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "in_flight={} listeners={} queued={} circuit={} trips={}",
            self.in_flight,
            self.active_listeners,
            self.queued_dispatches,
            self.circuit_state,
            self.circuit_trips
        )
    }
}
