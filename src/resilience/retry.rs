// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Retry logic with exponential backoff.
//!
//! Retries are classification-aware: only [`ErrorClass::Transient`] failures
//! are retried. Queue corruption is handed straight back so the circuit
//! breaker can react, and everything else propagates on the first failure.
//!
//! # Example
//!
//! ```
//! use query_coordinator::RetryConfig;
//! use std::time::Duration;
//!
//! let query = RetryConfig::query();
//! assert_eq!(query.max_retries, 3);
//! assert_eq!(query.delay_for(0), Duration::from_millis(200));
//! assert_eq!(query.delay_for(1), Duration::from_millis(400));
//! ```

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use super::classify::{classify, ErrorClass};
use crate::storage::traits::StoreError;

/// Configuration for operation retry behavior.
///
/// Use the preset constructors for common patterns:
/// - [`RetryConfig::query()`] - A few quick retries, capped at 5s
/// - [`RetryConfig::from_settings()`] - The coordinator's configured policy, uncapped
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retries after the first attempt. Total attempts = `max_retries + 1`.
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::query()
    }
}

impl RetryConfig {
    /// Quick retry with a 5s ceiling.
    #[must_use]
    pub fn query() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            factor: 2.0,
        }
    }

    /// Build from the flat settings in [`crate::config::CoordinatorConfig`].
    ///
    /// No ceiling: each delay is exactly double the previous one, whatever
    /// the base.
    #[must_use]
    pub fn from_settings(max_retries: usize, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay: Duration::MAX,
            factor: 2.0,
        }
    }

    /// Fast retry for tests (minimal delays)
    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            factor: 2.0,
        }
    }

    /// Delay before retry number `attempt` (0-based): `base * factor^attempt`,
    /// capped at `max_delay`.
    #[must_use]
    pub fn delay_for(&self, attempt: usize) -> Duration {
        let exp = i32::try_from(attempt).unwrap_or(i32::MAX);
        let scaled = self.base_delay.as_secs_f64() * self.factor.powi(exp);
        if !scaled.is_finite() || scaled >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::try_from_secs_f64(scaled).map_or(self.max_delay, |d| d.min(self.max_delay))
    }
}

/// Run `operation`, retrying transient failures with exponential backoff.
///
/// Returns the first success, or the error of the last attempt made.
/// [`ErrorClass::QueueCorruption`] is returned immediately without delay.
pub async fn with_retry<F, Fut, T>(
    operation_name: &str,
    config: &RetryConfig,
    mut operation: F,
) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(val) => {
                if attempt > 0 {
                    info!("Operation '{}' succeeded after {} retries", operation_name, attempt);
                }
                return Ok(val);
            }
            Err(err) => {
                let class = classify(&err);
                crate::metrics::record_store_error(operation_name, class.as_str());

                if class == ErrorClass::QueueCorruption {
                    warn!(operation = operation_name, error = %err, "Queue corruption, not retrying");
                    return Err(err);
                }
                if !class.is_retryable() {
                    debug!(operation = operation_name, %class, error = %err, "Non-retryable failure");
                    return Err(err);
                }
                if attempt >= config.max_retries {
                    warn!(
                        "Operation '{}' failed after {} attempts: {}",
                        operation_name, attempt + 1, err
                    );
                    return Err(err);
                }

                let delay = config.delay_for(attempt);
                warn!(
                    "Operation '{}' failed (attempt {}/{}): {}. Retrying in {:?}...",
                    operation_name,
                    attempt + 1,
                    config.max_retries + 1,
                    err,
                    delay
                );
                crate::metrics::record_retry(operation_name);

                sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
