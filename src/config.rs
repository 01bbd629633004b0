//! Configuration for the query coordinator.
//!
//! # Example
//!
//! ```
//! use query_coordinator::CoordinatorConfig;
//! use std::time::Duration;
//!
//! // Minimal config (uses defaults)
//! let config = CoordinatorConfig::default();
//! assert_eq!(config.min_dispatch_interval(), Duration::from_millis(50));
//!
//! // From JSON, overriding a couple of fields
//! let config: CoordinatorConfig = serde_json::from_str(
//!     r#"{ "circuit_breaker_cooldown_ms": 2000, "retry": { "max_retries": 5 } }"#,
//! ).unwrap();
//! assert_eq!(config.retry.max_retries, 5);
//! assert_eq!(config.retry.base_delay_ms, 200);
//! config.validate().unwrap();
//! ```

use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

/// Configuration for the query coordinator.
///
/// All fields have defaults tuned for a store client that falls over when
/// hit with bursts of concurrent requests.
#[derive(Debug, Clone, Deserialize)]
pub struct CoordinatorConfig {
    /// Minimum spacing between query/write dispatch starts
    #[serde(default = "default_min_dispatch_interval_ms")]
    pub min_dispatch_interval_ms: u64,

    /// Minimum spacing between listener attachments
    #[serde(default = "default_min_listener_interval_ms")]
    pub min_listener_interval_ms: u64,

    /// How long the breaker holds dispatches after queue corruption
    #[serde(default = "default_circuit_breaker_cooldown_ms")]
    pub circuit_breaker_cooldown_ms: u64,

    /// Pause between disabling and re-enabling the network during self-heal
    #[serde(default = "default_reset_pause_ms")]
    pub reset_pause_ms: u64,

    /// Re-dispatches allowed per operation after queue corruption
    #[serde(default = "default_max_corruption_recoveries")]
    pub max_corruption_recoveries: u32,

    #[serde(default)]
    pub retry: RetrySettings,
}

/// Transient-error retry settings.
#[derive(Debug, Clone, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
}

fn default_min_dispatch_interval_ms() -> u64 { 50 }
fn default_min_listener_interval_ms() -> u64 { 100 }
fn default_circuit_breaker_cooldown_ms() -> u64 { 5_000 }
fn default_reset_pause_ms() -> u64 { 1_000 }
fn default_max_corruption_recoveries() -> u32 { 3 }
fn default_max_retries() -> usize { 3 }
fn default_base_delay_ms() -> u64 { 200 }

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            min_dispatch_interval_ms: default_min_dispatch_interval_ms(),
            min_listener_interval_ms: default_min_listener_interval_ms(),
            circuit_breaker_cooldown_ms: default_circuit_breaker_cooldown_ms(),
            reset_pause_ms: default_reset_pause_ms(),
            max_corruption_recoveries: default_max_corruption_recoveries(),
            retry: RetrySettings::default(),
        }
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
        }
    }
}

/// Rejected configuration values.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("retry.base_delay_ms must be greater than zero")]
    ZeroRetryDelay,

    #[error("circuit_breaker_cooldown_ms must be greater than zero")]
    ZeroCooldown,
}

impl CoordinatorConfig {
    /// Check values that would make the coordinator spin or never back off.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retry.base_delay_ms == 0 {
            return Err(ConfigError::ZeroRetryDelay);
        }
        if self.circuit_breaker_cooldown_ms == 0 {
            return Err(ConfigError::ZeroCooldown);
        }
        Ok(())
    }

    #[must_use]
    pub fn min_dispatch_interval(&self) -> Duration {
        Duration::from_millis(self.min_dispatch_interval_ms)
    }

    #[must_use]
    pub fn min_listener_interval(&self) -> Duration {
        Duration::from_millis(self.min_listener_interval_ms)
    }

    #[must_use]
    pub fn circuit_breaker_cooldown(&self) -> Duration {
        Duration::from_millis(self.circuit_breaker_cooldown_ms)
    }

    #[must_use]
    pub fn reset_pause(&self) -> Duration {
        Duration::from_millis(self.reset_pause_ms)
    }
}

impl RetrySettings {
    #[must_use]
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }
}
