// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error classification for remote-store failures.
//!
//! Every error that comes back from the store is sorted into one of four
//! classes, and each class has exactly one handling strategy:
//!
//! | Class             | Handling                                              |
//! |-------------------|-------------------------------------------------------|
//! | `QueueCorruption` | never retried; trips the circuit breaker              |
//! | `Transient`       | retried with backoff by [`super::retry::with_retry`]  |
//! | `Offline`         | one network re-enable + one retry by the coordinator  |
//! | `Other`           | returned to the caller unmodified                     |
//!
//! # Example
//!
//! ```
//! use query_coordinator::resilience::classify::{classify, ErrorClass};
//! use query_coordinator::StoreError;
//!
//! let err = StoreError::internal("INTERNAL ASSERTION FAILED: Unexpected state (ID: ca9)");
//! assert_eq!(classify(&err), ErrorClass::QueueCorruption);
//!
//! let err = StoreError::internal("INTERNAL ASSERTION FAILED: Unexpected state");
//! assert_eq!(classify(&err), ErrorClass::Transient);
//! ```

use crate::storage::traits::{codes, StoreError};

/// Markers the client emits once its async dispatch queue is corrupted.
/// Matched before the transient markers, which they usually also contain.
const QUEUE_CORRUPTION_MARKERS: &[&str] = &[
    "(id: ca9)",
    "(id: b815)",
    "asyncqueue is already failed",
];

const TRANSIENT_MARKERS: &[&str] = &["internal assertion failed", "unexpected state"];

const TRANSIENT_CODES: &[&str] = &[codes::INTERNAL, codes::ABORTED];

const OFFLINE_MARKERS: &[&str] = &["offline", "network connection", "could not reach"];

/// How an error from the remote store should be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    Transient,
    QueueCorruption,
    Offline,
    Other,
}

impl ErrorClass {
    /// Whether the generic retry policy may retry this class.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient)
    }

    /// Subscription errors of this class are expected to self-heal and are
    /// not forwarded to the application.
    #[must_use]
    pub fn is_expected_noise(&self) -> bool {
        matches!(self, Self::Transient | Self::QueueCorruption)
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::QueueCorruption => "queue_corruption",
            Self::Offline => "offline",
            Self::Other => "other",
        }
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify a store error.
#[must_use]
pub fn classify(err: &StoreError) -> ErrorClass {
    let code = err.code.to_ascii_lowercase();
    let message = err.message.to_ascii_lowercase();
    let mentions = |markers: &[&str]| {
        markers
            .iter()
            .any(|m| code.contains(m) || message.contains(m))
    };

    if mentions(QUEUE_CORRUPTION_MARKERS) {
        return ErrorClass::QueueCorruption;
    }
    if mentions(TRANSIENT_MARKERS) || TRANSIENT_CODES.contains(&code.as_str()) {
        return ErrorClass::Transient;
    }
    if code == codes::UNAVAILABLE || mentions(OFFLINE_MARKERS) {
        return ErrorClass::Offline;
    }
    ErrorClass::Other
}
