// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Resilience: error classification, retries and the corruption breaker.

pub mod circuit_breaker;
pub mod classify;
pub mod retry;
