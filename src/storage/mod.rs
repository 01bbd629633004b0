// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The remote store contract and an in-memory implementation.

pub mod memory;
pub mod traits;
