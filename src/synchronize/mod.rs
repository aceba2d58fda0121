// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Per-`ClusterBom` mutual exclusion.
//!
//! [`mutex`] serialises work on one key inside this process, [`block`] extends that
//! to all controller instances through a persistent `ClusterBomSync` lease.

pub mod block;
pub mod mutex;

pub use block::{BlockGuard, BlockObject, BlockOutcome};
pub use mutex::{KeyGuard, MutexRegistry};
