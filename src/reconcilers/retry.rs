// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Optimistic-concurrency retries for read-modify-write updates.

use crate::constants::{CONFLICT_RETRY_ATTEMPTS, CONFLICT_RETRY_INTERVAL_SECS};
use crate::errors::is_conflict_anyhow;
use anyhow::Result;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Run a read-modify-write operation, repeating it while it fails with a conflict.
///
/// The closure is expected to re-read the object on every call. At most
/// `CONFLICT_RETRY_ATTEMPTS` attempts are made, spaced by
/// `CONFLICT_RETRY_INTERVAL_SECS`. Any other error is returned at once.
///
/// # Errors
///
/// Returns the last error of the operation.
pub async fn repeat_on_conflict<T, F, Fut>(mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match operation().await {
            Err(e) if is_conflict_anyhow(&e) && attempt < CONFLICT_RETRY_ATTEMPTS => {
                debug!(attempt = attempt, error = %e, "Conflict on update, will retry");
                tokio::time::sleep(Duration::from_secs(CONFLICT_RETRY_INTERVAL_SECS)).await;
            }
            result => return result,
        }
    }
}

#[cfg(test)]
#[path = "retry_tests.rs"]
mod retry_tests;
