// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Cluster-wide block: the persistent per-ClusterBom lease.
//!
//! A block combines the in-process mutex of the key (see [`super::mutex`]) with a
//! `ClusterBomSync` object named like the `ClusterBom`. The in-process mutex is
//! held for as long as the returned [`BlockGuard`] lives; dropping the guard is
//! the release. The persistent lease keeps a second controller instance away
//! until it expires.
//!
//! Lease rules:
//! - absent lease: create it owned by this instance
//! - foreign lease with `now < until + grace`: not acquired, retry after
//!   `until + grace + 5s - now` (at least one second)
//! - otherwise take over or extend: `until = now + ttl` when that is later or
//!   the owner changes; a conflicting update means not acquired (retry in 10s)

use super::mutex::{KeyGuard, MutexRegistry};
use crate::constants::{
    BLOCK_CONFLICT_RETRY_SECS, BLOCK_GRACE_SECS, BLOCK_LOCAL_RETRY_SECS,
    BLOCK_LOCAL_WAIT_SECS, BLOCK_MIN_RETRY_SECS, BLOCK_TAKEOVER_SLACK_SECS,
};
use crate::crd::{ClusterBomSync, ClusterBomSyncSpec};
use crate::errors::{is_conflict, is_not_found, BlockError};
use crate::keys::NamespacedName;
use crate::metrics;
use crate::timestamps::{from_time, to_time};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{DeleteParams, PostParams};
use kube::{Api, Client};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Result of evaluating an existing lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseDecision {
    /// No lease exists yet.
    Create,
    /// Own lease that already lasts long enough.
    Keep,
    /// Own or expired lease; write a new owner and expiry.
    Refresh { until: DateTime<Utc> },
    /// Foreign lease that is still valid.
    Busy { retry_after: Duration },
}

/// Decides what to do with the current lease.
#[must_use]
pub fn evaluate_lease(
    current: Option<&ClusterBomSyncSpec>,
    own_id: &str,
    now: DateTime<Utc>,
    ttl: Duration,
) -> LeaseDecision {
    let Some(current) = current else {
        return LeaseDecision::Create;
    };

    let grace_end = from_time(&current.until) + ChronoDuration::seconds(BLOCK_GRACE_SECS);
    if current.id != own_id && now < grace_end {
        let retry = (grace_end + ChronoDuration::seconds(BLOCK_TAKEOVER_SLACK_SECS) - now)
            .num_seconds()
            .max(BLOCK_MIN_RETRY_SECS);
        return LeaseDecision::Busy {
            retry_after: Duration::from_secs(u64::try_from(retry).unwrap_or(1)),
        };
    }

    let until = now + to_chrono(ttl);
    if from_time(&current.until) < until || current.id != own_id {
        LeaseDecision::Refresh { until }
    } else {
        LeaseDecision::Keep
    }
}

/// Decides whether an own lease may be extended.
///
/// Returns the new expiry, or `None` if the lease already lasts long enough.
///
/// # Errors
///
/// Fails if the lease belongs to someone else or is about to expire.
pub fn evaluate_reblock(
    current: &ClusterBomSyncSpec,
    own_id: &str,
    now: DateTime<Utc>,
    ttl: Duration,
) -> Result<Option<DateTime<Utc>>, BlockError> {
    if current.id != own_id {
        return Err(BlockError::WrongOwner {
            owner: current.id.clone(),
        });
    }
    if now + ChronoDuration::seconds(BLOCK_GRACE_SECS) > from_time(&current.until) {
        return Err(BlockError::Expired);
    }
    let until = now + to_chrono(ttl);
    Ok((from_time(&current.until) < until).then_some(until))
}

fn to_chrono(duration: Duration) -> ChronoDuration {
    ChronoDuration::from_std(duration).unwrap_or_else(|_| ChronoDuration::seconds(0))
}

/// Outcome of [`BlockObject::block`].
pub enum BlockOutcome {
    /// The lease is held until the guard is dropped.
    Acquired(BlockGuard),
    /// Someone else holds the lease; retry after the given delay.
    NotAcquired(Duration),
}

struct Inner {
    client: Client,
    mutexes: MutexRegistry,
    unique_id: String,
    excluded: Vec<NamespacedName>,
    sync_disabled: bool,
}

/// Entry point to the per-ClusterBom leases of this controller instance.
#[derive(Clone)]
pub struct BlockObject {
    inner: Arc<Inner>,
}

/// A held block. Dropping it releases the in-process mutex.
pub struct BlockGuard {
    block: BlockObject,
    key: NamespacedName,
    trivial: bool,
    _local: Option<KeyGuard>,
}

impl BlockObject {
    #[must_use]
    pub fn new(
        client: Client,
        unique_id: String,
        excluded: Vec<NamespacedName>,
        sync_disabled: bool,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                client,
                mutexes: MutexRegistry::new(),
                unique_id,
                excluded,
                sync_disabled,
            }),
        }
    }

    /// ID written into leases owned by this instance.
    #[must_use]
    pub fn unique_id(&self) -> &str {
        &self.inner.unique_id
    }

    fn api(&self, key: &NamespacedName) -> Api<ClusterBomSync> {
        Api::namespaced(self.inner.client.clone(), &key.namespace)
    }

    fn is_excluded(&self, key: &NamespacedName) -> bool {
        self.inner.excluded.iter().any(|k| k == key)
    }

    /// Tries to acquire the lease of `key` for `ttl`.
    ///
    /// # Errors
    ///
    /// Returns an error if the lease can neither be read nor created.
    pub async fn block(
        &self,
        key: &NamespacedName,
        ttl: Duration,
        ignore_exclusion: bool,
    ) -> Result<BlockOutcome, BlockError> {
        if self.inner.sync_disabled || (!ignore_exclusion && self.is_excluded(key)) {
            return Ok(BlockOutcome::Acquired(BlockGuard {
                block: self.clone(),
                key: key.clone(),
                trivial: true,
                _local: None,
            }));
        }

        let Ok(local) = tokio::time::timeout(
            Duration::from_secs(BLOCK_LOCAL_WAIT_SECS),
            self.inner.mutexes.lock(key),
        )
        .await
        else {
            debug!(clusterbom = %key, "Block busy in this instance");
            metrics::record_block_outcome("local_busy");
            return Ok(BlockOutcome::NotAcquired(Duration::from_secs(
                BLOCK_LOCAL_RETRY_SECS,
            )));
        };

        let api = self.api(key);
        let now = Utc::now();

        let mut sync = match api.get_opt(&key.name).await {
            Ok(Some(sync)) => sync,
            Ok(None) => match self.create_lease(&api, key, now, ttl).await {
                Ok(sync) => {
                    debug!(clusterbom = %key, until = %from_time(&sync.spec.until), "Block created");
                    sync
                }
                Err(e) => {
                    error!(clusterbom = %key, error = %e, "Error creating block");
                    return Err(e.into());
                }
            },
            Err(e) => {
                error!(clusterbom = %key, error = %e, "Error initial fetching block");
                return Err(e.into());
            }
        };

        match evaluate_lease(Some(&sync.spec), &self.inner.unique_id, now, ttl) {
            LeaseDecision::Busy { retry_after } => {
                debug!(
                    clusterbom = %key,
                    blocked_by = %sync.spec.id,
                    blocked_until = %from_time(&sync.spec.until),
                    "Blocked by someone else"
                );
                metrics::record_block_outcome("busy");
                Ok(BlockOutcome::NotAcquired(retry_after))
            }
            LeaseDecision::Keep | LeaseDecision::Create => {
                metrics::record_block_outcome("acquired");
                Ok(BlockOutcome::Acquired(self.guard(key, local)))
            }
            LeaseDecision::Refresh { until } => {
                let own_and_valid = sync.spec.id == self.inner.unique_id && now < from_time(&sync.spec.until);
                sync.spec.id.clone_from(&self.inner.unique_id);
                sync.spec.until = to_time(until);
                match api.replace(&key.name, &PostParams::default(), &sync).await {
                    Ok(_) => {
                        debug!(clusterbom = %key, until = %until, "Block updated");
                        metrics::record_block_outcome("acquired");
                        Ok(BlockOutcome::Acquired(self.guard(key, local)))
                    }
                    Err(e) => {
                        if own_and_valid {
                            error!(clusterbom = %key, error = %e, "Error updating block");
                        } else {
                            warn!(clusterbom = %key, error = %e, "Problem updating block");
                        }
                        metrics::record_block_outcome("conflict");
                        Ok(BlockOutcome::NotAcquired(Duration::from_secs(
                            BLOCK_CONFLICT_RETRY_SECS,
                        )))
                    }
                }
            }
        }
    }

    fn guard(&self, key: &NamespacedName, local: KeyGuard) -> BlockGuard {
        BlockGuard {
            block: self.clone(),
            key: key.clone(),
            trivial: false,
            _local: Some(local),
        }
    }

    async fn create_lease(
        &self,
        api: &Api<ClusterBomSync>,
        key: &NamespacedName,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<ClusterBomSync, kube::Error> {
        let sync = ClusterBomSync {
            metadata: ObjectMeta {
                name: Some(key.name.clone()),
                namespace: Some(key.namespace.clone()),
                ..Default::default()
            },
            spec: ClusterBomSyncSpec {
                id: self.inner.unique_id.clone(),
                timestamp: to_time(now),
                until: to_time(now + to_chrono(ttl)),
            },
        };
        match api.create(&PostParams::default(), &sync).await {
            Ok(created) => Ok(created),
            // Lost the race against another instance; continue with its lease.
            Err(e) if is_conflict(&e) => api.get(&key.name).await,
            Err(e) => Err(e),
        }
    }

    /// Deletes the lease of `key`. Used to reap leases of vanished `ClusterBom`s.
    ///
    /// # Errors
    ///
    /// Returns an error if the lease cannot be read or deleted.
    pub async fn delete_block(&self, key: &NamespacedName) -> Result<(), BlockError> {
        let api = self.api(key);
        match api.delete(&key.name, &DeleteParams::default()).await {
            Ok(_) => {
                debug!(clusterbom = %key, "Block deleted");
                Ok(())
            }
            Err(e) if is_not_found(&e) => {
                debug!(clusterbom = %key, "Block not found before deletion");
                Ok(())
            }
            Err(e) => {
                error!(clusterbom = %key, error = %e, "Error deleting block");
                Err(e.into())
            }
        }
    }
}

impl BlockGuard {
    /// Key of the held lease.
    #[must_use]
    pub fn key(&self) -> &NamespacedName {
        &self.key
    }

    /// Extends the held lease to `now + ttl`.
    ///
    /// # Errors
    ///
    /// Fails if the lease is gone, owned by someone else, expired, or the update fails.
    pub async fn reblock(&self, ttl: Duration) -> Result<(), BlockError> {
        if self.trivial {
            return Ok(());
        }
        let api = self.block.api(&self.key);
        let mut sync = api.get(&self.key.name).await.inspect_err(|e| {
            error!(clusterbom = %self.key, error = %e, "Error fetching block for reblock");
        })?;

        let now = Utc::now();
        match evaluate_reblock(&sync.spec, self.block.unique_id(), now, ttl) {
            Err(e) => {
                error!(clusterbom = %self.key, blocked_by = %sync.spec.id, error = %e, "Reblock failed");
                Err(e)
            }
            Ok(None) => Ok(()),
            Ok(Some(until)) => {
                sync.spec.until = to_time(until);
                api.replace(&self.key.name, &PostParams::default(), &sync)
                    .await
                    .inspect_err(|e| {
                        error!(clusterbom = %self.key, error = %e, "Reblock failed; update failed");
                    })?;
                debug!(clusterbom = %self.key, until = %until, "Block updated; reblock");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
#[path = "block_tests.rs"]
mod block_tests;
