// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Periodic driver: requests a reconcile of every `ClusterBom` once per interval.
//!
//! The schedule and a lease shared by all controller instances live in the
//! `reconcilemap` config map of the controller namespace:
//!
//! | Key | Content |
//! |---|---|
//! | `lastUpdateStarted` | start of the last completed sweep |
//! | `lastUpdateFinished` | end of the last completed sweep |
//! | `blockID` | instance currently sweeping |
//! | `blockUntil` | the sweep lease is not valid after this time |
//!
//! A sweep auto-deletes `ClusterBom`s whose target cluster is gone, stamps all
//! others with the reconcile annotation and then collects orphaned leases and
//! value secrets.

use crate::constants::{
    BLOCK_DURATION_SECS, BLOCK_GRACE_SECS, KAPP_CONTROLLER_POD_PREFIX, KIND_CLUSTER_BOM,
    KIND_CLUSTER_BOM_SYNC, PERIODIC_BLOCK_DURATION_SECS, PERIODIC_INITIAL_DELAY_SECS,
    PERIODIC_LOCK_RETRY_SECS, PERIODIC_PACING_SECS, PERIODIC_STATE_CONFIGMAP,
    SECRET_GC_GRACE_SECS, STALE_BLOCK_AGE_SECS,
};
use crate::context::Context;
use crate::crd::{ClusterBom, ClusterBomSync};
use crate::deployers::target::target_exists;
use crate::errors::{is_conflict, is_not_found};
use crate::keys::NamespacedName;
use crate::labels::{self, ANNOTATION_RECONCILE, ANNOTATION_RECONCILE_VALUE};
use crate::metrics;
use crate::reconcilers::patch_annotations;
use crate::synchronize::BlockOutcome;
use crate::timestamps::from_time;
use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, SecondsFormat, Utc};
use k8s_openapi::api::core::v1::{ConfigMap, Pod, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{DeleteParams, ListParams, PostParams};
use kube::{Api, ResourceExt};
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const LAST_UPDATE_STARTED_KEY: &str = "lastUpdateStarted";
const LAST_UPDATE_FINISHED_KEY: &str = "lastUpdateFinished";
const BLOCK_ID_KEY: &str = "blockID";
const BLOCK_UNTIL_KEY: &str = "blockUntil";

/// Parses a stored time. Empty values and `null` mean "never".
#[must_use]
pub fn parse_time(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim().trim_matches('"');
    if text.is_empty() || text == "null" {
        return None;
    }
    DateTime::parse_from_rfc3339(text)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

#[must_use]
pub fn format_time(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Content of the periodic state config map.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PeriodicState {
    pub last_started: Option<DateTime<Utc>>,
    pub last_finished: Option<DateTime<Utc>>,
    pub block_id: Option<String>,
    pub block_until: Option<DateTime<Utc>>,
}

impl PeriodicState {
    #[must_use]
    pub fn from_data(data: &BTreeMap<String, String>) -> Self {
        let time = |key: &str| data.get(key).and_then(|t| parse_time(t));
        Self {
            last_started: time(LAST_UPDATE_STARTED_KEY),
            last_finished: time(LAST_UPDATE_FINISHED_KEY),
            block_id: data.get(BLOCK_ID_KEY).cloned(),
            block_until: time(BLOCK_UNTIL_KEY),
        }
    }

    /// How long to sleep before the next sweep is due; `None` if it is due now.
    #[must_use]
    pub fn wait_time(&self, interval: ChronoDuration, now: DateTime<Utc>) -> Option<Duration> {
        let next = self.last_started? + interval;
        (next > now).then(|| (next - now).to_std().unwrap_or_default())
    }

    /// Whether `unique_id` may take the sweep lease.
    ///
    /// A lease of another instance is only taken over one minute after it expired.
    #[must_use]
    pub fn takeover_allowed(&self, unique_id: &str, now: DateTime<Utc>) -> bool {
        match self.block_id.as_deref() {
            None => true,
            Some(id) if id == unique_id => true,
            Some(_) => self
                .block_until
                .is_none_or(|until| until + ChronoDuration::seconds(BLOCK_GRACE_SECS) < now),
        }
    }
}

/// Whether a `ClusterBom` is old enough for auto-deletion. The target check is separate.
#[must_use]
pub fn auto_delete_due(clusterbom: &ClusterBom, now: DateTime<Utc>) -> bool {
    let Some(age) = clusterbom.spec.auto_delete.as_ref().map(|a| a.cluster_bom_age) else {
        return false;
    };
    age > 0
        && clusterbom
            .metadata
            .creation_timestamp
            .as_ref()
            .is_some_and(|created| from_time(created) + ChronoDuration::minutes(age) <= now)
}

/// Whether a lease whose `ClusterBom` is gone can be deleted.
#[must_use]
pub fn is_stale_sync(sync: &ClusterBomSync, now: DateTime<Utc>) -> bool {
    from_time(&sync.spec.until) + ChronoDuration::seconds(STALE_BLOCK_AGE_SECS) < now
}

/// The `ClusterBom` a value secret belongs to, from its `bom-name` label.
#[must_use]
pub fn value_secret_owner(secret: &Secret) -> Option<NamespacedName> {
    let clusterbom_name = secret.labels().get(labels::BOM_NAME)?;
    Some(NamespacedName::new(secret.namespace().unwrap_or_default(), clusterbom_name.clone()))
}

/// Keeps the candidates whose `ClusterBom` is still absent on a fresh read.
///
/// The sweep's list of `ClusterBom`s is taken before it starts, so owners
/// created since then are only visible here. Candidates whose owner cannot be
/// read are kept.
pub async fn still_orphaned<T, F, Fut>(candidates: Vec<(NamespacedName, T)>, clusterbom_exists: F) -> Vec<T>
where
    F: Fn(NamespacedName) -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let mut orphaned = Vec::with_capacity(candidates.len());
    for (owner, candidate) in candidates {
        match clusterbom_exists(owner.clone()).await {
            Ok(false) => orphaned.push(candidate),
            Ok(true) => debug!(clusterbom = %owner, "Clusterbom created during sweep; keeping its data"),
            Err(e) => warn!(clusterbom = %owner, error = %format!("{e:#}"), "Could not re-check clusterbom; keeping its data"),
        }
    }
    orphaned
}

/// Whether a value secret of a vanished `ClusterBom` can be deleted.
#[must_use]
pub fn is_orphaned_secret(
    secret: &Secret,
    existing: &BTreeSet<NamespacedName>,
    now: DateTime<Utc>,
) -> bool {
    let Some(key) = value_secret_owner(secret) else {
        return false;
    };
    !existing.contains(&key)
        && secret
            .metadata
            .creation_timestamp
            .as_ref()
            .is_some_and(|created| from_time(created) + ChronoDuration::seconds(SECRET_GC_GRACE_SECS) < now)
}

/// Whether the kapp-controller pod is due for a restart.
#[must_use]
pub fn kapp_restart_due(interval_minutes: i64, last: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    interval_minutes >= 1 && last + ChronoDuration::minutes(interval_minutes) <= now
}

/// Sweeps all `ClusterBom`s in the configured interval.
pub struct PeriodicReconciler {
    ctx: Arc<Context>,
    state_api: Api<ConfigMap>,
    last_kapp_restart: DateTime<Utc>,
}

impl PeriodicReconciler {
    #[must_use]
    pub fn new(ctx: Arc<Context>) -> Self {
        let state_api = Api::namespaced(ctx.hub_client.clone(), &ctx.settings.pod_namespace);
        Self {
            ctx,
            state_api,
            last_kapp_restart: Utc::now(),
        }
    }

    fn unique_id(&self) -> &str {
        self.ctx.block.unique_id()
    }

    /// Runs the sweep loop forever.
    ///
    /// # Errors
    ///
    /// Never returns under normal operation; errors of single sweeps are logged
    /// and retried.
    pub async fn run(mut self) -> Result<()> {
        let interval = ChronoDuration::minutes(self.ctx.settings.reconcile_interval_minutes);
        info!(
            interval_minutes = self.ctx.settings.reconcile_interval_minutes,
            "Starting periodic reconciler"
        );

        loop {
            let state = match self.read_state().await {
                Ok(Some(state)) => state,
                Ok(None) => {
                    if let Err(e) = self.write_times(None, None).await {
                        error!(error = %format!("{e:#}"), "Could not create periodic state");
                    }
                    tokio::time::sleep(Duration::from_secs(PERIODIC_INITIAL_DELAY_SECS)).await;
                    continue;
                }
                Err(e) => {
                    error!(error = %format!("{e:#}"), "Could not read periodic state");
                    tokio::time::sleep(Duration::from_secs(PERIODIC_INITIAL_DELAY_SECS)).await;
                    continue;
                }
            };

            if let Some(wait) = state.wait_time(interval, Utc::now()) {
                debug!(?wait, "Sleeping until next periodic reconcile");
                tokio::time::sleep(wait).await;
                continue;
            }

            if !self.reconcile_all().await {
                tokio::time::sleep(Duration::from_secs(PERIODIC_LOCK_RETRY_SECS)).await;
            }
        }
    }

    async fn read_state(&self) -> Result<Option<PeriodicState>> {
        let map = self.state_api.get_opt(PERIODIC_STATE_CONFIGMAP).await?;
        Ok(map.map(|m| PeriodicState::from_data(&m.data.unwrap_or_default())))
    }

    /// Takes or extends the sweep lease. `false` if another instance holds it.
    async fn block(&self, ttl: ChronoDuration) -> Result<bool> {
        let mut map = self.state_api.get(PERIODIC_STATE_CONFIGMAP).await?;
        let now = Utc::now();
        let state = PeriodicState::from_data(map.data.as_ref().unwrap_or(&BTreeMap::new()));
        if !state.takeover_allowed(self.unique_id(), now) {
            debug!(owner = ?state.block_id, "Periodic reconcile is blocked by another instance");
            return Ok(false);
        }
        if state.block_id.as_deref().is_some_and(|id| id != self.unique_id()) {
            warn!(owner = ?state.block_id, "Taking over expired periodic reconcile block");
        }

        let data = map.data.get_or_insert_with(BTreeMap::new);
        data.insert(BLOCK_ID_KEY.to_string(), self.unique_id().to_string());
        data.insert(BLOCK_UNTIL_KEY.to_string(), format_time(now + ttl));
        match self
            .state_api
            .replace(PERIODIC_STATE_CONFIGMAP, &PostParams::default(), &map)
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if is_conflict(&e) => {
                debug!("Concurrent modification of periodic state while blocking");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn unblock(&self) {
        let result = async {
            let mut map = self.state_api.get(PERIODIC_STATE_CONFIGMAP).await?;
            let data = map.data.get_or_insert_with(BTreeMap::new);
            if data.get(BLOCK_ID_KEY).map(String::as_str) != Some(self.unique_id()) {
                warn!("Periodic reconcile block is owned by another instance");
                return Ok::<_, kube::Error>(());
            }
            data.remove(BLOCK_ID_KEY);
            data.remove(BLOCK_UNTIL_KEY);
            self.state_api
                .replace(PERIODIC_STATE_CONFIGMAP, &PostParams::default(), &map)
                .await?;
            Ok(())
        }
        .await;
        if let Err(e) = result {
            error!(error = %e, "Could not release periodic reconcile block");
        }
    }

    /// Writes the sweep times, creating the config map if needed.
    async fn write_times(
        &self,
        started: Option<DateTime<Utc>>,
        finished: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let text = |t: Option<DateTime<Utc>>| t.map(format_time).unwrap_or_default();
        match self.state_api.get_opt(PERIODIC_STATE_CONFIGMAP).await? {
            Some(mut map) => {
                let data = map.data.get_or_insert_with(BTreeMap::new);
                data.insert(LAST_UPDATE_STARTED_KEY.to_string(), text(started));
                data.insert(LAST_UPDATE_FINISHED_KEY.to_string(), text(finished));
                self.state_api
                    .replace(PERIODIC_STATE_CONFIGMAP, &PostParams::default(), &map)
                    .await?;
            }
            None => {
                let map = ConfigMap {
                    metadata: ObjectMeta {
                        name: Some(PERIODIC_STATE_CONFIGMAP.to_string()),
                        namespace: Some(self.ctx.settings.pod_namespace.clone()),
                        ..Default::default()
                    },
                    data: Some(BTreeMap::from([
                        (LAST_UPDATE_STARTED_KEY.to_string(), text(started)),
                        (LAST_UPDATE_FINISHED_KEY.to_string(), text(finished)),
                    ])),
                    ..Default::default()
                };
                self.state_api.create(&PostParams::default(), &map).await?;
                info!(namespace = %self.ctx.settings.pod_namespace, "Created periodic state");
            }
        }
        Ok(())
    }

    /// One sweep. Returns `false` if the lease was not available or the state
    /// could not be written.
    async fn reconcile_all(&mut self) -> bool {
        let ttl = ChronoDuration::seconds(PERIODIC_BLOCK_DURATION_SECS);
        match self.block(ttl).await {
            Ok(true) => {}
            Ok(false) => return false,
            Err(e) => {
                error!(error = %format!("{e:#}"), "Could not block periodic reconcile");
                return false;
            }
        }

        info!("Starting periodic reconcile of all clusterboms");
        let started = Utc::now();
        let existing = self.handle_all_clusterboms(ttl).await;
        if let Some(existing) = existing {
            self.cleanup(&existing).await;
        }
        let finished = Utc::now();

        let written = self.write_times(Some(started), Some(finished)).await;
        self.unblock().await;
        let duration = (finished - started).to_std().unwrap_or_default();
        match written {
            Ok(()) => {
                metrics::record_reconciliation_success("Periodic", duration);
                info!(duration_secs = duration.as_secs(), "Finished periodic reconcile");
                true
            }
            Err(e) => {
                error!(error = %format!("{e:#}"), "Could not update periodic state");
                false
            }
        }
    }

    /// Stamps every `ClusterBom`. Returns the keys of all listed `ClusterBom`s,
    /// or `None` if the list failed.
    async fn handle_all_clusterboms(&self, ttl: ChronoDuration) -> Option<BTreeSet<NamespacedName>> {
        let api: Api<ClusterBom> = Api::all(self.ctx.client.clone());
        let clusterboms = match api.list(&ListParams::default()).await {
            Ok(list) => list.items,
            Err(e) => {
                error!(error = %e, "Could not list clusterboms");
                return None;
            }
        };
        let existing: BTreeSet<NamespacedName> = clusterboms.iter().map(NamespacedName::of).collect();

        for clusterbom in &clusterboms {
            let key = NamespacedName::of(clusterbom);
            match self.auto_delete(clusterbom).await {
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) => error!(clusterbom = %key, error = %format!("{e:#}"), "Auto-delete check failed"),
            }

            if let Err(e) = patch_annotations(
                &self.ctx.client,
                clusterbom,
                &[(ANNOTATION_RECONCILE, Some(ANNOTATION_RECONCILE_VALUE))],
            )
            .await
            {
                error!(clusterbom = %key, error = %format!("{e:#}"), "Could not request reconcile");
            }

            tokio::time::sleep(Duration::from_secs(PERIODIC_PACING_SECS)).await;
            match self.block(ttl).await {
                Ok(true) => {}
                Ok(false) => {
                    warn!("Lost periodic reconcile block, interrupting sweep");
                    return Some(existing);
                }
                Err(e) => {
                    error!(error = %format!("{e:#}"), "Could not extend periodic reconcile block");
                    return Some(existing);
                }
            }
        }
        Some(existing)
    }

    /// Deletes a `ClusterBom` whose age ran out while its target cluster is gone.
    async fn auto_delete(&self, clusterbom: &ClusterBom) -> Result<bool> {
        if !auto_delete_due(clusterbom, Utc::now()) {
            return Ok(false);
        }
        let key = NamespacedName::of(clusterbom);
        let target = NamespacedName::new(key.namespace.clone(), clusterbom.spec.secret_ref.clone());
        if target_exists(&self.ctx.client, &target).await? {
            return Ok(false);
        }

        warn!(clusterbom = %key, target = %target, "Auto-deleting clusterbom of a deleted cluster");
        let api: Api<ClusterBom> = Api::namespaced(self.ctx.client.clone(), &key.namespace);
        match api.delete(&key.name, &DeleteParams::default()).await {
            Ok(_) => metrics::record_resource_deleted(KIND_CLUSTER_BOM),
            Err(e) if is_not_found(&e) => {}
            Err(e) => return Err(e.into()),
        }
        Ok(true)
    }

    async fn clusterbom_exists(&self, key: NamespacedName) -> Result<bool> {
        let api: Api<ClusterBom> = Api::namespaced(self.ctx.client.clone(), &key.namespace);
        Ok(api.get_opt(&key.name).await?.is_some())
    }

    async fn cleanup(&mut self, existing: &BTreeSet<NamespacedName>) {
        self.cleanup_syncs(existing).await;
        self.cleanup_secrets(existing).await;
        self.restart_kapp_controller().await;
    }

    async fn cleanup_syncs(&self, existing: &BTreeSet<NamespacedName>) {
        let api: Api<ClusterBomSync> = Api::all(self.ctx.client.clone());
        let syncs = match api.list(&ListParams::default()).await {
            Ok(list) => list.items,
            Err(e) => {
                error!(error = %e, "Could not list {KIND_CLUSTER_BOM_SYNC} objects");
                return;
            }
        };

        let now = Utc::now();
        let candidates = syncs
            .iter()
            .filter(|s| !existing.contains(&NamespacedName::of(*s)) && is_stale_sync(s, now))
            .map(|s| (NamespacedName::of(s), NamespacedName::of(s)))
            .collect();
        for key in still_orphaned(candidates, |owner| self.clusterbom_exists(owner)).await {
            let ttl = Duration::from_secs(BLOCK_DURATION_SECS.unsigned_abs());
            match self.ctx.block.block(&key, ttl, true).await {
                Ok(BlockOutcome::Acquired(_guard)) => {
                    if let Err(e) = self.ctx.block.delete_block(&key).await {
                        error!(clusterbom = %key, error = %e, "Could not delete stale block");
                    } else {
                        info!(clusterbom = %key, "Deleted stale block");
                    }
                }
                Ok(BlockOutcome::NotAcquired(_)) => {
                    debug!(clusterbom = %key, "Stale block is busy");
                }
                Err(e) => error!(clusterbom = %key, error = %e, "Could not block stale block"),
            }
        }
    }

    async fn cleanup_secrets(&self, existing: &BTreeSet<NamespacedName>) {
        let api: Api<Secret> = Api::all(self.ctx.client.clone());
        let selector = labels::selector(&[(labels::PURPOSE, labels::PURPOSE_SECRET_VALUES)]);
        let secrets = match api.list(&ListParams::default().labels(&selector)).await {
            Ok(list) => list.items,
            Err(e) => {
                error!(error = %e, "Could not list value secrets");
                return;
            }
        };

        let now = Utc::now();
        let candidates = secrets
            .iter()
            .filter(|s| is_orphaned_secret(s, existing, now))
            .filter_map(|s| value_secret_owner(s).map(|owner| (owner, s)))
            .collect();
        for secret in still_orphaned(candidates, |owner| self.clusterbom_exists(owner)).await {
            match self.ctx.secrets.delete_secret(secret).await {
                Ok(()) => info!(
                    secret = %secret.name_any(),
                    namespace = ?secret.namespace(),
                    "Deleted value secret of a deleted clusterbom"
                ),
                Err(e) => error!(secret = %secret.name_any(), error = %e, "Could not delete value secret"),
            }
        }
    }

    async fn restart_kapp_controller(&mut self) {
        let now = Utc::now();
        let interval = self.ctx.settings.restart_kapp_interval_minutes;
        if !kapp_restart_due(interval, self.last_kapp_restart, now) {
            return;
        }
        self.last_kapp_restart = now;

        let api: Api<Pod> =
            Api::namespaced(self.ctx.hub_client.clone(), &self.ctx.settings.pod_namespace);
        let pods = match api.list(&ListParams::default()).await {
            Ok(list) => list.items,
            Err(e) => {
                error!(error = %e, "Could not list pods for the kapp-controller restart");
                return;
            }
        };

        if let Some(pod) = pods
            .iter()
            .find(|p| p.name_any().starts_with(KAPP_CONTROLLER_POD_PREFIX))
        {
            warn!(pod = %pod.name_any(), "Restarting kapp-controller");
            if let Err(e) = api.delete(&pod.name_any(), &DeleteParams::default()).await {
                error!(pod = %pod.name_any(), error = %e, "Could not restart kapp-controller");
            }
        }
    }
}

#[cfg(test)]
#[path = "periodic_tests.rs"]
mod periodic_tests;
