// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Aggregation loop: folds the deploy items of a `ClusterBom` into its status.
//!
//! Per item a state is derived from its provider status. The overall state is
//! the worst item state under `ok < pending < unknown < failed`. The `Ready`
//! condition counts successful, pending and failed applications; the
//! `ClusterReachable` condition follows the most recent reachability reported
//! by any item.
//!
//! Once per hour a run also gives every `ClusterBom` without applications and
//! without items the canonical empty status.

use crate::constants::{
    BLOCK_DURATION_SECS, KIND_CLUSTER_BOM, OPERATION_REMOVE, STATE_FAILED, STATE_OK, STATE_PENDING,
    STATE_UNKNOWN, TEXT_SHOOT_NOT_EXISTING,
};
use crate::context::Context;
use crate::crd::{
    ApplicationConfig, ApplicationState, ClusterBom, ClusterBomStatus, Condition, DeployItem,
    DetailedState,
};
use crate::deploy_data::{worse_state, DeployItemConfiguration, ProviderStatus};
use crate::deployers::target::target_exists;
use crate::keys::{app_id_of_item, clusterbom_key_of_item, NamespacedName};
use crate::reconcilers::status::{condition_status, create_condition, ClusterBomStatusUpdater};
use crate::reconcilers::{
    block_for_reconcile, delete_deploy_items, delete_resource, list_deploy_items,
};
use crate::status_reasons::{
    worse_condition_status, CONDITION_FALSE, CONDITION_TRUE, CONDITION_TYPE_CLUSTER_REACHABLE,
    CONDITION_TYPE_READY, CONDITION_UNKNOWN, REASON_ALL_APPS_READY, REASON_CLUSTER_DOES_NOT_EXIST,
    REASON_CLUSTER_NOT_REACHABLE, REASON_CLUSTER_REACHABILITY_UNKNOWN, REASON_CLUSTER_REACHABLE,
    REASON_EMPTY_CLUSTER_BOM, REASON_FAILED_AND_PENDING_APPS, REASON_FAILED_APPS,
    REASON_PENDING_APPS, REASON_TARGET_CLUSTER_DOES_NOT_EXIST,
};
use crate::synchronize::BlockOutcome;
use crate::timestamps::from_time;
use anyhow::{Context as _, Result};
use chrono::{DateTime, Utc};
use kube::api::ListParams;
use kube::runtime::controller::Action;
use kube::{Api, Client, ResourceExt};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Provider status of an item; an item never processed has the default one.
///
/// # Errors
///
/// Returns an error if the stored provider status does not decode.
pub fn provider_status_of(item: &DeployItem) -> Result<ProviderStatus, serde_json::Error> {
    match item.status.as_ref().and_then(|s| s.provider_status.clone()) {
        Some(raw) if !raw.is_null() => serde_json::from_value(raw),
        _ => Ok(ProviderStatus::default()),
    }
}

fn observed_generation(item: &DeployItem) -> i64 {
    item.status.as_ref().map_or(0, |s| s.observed_generation)
}

/// State of one application derived from its item.
#[must_use]
pub fn item_state(item: &DeployItem, provider_status: &ProviderStatus) -> &'static str {
    let last_operation = &provider_status.last_operation;
    if item.metadata.deletion_timestamp.is_some() {
        return if last_operation.operation != OPERATION_REMOVE {
            STATE_PENDING
        } else if last_operation.state == STATE_OK {
            STATE_OK
        } else {
            STATE_FAILED
        };
    }

    let generation = item.metadata.generation.unwrap_or(0);
    if generation != observed_generation(item) {
        return STATE_PENDING;
    }
    if generation != last_operation.success_generation {
        return STATE_FAILED;
    }
    match provider_status.readiness.as_ref().map(|r| r.state.as_str()) {
        None | Some(STATE_UNKNOWN) => STATE_UNKNOWN,
        Some(STATE_OK) => STATE_OK,
        Some(STATE_PENDING) => STATE_PENDING,
        // finallyFailed and failed alike
        Some(_) => STATE_FAILED,
    }
}

/// Application state entry of an item.
#[must_use]
pub fn application_state(item: &DeployItem, provider_status: &ProviderStatus, now: DateTime<Utc>) -> ApplicationState {
    let status = item.status.clone().unwrap_or_default();
    ApplicationState {
        id: app_id_of_item(item),
        state: item_state(item, provider_status).to_string(),
        detailed_state: DetailedState {
            current_operation_time: Some(now.to_rfc3339()),
            last_operation: provider_status.last_operation.clone(),
            reachability: provider_status.reachability.clone(),
            readiness: provider_status.readiness.clone(),
            deploy_item_conditions: status.conditions,
            type_specific_status: provider_status.type_specific_status.clone(),
            generation: item.metadata.generation.unwrap_or(0),
            observed_generation: status.observed_generation,
            deletion_timestamp: item.metadata.deletion_timestamp.as_ref().map(|t| from_time(t).to_rfc3339()),
        },
    }
}

/// Whether an item already carries the projection of `app`.
///
/// Secret references are not compared; they only change together with the
/// generation of the item.
#[must_use]
pub fn config_matches(app: &ApplicationConfig, item: &DeployItem) -> bool {
    let Ok(configuration) =
        serde_json::from_value::<DeployItemConfiguration>(item.spec.configuration.clone())
    else {
        return false;
    };
    let deployed = &configuration.deployment_config;
    let type_specific_data = app.type_specific_data.clone().unwrap_or_default();

    app.id == deployed.id
        && app.config_type == item.spec.r#type
        && app.no_reconcile == deployed.no_reconcile
        && app.ready_requirements.clone().unwrap_or_default() == deployed.ready_requirements
        && app.values == deployed.values
        && type_specific_data == deployed.type_specific_data
}

/// Application IDs by outcome.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Statistics {
    pub successful: Vec<String>,
    pub pending: Vec<String>,
    pub failed: Vec<String>,
}

impl Statistics {
    fn add(&mut self, app_id: &str, condition_status: &str) {
        let bucket = match condition_status {
            CONDITION_TRUE => &mut self.successful,
            CONDITION_FALSE => &mut self.failed,
            _ => &mut self.pending,
        };
        bucket.push(app_id.to_string());
    }

    #[must_use]
    pub fn total(&self) -> usize {
        self.successful.len() + self.pending.len() + self.failed.len()
    }

    /// Percentage of ready applications, 100 without applications.
    #[must_use]
    pub fn progress(&self) -> usize {
        match self.total() {
            0 => 100,
            total => self.successful.len() * 100 / total,
        }
    }

    /// Reason and message of the `Ready` condition.
    #[must_use]
    pub fn reason_and_message(&self) -> (&'static str, String) {
        let failed = format!("Failed applications: {}", self.failed.join(", "));
        let pending = format!("Pending applications: {}", self.pending.join(", "));
        match (self.failed.is_empty(), self.pending.is_empty()) {
            (false, false) => (REASON_FAILED_AND_PENDING_APPS, format!("{failed} {pending}")),
            (false, true) => (REASON_FAILED_APPS, failed),
            (true, false) => (REASON_PENDING_APPS, pending),
            (true, true) => (REASON_ALL_APPS_READY, "All applications are ready.".to_string()),
        }
    }
}

fn item_ready_status(item: &DeployItem) -> &str {
    item.status.as_ref().map_or(CONDITION_UNKNOWN, |s| {
        condition_status(&s.conditions, CONDITION_TYPE_READY)
    })
}

/// `Ready` condition of a `ClusterBom` and the statistics behind it.
///
/// Every application config counts, and so does every item whose application
/// was removed from the `ClusterBom` but is still being deleted.
#[must_use]
pub fn ready_condition(
    clusterbom: &ClusterBom,
    items: &[(DeployItem, ProviderStatus)],
    now: DateTime<Utc>,
) -> (Condition, Statistics) {
    let mut status = CONDITION_TRUE;
    let mut stats = Statistics::default();

    for app in &clusterbom.spec.application_configs {
        let item = items.iter().map(|(item, _)| item).find(|item| app_id_of_item(*item) == app.id);
        let app_status = match item {
            Some(item) if config_matches(app, item) && item.metadata.generation.unwrap_or(0) == observed_generation(item) => {
                item_ready_status(item)
            }
            _ => CONDITION_UNKNOWN,
        };
        status = worse_condition_status(status, app_status);
        stats.add(&app.id, app_status);
    }

    for (item, provider_status) in items {
        let app_id = app_id_of_item(item);
        if clusterbom.spec.application_configs.iter().any(|a| a.id == app_id) {
            continue;
        }
        let item_status = if provider_status.last_operation.operation == OPERATION_REMOVE {
            item_ready_status(item)
        } else {
            CONDITION_UNKNOWN
        };
        status = worse_condition_status(status, item_status);
        stats.add(&app_id, item_status);
    }

    let (reason, message) = stats.reason_and_message();
    (create_condition(CONDITION_TYPE_READY, status, reason, &message, now), stats)
}

/// `ClusterReachable` condition from the most recent reachability of any item.
#[must_use]
pub fn reachability_condition(items: &[(DeployItem, ProviderStatus)], now: DateTime<Utc>) -> Condition {
    let latest = items
        .iter()
        .filter_map(|(_, ps)| ps.reachability.as_ref())
        .filter_map(|r| r.time.as_ref().map(|t| (from_time(t), r.reachable)))
        .max_by_key(|(time, _)| *time);

    let (status, reason, message) = match latest {
        None => (
            CONDITION_UNKNOWN,
            REASON_CLUSTER_REACHABILITY_UNKNOWN,
            "No info about cluster reachability",
        ),
        Some((_, true)) => (CONDITION_TRUE, REASON_CLUSTER_REACHABLE, "Cluster reachable"),
        Some((_, false)) => (CONDITION_FALSE, REASON_CLUSTER_NOT_REACHABLE, "Cluster not reachable"),
    };
    create_condition(CONDITION_TYPE_CLUSTER_REACHABLE, status, reason, message, now)
}

fn count(n: usize) -> i32 {
    i32::try_from(n).unwrap_or(i32::MAX)
}

/// Status of a `ClusterBom` computed from its items.
///
/// # Errors
///
/// Returns an error if the provider status of an item does not decode.
pub fn compute_status(clusterbom: &ClusterBom, items: &[DeployItem], now: DateTime<Utc>) -> Result<ClusterBomStatus> {
    let decoded = items
        .iter()
        .map(|item| {
            provider_status_of(item)
                .map(|ps| (item.clone(), ps))
                .with_context(|| format!("decoding provider status of {}", item.name_any()))
        })
        .collect::<Result<Vec<_>>>()?;

    let application_states: Vec<ApplicationState> = decoded
        .iter()
        .map(|(item, ps)| application_state(item, ps, now))
        .collect();
    let overall_state = application_states
        .iter()
        .fold(STATE_OK, |worst, s| worse_state(worst, &s.state))
        .to_string();
    let (ready, stats) = ready_condition(clusterbom, &decoded, now);
    let reachable = reachability_condition(&decoded, now);

    Ok(ClusterBomStatus {
        observed_generation: clusterbom.metadata.generation.unwrap_or(0),
        overall_state,
        overall_time: Some(now.to_rfc3339()),
        overall_num_of_deployments: count(stats.total()),
        overall_num_of_ready_deployments: count(stats.successful.len()),
        overall_progress: count(stats.progress()),
        description: None,
        conditions: vec![ready, reachable],
        application_states,
    })
}

/// Canonical status of a `ClusterBom` without applications and items.
#[must_use]
pub fn empty_status(clusterbom: &ClusterBom, now: DateTime<Utc>) -> ClusterBomStatus {
    ClusterBomStatus {
        observed_generation: clusterbom.metadata.generation.unwrap_or(0),
        overall_state: STATE_OK.to_string(),
        overall_time: Some(now.to_rfc3339()),
        overall_num_of_deployments: 0,
        overall_num_of_ready_deployments: 0,
        overall_progress: 100,
        description: None,
        conditions: vec![create_condition(
            CONDITION_TYPE_READY,
            CONDITION_TRUE,
            REASON_EMPTY_CLUSTER_BOM,
            "Empty ClusterBom",
            now,
        )],
        application_states: Vec::new(),
    }
}

/// Status of a `ClusterBom` whose target cluster secret is gone.
#[must_use]
pub fn unreachable_status(clusterbom: &ClusterBom, now: DateTime<Utc>) -> ClusterBomStatus {
    ClusterBomStatus {
        observed_generation: clusterbom.metadata.generation.unwrap_or(0),
        overall_state: STATE_PENDING.to_string(),
        overall_time: Some(now.to_rfc3339()),
        overall_num_of_deployments: 0,
        overall_num_of_ready_deployments: 0,
        overall_progress: 0,
        description: Some(TEXT_SHOOT_NOT_EXISTING.to_string()),
        conditions: vec![
            create_condition(
                CONDITION_TYPE_READY,
                CONDITION_UNKNOWN,
                REASON_TARGET_CLUSTER_DOES_NOT_EXIST,
                "Target cluster does not exist",
                now,
            ),
            create_condition(
                CONDITION_TYPE_CLUSTER_REACHABLE,
                CONDITION_FALSE,
                REASON_CLUSTER_DOES_NOT_EXIST,
                "Cluster does not exist",
                now,
            ),
        ],
        application_states: Vec::new(),
    }
}

/// Writes `status` to a `ClusterBom` if it differs from the stored one.
///
/// # Errors
///
/// Returns an error if the status write fails.
pub async fn write_status(client: &Client, clusterbom: &ClusterBom, status: ClusterBomStatus) -> Result<()> {
    let mut updater = ClusterBomStatusUpdater::new(clusterbom);
    updater.set_status(status);
    updater.apply(client).await
}

/// Deletes the items of a `ClusterBom` whose target cluster is gone and marks
/// the `ClusterBom` as unreachable.
///
/// # Errors
///
/// Returns an error if the items cannot be listed or deleted, or the status not written.
pub async fn handle_missing_target(
    client: &Client,
    clusterbom_key: &NamespacedName,
    clusterbom: Option<&ClusterBom>,
) -> Result<()> {
    let items = list_deploy_items(client, clusterbom_key).await?;
    if !items.is_empty() {
        warn!(clusterbom = %clusterbom_key, "Target cluster secret does not exist, deleting deploy items");
        delete_deploy_items(client, &items).await?;
    }
    if let Some(clusterbom) = clusterbom {
        write_status(client, clusterbom, unreachable_status(clusterbom, Utc::now())).await?;
    }
    Ok(())
}

/// Reconciles the status of the `ClusterBom` owning a deploy item.
///
/// # Errors
///
/// Returns an error if the block, the items, the target secret or the status
/// cannot be accessed.
pub async fn reconcile_clusterbom_state(ctx: Arc<Context>, item: Arc<DeployItem>) -> Result<Action> {
    if ctx.empty_sweep.try_claim(Utc::now()).await {
        if let Err(e) = sweep_empty_clusterboms(&ctx).await {
            warn!(error = %format!("{e:#}"), "Sweep of empty clusterboms failed");
        }
    }

    let clusterbom_key = clusterbom_key_of_item(item.as_ref());
    let _guard = match block_for_reconcile(&ctx, &clusterbom_key, KIND_CLUSTER_BOM, false).await {
        Ok(guard) => guard,
        Err(action) => return Ok(action),
    };

    let api: Api<ClusterBom> = Api::namespaced(ctx.client.clone(), &clusterbom_key.namespace);
    match api.get_opt(&clusterbom_key.name).await? {
        Some(clusterbom) => aggregate(&ctx, &clusterbom_key, &clusterbom).await?,
        None => reconcile_orphan(&ctx, &clusterbom_key, &NamespacedName::of(item.as_ref())).await?,
    }
    Ok(Action::await_change())
}

async fn aggregate(ctx: &Context, clusterbom_key: &NamespacedName, clusterbom: &ClusterBom) -> Result<()> {
    let target = NamespacedName::new(&clusterbom_key.namespace, &clusterbom.spec.secret_ref);
    if !target_exists(&ctx.client, &target).await? {
        return handle_missing_target(&ctx.client, clusterbom_key, Some(clusterbom)).await;
    }

    let items = list_deploy_items(&ctx.client, clusterbom_key).await?;
    debug!(clusterbom = %clusterbom_key, items = items.len(), "Adjusting status of clusterbom");
    let status = compute_status(clusterbom, &items, Utc::now())?;
    write_status(&ctx.client, clusterbom, status).await
}

/// An item whose `ClusterBom` is gone is deleted.
async fn reconcile_orphan(ctx: &Context, clusterbom_key: &NamespacedName, item_key: &NamespacedName) -> Result<()> {
    let api: Api<DeployItem> = Api::namespaced(ctx.client.clone(), &item_key.namespace);
    let Some(item) = api.get_opt(&item_key.name).await? else {
        debug!(item = %item_key, "Neither clusterbom nor deploy item exist any more");
        return Ok(());
    };

    let configuration: DeployItemConfiguration = serde_json::from_value(item.spec.configuration.clone())
        .with_context(|| format!("decoding configuration of {item_key}"))?;
    let target = NamespacedName::new(&item_key.namespace, &configuration.local_secret_ref);
    if !target_exists(&ctx.client, &target).await? {
        return handle_missing_target(&ctx.client, clusterbom_key, None).await;
    }

    info!(item = %item_key, "Deleting deploy item of a deleted clusterbom");
    delete_resource(&ctx.client, &item).await
}

/// Gives every `ClusterBom` without applications and items its final status.
async fn sweep_empty_clusterboms(ctx: &Context) -> Result<()> {
    debug!("Cleaning up status of empty clusterboms");
    let api: Api<ClusterBom> = Api::all(ctx.client.clone());
    let clusterboms = api.list(&ListParams::default()).await?;

    for clusterbom in clusterboms.items.iter().filter(|c| c.spec.application_configs.is_empty()) {
        let key = NamespacedName::of(clusterbom);
        if !list_deploy_items(&ctx.client, &key).await?.is_empty() {
            continue;
        }

        let BlockOutcome::Acquired(_guard) = ctx
            .block
            .block(&key, Duration::from_secs(BLOCK_DURATION_SECS.unsigned_abs()), false)
            .await?
        else {
            continue;
        };

        let target = NamespacedName::new(&key.namespace, &clusterbom.spec.secret_ref);
        let now = Utc::now();
        let status = if target_exists(&ctx.client, &target).await? {
            empty_status(clusterbom, now)
        } else {
            unreachable_status(clusterbom, now)
        };
        write_status(&ctx.client, clusterbom, status).await?;
    }
    Ok(())
}

#[cfg(test)]
#[path = "clusterbom_state_tests.rs"]
mod clusterbom_state_tests;
