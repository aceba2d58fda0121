// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Deployment loop: drives one deploy item to convergence.
//!
//! Every run holds the block of the owning `ClusterBom`. Which deployer
//! operation runs is decided by [`next_step`] from the stored provider status:
//!
//! | Provider status | Step |
//! |---|---|
//! | unobserved generation or unanswered deletion | [`Step::New`] |
//! | readiness finally failed or tries exhausted | [`Step::FinallyFailed`] |
//! | last operation failed | [`Step::Retry`] |
//! | reconcile annotation set | [`Step::Reconcile`] |
//! | install not ready yet | [`Step::Pending`] |
//! | successful remove | [`Step::Removed`] |
//! | anything else | [`Step::Converged`] |

use crate::constants::{
    HUB_CONTROLLER_FINALIZER, KIND_DEPLOY_ITEM, OPERATION_REMOVE,
};
use crate::context::Context;
use crate::crd::DeployItem;
use crate::deploy_data::{
    not_ready_requeue_delay, premature_retry_delay, unreachable_requeue_delay, DeployData,
};
use crate::deployers::target::target_exists;
use crate::deployers::Deployer;
use crate::exports::{remove_export_secrets, store_export};
use crate::keys::NamespacedName;
use crate::labels::ANNOTATION_RECONCILE;
use crate::metrics;
use crate::reconcilers::finalizers::{ensure_finalizer, remove_finalizer};
use crate::reconcilers::retry::repeat_on_conflict;
use crate::reconcilers::status::status_patch;
use crate::reconcilers::{block_for_reconcile, deactivator, patch_annotations};
use crate::status_reasons::{
    EVENT_FAILED_FETCH, EVENT_FAILED_WRITE_STATE, EVENT_SUCCESSFUL_DEPLOYMENT,
};
use crate::synchronize::BlockGuard;
use anyhow::{Context as _, Result};
use chrono::Utc;
use kube::api::{Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::{Api, Client, ResourceExt};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// What the deployment loop does with an item in its current state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Step {
    New,
    FinallyFailed,
    Retry,
    Reconcile,
    Pending,
    /// The remove succeeded; only the hub side is left to clean up.
    Removed,
    Converged,
}

/// Picks the next step for an item. The first matching row wins.
#[must_use]
pub fn next_step(data: &DeployData, max_number_of_tries: i64) -> Step {
    if data.is_new_operation() {
        Step::New
    } else if data.is_finally_failed(max_number_of_tries) {
        Step::FinallyFailed
    } else if data.is_last_deploy_failed() {
        Step::Retry
    } else if data.is_reconcile() {
        Step::Reconcile
    } else if data.is_install_but_not_ready() {
        Step::Pending
    } else if data.provider_status.last_operation.operation == OPERATION_REMOVE {
        Step::Removed
    } else {
        Step::Converged
    }
}

/// Reconciles one deploy item.
///
/// # Errors
///
/// Returns an error if the block, the item, the target secret or the item status
/// cannot be accessed. The item is requeued by the error policy.
pub async fn reconcile_deploy_item(ctx: Arc<Context>, item: Arc<DeployItem>) -> Result<Action> {
    let key = NamespacedName::of(item.as_ref());
    let clusterbom_key = crate::keys::clusterbom_key_of_item(item.as_ref());

    let guard = match block_for_reconcile(&ctx, &clusterbom_key, KIND_DEPLOY_ITEM, true).await {
        Ok(guard) => guard,
        Err(action) => return Ok(action),
    };

    // The cached object may predate changes made while waiting for the block.
    let api: Api<DeployItem> = Api::namespaced(ctx.client.clone(), &key.namespace);
    let item = match api.get_opt(&key.name).await {
        Ok(Some(item)) => item,
        Ok(None) => {
            debug!(item = %key, "Deploy item no longer exists");
            return Ok(Action::await_change());
        }
        Err(e) => {
            let message = format!("Failed to fetch deploy item {key}: {e}");
            ctx.events.failure(&clusterbom_key, EVENT_FAILED_FETCH, &message).await;
            return Err(e.into());
        }
    };

    if deactivator::handle_item(&ctx.client, &item).await? {
        debug!(item = %key, "Deploy item is deactivated");
        return Ok(Action::await_change());
    }

    let mut data = match DeployData::new(item) {
        Ok(data) => data,
        Err(e) => {
            error!(item = %key, error = %e, "Deploy item is not decodable");
            metrics::record_error(KIND_DEPLOY_ITEM, "decode");
            return Err(e.into());
        }
    };

    let config_type = data.config_type();
    let Some(deployer) = ctx.deployers.get(&config_type) else {
        debug!(item = %key, config_type = %config_type, "No deployer enabled for config type");
        return Ok(Action::await_change());
    };

    if !ctx.settings.disable_deploy_preprocess {
        deployer.preprocess(&mut data).await;
    }

    if data.is_delete_operation() {
        let target = data.target_secret_key();
        if !target_exists(&ctx.client, &target).await? {
            info!(item = %key, target = %target, "Target cluster is gone, cleaning up on the hub only");
            deployer.cleanup(&data, false).await?;
            remove_export_secrets(&ctx.client, &data, None).await?;
            remove_finalizer(&ctx.client, data.item(), HUB_CONTROLLER_FINALIZER).await?;
            return Ok(Action::await_change());
        }
    } else {
        ensure_finalizer(&ctx.client, data.item(), HUB_CONTROLLER_FINALIZER).await?;
    }

    let now = Utc::now();
    if let Some(delay) = unreachable_requeue_delay(&data.provider_status, now) {
        debug!(item = %key, ?delay, "Target cluster was unreachable recently");
        metrics::record_reconciliation_requeue(KIND_DEPLOY_ITEM, "unreachable");
        return Ok(Action::requeue(delay));
    }

    let step = next_step(&data, ctx.settings.max_number_of_tries);
    debug!(item = %key, ?step, "Deployment step");
    match step {
        Step::New => {
            deployer.process_new_operation(&mut data, &guard).await;
            update_status(&ctx, deployer.as_ref(), &mut data, &guard).await
        }
        Step::FinallyFailed => Ok(Action::await_change()),
        Step::Retry => {
            if let Some(delay) = premature_retry_delay(&data.provider_status, now) {
                return Ok(Action::requeue(delay));
            }
            deployer.retry_failed_operation(&mut data, &guard).await;
            update_status(&ctx, deployer.as_ref(), &mut data, &guard).await
        }
        Step::Reconcile => {
            deployer.reconcile_operation(&mut data, &guard).await;
            update_status(&ctx, deployer.as_ref(), &mut data, &guard).await
        }
        Step::Pending => {
            if let Some(delay) = not_ready_requeue_delay(&data.provider_status, now) {
                return Ok(Action::requeue(delay));
            }
            deployer.process_pending_operation(&mut data).await;
            update_status(&ctx, deployer.as_ref(), &mut data, &guard).await
        }
        Step::Removed => {
            remove_export_secrets(&ctx.client, &data, None).await?;
            remove_finalizer(&ctx.client, data.item(), HUB_CONTROLLER_FINALIZER).await?;
            ctx.events
                .success(
                    &clusterbom_key,
                    EVENT_SUCCESSFUL_DEPLOYMENT,
                    &format!("Removal ok for application {}", data.config_id()),
                )
                .await;
            Ok(Action::await_change())
        }
        Step::Converged => {
            ctx.events
                .success(
                    &clusterbom_key,
                    EVENT_SUCCESSFUL_DEPLOYMENT,
                    &format!("Deployment ok for application {}", data.config_id()),
                )
                .await;
            Ok(Action::await_change())
        }
    }
}

/// Persists the outcome of an operation.
///
/// A ready item stores its export first, the reconcile annotation is consumed,
/// and export secrets other than the current one are dropped after the status
/// points to it.
async fn update_status(
    ctx: &Context,
    deployer: &dyn Deployer,
    data: &mut DeployData,
    guard: &BlockGuard,
) -> Result<Action> {
    let key = data.key();
    debug!(item = %key, config_type = %deployer.config_type(), clusterbom = %guard.key(), "Updating deploy item status");

    let has_export = data
        .export_values
        .as_ref()
        .is_some_and(|v| v.as_object().is_none_or(|o| !o.is_empty()));
    if data.is_ready() && has_export {
        store_export(&ctx.client, data)
            .await
            .with_context(|| format!("storing export of {key}"))?;
    }

    if let Err(e) = patch_annotations(&ctx.client, data.item(), &[(ANNOTATION_RECONCILE, None)]).await {
        debug!(item = %key, error = %format!("{e:#}"), "Could not remove reconcile annotation");
    }

    if let Err(e) = write_item_status(&ctx.client, data).await {
        ctx.events
            .failure(
                &data.clusterbom_key(),
                EVENT_FAILED_WRITE_STATE,
                &format!("Writing the state of application {} failed", data.config_id()),
            )
            .await;
        return Err(e);
    }

    let keep = data.export_reference().map(|r| r.name.clone());
    if let Err(e) = remove_export_secrets(&ctx.client, data, keep.as_deref()).await {
        warn!(item = %key, error = %format!("{e:#}"), "Could not remove outdated export secrets");
    }
    Ok(Action::await_change())
}

/// Writes the status of an item, retrying conflicts on a freshly read object.
///
/// # Errors
///
/// Returns an error if the status cannot be encoded or patched.
pub async fn write_item_status(client: &Client, data: &DeployData) -> Result<()> {
    let key = data.key();
    let new_status = serde_json::to_value(data.status()?)?;
    let api: Api<DeployItem> = Api::namespaced(client.clone(), &key.namespace);

    repeat_on_conflict(|| {
        let api = api.clone();
        let name = key.name.clone();
        let new_status = new_status.clone();
        async move {
            let Some(stored) = api.get_opt(&name).await? else {
                return Ok(());
            };
            let old_status = stored.status.as_ref().map(serde_json::to_value).transpose()?;
            let patch = status_patch(
                old_status.as_ref(),
                &new_status,
                stored.resource_version().as_deref(),
            );
            api.patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
                .await?;
            Ok(())
        }
    })
    .await?;

    debug!(item = %key, "Wrote deploy item status");
    Ok(())
}

#[cfg(test)]
#[path = "deployment_tests.rs"]
mod deployment_tests;
