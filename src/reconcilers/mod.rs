// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Reconciliation loops of the potter controller.
//!
//! # Reconciliation Architecture
//!
//! 1. **Projection** ([`clusterbom`]) - turns every application config of a
//!    `ClusterBom` into a deploy item (or an installation for landscaper-managed
//!    `ClusterBom`s) and removes orphans
//! 2. **Deployment** ([`deployment`]) - drives one deploy item to convergence
//!    through its deployer and records the outcome in the item status
//! 3. **Aggregation** ([`clusterbom_state`]) - folds the item states into the
//!    `ClusterBom` status
//! 4. **Periodic driver** ([`periodic`]) - stamps every `ClusterBom` for a
//!    reconcile and collects orphans
//!
//! All loops serialise on the `ClusterBom` key through
//! [`crate::synchronize::BlockObject`].
//!
//! # Example: Using a Reconciler
//!
//! ```rust,ignore
//! use potter_controller::context::Context;
//! use potter_controller::crd::ClusterBom;
//! use potter_controller::reconcilers::reconcile_clusterbom;
//! use std::sync::Arc;
//!
//! async fn project(ctx: Arc<Context>, clusterbom: Arc<ClusterBom>) -> anyhow::Result<()> {
//!     let action = reconcile_clusterbom(ctx, clusterbom).await?;
//!     println!("{action:?}");
//!     Ok(())
//! }
//! ```

pub mod clusterbom;
pub mod clusterbom_state;
pub mod deactivator;
pub mod deployment;
pub mod finalizers;
pub mod installation;
pub mod periodic;
pub mod retry;
pub mod status;

pub use clusterbom::reconcile_clusterbom;
pub use clusterbom_state::reconcile_clusterbom_state;
pub use deployment::reconcile_deploy_item;
pub use periodic::PeriodicReconciler;

use crate::constants::{BLOCK_DURATION_SECS, BLOCK_ERROR_RETRY_SECS};
use crate::context::Context;
use crate::crd::DeployItem;
use crate::errors::is_not_found;
use crate::keys::NamespacedName;
use crate::labels;
use crate::metrics;
use crate::synchronize::{BlockGuard, BlockOutcome};
use anyhow::Result;
use kube::api::{DeleteParams, ListParams, Patch, PatchParams};
use kube::core::NamespaceResourceScope;
use kube::runtime::controller::Action;
use kube::{Api, Client, Resource, ResourceExt};
use serde_json::{json, Map, Value};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Merge patch changing annotations; `None` removes the key.
///
/// # Example
///
/// ```rust
/// use potter_controller::reconcilers::annotations_patch;
///
/// let patch = annotations_patch(&[("a", Some("x")), ("b", None)]);
/// assert_eq!(patch["metadata"]["annotations"]["a"], "x");
/// assert!(patch["metadata"]["annotations"]["b"].is_null());
/// ```
#[must_use]
pub fn annotations_patch(changes: &[(&str, Option<&str>)]) -> Value {
    let annotations: Map<String, Value> = changes
        .iter()
        .map(|(key, value)| {
            let value = value.map_or(Value::Null, |v| Value::String(v.to_string()));
            ((*key).to_string(), value)
        })
        .collect();
    json!({ "metadata": { "annotations": annotations } })
}

/// Whether applying `changes` would leave the annotations of `resource` as they are.
#[must_use]
pub fn annotations_unchanged<T: ResourceExt>(resource: &T, changes: &[(&str, Option<&str>)]) -> bool {
    let annotations = resource.annotations();
    changes
        .iter()
        .all(|(key, value)| annotations.get(*key).map(String::as_str) == *value)
}

/// Applies annotation changes to a namespaced resource.
///
/// A resource that no longer exists is not an error.
///
/// # Errors
///
/// Returns an error if the patch fails.
pub async fn patch_annotations<T>(
    client: &Client,
    resource: &T,
    changes: &[(&str, Option<&str>)],
) -> Result<()>
where
    T: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + ResourceExt
        + Clone
        + std::fmt::Debug
        + serde::Serialize
        + for<'de> serde::Deserialize<'de>,
{
    if annotations_unchanged(resource, changes) {
        return Ok(());
    }

    let namespace = resource.namespace().unwrap_or_default();
    let name = resource.name_any();
    let api: Api<T> = Api::namespaced(client.clone(), &namespace);
    let patch = annotations_patch(changes);
    match api
        .patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
        .await
    {
        Ok(_) => {
            debug!(kind = %T::kind(&()), namespace = %namespace, name = %name, "Patched annotations");
            Ok(())
        }
        Err(e) if is_not_found(&e) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Deletes a namespaced resource unless it is already being deleted.
///
/// # Errors
///
/// Returns an error if the delete call fails with anything but not-found.
pub async fn delete_resource<T>(client: &Client, resource: &T) -> Result<()>
where
    T: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + ResourceExt
        + Clone
        + std::fmt::Debug
        + serde::Serialize
        + for<'de> serde::Deserialize<'de>,
{
    if resource.meta().deletion_timestamp.is_some() {
        return Ok(());
    }

    let namespace = resource.namespace().unwrap_or_default();
    let name = resource.name_any();
    let api: Api<T> = Api::namespaced(client.clone(), &namespace);
    match api.delete(&name, &DeleteParams::default()).await {
        Ok(_) => {
            let kind = T::kind(&());
            metrics::record_resource_deleted(&kind);
            info!(kind = %kind, namespace = %namespace, name = %name, "Deleted resource");
            Ok(())
        }
        Err(e) if is_not_found(&e) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Takes the block of `clusterbom` for one reconcile of `kind`.
///
/// `Err` carries the requeue to return when the block is held elsewhere or
/// could not be taken.
pub async fn block_for_reconcile(
    ctx: &Context,
    clusterbom: &NamespacedName,
    kind: &str,
    ignore_exclusion: bool,
) -> std::result::Result<BlockGuard, Action> {
    let ttl = Duration::from_secs(BLOCK_DURATION_SECS.unsigned_abs());
    match ctx.block.block(clusterbom, ttl, ignore_exclusion).await {
        Ok(BlockOutcome::Acquired(guard)) => Ok(guard),
        Ok(BlockOutcome::NotAcquired(delay)) => {
            metrics::record_reconciliation_requeue(kind, "blocked");
            Err(Action::requeue(delay))
        }
        Err(e) => {
            warn!(clusterbom = %clusterbom, error = %e, "Failed to block clusterbom");
            metrics::record_reconciliation_requeue(kind, "block_error");
            Err(Action::requeue(Duration::from_secs(BLOCK_ERROR_RETRY_SECS)))
        }
    }
}

/// Deploy items projected from the `ClusterBom` behind `clusterbom`.
///
/// Items created by landscaper for an installation are not included.
///
/// # Errors
///
/// Returns an error if the list call fails.
pub async fn list_deploy_items(client: &Client, clusterbom: &NamespacedName) -> Result<Vec<DeployItem>> {
    let api: Api<DeployItem> = Api::namespaced(client.clone(), &clusterbom.namespace);
    let selector = format!(
        "{},{}",
        labels::selector(&[(labels::BOM_NAME, clusterbom.name.as_str())]),
        labels::NOT_LANDSCAPER_MANAGED
    );
    let list = api.list(&ListParams::default().labels(&selector)).await?;
    Ok(list.items)
}

/// Deletes every deploy item of a `ClusterBom`.
///
/// # Errors
///
/// Returns the first failing delete.
pub async fn delete_deploy_items(client: &Client, items: &[DeployItem]) -> Result<()> {
    for item in items {
        delete_resource(client, item).await?;
    }
    Ok(())
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod mod_tests;
