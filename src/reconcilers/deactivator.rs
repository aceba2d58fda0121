// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Deactivation and reactivation of `ClusterBom`s.
//!
//! A `ClusterBom` is deactivated by setting `action-ignore: deactivate`. The
//! projection loop forwards the action to every deploy item; the deployment loop
//! confirms it on the item by replacing the action with `status-ignore: ignore`.
//! Once every item confirmed, the `ClusterBom` gets `status-ignore: ignore` itself
//! and is no longer reconciled. `action-ignore: reactivate` walks the same way
//! back.

use crate::crd::{ClusterBom, DeployItem};
use crate::labels::{
    has_entry, ACTION_DEACTIVATE, ACTION_REACTIVATE, ANNOTATION_ACTION_IGNORE,
    ANNOTATION_STATUS_IGNORE, STATUS_IGNORE,
};
use crate::reconcilers::finalizers::clear_finalizers;
use crate::reconcilers::{delete_resource, patch_annotations};
use anyhow::Result;
use kube::{Client, ResourceExt};
use std::collections::BTreeMap;
use tracing::info;

/// Activation state read from the ignore annotations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Activation {
    /// `action-ignore: deactivate` is pending.
    Deactivating,
    /// `action-ignore: reactivate` is pending.
    Reactivating,
    /// `status-ignore: ignore` without a pending action.
    Deactivated,
    Active,
}

#[must_use]
pub fn activation_of(annotations: &BTreeMap<String, String>) -> Activation {
    let annotations = Some(annotations);
    if has_entry(annotations, ANNOTATION_ACTION_IGNORE, ACTION_DEACTIVATE) {
        Activation::Deactivating
    } else if has_entry(annotations, ANNOTATION_ACTION_IGNORE, ACTION_REACTIVATE) {
        Activation::Reactivating
    } else if has_entry(annotations, ANNOTATION_STATUS_IGNORE, STATUS_IGNORE) {
        Activation::Deactivated
    } else {
        Activation::Active
    }
}

/// Where an item stands while its `ClusterBom` is (re)activated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ItemProgress {
    /// The item reached the target state.
    Done,
    /// The item got the action but has not confirmed it yet.
    Informed,
    /// The item still needs the action.
    Uninformed,
}

/// Progress of an item towards `target`, which is `Deactivating` or `Reactivating`.
#[must_use]
pub fn item_progress(annotations: &BTreeMap<String, String>, target: Activation) -> ItemProgress {
    match (activation_of(annotations), target) {
        (Activation::Deactivated, Activation::Deactivating)
        | (Activation::Active, Activation::Reactivating) => ItemProgress::Done,
        (current, target) if current == target => ItemProgress::Informed,
        _ => ItemProgress::Uninformed,
    }
}

/// Outcome of the activation handling of a `ClusterBom`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClusterBomActivation {
    /// Nothing to do; reconcile normally.
    Continue,
    /// Deactivated, or a (re)activation just completed.
    Stop,
    /// Items have not confirmed yet; check again shortly.
    Progressing,
}

/// Forwards a pending (re)activation of a `ClusterBom` to its deploy items.
///
/// # Errors
///
/// Returns an error if an item or the `ClusterBom` cannot be patched.
pub async fn handle_clusterbom(
    client: &Client,
    clusterbom: &ClusterBom,
    items: &[DeployItem],
) -> Result<ClusterBomActivation> {
    let target = activation_of(clusterbom.annotations());
    let action = match target {
        Activation::Active => return Ok(ClusterBomActivation::Continue),
        Activation::Deactivated => return Ok(ClusterBomActivation::Stop),
        Activation::Deactivating => ACTION_DEACTIVATE,
        Activation::Reactivating => ACTION_REACTIVATE,
    };

    let mut all_done = true;
    for item in items {
        match item_progress(item.annotations(), target) {
            ItemProgress::Done => {}
            ItemProgress::Informed => all_done = false,
            ItemProgress::Uninformed => {
                all_done = false;
                patch_annotations(client, item, &[(ANNOTATION_ACTION_IGNORE, Some(action))]).await?;
            }
        }
    }
    if !all_done {
        return Ok(ClusterBomActivation::Progressing);
    }

    let status_ignore = (target == Activation::Deactivating).then_some(STATUS_IGNORE);
    patch_annotations(
        client,
        clusterbom,
        &[
            (ANNOTATION_ACTION_IGNORE, None),
            (ANNOTATION_STATUS_IGNORE, status_ignore),
        ],
    )
    .await?;
    info!(clusterbom = %clusterbom.name_any(), action, "All deploy items confirmed the action");
    Ok(ClusterBomActivation::Stop)
}

/// Lets a deleted, deactivated `ClusterBom` go without touching the target cluster.
///
/// Finalizers of the items and of the `ClusterBom` are dropped and the items
/// deleted.
///
/// # Errors
///
/// Returns an error if a patch or delete fails.
pub async fn delete_if_required(client: &Client, clusterbom: &ClusterBom, items: &[DeployItem]) -> Result<()> {
    if clusterbom.metadata.deletion_timestamp.is_none()
        || activation_of(clusterbom.annotations()) != Activation::Deactivated
    {
        return Ok(());
    }

    for item in items {
        clear_finalizers(client, item).await?;
        delete_resource(client, item).await?;
    }
    clear_finalizers(client, clusterbom).await
}

/// Confirms a (re)activation on a deploy item.
///
/// Returns `true` if the deployment loop must not drive the item.
///
/// # Errors
///
/// Returns an error if the item cannot be patched.
pub async fn handle_item(client: &Client, item: &DeployItem) -> Result<bool> {
    match activation_of(item.annotations()) {
        Activation::Deactivating => {
            patch_annotations(
                client,
                item,
                &[
                    (ANNOTATION_ACTION_IGNORE, None),
                    (ANNOTATION_STATUS_IGNORE, Some(STATUS_IGNORE)),
                ],
            )
            .await?;
            info!(item = %item.name_any(), "Deploy item deactivated");
            Ok(true)
        }
        Activation::Reactivating => {
            patch_annotations(
                client,
                item,
                &[(ANNOTATION_ACTION_IGNORE, None), (ANNOTATION_STATUS_IGNORE, None)],
            )
            .await?;
            info!(item = %item.name_any(), "Deploy item reactivated");
            // The annotation change triggers the next run
            Ok(true)
        }
        Activation::Deactivated => Ok(true),
        Activation::Active => Ok(false),
    }
}

#[cfg(test)]
#[path = "deactivator_tests.rs"]
mod deactivator_tests;
