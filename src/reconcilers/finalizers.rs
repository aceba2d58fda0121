// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Finalizer management for `ClusterBom` and `DeployItem` resources.
//!
//! Both kinds carry the `hub-controller` finalizer. A `ClusterBom` gets it on
//! admission and loses it once all of its deploy items are gone; a deploy item
//! gets it from the deployment loop and loses it after a successful remove or
//! when its target cluster no longer exists.
//!
//! Finalizer patches carry the resource version they were computed from, so a
//! concurrent change of the finalizer list is never overwritten. Conflicts are
//! retried on a freshly read object.
//!
//! # Example
//!
//! ```rust,ignore
//! use potter_controller::constants::HUB_CONTROLLER_FINALIZER;
//! use potter_controller::reconcilers::finalizers::{ensure_finalizer, remove_finalizer};
//!
//! ensure_finalizer(&client, &item, HUB_CONTROLLER_FINALIZER).await?;
//! // ... item removed from the target cluster ...
//! remove_finalizer(&client, &item, HUB_CONTROLLER_FINALIZER).await?;
//! ```

use crate::errors::is_not_found;
use crate::reconcilers::retry::repeat_on_conflict;
use anyhow::Result;
use kube::api::{Patch, PatchParams};
use kube::core::NamespaceResourceScope;
use kube::{Api, Client, Resource, ResourceExt};
use serde_json::{json, Value};
use tracing::info;

/// Whether `resource` carries `finalizer`.
#[must_use]
pub fn has_finalizer<T: ResourceExt>(resource: &T, finalizer: &str) -> bool {
    resource.finalizers().iter().any(|f| f == finalizer)
}

/// Merge patch setting the finalizer list, guarded by the resource version.
#[must_use]
pub fn finalizer_patch(finalizers: &[String], resource_version: Option<&str>) -> Value {
    match resource_version {
        Some(version) => json!({ "metadata": { "finalizers": finalizers, "resourceVersion": version } }),
        None => json!({ "metadata": { "finalizers": finalizers } }),
    }
}

/// Add a finalizer to a resource if not already present.
///
/// # Errors
///
/// Returns an error if the API patch operation fails after all conflict retries.
pub async fn ensure_finalizer<T>(client: &Client, resource: &T, finalizer: &str) -> Result<()>
where
    T: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + ResourceExt
        + Clone
        + std::fmt::Debug
        + serde::Serialize
        + for<'de> serde::Deserialize<'de>,
{
    if has_finalizer(resource, finalizer) {
        return Ok(());
    }

    let namespace = resource.namespace().unwrap_or_default();
    let name = resource.name_any();
    let api: Api<T> = Api::namespaced(client.clone(), &namespace);

    let mut first = Some(resource.clone());
    repeat_on_conflict(|| {
        let api = api.clone();
        let name = name.clone();
        let cached = first.take();
        async move {
            let current = match cached {
                Some(current) => current,
                None => match api.get_opt(&name).await? {
                    Some(current) => current,
                    None => return Ok(()),
                },
            };
            if has_finalizer(&current, finalizer) {
                return Ok(());
            }

            let mut finalizers = current.finalizers().to_vec();
            finalizers.push(finalizer.to_string());
            let patch = finalizer_patch(&finalizers, current.resource_version().as_deref());
            api.patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
                .await?;
            Ok(())
        }
    })
    .await?;

    info!(kind = %T::kind(&()), namespace = %namespace, name = %name, "Added finalizer {finalizer}");
    Ok(())
}

/// Remove a finalizer from a resource.
///
/// A resource that no longer exists counts as done. Errors are never swallowed:
/// a finalizer left behind blocks the deletion of the resource.
///
/// # Errors
///
/// Returns an error if the API patch operation fails after all conflict retries.
pub async fn remove_finalizer<T>(client: &Client, resource: &T, finalizer: &str) -> Result<()>
where
    T: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + ResourceExt
        + Clone
        + std::fmt::Debug
        + serde::Serialize
        + for<'de> serde::Deserialize<'de>,
{
    if !has_finalizer(resource, finalizer) {
        return Ok(());
    }

    let namespace = resource.namespace().unwrap_or_default();
    let name = resource.name_any();
    let api: Api<T> = Api::namespaced(client.clone(), &namespace);

    let mut first = Some(resource.clone());
    repeat_on_conflict(|| {
        let api = api.clone();
        let name = name.clone();
        let cached = first.take();
        async move {
            let current = match cached {
                Some(current) => current,
                None => match api.get_opt(&name).await? {
                    Some(current) => current,
                    None => return Ok(()),
                },
            };
            if !has_finalizer(&current, finalizer) {
                return Ok(());
            }

            let finalizers: Vec<String> = current
                .finalizers()
                .iter()
                .filter(|f| *f != finalizer)
                .cloned()
                .collect();
            let patch = finalizer_patch(&finalizers, current.resource_version().as_deref());
            match api
                .patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
                .await
            {
                Ok(_) => Ok(()),
                Err(e) if is_not_found(&e) => Ok(()),
                Err(e) => Err(e.into()),
            }
        }
    })
    .await?;

    info!(kind = %T::kind(&()), namespace = %namespace, name = %name, "Removed finalizer {finalizer}");
    Ok(())
}

/// Drops every finalizer of a resource, including foreign ones.
///
/// Only used for deactivated `ClusterBom`s, whose items are no longer driven.
///
/// # Errors
///
/// Returns an error if the patch fails with anything but not-found.
pub async fn clear_finalizers<T>(client: &Client, resource: &T) -> Result<()>
where
    T: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + ResourceExt
        + Clone
        + std::fmt::Debug
        + serde::Serialize
        + for<'de> serde::Deserialize<'de>,
{
    if resource.finalizers().is_empty() {
        return Ok(());
    }

    let namespace = resource.namespace().unwrap_or_default();
    let name = resource.name_any();
    let api: Api<T> = Api::namespaced(client.clone(), &namespace);
    let patch = finalizer_patch(&[], None);
    match api
        .patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
        .await
    {
        Ok(_) => {
            info!(kind = %T::kind(&()), namespace = %namespace, name = %name, "Cleared all finalizers");
            Ok(())
        }
        Err(e) if is_not_found(&e) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
#[path = "finalizers_tests.rs"]
mod finalizers_tests;
