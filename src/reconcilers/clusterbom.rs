// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Projection loop: turns the application configs of a `ClusterBom` into deploy items.
//!
//! A run holds the block of the `ClusterBom` and works through these cases in
//! order:
//!
//! 1. (Re)activation in progress: forwarded by [`deactivator`]
//! 2. `ClusterBom` gone: all items (and installations) are deleted
//! 3. `ClusterBom` being deleted: items are deleted, then the value secrets and
//!    finally the finalizer
//! 4. Target cluster secret missing: items are deleted and the status reports the
//!    unreachable cluster
//! 5. Otherwise every application config is projected into an item contract.
//!    Orphans are deleted, missing items created and changed ones updated.
//!
//! Items are only written when the SHA-256 of the normalised contract changed.

use crate::constants::{
    DEACTIVATION_REQUEUE_SECS, HUB_CONTROLLER_FINALIZER, KIND_CLUSTER_BOM, KIND_DEPLOY_ITEM,
    MISSING_TARGET_REQUEUE_SECS, REQUEUE_BASE_SECS,
};
use crate::context::Context;
use crate::crd::{ApplicationConfig, ClusterBom, DeployItem, DeployItemSpec};
use crate::deploy_data::{DeployItemConfiguration, DeploymentConfig};
use crate::deployers::target::target_exists;
use crate::exports::import_references;
use crate::keys::{app_id_of_item, deploy_item_name, NamespacedName};
use crate::labels::{self, ANNOTATION_RECONCILE, ANNOTATION_RECONCILE_VALUE};
use crate::metrics;
use crate::reconcilers::clusterbom_state::handle_missing_target;
use crate::reconcilers::deactivator::{self, ClusterBomActivation};
use crate::reconcilers::finalizers::{ensure_finalizer, has_finalizer, remove_finalizer};
use crate::reconcilers::installation::{
    apply_installation, build_installation, delete_installations, force_reconcile,
    list_installations,
};
use crate::reconcilers::{
    block_for_reconcile, delete_deploy_items, list_deploy_items, patch_annotations,
};
use crate::secrets::{
    legacy_content, named_content, plan_secret_values, stored_content, SecretContent, SecretPlan,
};
use anyhow::{Context as _, Result};
use chrono::Utc;
use k8s_openapi::api::core::v1::Secret;
use kube::api::{DynamicObject, PostParams};
use kube::runtime::controller::Action;
use kube::{Api, Client, ResourceExt};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Sorts object keys recursively so equal trees encode to equal bytes.
#[must_use]
pub fn normalise(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<&String, Value> =
                map.iter().map(|(k, v)| (k, normalise(v))).collect();
            Value::Object(sorted.into_iter().map(|(k, v)| (k.clone(), v)).collect::<Map<_, _>>())
        }
        Value::Array(items) => Value::Array(items.iter().map(normalise).collect()),
        other => other.clone(),
    }
}

/// Hex encoded SHA-256 of the compact, key-sorted JSON encoding of `value`.
///
/// # Errors
///
/// Returns an error if the value cannot be encoded.
pub fn contract_hash(value: &Value) -> Result<String, serde_json::Error> {
    let encoded = serde_json::to_vec(&normalise(value))?;
    Ok(hex::encode(Sha256::digest(&encoded)))
}

/// Value secret names materialised into one contract; empty means none.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SecretNames {
    pub internal: String,
    pub named: BTreeMap<String, String>,
}

impl SecretNames {
    /// All referenced secret names.
    pub fn all(&self) -> impl Iterator<Item = &String> {
        std::iter::once(&self.internal)
            .chain(self.named.values())
            .filter(|name| !name.is_empty())
    }
}

/// The contract of one application config.
#[must_use]
pub fn deployment_config(
    clusterbom_name: &str,
    app: &ApplicationConfig,
    secrets: &SecretNames,
) -> DeploymentConfig {
    DeploymentConfig {
        id: app.id.clone(),
        config_type: app.config_type.clone(),
        type_specific_data: app.type_specific_data.clone().unwrap_or_default(),
        values: app.values.clone(),
        internal_secret_name: secrets.internal.clone(),
        named_internal_secret_names: secrets.named.clone(),
        ready_requirements: app.ready_requirements.clone().unwrap_or_default(),
        reconcile_time: None,
        import_parameters: import_references(clusterbom_name, &app.import_parameters),
        internal_import_parameters: app.internal_import_parameters.clone(),
        export_parameters: app.export_parameters.as_ref().map(|e| e.parameters.clone()),
        no_reconcile: app.no_reconcile,
    }
}

/// Builds the desired deploy item of an application config.
///
/// # Errors
///
/// Returns an error if the configuration cannot be encoded.
pub fn build_deploy_item(
    clusterbom: &ClusterBom,
    app: &ApplicationConfig,
    secrets: &SecretNames,
) -> Result<DeployItem, serde_json::Error> {
    let clusterbom_name = clusterbom.name_any();
    let configuration = DeployItemConfiguration::new(
        &clusterbom.spec.secret_ref,
        deployment_config(&clusterbom_name, app, secrets),
    );

    let mut item = DeployItem::new(
        &deploy_item_name(&clusterbom_name, &app.id),
        DeployItemSpec {
            r#type: app.config_type.clone(),
            configuration: serde_json::to_value(configuration)?,
        },
    );
    let mut item_labels = labels::app_labels(&clusterbom_name, &app.id);
    item_labels.insert(labels::CONFIG_TYPE.to_string(), app.config_type.clone());
    item.metadata.namespace = clusterbom.namespace();
    item.metadata.labels = Some(item_labels);
    Ok(item)
}

/// Whether the stored item carries a different contract than the desired one.
///
/// # Errors
///
/// Returns an error if a spec cannot be encoded.
pub fn contract_changed(
    existing: &DeployItem,
    desired: &DeployItem,
) -> Result<bool, serde_json::Error> {
    Ok(contract_hash(&serde_json::to_value(&existing.spec)?)?
        != contract_hash(&serde_json::to_value(&desired.spec)?)?)
}

/// Contract currently embedded in an item, if it decodes.
#[must_use]
pub fn existing_contract(item: &DeployItem) -> Option<DeploymentConfig> {
    serde_json::from_value::<DeployItemConfiguration>(item.spec.configuration.clone())
        .ok()
        .map(|c| c.deployment_config)
}

/// Projected objects whose application config no longer exists.
#[must_use]
pub fn orphans<K: ResourceExt + Clone>(objects: &[K], clusterbom: &ClusterBom) -> Vec<K> {
    let ids: BTreeSet<&str> = clusterbom
        .spec
        .application_configs
        .iter()
        .map(|a| a.id.as_str())
        .collect();
    objects
        .iter()
        .filter(|o| !ids.contains(app_id_of_item(*o).as_str()))
        .cloned()
        .collect()
}

/// The value secret currently holding a block of an application.
///
/// A referenced name wins. Without one, a secret of the application with the
/// same logical name and content is reused.
#[must_use]
pub fn find_current_secret(
    stored: &[Secret],
    referenced: Option<&str>,
    app_id: &str,
    logical_name: Option<&str>,
    content: Option<&SecretContent>,
) -> Option<(String, SecretContent)> {
    if let Some(name) = referenced.filter(|n| !n.is_empty()) {
        if let Some(secret) = stored.iter().find(|s| s.name_any() == name) {
            return Some((name.to_string(), stored_content(secret)));
        }
    }

    let content = content?;
    stored
        .iter()
        .filter(|s| s.labels().get(labels::APPLICATION_CONFIG_ID).map(String::as_str) == Some(app_id))
        .filter(|s| s.labels().get(labels::LOGICAL_SECRET_NAME).map(String::as_str) == logical_name)
        .find(|s| stored_content(s) == *content)
        .map(|s| (s.name_any(), stored_content(s)))
}

/// Everything the projection reads about a `ClusterBom`.
struct Associated {
    key: NamespacedName,
    clusterbom: Option<ClusterBom>,
    items: Vec<DeployItem>,
    installations: Vec<DynamicObject>,
    secrets: Vec<Secret>,
}

impl Associated {
    async fn load(ctx: &Context, key: NamespacedName) -> Result<Self> {
        let api: Api<ClusterBom> = Api::namespaced(ctx.client.clone(), &key.namespace);
        let clusterbom = api.get_opt(&key.name).await?;
        let items = list_deploy_items(&ctx.client, &key).await?;
        let installations = if ctx.settings.landscaper_enabled {
            list_installations(&ctx.client, &key).await?
        } else {
            Vec::new()
        };
        let secrets = ctx
            .secrets
            .list_value_secrets(&key.namespace, &key.name)
            .await?;
        Ok(Self {
            key,
            clusterbom,
            items,
            installations,
            secrets,
        })
    }

    async fn delete_projection(&self, client: &Client) -> Result<()> {
        delete_deploy_items(client, &self.items).await?;
        delete_installations(client, &self.installations).await
    }
}

/// Reconciles one `ClusterBom`.
///
/// # Errors
///
/// Returns an error if the block, the associated objects or a write fails. The
/// `ClusterBom` is requeued by the error policy.
pub async fn reconcile_clusterbom(ctx: Arc<Context>, clusterbom: Arc<ClusterBom>) -> Result<Action> {
    let key = NamespacedName::of(clusterbom.as_ref());

    let _guard = match block_for_reconcile(&ctx, &key, KIND_CLUSTER_BOM, false).await {
        Ok(guard) => guard,
        Err(action) => return Ok(action),
    };

    let associated = Associated::load(&ctx, key.clone()).await?;
    let Some(clusterbom) = associated.clusterbom.as_ref() else {
        info!(clusterbom = %key, "ClusterBom is gone, deleting its deploy items");
        associated.delete_projection(&ctx.client).await?;
        return Ok(Action::await_change());
    };

    match deactivator::handle_clusterbom(&ctx.client, clusterbom, &associated.items).await? {
        ClusterBomActivation::Continue => {}
        ClusterBomActivation::Progressing => {
            debug!(clusterbom = %key, "Waiting for deploy items to confirm the action");
            return Ok(Action::requeue(Duration::from_secs(DEACTIVATION_REQUEUE_SECS)));
        }
        ClusterBomActivation::Stop => {
            deactivator::delete_if_required(&ctx.client, clusterbom, &associated.items).await?;
            return Ok(Action::await_change());
        }
    }

    if clusterbom.metadata.deletion_timestamp.is_some() {
        return handle_deletion(&ctx, &associated, clusterbom).await;
    }

    ensure_finalizer(&ctx.client, clusterbom, HUB_CONTROLLER_FINALIZER).await?;

    let target = NamespacedName::new(key.namespace.clone(), clusterbom.spec.secret_ref.clone());
    if !target_exists(&ctx.client, &target).await? {
        warn!(clusterbom = %key, target = %target, "Target cluster secret does not exist");
        delete_installations(&ctx.client, &associated.installations).await?;
        handle_missing_target(&ctx.client, &key, Some(clusterbom)).await?;
        metrics::record_reconciliation_requeue(KIND_CLUSTER_BOM, "missing_target");
        return Ok(Action::requeue(Duration::from_secs(MISSING_TARGET_REQUEUE_SECS)));
    }

    let referenced = if labels::clusterbom_is_landscaper_managed(clusterbom.annotations())
        && ctx.settings.landscaper_enabled
    {
        project_installations(&ctx, &associated, clusterbom).await?
    } else {
        project_deploy_items(&ctx, &associated, clusterbom).await?
    };

    let collected = ctx
        .secrets
        .collect_unreferenced(&associated.secrets, &referenced, Utc::now())
        .await;
    if collected > 0 {
        info!(clusterbom = %key, count = collected, "Deleted unreferenced value secrets");
    }

    forward_reconcile_annotation(&ctx, clusterbom).await?;
    Ok(Action::await_change())
}

async fn handle_deletion(ctx: &Context, associated: &Associated, clusterbom: &ClusterBom) -> Result<Action> {
    let key = &associated.key;
    if !has_finalizer(clusterbom, HUB_CONTROLLER_FINALIZER) {
        return Ok(Action::await_change());
    }

    if associated.items.is_empty() && associated.installations.is_empty() {
        ctx.secrets
            .delete_all(&associated.secrets)
            .await
            .with_context(|| format!("deleting value secrets of {key}"))?;
        remove_finalizer(&ctx.client, clusterbom, HUB_CONTROLLER_FINALIZER).await?;
        info!(clusterbom = %key, "All deploy items are gone, released the ClusterBom");
        return Ok(Action::await_change());
    }

    info!(clusterbom = %key, items = associated.items.len(), "ClusterBom is being deleted, deleting its deploy items");
    associated.delete_projection(&ctx.client).await?;
    Ok(Action::requeue(Duration::from_secs(REQUEUE_BASE_SECS)))
}

/// Creates value secrets where the plan asks for them and returns the names to reference.
async fn materialise_secrets(
    ctx: &Context,
    clusterbom: &ClusterBom,
    app: &ApplicationConfig,
    existing: Option<&DeploymentConfig>,
    stored: &[Secret],
) -> Result<SecretNames> {
    let namespace = clusterbom.namespace().unwrap_or_default();
    let clusterbom_name = clusterbom.name_any();
    let mut names = SecretNames::default();

    if let Some(values) = app.secret_values.as_ref() {
        let content = legacy_content(values)?;
        let referenced = existing
            .map(|c| c.internal_secret_name.as_str())
            .filter(|n| !n.is_empty())
            .or(values.internal_secret_name.as_deref());
        let current = find_current_secret(stored, referenced, &app.id, None, content.as_ref());
        let plan = plan_secret_values(
            values.operation.as_deref(),
            content,
            current.as_ref().map(|(name, content)| (name.as_str(), content)),
        )?;
        names.internal = match plan {
            SecretPlan::Create(content) => {
                ctx.secrets
                    .create_value_secret(&namespace, &clusterbom_name, &app.id, None, content)
                    .await?
            }
            SecretPlan::Keep(name) => name.unwrap_or_default(),
            SecretPlan::Drop => String::new(),
        };
    }

    for (logical_name, values) in &app.named_secret_values {
        let content = named_content(values)?;
        let referenced = existing
            .and_then(|c| c.named_internal_secret_names.get(logical_name))
            .map(String::as_str)
            .filter(|n| !n.is_empty())
            .or(values.internal_secret_name.as_deref());
        let current = find_current_secret(
            stored,
            referenced,
            &app.id,
            Some(logical_name.as_str()),
            content.as_ref(),
        );
        let plan = plan_secret_values(
            values.operation.as_deref(),
            content,
            current.as_ref().map(|(name, content)| (name.as_str(), content)),
        )?;
        let name = match plan {
            SecretPlan::Create(content) => {
                ctx.secrets
                    .create_value_secret(
                        &namespace,
                        &clusterbom_name,
                        &app.id,
                        Some(logical_name),
                        content,
                    )
                    .await?
            }
            SecretPlan::Keep(Some(name)) => name,
            SecretPlan::Keep(None) | SecretPlan::Drop => continue,
        };
        names.named.insert(logical_name.clone(), name);
    }

    Ok(names)
}

/// Projects every application config into a deploy item. Returns the referenced secret names.
async fn project_deploy_items(
    ctx: &Context,
    associated: &Associated,
    clusterbom: &ClusterBom,
) -> Result<BTreeSet<String>> {
    let key = &associated.key;

    let orphaned = orphans(&associated.items, clusterbom);
    if !orphaned.is_empty() {
        info!(clusterbom = %key, count = orphaned.len(), "Deleting deploy items of removed applications");
        delete_deploy_items(&ctx.client, &orphaned).await?;
    }

    let existing: BTreeMap<String, &DeployItem> = associated
        .items
        .iter()
        .map(|i| (app_id_of_item(i), i))
        .collect();
    let api: Api<DeployItem> = Api::namespaced(ctx.client.clone(), &key.namespace);
    let mut referenced = BTreeSet::new();

    for app in &clusterbom.spec.application_configs {
        let current = existing.get(&app.id).copied();
        let contract = current.and_then(existing_contract);
        let secrets = materialise_secrets(ctx, clusterbom, app, contract.as_ref(), &associated.secrets)
            .await
            .with_context(|| format!("secret values of application {} in {key}", app.id))?;
        referenced.extend(secrets.all().cloned());

        let desired = build_deploy_item(clusterbom, app, &secrets)?;
        match current {
            None => {
                api.create(&PostParams::default(), &desired).await?;
                metrics::record_resource_created(KIND_DEPLOY_ITEM);
                info!(clusterbom = %key, item = %desired.name_any(), "Created deploy item");
            }
            Some(current) if contract_changed(current, &desired)? => {
                let mut updated = current.clone();
                updated.spec = desired.spec;
                updated.metadata.labels = desired.metadata.labels;
                api.replace(&updated.name_any(), &PostParams::default(), &updated)
                    .await?;
                metrics::record_resource_updated(KIND_DEPLOY_ITEM);
                info!(clusterbom = %key, item = %updated.name_any(), "Updated deploy item");
            }
            Some(current) => {
                debug!(clusterbom = %key, item = %current.name_any(), "Deploy item unchanged");
            }
        }
    }

    Ok(referenced)
}

/// Projects every application config into an installation. Returns the referenced secret names.
async fn project_installations(
    ctx: &Context,
    associated: &Associated,
    clusterbom: &ClusterBom,
) -> Result<BTreeSet<String>> {
    let key = &associated.key;

    let orphaned = orphans(&associated.installations, clusterbom);
    if !orphaned.is_empty() {
        info!(clusterbom = %key, count = orphaned.len(), "Deleting installations of removed applications");
        delete_installations(&ctx.client, &orphaned).await?;
    }

    let mut referenced = BTreeSet::new();
    for app in &clusterbom.spec.application_configs {
        let current = associated
            .installations
            .iter()
            .find(|i| app_id_of_item(*i) == app.id);
        let secrets = materialise_secrets(ctx, clusterbom, app, None, &associated.secrets)
            .await
            .with_context(|| format!("secret values of application {} in {key}", app.id))?;
        referenced.extend(secrets.all().cloned());

        let configuration = DeployItemConfiguration::new(
            &clusterbom.spec.secret_ref,
            deployment_config(&key.name, app, &secrets),
        );
        let desired = build_installation(clusterbom, app, &configuration)?;
        apply_installation(&ctx.client, current, desired).await?;
    }

    Ok(referenced)
}

/// Hands a reconcile request on the `ClusterBom` down to its items.
async fn forward_reconcile_annotation(ctx: &Context, clusterbom: &ClusterBom) -> Result<()> {
    if !labels::has_entry(
        clusterbom.metadata.annotations.as_ref(),
        ANNOTATION_RECONCILE,
        ANNOTATION_RECONCILE_VALUE,
    ) {
        return Ok(());
    }

    let key = NamespacedName::of(clusterbom);
    for item in list_deploy_items(&ctx.client, &key).await? {
        patch_annotations(
            &ctx.client,
            &item,
            &[(ANNOTATION_RECONCILE, Some(ANNOTATION_RECONCILE_VALUE))],
        )
        .await?;
    }
    if ctx.settings.landscaper_enabled {
        force_reconcile(&ctx.client, &list_installations(&ctx.client, &key).await?).await?;
    }

    patch_annotations(&ctx.client, clusterbom, &[(ANNOTATION_RECONCILE, None)]).await?;
    debug!(clusterbom = %key, "Forwarded reconcile request to deploy items");
    Ok(())
}

#[cfg(test)]
#[path = "clusterbom_tests.rs"]
mod clusterbom_tests;
