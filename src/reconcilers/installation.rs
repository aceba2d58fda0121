// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Landscaper `Installation` projection of landscaper-managed `ClusterBom`s.
//!
//! Each application config becomes one `Installation` with an inline blueprint
//! whose single deploy execution renders the projected deploy item contract.
//! Equality is decided by the `installation-hash` annotation, the SHA-256 of
//! the normalised installation spec.

use crate::constants::{
    INSTALLATION_PLURAL, KIND_INSTALLATION, LANDSCAPER_API_GROUP, LANDSCAPER_API_VERSION,
};
use crate::crd::{ApplicationConfig, ClusterBom};
use crate::deploy_data::DeployItemConfiguration;
use crate::errors::is_not_found;
use crate::exports::{data_ref, import_references};
use crate::keys::{deploy_item_name, NamespacedName};
use crate::labels::{
    self, ANNOTATION_INSTALLATION_HASH, ANNOTATION_LANDSCAPER_OPERATION,
    LANDSCAPER_OPERATION_FORCE_RECONCILE,
};
use crate::metrics;
use crate::reconcilers::annotations_patch;
use crate::reconcilers::clusterbom::contract_hash;
use anyhow::{Context as _, Result};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{
    ApiResource, DeleteParams, DynamicObject, GroupVersionKind, ListParams, Patch, PatchParams,
    PostParams,
};
use kube::{Api, Client, ResourceExt};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use tracing::{debug, info};

const DEFAULT_EXECUTION_NAME: &str = "default";
const TEMPLATE_TYPE_SPIFF: &str = "Spiff";
const BLUEPRINT_FILE: &str = "blueprint.yaml";
const INTERNAL_EXPORT_PREFIX: &str = "internalExport.";

/// API resource of landscaper `Installation`s.
#[must_use]
pub fn installation_resource() -> ApiResource {
    let gvk = GroupVersionKind::gvk(LANDSCAPER_API_GROUP, LANDSCAPER_API_VERSION, KIND_INSTALLATION);
    ApiResource::from_gvk_with_plural(&gvk, INSTALLATION_PLURAL)
}

fn installation_labels(clusterbom_name: &str, app: &ApplicationConfig) -> BTreeMap<String, String> {
    let mut result = labels::app_labels(clusterbom_name, &app.id);
    result.insert(
        labels::LANDSCAPER_MANAGED_LABEL.to_string(),
        labels::LANDSCAPER_MANAGED_VALUE.to_string(),
    );
    result.insert(labels::CONFIG_TYPE.to_string(), app.config_type.clone());
    result
}

/// Export execution template of one export parameter.
///
/// References to the internal export of the item are rewritten to the path
/// under which landscaper exposes deploy item values.
///
/// # Errors
///
/// Returns an error if the rewritten parameter is no longer valid JSON.
pub fn export_template(app_id: &str, name: &str, parameter: &Value) -> Result<Value> {
    let rewritten = serde_json::to_string(parameter)?
        .replace(INTERNAL_EXPORT_PREFIX, &format!("values.deployitems.{app_id}."));
    let parameter: Value = serde_json::from_str(&rewritten)
        .with_context(|| format!("export parameter {name} of application {app_id}"))?;
    let value = parameter.get("value").cloned().unwrap_or(Value::Null);
    Ok(json!({ "exports": { name: value } }))
}

fn export_parameters(app: &ApplicationConfig) -> Map<String, Value> {
    app.export_parameters
        .as_ref()
        .and_then(|e| e.parameters.as_object().cloned())
        .unwrap_or_default()
}

/// Renders the inline blueprint filesystem of an application.
///
/// # Errors
///
/// Returns an error if the contract or an export template cannot be encoded.
pub fn blueprint_filesystem(
    clusterbom_name: &str,
    app: &ApplicationConfig,
    configuration: &DeployItemConfiguration,
) -> Result<Value> {
    let exports = export_parameters(app);
    let mut export_definitions = Vec::new();
    let mut export_executions = Vec::new();
    for (name, parameter) in &exports {
        export_definitions.push(json!({ "name": name, "schema": {} }));
        export_executions.push(json!({
            "name": name,
            "type": TEMPLATE_TYPE_SPIFF,
            "template": export_template(&app.id, name, parameter)?,
        }));
    }

    let import_definitions: Vec<Value> = app
        .import_parameters
        .iter()
        .map(|p| json!({ "name": p.name, "schema": {} }))
        .collect();

    let blueprint = json!({
        "apiVersion": format!("{LANDSCAPER_API_GROUP}/{LANDSCAPER_API_VERSION}"),
        "kind": "Blueprint",
        "imports": import_definitions,
        "exports": export_definitions,
        "exportExecutions": export_executions,
        "deployExecutions": [{
            "name": DEFAULT_EXECUTION_NAME,
            "type": TEMPLATE_TYPE_SPIFF,
            "template": {
                "deployItems": [{
                    "name": app.id,
                    "type": app.config_type,
                    "labels": installation_labels(clusterbom_name, app),
                    "config": serde_json::to_value(configuration)?,
                }],
            },
        }],
    });

    Ok(json!({ BLUEPRINT_FILE: serde_yaml::to_string(&blueprint)? }))
}

/// Builds the desired `Installation` of an application, hash annotation included.
///
/// # Errors
///
/// Returns an error if the blueprint cannot be rendered.
pub fn build_installation(
    clusterbom: &ClusterBom,
    app: &ApplicationConfig,
    configuration: &DeployItemConfiguration,
) -> Result<DynamicObject> {
    let clusterbom_name = clusterbom.name_any();

    let imports: Vec<Value> = import_references(&clusterbom_name, &app.import_parameters)
        .into_iter()
        .map(|r| json!({ "name": r.name, "dataRef": r.data_ref }))
        .collect();
    let exports: Vec<Value> = export_parameters(app)
        .keys()
        .map(|name| json!({ "name": name, "dataRef": data_ref(&clusterbom_name, &app.id, name) }))
        .collect();

    let spec = json!({
        "blueprint": {
            "inline": { "filesystem": blueprint_filesystem(&clusterbom_name, app, configuration)? },
        },
        "imports": { "data": imports },
        "exports": { "data": exports },
    });
    let hash = contract_hash(&spec)?;

    let resource = installation_resource();
    let mut installation = DynamicObject::new(&deploy_item_name(&clusterbom_name, &app.id), &resource);
    installation.metadata = ObjectMeta {
        name: Some(deploy_item_name(&clusterbom_name, &app.id)),
        namespace: clusterbom.namespace(),
        labels: Some(installation_labels(&clusterbom_name, app)),
        annotations: Some(BTreeMap::from([(ANNOTATION_INSTALLATION_HASH.to_string(), hash)])),
        ..Default::default()
    };
    installation.data = json!({ "spec": spec });
    Ok(installation)
}

/// Whether the stored installation was built from the same contract.
#[must_use]
pub fn same_hash(existing: &DynamicObject, desired: &DynamicObject) -> bool {
    let hash = |o: &DynamicObject| o.annotations().get(ANNOTATION_INSTALLATION_HASH).cloned();
    hash(existing).is_some() && hash(existing) == hash(desired)
}

fn api(client: &Client, namespace: &str) -> Api<DynamicObject> {
    Api::namespaced_with(client.clone(), namespace, &installation_resource())
}

/// Installations projected from the `ClusterBom` behind `clusterbom`.
///
/// # Errors
///
/// Returns an error if the list call fails.
pub async fn list_installations(client: &Client, clusterbom: &NamespacedName) -> Result<Vec<DynamicObject>> {
    let selector = labels::selector(&[(labels::BOM_NAME, clusterbom.name.as_str())]);
    let list = api(client, &clusterbom.namespace)
        .list(&ListParams::default().labels(&selector))
        .await?;
    Ok(list.items)
}

/// Creates the desired installation, or replaces the existing one if its hash differs.
///
/// Updates carry the force-reconcile operation so landscaper re-runs the blueprint.
///
/// # Errors
///
/// Returns an error if the create or replace call fails.
pub async fn apply_installation(
    client: &Client,
    existing: Option<&DynamicObject>,
    mut desired: DynamicObject,
) -> Result<()> {
    let namespace = desired.namespace().unwrap_or_default();
    let name = desired.name_any();
    let api = api(client, &namespace);

    let Some(existing) = existing else {
        api.create(&PostParams::default(), &desired).await?;
        metrics::record_resource_created(KIND_INSTALLATION);
        info!(installation = %name, namespace = %namespace, "Created installation");
        return Ok(());
    };

    if same_hash(existing, &desired) {
        debug!(installation = %name, "Installation unchanged");
        return Ok(());
    }

    desired.metadata.resource_version = existing.resource_version();
    desired.annotations_mut().insert(
        ANNOTATION_LANDSCAPER_OPERATION.to_string(),
        LANDSCAPER_OPERATION_FORCE_RECONCILE.to_string(),
    );
    api.replace(&name, &PostParams::default(), &desired).await?;
    metrics::record_resource_updated(KIND_INSTALLATION);
    info!(installation = %name, namespace = %namespace, "Updated installation");
    Ok(())
}

/// Deletes installations that are not already being deleted.
///
/// # Errors
///
/// Returns the first failing delete.
pub async fn delete_installations(client: &Client, installations: &[DynamicObject]) -> Result<()> {
    for installation in installations {
        if installation.metadata.deletion_timestamp.is_some() {
            continue;
        }
        let namespace = installation.namespace().unwrap_or_default();
        let name = installation.name_any();
        match api(client, &namespace).delete(&name, &DeleteParams::default()).await {
            Ok(_) => {
                metrics::record_resource_deleted(KIND_INSTALLATION);
                info!(installation = %name, namespace = %namespace, "Deleted installation");
            }
            Err(e) if is_not_found(&e) => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Asks landscaper to re-run every given installation.
///
/// # Errors
///
/// Returns the first failing patch.
pub async fn force_reconcile(client: &Client, installations: &[DynamicObject]) -> Result<()> {
    let patch = annotations_patch(&[(
        ANNOTATION_LANDSCAPER_OPERATION,
        Some(LANDSCAPER_OPERATION_FORCE_RECONCILE),
    )]);
    for installation in installations {
        let namespace = installation.namespace().unwrap_or_default();
        match api(client, &namespace)
            .patch(&installation.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => {}
            Err(e) if is_not_found(&e) => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

#[cfg(test)]
#[path = "installation_tests.rs"]
mod installation_tests;
