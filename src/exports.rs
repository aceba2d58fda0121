// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Export and import of values between applications.
//!
//! Producer side: once an item is ready and its deployer read export values from
//! the target cluster, the declared export parameters are resolved against them
//! (`(( internalExport.<key> ))` placeholders) and stored as YAML under data key
//! `config` in an export secret referenced by `status.exportReference`. A changed
//! export always gets a fresh secret name.
//!
//! Consumer side: every import is recorded in the item contract as a data
//! reference `<clusterbom>::<appID>::<exportParam>`. Preprocessing reads the
//! referenced export, substitutes `(( imports.<name> ))` in the import parameter
//! tree and the deployer merges the result over the values.

use crate::constants::EXPORT_DATA_KEY;
use crate::crd::{DeployItem, ImportParameter};
use crate::deploy_data::{DeployData, ImportReference};
use crate::errors::{is_not_found, DeployError};
use crate::keys::{deploy_item_name, random_secret_name};
use crate::labels;
use crate::metrics;
use anyhow::{Context as _, Result};
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use k8s_openapi::ByteString;
use kube::api::{DeleteParams, ListParams, PostParams};
use kube::{Api, Client, Resource, ResourceExt};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

const DATA_REF_SEPARATOR: &str = "::";
const IMPORTS_PREFIX: &str = "imports.";
const INTERNAL_EXPORT_PREFIX: &str = "internalExport.";

/// Builds the data reference of an export parameter.
#[must_use]
pub fn data_ref(clusterbom_name: &str, app_id: &str, export_param: &str) -> String {
    [clusterbom_name, app_id, export_param].join(DATA_REF_SEPARATOR)
}

/// Splits a data reference into `ClusterBom` name, application ID and parameter.
#[must_use]
pub fn parse_data_ref(reference: &str) -> Option<(&str, &str, &str)> {
    let mut parts = reference.splitn(3, DATA_REF_SEPARATOR);
    let clusterbom = parts.next().filter(|p| !p.is_empty())?;
    let app_id = parts.next().filter(|p| !p.is_empty())?;
    let param = parts.next().filter(|p| !p.is_empty())?;
    Some((clusterbom, app_id, param))
}

/// Turns the imports of an application config into item contract references.
///
/// Imports without a source `ClusterBom` refer to the importing one.
#[must_use]
pub fn import_references(clusterbom_name: &str, imports: &[ImportParameter]) -> Vec<ImportReference> {
    imports
        .iter()
        .map(|import| ImportReference {
            name: import.name.clone(),
            data_ref: data_ref(
                import.cluster_bom_name.as_deref().unwrap_or(clusterbom_name),
                &import.app_id,
                &import.export_param_name,
            ),
        })
        .collect()
}

/// Deep merge: keys of `overlay` win, nested objects are merged recursively.
#[must_use]
pub fn merge_values(base: &Value, overlay: &Value) -> Value {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            let mut merged = base_map.clone();
            for (key, value) in overlay_map {
                let next = match merged.get(key) {
                    Some(existing @ Value::Object(_)) if value.is_object() => {
                        merge_values(existing, value)
                    }
                    _ => value.clone(),
                };
                merged.insert(key.clone(), next);
            }
            Value::Object(merged)
        }
        (_, Value::Null) => base.clone(),
        _ => overlay.clone(),
    }
}

/// The name inside a `(( <prefix><name> ))` placeholder.
fn placeholder_name<'a>(text: &'a str, prefix: &str) -> Option<&'a str> {
    text.trim()
        .strip_prefix("((")?
        .strip_suffix("))")?
        .trim()
        .strip_prefix(prefix)
        .map(str::trim)
}

fn substitute<F>(tree: &Value, prefix: &str, lookup: &mut F) -> Result<Value, DeployError>
where
    F: FnMut(&str) -> Result<Value, DeployError>,
{
    Ok(match tree {
        Value::String(text) => match placeholder_name(text, prefix) {
            Some(name) => lookup(name)?,
            None => tree.clone(),
        },
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| substitute(item, prefix, lookup))
                .collect::<Result<_, _>>()?,
        ),
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (key, value) in map {
                out.insert(key.clone(), substitute(value, prefix, lookup)?);
            }
            Value::Object(out)
        }
        _ => tree.clone(),
    })
}

/// Replaces every `(( imports.<name> ))` string in `tree` with the imported value.
///
/// # Errors
///
/// Returns [`DeployError::Import`] for a placeholder without an imported value.
pub fn substitute_imports(tree: &Value, imports: &BTreeMap<String, Value>) -> Result<Value, DeployError> {
    substitute(tree, IMPORTS_PREFIX, &mut |name| {
        imports.get(name).cloned().ok_or_else(|| DeployError::Import {
            name: name.to_string(),
            reason: "no imported value".to_string(),
        })
    })
}

/// Resolves declared export parameters against the values read by the deployer.
///
/// Without declarations the export values are published as they are. A
/// placeholder for a missing key resolves to `null`.
#[must_use]
pub fn resolve_export_parameters(parameters: Option<&Value>, export_values: &Value) -> Value {
    let Some(parameters) = parameters.filter(|p| p.as_object().is_some_and(|m| !m.is_empty())) else {
        return export_values.clone();
    };
    let resolved = substitute(parameters, INTERNAL_EXPORT_PREFIX, &mut |key| {
        Ok(export_values.get(key).cloned().unwrap_or(Value::Null))
    });
    resolved.unwrap_or_else(|_| parameters.clone())
}

/// Decodes the export stored in an export secret.
///
/// # Errors
///
/// Returns an error if the `config` entry is missing or not YAML.
pub fn decode_export(secret: &Secret) -> Result<Value> {
    let raw = secret
        .data
        .as_ref()
        .and_then(|d| d.get(EXPORT_DATA_KEY))
        .with_context(|| format!("export secret {} has no {EXPORT_DATA_KEY} entry", secret.name_any()))?;
    serde_yaml::from_slice(&raw.0).with_context(|| format!("decoding export secret {}", secret.name_any()))
}

/// Reads and resolves all imports of an item.
///
/// Returns `None` if the item has no import parameter tree.
///
/// # Errors
///
/// Returns [`DeployError::Import`] if a referenced export is not available.
pub async fn resolve_imports(client: &Client, data: &DeployData) -> Result<Option<Value>, DeployError> {
    let config = &data.configuration.deployment_config;
    let Some(tree) = config
        .internal_import_parameters
        .as_ref()
        .map(|p| &p.parameters)
        .filter(|p| !p.is_null())
    else {
        return Ok(None);
    };

    let namespace = data.key().namespace;
    let mut imports = BTreeMap::new();
    for reference in &config.import_parameters {
        let value = read_import(client, &namespace, reference).await?;
        imports.insert(reference.name.clone(), value);
    }

    substitute_imports(tree, &imports).map(Some)
}

async fn read_import(client: &Client, namespace: &str, reference: &ImportReference) -> Result<Value, DeployError> {
    let import_error = |reason: String| DeployError::Import {
        name: reference.name.clone(),
        reason,
    };

    let (clusterbom, app_id, param) = parse_data_ref(&reference.data_ref)
        .ok_or_else(|| import_error(format!("malformed data reference {}", reference.data_ref)))?;

    let items: Api<DeployItem> = Api::namespaced(client.clone(), namespace);
    let source_name = deploy_item_name(clusterbom, app_id);
    let source = items
        .get_opt(&source_name)
        .await?
        .ok_or_else(|| import_error(format!("source item {source_name} does not exist")))?;
    let export_ref = source
        .status
        .as_ref()
        .and_then(|s| s.export_reference.clone())
        .ok_or_else(|| import_error(format!("source item {source_name} has no export")))?;

    let secrets: Api<Secret> = Api::namespaced(client.clone(), &export_ref.namespace);
    let secret = secrets
        .get_opt(&export_ref.name)
        .await?
        .ok_or_else(|| import_error(format!("export secret {} does not exist", export_ref.name)))?;
    let export = decode_export(&secret).map_err(|e| import_error(format!("{e:#}")))?;

    export
        .get(param)
        .cloned()
        .ok_or_else(|| import_error(format!("export parameter {param} not found in {source_name}")))
}

/// Stores the resolved export of a ready item if it changed.
///
/// # Errors
///
/// Returns an error if the export secret cannot be read or written.
pub async fn store_export(client: &Client, data: &mut DeployData) -> Result<()> {
    let Some(export_values) = data.export_values.as_ref() else {
        return Ok(());
    };
    let export = resolve_export_parameters(
        data.configuration.deployment_config.export_parameters.as_ref(),
        export_values,
    );

    let key = data.key();
    let secrets: Api<Secret> = Api::namespaced(client.clone(), &key.namespace);

    if let Some(reference) = data.export_reference() {
        if let Some(current) = secrets.get_opt(&reference.name).await? {
            match decode_export(&current) {
                Ok(stored) if stored == export => {
                    debug!(item = %key, "Export data unchanged");
                    return Ok(());
                }
                Ok(_) => {}
                Err(e) => warn!(item = %key, error = %format!("{e:#}"), "Stored export is unreadable, replacing it"),
            }
        }
    }

    let clusterbom = data.clusterbom_key();
    let app_id = data.config_id().to_string();
    let name = random_secret_name(&clusterbom.name, &app_id);
    let mut secret_labels = labels::app_labels(&clusterbom.name, &app_id);
    secret_labels.insert(labels::PURPOSE.to_string(), labels::PURPOSE_EXPORT_DATA.to_string());

    let encoded = serde_yaml::to_string(&export).context("encoding export data")?;
    let secret = Secret {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(key.namespace.clone()),
            labels: Some(secret_labels),
            owner_references: export_owner_reference(data.item()).map(|r| vec![r]),
            ..Default::default()
        },
        type_: Some("Opaque".to_string()),
        data: Some(BTreeMap::from([(
            EXPORT_DATA_KEY.to_string(),
            ByteString(encoded.into_bytes()),
        )])),
        ..Default::default()
    };
    secrets
        .create(&PostParams::default(), &secret)
        .await
        .with_context(|| format!("creating export secret {name}"))?;
    metrics::record_resource_created("Secret");
    info!(item = %key, secret = %name, "Stored new export data");

    data.set_export_secret_name(&name);
    Ok(())
}

/// Owner reference that hands an export secret to the garbage collector
/// together with its deploy item. `None` for an item not yet persisted.
#[must_use]
pub fn export_owner_reference(item: &DeployItem) -> Option<OwnerReference> {
    Some(OwnerReference {
        api_version: DeployItem::api_version(&()).to_string(),
        kind: DeployItem::kind(&()).to_string(),
        name: item.metadata.name.clone()?,
        uid: item.metadata.uid.clone()?,
        controller: Some(true),
        block_owner_deletion: Some(true),
    })
}

/// Deletes the export secrets of an item except `keep`.
///
/// # Errors
///
/// Returns an error if the list call fails; individual deletes are logged.
pub async fn remove_export_secrets(client: &Client, data: &DeployData, keep: Option<&str>) -> Result<()> {
    let key = data.key();
    let clusterbom = data.clusterbom_key();
    let secrets: Api<Secret> = Api::namespaced(client.clone(), &key.namespace);
    let selector = labels::selector(&[
        (labels::BOM_NAME, clusterbom.name.as_str()),
        (labels::APPLICATION_CONFIG_ID, data.config_id()),
        (labels::PURPOSE, labels::PURPOSE_EXPORT_DATA),
    ]);

    let list = secrets
        .list(&ListParams::default().labels(&selector))
        .await
        .context("listing export secrets")?;
    for secret in list.items {
        let name = secret.name_any();
        if keep == Some(name.as_str()) {
            continue;
        }
        match secrets.delete(&name, &DeleteParams::default()).await {
            Ok(_) => {
                metrics::record_resource_deleted("Secret");
                debug!(item = %key, secret = %name, "Deleted export secret");
            }
            Err(e) if is_not_found(&e) => {}
            Err(e) => warn!(item = %key, secret = %name, error = %e, "Could not delete export secret"),
        }
    }
    Ok(())
}

#[cfg(test)]
#[path = "exports_tests.rs"]
mod exports_tests;
