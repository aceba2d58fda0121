// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! kapp-controller deployer.
//!
//! The type specific payload of a `kapp` application is the spec of a
//! kapp-controller `App`. The `App` is created on the hub cluster, next to the
//! deploy item and under the same name; kapp-controller deploys it to the target
//! cluster through the kubeconfig secret of the `ClusterBom`.

use super::{target, Deployer, DeployerContext, Observation, Rollout};
use crate::constants::{
    CONFIG_TYPE_KAPP, KAPP_API_GROUP, KAPP_API_VERSION, KAPP_APP_PLURAL, KAPP_DELETE_WAIT_ATTEMPTS,
    KAPP_DELETE_WAIT_SECS, KIND_KAPP_APP, KUBECONFIG_KEY,
};
use crate::deploy_data::DeployData;
use crate::errors::{is_not_found, DeployError};
use crate::keys::NamespacedName;
use crate::synchronize::BlockGuard;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{ApiResource, DeleteParams, DynamicObject, GroupVersionKind, Patch, PatchParams, PostParams};
use kube::{Api, Client};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const SECRET_REF: &str = "secretRef";
const SECRET_REF_NAME: &str = "name";
const DEFAULT_NAMESPACE: &str = "default";

const CONDITION_RECONCILE_SUCCEEDED: &str = "ReconcileSucceeded";
const CONDITION_RECONCILE_FAILED: &str = "ReconcileFailed";
const CONDITION_RECONCILING: &str = "Reconciling";

/// Replaces logical secret names by the names of the value secrets.
///
/// Only string values under a `name` key whose parent key is `secretRef` are
/// touched, and only if `mapping` knows them.
#[must_use]
pub fn replace_secret_names(tree: &Value, mapping: &BTreeMap<String, String>) -> Value {
    fn walk(tree: &Value, mapping: &BTreeMap<String, String>, parent_key: &str) -> Value {
        match tree {
            Value::Array(items) => Value::Array(items.iter().map(|item| walk(item, mapping, "")).collect()),
            Value::Object(map) => {
                let mut out = Map::with_capacity(map.len());
                for (key, value) in map {
                    let replaced = match value {
                        Value::String(name) if key == SECRET_REF_NAME && parent_key == SECRET_REF => mapping
                            .get(name)
                            .map_or_else(|| value.clone(), |mapped| Value::String(mapped.clone())),
                        Value::Object(_) => walk(value, mapping, key),
                        Value::Array(_) => walk(value, mapping, ""),
                        _ => value.clone(),
                    };
                    out.insert(key.clone(), replaced);
                }
                Value::Object(out)
            }
            _ => tree.clone(),
        }
    }

    if mapping.is_empty() {
        return tree.clone();
    }
    walk(tree, mapping, "")
}

/// Formats minutes the way Kubernetes durations are written (`1h30m0s`).
#[must_use]
pub fn format_sync_period(minutes: i64) -> String {
    let hours = minutes / 60;
    let rest = minutes % 60;
    if hours > 0 {
        format!("{hours}h{rest}m0s")
    } else {
        format!("{rest}m0s")
    }
}

/// Builds the `App` spec of an item.
///
/// Secret names are replaced, the cluster defaults to the target cluster of the
/// `ClusterBom` and the sync period to the reconcile interval.
///
/// # Errors
///
/// Returns [`DeployError::Config`] if the payload is not an object or points to
/// another cluster.
pub fn app_spec(
    type_specific_data: &Value,
    named_secret_names: &BTreeMap<String, String>,
    local_secret_ref: &str,
    reconcile_interval_minutes: i64,
) -> Result<Value, DeployError> {
    let mut spec = replace_secret_names(type_specific_data, named_secret_names);
    let Some(fields) = spec.as_object_mut() else {
        return Err(DeployError::Config("kapp specific data is not an object".to_string()));
    };
    fields.remove("internalExport");

    let cluster = fields
        .entry("cluster")
        .or_insert_with(|| json!({}))
        .as_object_mut()
        .ok_or_else(|| DeployError::Config("field cluster is not an object".to_string()))?;
    if cluster.get("namespace").and_then(Value::as_str).unwrap_or_default().is_empty() {
        cluster.insert("namespace".to_string(), json!(DEFAULT_NAMESPACE));
    }
    let secret_ref = cluster
        .entry("kubeconfigSecretRef")
        .or_insert_with(|| json!({}))
        .as_object_mut()
        .ok_or_else(|| DeployError::Config("field cluster.kubeconfigSecretRef is not an object".to_string()))?;
    if secret_ref.get("name").and_then(Value::as_str).unwrap_or_default().is_empty() {
        secret_ref.insert("name".to_string(), json!(local_secret_ref));
    }
    if secret_ref.get("key").and_then(Value::as_str).unwrap_or_default().is_empty() {
        secret_ref.insert("key".to_string(), json!(KUBECONFIG_KEY));
    }
    if secret_ref.get("name").and_then(Value::as_str) != Some(local_secret_ref) {
        return Err(DeployError::Config(
            "target cluster of kapp app differs from localSecretRef".to_string(),
        ));
    }
    if secret_ref.get("key").and_then(Value::as_str) != Some(KUBECONFIG_KEY) {
        return Err(DeployError::Config(
            "the value of field cluster.kubeconfigSecretRef.key must be kubeconfig".to_string(),
        ));
    }

    if fields.get("syncPeriod").is_none_or(Value::is_null) {
        fields.insert("syncPeriod".to_string(), json!(format_sync_period(reconcile_interval_minutes)));
    }
    Ok(spec)
}

/// Namespace on the target cluster that holds the kapp state.
#[must_use]
pub fn state_namespace(spec: &Value) -> Option<&str> {
    spec.pointer("/cluster/namespace")
        .and_then(Value::as_str)
        .filter(|ns| !ns.is_empty() && *ns != DEFAULT_NAMESPACE)
}

fn has_condition(app: &DynamicObject, condition_type: &str) -> bool {
    app.data
        .pointer("/status/conditions")
        .and_then(Value::as_array)
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.get("type").and_then(Value::as_str) == Some(condition_type))
        })
}

/// Rollout state of an `App` from its conditions.
#[must_use]
pub fn rollout_of_app(app: &DynamicObject) -> Rollout {
    if has_condition(app, CONDITION_RECONCILE_SUCCEEDED) {
        Rollout::Deployed
    } else if has_condition(app, CONDITION_RECONCILE_FAILED) {
        Rollout::Failed
    } else if has_condition(app, CONDITION_RECONCILING) {
        Rollout::Pending
    } else {
        Rollout::Unknown(String::new())
    }
}

/// Whether kapp-controller has seen the latest spec of the `App`.
#[must_use]
pub fn is_current(app: &DynamicObject) -> bool {
    let observed = app.data.pointer("/status/observedGeneration").and_then(Value::as_i64);
    app.metadata.generation.unwrap_or(0) == observed.unwrap_or(0)
}

#[must_use]
pub fn app_resource() -> ApiResource {
    let gvk = GroupVersionKind::gvk(KAPP_API_GROUP, KAPP_API_VERSION, KIND_KAPP_APP);
    ApiResource::from_gvk_with_plural(&gvk, KAPP_APP_PLURAL)
}

/// Deploys `kapp` application configs through kapp-controller.
pub struct KappDeployer {
    context: DeployerContext,
    reconcile_interval_minutes: i64,
}

impl KappDeployer {
    #[must_use]
    pub fn new(context: DeployerContext, reconcile_interval_minutes: i64) -> Self {
        Self {
            context,
            reconcile_interval_minutes,
        }
    }

    fn apps(&self, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.context.client.clone(), namespace, &app_resource())
    }

    async fn create_state_namespace(&self, data: &DeployData, spec: &Value) -> Result<(), DeployError> {
        let target = target::target_client(&self.context.client, &data.target_secret_key()).await?;
        let Some(name) = state_namespace(spec) else {
            return Ok(());
        };
        ensure_namespace(&target, name)
            .await
            .map_err(target::classify_target_error)
    }

    async fn install_or_update(&self, key: &NamespacedName, spec: Value) -> Result<(), DeployError> {
        let apps = self.apps(&key.namespace);
        match apps.get_opt(&key.name).await? {
            None => {
                let mut app = DynamicObject::new(&key.name, &app_resource()).within(&key.namespace);
                app.data = json!({ "spec": spec });
                apps.create(&PostParams::default(), &app).await.inspect_err(|e| {
                    error!(app = %key, error = %e, "Error creating kapp app");
                })?;
                info!(app = %key, "Created kapp app");
            }
            Some(mut app) => {
                match app.data.as_object_mut() {
                    Some(fields) => {
                        fields.insert("spec".to_string(), spec);
                    }
                    None => app.data = json!({ "spec": spec }),
                }
                apps.replace(&key.name, &PostParams::default(), &app)
                    .await
                    .inspect_err(|e| {
                        error!(app = %key, error = %e, "Error updating kapp app");
                    })?;
                debug!(app = %key, "Updated kapp app");
            }
        }
        Ok(())
    }
}

async fn ensure_namespace(client: &Client, name: &str) -> Result<(), kube::Error> {
    let namespaces: Api<Namespace> = Api::all(client.clone());
    if namespaces.get_opt(name).await?.is_some() {
        return Ok(());
    }
    let namespace = Namespace {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        ..Default::default()
    };
    namespaces.create(&PostParams::default(), &namespace).await?;
    info!(namespace = %name, "Created kapp state namespace on target cluster");
    Ok(())
}

#[async_trait]
impl Deployer for KappDeployer {
    fn config_type(&self) -> &'static str {
        CONFIG_TYPE_KAPP
    }

    fn context(&self) -> &DeployerContext {
        &self.context
    }

    async fn apply(&self, data: &mut DeployData, _guard: &BlockGuard) -> Result<Observation, DeployError> {
        if data.is_delete_operation() {
            self.cleanup(data, true).await?;
            return Ok(Observation::default());
        }

        let config = &data.configuration.deployment_config;
        let spec = app_spec(
            &config.type_specific_data,
            &config.named_internal_secret_names,
            &data.configuration.local_secret_ref,
            self.reconcile_interval_minutes,
        )
        .inspect_err(|e| warn!(item = %data.key(), error = %e, "Invalid kapp specific data"))?;

        self.create_state_namespace(data, &spec).await?;
        self.install_or_update(&data.key(), spec).await?;
        self.observe(data).await
    }

    async fn observe(&self, data: &DeployData) -> Result<Observation, DeployError> {
        let key = data.key();
        let Some(app) = self.apps(&key.namespace).get_opt(&key.name).await? else {
            return Ok(Observation::default());
        };
        Ok(Observation {
            rollout: Some(rollout_of_app(&app)),
            workloads: Vec::new(),
            type_specific_status: app.data.get("status").cloned(),
            current: is_current(&app),
        })
    }

    async fn cleanup(&self, data: &DeployData, cluster_exists: bool) -> Result<(), DeployError> {
        let key = data.key();
        let apps = self.apps(&key.namespace);

        let Some(mut app) = apps.get_opt(&key.name).await? else {
            return Ok(());
        };

        if !cluster_exists {
            // kapp-controller cannot finalize an app of a vanished cluster
            let patch = json!({ "metadata": { "finalizers": null } });
            apps.patch(&key.name, &PatchParams::default(), &Patch::Merge(&patch))
                .await
                .inspect_err(|e| error!(app = %key, error = %e, "Error removing finalizers from kapp app"))?;
            match apps.get_opt(&key.name).await? {
                Some(current) => app = current,
                None => return Ok(()),
            }
        }

        if app.metadata.deletion_timestamp.is_none() {
            match apps.delete(&key.name, &DeleteParams::default()).await {
                Ok(_) => info!(app = %key, "Deleting kapp app"),
                Err(e) if is_not_found(&e) => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        }

        for _ in 0..KAPP_DELETE_WAIT_ATTEMPTS {
            tokio::time::sleep(Duration::from_secs(KAPP_DELETE_WAIT_SECS)).await;
            if apps.get_opt(&key.name).await?.is_none() {
                return Ok(());
            }
        }

        error!(app = %key, "Could not remove kapp controller app");
        Err(DeployError::Deployer(
            "kapp controller app resource not removed within sleep period".to_string(),
        ))
    }
}

#[cfg(test)]
#[path = "kapp_tests.rs"]
mod kapp_tests;
