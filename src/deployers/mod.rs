// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Deployers drive one application on a target cluster.
//!
//! A deployer implements the type specific part ([`Deployer::apply`],
//! [`Deployer::observe`], [`Deployer::cleanup`]). Recording outcomes, events,
//! readiness and exports is shared by all deployers through the provided methods
//! of the trait:
//!
//! | Method | Used for |
//! |---|---|
//! | [`Deployer::process_new_operation`] | a new generation or a deletion |
//! | [`Deployer::retry_failed_operation`] | a failed operation, tries + 1 |
//! | [`Deployer::reconcile_operation`] | a periodic re-run |
//! | [`Deployer::process_pending_operation`] | readiness poll of an install |

pub mod helm;
pub mod kapp;
pub mod target;

use crate::constants::{
    CONFIG_TYPE_HELM, CONFIG_TYPE_KAPP, OPERATION_INSTALL, OPERATION_REMOVE, PHASE_PROGRESSING,
    STATE_FAILED, STATE_NOT_RELEVANT, STATE_OK, STATE_PENDING, STATE_UNKNOWN,
};
use crate::deploy_data::DeployData;
use crate::errors::DeployError;
use crate::events::EventPublisher;
use crate::metrics;
use crate::readiness::{api_resource, single_field, ReadinessChecker, ReadinessReport, WorkloadRef};
use crate::status_reasons::{
    CONDITION_UNKNOWN, CONDITION_TYPE_READY, EVENT_FAILED_CLUSTER_UNREACHABLE,
    EVENT_FAILED_DEPLOYMENT, EVENT_FAILED_JOB, EVENT_SUCCESSFUL_DEPLOYMENT,
    REASON_COULD_NOT_GET_EXPORT, REASON_NOT_CURRENT_GENERATION,
};
use crate::synchronize::BlockGuard;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kube::api::DynamicObject;
use kube::{Api, Client};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, warn};

/// Everything a deployer needs from the hub cluster.
#[derive(Clone)]
pub struct DeployerContext {
    pub client: Client,
    pub events: EventPublisher,
}

/// Rollout state reported by a deployer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Rollout {
    /// Applied; the deployed resources decide about readiness.
    Deployed,
    Pending,
    Failed,
    /// Anything else, with the raw deployer state.
    Unknown(String),
}

/// What a deployer found on the target cluster after an operation.
#[derive(Clone, Debug, PartialEq)]
pub struct Observation {
    pub rollout: Option<Rollout>,
    /// Workloads whose rollout decides about readiness.
    pub workloads: Vec<WorkloadRef>,
    pub type_specific_status: Option<Value>,
    /// `false` while the deployer has not picked up the latest spec.
    pub current: bool,
}

impl Default for Observation {
    fn default() -> Self {
        Self {
            rollout: None,
            workloads: Vec::new(),
            type_specific_status: None,
            current: true,
        }
    }
}

/// Value read from a target cluster resource and published as export.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct InternalExportEntry {
    pub name: String,
    pub namespace: String,
    pub api_version: String,
    pub resource: String,
    pub field_path: String,
}

/// The `internalExport` declarations of a type specific payload.
#[must_use]
pub fn internal_exports(type_specific_data: &Value) -> BTreeMap<String, InternalExportEntry> {
    type_specific_data
        .get("internalExport")
        .cloned()
        .and_then(|raw| serde_json::from_value(raw).ok())
        .unwrap_or_default()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperationKind {
    New,
    Retry,
    Reconcile,
}

impl OperationKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Retry => "retry",
            Self::Reconcile => "reconcile",
        }
    }

    fn description(self) -> &'static str {
        match self {
            Self::New => "Deployment",
            Self::Retry => "Retry of deployment",
            Self::Reconcile => "Reconcile",
        }
    }
}

/// Readiness from the last operation and what the deployer observed.
///
/// Only an applied install is checked on the target cluster; `check` performs
/// that check.
pub fn initial_readiness(data: &DeployData, observation: Option<&Observation>) -> Option<&'static str> {
    let last_operation = &data.provider_status.last_operation;
    match last_operation.operation.as_str() {
        OPERATION_REMOVE => Some(STATE_NOT_RELEVANT),
        OPERATION_INSTALL if last_operation.success_generation == 0 => Some(STATE_FAILED),
        OPERATION_INSTALL => match observation.and_then(|o| o.rollout.as_ref()) {
            Some(Rollout::Deployed) => None,
            Some(Rollout::Pending) => Some(STATE_PENDING),
            Some(Rollout::Failed) => Some(STATE_FAILED),
            Some(Rollout::Unknown(raw)) => {
                debug!(item = %data.key(), state = %raw, "Unexpected deployer state");
                Some(STATE_UNKNOWN)
            }
            None => Some(STATE_UNKNOWN),
        },
        _ => Some(STATE_UNKNOWN),
    }
}

fn success_description(data: &DeployData) -> &'static str {
    if data.is_delete_operation() {
        "remove successful"
    } else {
        "install successful"
    }
}

/// A type specific deployer.
#[async_trait]
pub trait Deployer: Send + Sync {
    fn config_type(&self) -> &'static str;

    fn context(&self) -> &DeployerContext;

    /// Prepares an item before the operation is decided. Never fails the item.
    async fn preprocess(&self, _data: &mut DeployData) {}

    /// Installs, updates or removes the application, depending on the item.
    async fn apply(&self, data: &mut DeployData, guard: &BlockGuard) -> Result<Observation, DeployError>;

    /// Reads the current rollout without changing anything.
    async fn observe(&self, data: &DeployData) -> Result<Observation, DeployError>;

    /// Removes what is left of the application on the hub cluster.
    async fn cleanup(&self, data: &DeployData, cluster_exists: bool) -> Result<(), DeployError>;

    async fn process_new_operation(&self, data: &mut DeployData, guard: &BlockGuard) {
        self.run_operation(data, guard, OperationKind::New).await;
    }

    async fn retry_failed_operation(&self, data: &mut DeployData, guard: &BlockGuard) {
        self.run_operation(data, guard, OperationKind::Retry).await;
    }

    async fn reconcile_operation(&self, data: &mut DeployData, guard: &BlockGuard) {
        self.run_operation(data, guard, OperationKind::Reconcile).await;
    }

    /// Polls the readiness of an install without deploying.
    async fn process_pending_operation(&self, data: &mut DeployData) {
        let now = Utc::now();
        let observation = match self.observe(data).await {
            Ok(observation) => {
                data.set_status_for_reachable_cluster(now);
                Some(observation)
            }
            Err(e) => {
                let reason = if e.is_cluster_unreachable() {
                    EVENT_FAILED_CLUSTER_UNREACHABLE
                } else {
                    EVENT_FAILED_DEPLOYMENT
                };
                let message = format!("Readiness check failed for application {}: {e}", data.config_id());
                self.context().events.failure(&data.clusterbom_key(), reason, &message).await;
                data.set_status_for_unreachable_cluster(now);
                None
            }
        };
        self.finish_operation(data, observation, now).await;
    }

    /// Runs the operation and records its outcome.
    async fn run_operation(&self, data: &mut DeployData, guard: &BlockGuard, kind: OperationKind) {
        let app_id = data.config_id().to_string();
        let clusterbom = data.clusterbom_key();
        let tries = match kind {
            OperationKind::Retry => data.provider_status.last_operation.number_of_tries + 1,
            OperationKind::New | OperationKind::Reconcile => 1,
        };

        let result = self.apply(data, guard).await;
        let now = Utc::now();
        metrics::record_deployer_operation(self.config_type(), kind.as_str(), result.is_ok());

        let events = &self.context().events;
        let observation = match result {
            Ok(observation) => {
                let message = format!("{} done for application {app_id}", kind.description());
                events.success(&clusterbom, EVENT_SUCCESSFUL_DEPLOYMENT, &message).await;
                data.set_status(STATE_OK, success_description(data), 1, now);
                Some(observation)
            }
            Err(e) if e.is_cluster_unreachable() => {
                let message = format!(
                    "{} failed for application {app_id}, because cluster is unreachable: {e}",
                    kind.description()
                );
                events.failure(&clusterbom, EVENT_FAILED_CLUSTER_UNREACHABLE, &message).await;
                data.set_status_for_unreachable_cluster(now);
                None
            }
            Err(e) => {
                let message = format!("{} failed for application {app_id}: {e}", kind.description());
                events.failure(&clusterbom, EVENT_FAILED_DEPLOYMENT, &message).await;
                data.set_status(STATE_FAILED, &e.to_string(), tries, now);
                // The rollout may still tell why the operation failed.
                self.observe(data).await.ok()
            }
        };

        self.finish_operation(data, observation, now).await;
    }

    /// Computes readiness, the Ready condition and exports after an operation.
    async fn finish_operation(&self, data: &mut DeployData, observation: Option<Observation>, now: DateTime<Utc>) {
        let unreachable = data
            .provider_status
            .reachability
            .as_ref()
            .is_some_and(|r| !r.reachable);
        if unreachable {
            data.compute_ready_condition(now);
            return;
        }

        let report = self.probe_readiness(data, observation.as_ref()).await;
        for job in &report.failed_jobs {
            let message = format!("Job {job} has finally failed");
            self.context().events.failure(&data.clusterbom_key(), EVENT_FAILED_JOB, &message).await;
        }
        data.set_readiness(&report.state, now);
        data.provider_status.type_specific_status =
            observation.as_ref().and_then(|o| o.type_specific_status.clone());
        data.compute_ready_condition(now);

        if data.is_ready() && observation.as_ref().is_some_and(|o| !o.current) {
            data.replace_condition(
                CONDITION_TYPE_READY,
                CONDITION_UNKNOWN,
                REASON_NOT_CURRENT_GENERATION,
                "Not latest version running",
                now,
            );
            data.set_phase(PHASE_PROGRESSING);
        }

        if data.is_ready() {
            match self.read_exports(data).await {
                Ok(values) => data.export_values = values,
                Err(e) => {
                    warn!(item = %data.key(), error = %e, "Could not get export data");
                    data.replace_condition(
                        CONDITION_TYPE_READY,
                        CONDITION_UNKNOWN,
                        REASON_COULD_NOT_GET_EXPORT,
                        "Could not get export data",
                        now,
                    );
                    data.set_phase(PHASE_PROGRESSING);
                }
            }
        }
    }

    /// Readiness of the last operation, checked on the target cluster if applied.
    async fn probe_readiness(&self, data: &DeployData, observation: Option<&Observation>) -> ReadinessReport {
        if let Some(state) = initial_readiness(data, observation) {
            return ReadinessReport {
                state: state.to_string(),
                failed_jobs: Vec::new(),
            };
        }

        let client = match target::target_client(&self.context().client, &data.target_secret_key()).await {
            Ok(client) => client,
            Err(e) => {
                warn!(item = %data.key(), error = %e, "Error fetching target client");
                return ReadinessReport {
                    state: STATE_UNKNOWN.to_string(),
                    failed_jobs: Vec::new(),
                };
            }
        };
        let workloads = observation.map(|o| o.workloads.as_slice()).unwrap_or_default();
        ReadinessChecker::new(client)
            .check(STATE_OK, workloads, &data.configuration.deployment_config.ready_requirements)
            .await
    }

    /// Reads the declared `internalExport` values from the target cluster.
    async fn read_exports(&self, data: &DeployData) -> Result<Option<Value>, DeployError> {
        let exports = internal_exports(&data.configuration.deployment_config.type_specific_data);
        if exports.is_empty() {
            return Ok(None);
        }

        let client = target::target_client(&self.context().client, &data.target_secret_key()).await?;
        let mut values = Map::new();
        for (key, entry) in exports {
            let resource = api_resource(&entry.api_version, &entry.resource);
            let api: Api<DynamicObject> = Api::namespaced_with(client.clone(), &entry.namespace, &resource);
            let object = api.get(&entry.name).await.map_err(target::classify_target_error)?;
            let object = serde_json::to_value(&object)
                .map_err(|e| DeployError::Deployer(format!("cannot encode {}: {e}", entry.name)))?;
            let value = single_field(&object, &entry.field_path)
                .map_err(|e| DeployError::Deployer(format!("export {key}: {e}")))?;
            values.insert(key, value);
        }
        Ok(Some(Value::Object(values)))
    }
}

/// Deployers by config type, restricted to the enabled types.
#[derive(Clone)]
pub struct DeployerFactory {
    deployers: BTreeMap<&'static str, Arc<dyn Deployer>>,
}

impl DeployerFactory {
    #[must_use]
    pub fn new(deployers: Vec<Arc<dyn Deployer>>, enabled: &BTreeSet<String>) -> Self {
        let deployers = deployers
            .into_iter()
            .filter(|d| enabled.contains(d.config_type()))
            .map(|d| (d.config_type(), d))
            .collect();
        Self { deployers }
    }

    /// The default deployers for Helm and kapp.
    #[must_use]
    pub fn with_defaults(
        context: &DeployerContext,
        helm_driver: Option<String>,
        reconcile_interval_minutes: i64,
        enabled: &BTreeSet<String>,
    ) -> Self {
        let helm: Arc<dyn Deployer> = Arc::new(helm::HelmDeployer::new(
            context.clone(),
            Arc::new(helm::HelmCli::new(helm_driver)),
        ));
        let kapp: Arc<dyn Deployer> = Arc::new(kapp::KappDeployer::new(
            context.clone(),
            reconcile_interval_minutes,
        ));
        Self::new(vec![helm, kapp], enabled)
    }

    /// Deployer for `config_type`, `None` for unknown or disabled types.
    #[must_use]
    pub fn get(&self, config_type: &str) -> Option<Arc<dyn Deployer>> {
        self.deployers.get(config_type).cloned()
    }

    #[must_use]
    pub fn known_types() -> [&'static str; 2] {
        [CONFIG_TYPE_HELM, CONFIG_TYPE_KAPP]
    }
}
