// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Readiness of deployed resources on a target cluster.
//!
//! Three sources contribute to the readiness of an item:
//!
//! - workloads touched by a release (`Deployment`, `StatefulSet`, `DaemonSet`)
//! - `readyRequirements.jobs`, where a failed Job is final
//! - `readyRequirements.resources`, evaluated through a small JSONPath subset
//!
//! Results are folded with [`worse_state`]. A resource that cannot be read makes
//! the result `unknown` rather than failing the whole check.

use crate::constants::{STATE_FINALLY_FAILED, STATE_OK, STATE_PENDING, STATE_UNKNOWN};
use crate::crd::{ReadyRequirements, ResourceRequirement};
use crate::deploy_data::worse_state;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::batch::v1::Job;
use kube::api::{ApiResource, DynamicObject, GroupVersionKind};
use kube::{Api, Client};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

// ============================================================================
// Workloads
// ============================================================================

/// Kinds of workloads with a rollout check.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkloadKind {
    Deployment,
    StatefulSet,
    DaemonSet,
}

impl WorkloadKind {
    fn from_kind(kind: &str) -> Option<Self> {
        match kind {
            "Deployment" => Some(Self::Deployment),
            "StatefulSet" => Some(Self::StatefulSet),
            "DaemonSet" => Some(Self::DaemonSet),
            _ => None,
        }
    }
}

/// A workload on the target cluster.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkloadRef {
    pub kind: WorkloadKind,
    pub namespace: String,
    pub name: String,
}

/// Extracts the workloads from a rendered multi-document manifest.
///
/// Objects without a namespace live in `default_namespace`.
#[must_use]
pub fn workloads_from_manifest(manifest: &str, default_namespace: &str) -> Vec<WorkloadRef> {
    let mut workloads = Vec::new();
    for document in serde_yaml::Deserializer::from_str(manifest) {
        let Ok(object) = <Value as serde::Deserialize>::deserialize(document) else {
            continue;
        };
        let Some(kind) = object
            .get("kind")
            .and_then(Value::as_str)
            .and_then(WorkloadKind::from_kind)
        else {
            continue;
        };
        let metadata = object.get("metadata");
        let Some(name) = metadata.and_then(|m| m.get("name")).and_then(Value::as_str) else {
            continue;
        };
        let namespace = metadata
            .and_then(|m| m.get("namespace"))
            .and_then(Value::as_str)
            .unwrap_or(default_namespace);
        workloads.push(WorkloadRef {
            kind,
            namespace: namespace.to_string(),
            name: name.to_string(),
        });
    }
    workloads
}

/// `true` if both counters are equal and not zero.
#[must_use]
pub fn compare_numbers(num1: i32, num2: i32) -> bool {
    num1 != 0 && num1 == num2
}

#[must_use]
pub fn deployment_ready(deployment: &Deployment) -> bool {
    let generation = deployment.metadata.generation.unwrap_or(0);
    let spec_replicas = deployment
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(1);
    let Some(status) = deployment.status.as_ref() else {
        return false;
    };
    generation == status.observed_generation.unwrap_or(0)
        && spec_replicas == status.updated_replicas.unwrap_or(0)
        && spec_replicas == status.replicas.unwrap_or(0)
        && spec_replicas == status.available_replicas.unwrap_or(0)
}

#[must_use]
pub fn statefulset_ready(statefulset: &StatefulSet) -> bool {
    statefulset.status.as_ref().is_some_and(|s| {
        compare_numbers(s.ready_replicas.unwrap_or(0), s.replicas)
    })
}

#[must_use]
pub fn daemonset_ready(daemonset: &DaemonSet) -> bool {
    daemonset.status.as_ref().is_some_and(|s| {
        compare_numbers(s.number_ready, s.current_number_scheduled)
    })
}

/// Readiness of a Job: complete, finally failed or still pending.
#[must_use]
pub fn job_state(job: &Job) -> &'static str {
    let conditions = job
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_deref())
        .unwrap_or_default();
    for condition in conditions {
        if condition.status != "True" {
            continue;
        }
        match condition.type_.as_str() {
            "Complete" => return STATE_OK,
            "Failed" => return STATE_FINALLY_FAILED,
            _ => {}
        }
    }
    STATE_PENDING
}

// ============================================================================
// JSONPath subset
// ============================================================================

#[derive(Debug, Error, PartialEq, Eq)]
pub enum JsonPathError {
    #[error("field path {0:?} is not of the form {{.a.b}}")]
    Syntax(String),

    #[error("field {0:?} not found")]
    NotFound(String),

    #[error("field path {0:?} does not select exactly one value")]
    NotUnique(String),
}

#[derive(Debug, PartialEq)]
enum Step {
    Field(String),
    Index(usize),
    Filter { key: String, value: String },
}

fn parse_path(path: &str) -> Result<Vec<Step>, JsonPathError> {
    let syntax = || JsonPathError::Syntax(path.to_string());
    let inner = path
        .trim()
        .strip_prefix('{')
        .and_then(|p| p.strip_suffix('}'))
        .ok_or_else(syntax)?
        .trim();

    let mut steps = Vec::new();
    let mut rest = inner;
    while !rest.is_empty() {
        if let Some(after_dot) = rest.strip_prefix('.') {
            let end = after_dot.find(['.', '[']).unwrap_or(after_dot.len());
            let field = &after_dot[..end];
            if !field.is_empty() {
                steps.push(Step::Field(field.to_string()));
            }
            rest = &after_dot[end..];
        } else if let Some(after_bracket) = rest.strip_prefix('[') {
            let end = after_bracket.find(']').ok_or_else(syntax)?;
            let selector = &after_bracket[..end];
            rest = &after_bracket[end + 1..];
            if let Some(filter) = selector.strip_prefix("?(@.").and_then(|f| f.strip_suffix(')')) {
                let (key, value) = filter.split_once("==").ok_or_else(syntax)?;
                let value = value.trim().trim_matches(|c| c == '"' || c == '\'');
                steps.push(Step::Filter {
                    key: key.trim().to_string(),
                    value: value.to_string(),
                });
            } else {
                let index = selector.trim().parse().map_err(|_| syntax())?;
                steps.push(Step::Index(index));
            }
        } else {
            return Err(syntax());
        }
    }
    Ok(steps)
}

fn value_matches(value: &Value, expected: &str) -> bool {
    match value {
        Value::String(s) => s == expected,
        other => other.to_string() == expected,
    }
}

/// Evaluates `{.a.b}`, `[n]` and `[?(@.k=="v")]` against `object`.
///
/// A filter yields every matching element, so the result may hold several values
/// or none.
///
/// # Errors
///
/// Returns [`JsonPathError`] for unsupported syntax or a missing field.
pub fn evaluate_json_path(object: &Value, path: &str) -> Result<Vec<Value>, JsonPathError> {
    let mut current = vec![object.clone()];
    for step in parse_path(path)? {
        let mut next = Vec::new();
        for value in &current {
            match &step {
                Step::Field(field) => {
                    let found = value
                        .get(field)
                        .ok_or_else(|| JsonPathError::NotFound(field.clone()))?;
                    next.push(found.clone());
                }
                Step::Index(index) => {
                    let found = value
                        .get(index)
                        .ok_or_else(|| JsonPathError::NotFound(format!("[{index}]")))?;
                    next.push(found.clone());
                }
                Step::Filter { key, value: expected } => {
                    let items = value.as_array().map(Vec::as_slice).unwrap_or_default();
                    next.extend(
                        items
                            .iter()
                            .filter(|item| item.get(key).is_some_and(|v| value_matches(v, expected)))
                            .cloned(),
                    );
                }
            }
        }
        current = next;
    }
    Ok(current)
}

/// Reads exactly one value at `field_path`; braces and the leading dot are optional.
///
/// # Errors
///
/// Returns [`JsonPathError`] if the path is invalid or selects no or several values.
pub fn single_field(object: &Value, field_path: &str) -> Result<Value, JsonPathError> {
    let trimmed = field_path.trim();
    let path = if trimmed.starts_with('{') {
        trimmed.to_string()
    } else if trimmed.starts_with('.') {
        format!("{{{trimmed}}}")
    } else {
        format!("{{.{trimmed}}}")
    };
    let mut values = evaluate_json_path(object, &path)?;
    if values.len() == 1 {
        Ok(values.remove(0))
    } else {
        Err(JsonPathError::NotUnique(field_path.to_string()))
    }
}

/// Readiness of a resource requirement against the fetched object.
///
/// `ok` if every selected value is one of the success values, `unknown` otherwise.
/// An empty selection is `unknown` as the field is not there yet.
#[must_use]
pub fn resource_state(object: &Value, requirement: &ResourceRequirement) -> &'static str {
    let values = match evaluate_json_path(object, &requirement.field_path) {
        Ok(values) => values,
        Err(e) => {
            debug!(resource = %requirement.name, error = %e, "Field path not evaluable");
            return STATE_UNKNOWN;
        }
    };
    let accepted = |value: &Value| requirement.success_values.iter().any(|s| &s.value == value);
    if !values.is_empty() && values.iter().all(accepted) {
        STATE_OK
    } else {
        STATE_UNKNOWN
    }
}

/// API resource for a plural resource name, e.g. `batch/v1` and `jobs`.
#[must_use]
pub fn api_resource(api_version: &str, plural: &str) -> ApiResource {
    let (group, version) = api_version.split_once('/').unwrap_or(("", api_version));
    let gvk = GroupVersionKind::gvk(group, version, "");
    ApiResource::from_gvk_with_plural(&gvk, plural)
}

// ============================================================================
// Checker
// ============================================================================

/// Result of a readiness check.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReadinessReport {
    pub state: String,
    /// `namespace/name` of Jobs which failed for good.
    pub failed_jobs: Vec<String>,
}

/// Checks readiness on one target cluster.
pub struct ReadinessChecker {
    client: Client,
}

impl ReadinessChecker {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Readiness of workloads and requirements, starting from `initial`.
    pub async fn check(
        &self,
        initial: &str,
        workloads: &[WorkloadRef],
        requirements: &ReadyRequirements,
    ) -> ReadinessReport {
        let mut state = initial;
        let mut failed_jobs = Vec::new();

        for workload in workloads {
            state = worse_state(state, self.workload_state(workload).await);
        }

        for requirement in &requirements.resources {
            state = worse_state(state, self.requirement_state(requirement).await);
        }

        for job in &requirements.jobs {
            let api: Api<Job> = Api::namespaced(self.client.clone(), &job.namespace);
            let job_state = match api.get(&job.name).await {
                Ok(found) => job_state(&found),
                Err(e) => {
                    warn!(job = %job.name, namespace = %job.namespace, error = %e, "Error reading job from target cluster");
                    STATE_UNKNOWN
                }
            };
            if job_state == STATE_FINALLY_FAILED {
                failed_jobs.push(format!("{}/{}", job.namespace, job.name));
            }
            state = worse_state(state, job_state);
        }

        ReadinessReport {
            state: state.to_string(),
            failed_jobs,
        }
    }

    async fn workload_state(&self, workload: &WorkloadRef) -> &'static str {
        let client = self.client.clone();
        let ns = workload.namespace.as_str();
        let ready = match workload.kind {
            WorkloadKind::Deployment => Api::<Deployment>::namespaced(client, ns)
                .get(&workload.name)
                .await
                .map(|d| deployment_ready(&d)),
            WorkloadKind::StatefulSet => Api::<StatefulSet>::namespaced(client, ns)
                .get(&workload.name)
                .await
                .map(|s| statefulset_ready(&s)),
            WorkloadKind::DaemonSet => Api::<DaemonSet>::namespaced(client, ns)
                .get(&workload.name)
                .await
                .map(|d| daemonset_ready(&d)),
        };
        match ready {
            Ok(true) => STATE_OK,
            Ok(false) => {
                debug!(kind = ?workload.kind, name = %workload.name, namespace = ns, "Resource not ready");
                STATE_PENDING
            }
            Err(e) => {
                warn!(kind = ?workload.kind, name = %workload.name, namespace = ns, error = %e, "Error reading resource from target cluster");
                STATE_UNKNOWN
            }
        }
    }

    async fn requirement_state(&self, requirement: &ResourceRequirement) -> &'static str {
        let resource = api_resource(&requirement.api_version, &requirement.resource);
        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), &requirement.namespace, &resource);
        match api.get(&requirement.name).await {
            Ok(object) => match serde_json::to_value(&object) {
                Ok(value) => resource_state(&value, requirement),
                Err(_) => STATE_UNKNOWN,
            },
            Err(e) => {
                warn!(resource = %requirement.resource, name = %requirement.name, error = %e, "Error reading resource from target cluster");
                STATE_UNKNOWN
            }
        }
    }
}

#[cfg(test)]
#[path = "readiness_tests.rs"]
mod readiness_tests;
