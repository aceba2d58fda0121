// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Status condition helpers and the `ClusterBom` status writer.
//!
//! Conditions follow the usual Kubernetes shape:
//! - `type`: `Ready` or `ClusterReachable`
//! - `status`: "True", "False", or "Unknown"
//! - `reason`: a programmatic identifier (CamelCase)
//! - `message`: a human-readable explanation
//! - `lastUpdateTime`: refreshed on every computation
//! - `lastTransitionTime`: only moves when status, reason or message change
//!
//! # Example
//!
//! ```rust,no_run
//! use chrono::Utc;
//! use potter_controller::reconcilers::status::create_condition;
//!
//! let condition =
//!     create_condition("Ready", "True", "AllAppsReady", "All applications are ready", Utc::now());
//! assert_eq!(condition.status, "True");
//! ```

use crate::crd::{ApplicationState, ClusterBom, ClusterBomStatus, Condition, DetailedState};
use crate::errors::is_not_found;
use crate::keys::NamespacedName;
use crate::reconcilers::retry::repeat_on_conflict;
use anyhow::Result;
use chrono::{DateTime, Utc};
use kube::api::{Patch, PatchParams};
use kube::{Api, Client};
use serde_json::{json, Map, Value};
use tracing::debug;

/// Create a new condition stamped with `now`.
#[must_use]
pub fn create_condition(
    condition_type: &str,
    status: &str,
    reason: &str,
    message: &str,
    now: DateTime<Utc>,
) -> Condition {
    let now = now.to_rfc3339();
    Condition {
        r#type: condition_type.to_string(),
        status: status.to_string(),
        reason: Some(reason.to_string()),
        message: Some(message.to_string()),
        last_update_time: Some(now.clone()),
        last_transition_time: Some(now),
    }
}

/// Check if a condition has changed compared to the existing one.
///
/// Type, status, reason and message are compared; timestamps are ignored.
#[must_use]
pub fn condition_changed(existing: Option<&Condition>, new_condition: &Condition) -> bool {
    existing.is_none_or(|current| {
        current.r#type != new_condition.r#type
            || current.status != new_condition.status
            || current.reason != new_condition.reason
            || current.message != new_condition.message
    })
}

/// Find a condition by type in a list of conditions.
#[must_use]
pub fn find_condition<'a>(
    conditions: &'a [Condition],
    condition_type: &str,
) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.r#type == condition_type)
}

/// Status of a condition, `Unknown` when it is missing.
#[must_use]
pub fn condition_status<'a>(conditions: &'a [Condition], condition_type: &str) -> &'a str {
    find_condition(conditions, condition_type).map_or(
        crate::status_reasons::CONDITION_UNKNOWN,
        |c| c.status.as_str(),
    )
}

/// Copies `lastTransitionTime` from `old` into every condition of `new` that did not change.
pub fn carry_forward_transition_times(old: &[Condition], new: &mut [Condition]) {
    for condition in new.iter_mut() {
        if let Some(previous) = find_condition(old, &condition.r#type) {
            if !condition_changed(Some(previous), condition) && previous.last_transition_time.is_some() {
                condition
                    .last_transition_time
                    .clone_from(&previous.last_transition_time);
            }
        }
    }
}

/// Compare two condition lists to check if they are semantically equal.
///
/// Order and timestamps are ignored.
#[must_use]
pub fn conditions_equal(current: &[Condition], new: &[Condition]) -> bool {
    if current.len() != new.len() {
        return false;
    }

    new.iter().all(|new_cond| {
        find_condition(current, &new_cond.r#type)
            .is_some_and(|curr_cond| !condition_changed(Some(curr_cond), new_cond))
    })
}

fn detailed_state_equal(a: &DetailedState, b: &DetailedState) -> bool {
    a.last_operation == b.last_operation
        && a.reachability == b.reachability
        && a.readiness == b.readiness
        && a.type_specific_status == b.type_specific_status
        && conditions_equal(&a.deploy_item_conditions, &b.deploy_item_conditions)
        && a.generation == b.generation
        && a.observed_generation == b.observed_generation
        && a.deletion_timestamp == b.deletion_timestamp
}

fn application_states_equal(current: &[ApplicationState], new: &[ApplicationState]) -> bool {
    if current.len() != new.len() {
        return false;
    }

    new.iter().all(|new_state| {
        current.iter().find(|s| s.id == new_state.id).is_some_and(|s| {
            s.state == new_state.state
                && detailed_state_equal(&s.detailed_state, &new_state.detailed_state)
        })
    })
}

/// Semantic equality of two `ClusterBom` statuses.
///
/// Timestamps that move on every computation (`overallTime`, `currentOperationTime`,
/// condition update times) are ignored; list order does not matter.
#[must_use]
pub fn clusterbom_status_equal(current: &ClusterBomStatus, new: &ClusterBomStatus) -> bool {
    current.observed_generation == new.observed_generation
        && current.overall_state == new.overall_state
        && current.overall_num_of_deployments == new.overall_num_of_deployments
        && current.overall_num_of_ready_deployments == new.overall_num_of_ready_deployments
        && current.overall_progress == new.overall_progress
        && current.description == new.description
        && conditions_equal(&current.conditions, &new.conditions)
        && application_states_equal(&current.application_states, &new.application_states)
}

/// `new` with every field that `old` has and `new` lacks set to null.
///
/// A JSON merge patch built from the result removes those fields. Arrays are
/// replaced as a whole.
#[must_use]
pub fn null_removed_fields(old: &Value, new: &Value) -> Value {
    match (old, new) {
        (Value::Object(old), Value::Object(new)) => {
            let mut merged = Map::new();
            for (key, value) in new {
                let value = match old.get(key) {
                    Some(previous) => null_removed_fields(previous, value),
                    None => value.clone(),
                };
                merged.insert(key.clone(), value);
            }
            for key in old.keys().filter(|k| !new.contains_key(*k)) {
                merged.insert(key.clone(), Value::Null);
            }
            Value::Object(merged)
        }
        _ => new.clone(),
    }
}

/// Merge patch replacing a status, guarded by the resource version it was read at.
#[must_use]
pub fn status_patch(old: Option<&Value>, new: &Value, resource_version: Option<&str>) -> Value {
    let status = old.map_or_else(|| new.clone(), |old| null_removed_fields(old, new));
    match resource_version {
        Some(version) => json!({ "metadata": { "resourceVersion": version }, "status": status }),
        None => json!({ "status": status }),
    }
}

/// Collects a new `ClusterBom` status and writes it only when it differs from the stored one.
///
/// # Example
///
/// ```rust,ignore
/// let mut updater = ClusterBomStatusUpdater::new(&clusterbom);
/// updater.set_status(computed_status);
/// updater.apply(&client).await?;
/// ```
pub struct ClusterBomStatusUpdater {
    key: NamespacedName,
    current_status: Option<ClusterBomStatus>,
    new_status: ClusterBomStatus,
}

impl ClusterBomStatusUpdater {
    #[must_use]
    pub fn new(clusterbom: &ClusterBom) -> Self {
        let current_status = clusterbom.status.clone();
        Self {
            key: NamespacedName::of(clusterbom),
            new_status: current_status.clone().unwrap_or_default(),
            current_status,
        }
    }

    /// Replaces the collected status, keeping transition times of unchanged conditions.
    pub fn set_status(&mut self, mut status: ClusterBomStatus) {
        if let Some(current) = &self.current_status {
            carry_forward_transition_times(&current.conditions, &mut status.conditions);
        }
        self.new_status = status;
    }

    /// The collected status.
    #[must_use]
    pub fn status(&self) -> &ClusterBomStatus {
        &self.new_status
    }

    /// Whether the collected status differs semantically from the stored one.
    #[must_use]
    pub fn has_changes(&self) -> bool {
        self.current_status
            .as_ref()
            .is_none_or(|current| !clusterbom_status_equal(current, &self.new_status))
    }

    /// Writes the collected status through the status subresource.
    ///
    /// Conflicts are retried on a freshly read object; a `ClusterBom` deleted in
    /// the meantime is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the Kubernetes API call fails.
    pub async fn apply(&self, client: &Client) -> Result<()> {
        if !self.has_changes() {
            debug!(clusterbom = %self.key, "Status of clusterbom has not changed; no update necessary");
            return Ok(());
        }

        let api: Api<ClusterBom> = Api::namespaced(client.clone(), &self.key.namespace);
        let new_status = serde_json::to_value(&self.new_status)?;
        repeat_on_conflict(|| {
            let api = api.clone();
            let name = self.key.name.clone();
            let new_status = new_status.clone();
            async move {
                let stored = match api.get(&name).await {
                    Ok(stored) => stored,
                    Err(e) if is_not_found(&e) => return Ok(()),
                    Err(e) => return Err(e.into()),
                };
                let old_status = stored.status.as_ref().map(serde_json::to_value).transpose()?;
                let patch = status_patch(
                    old_status.as_ref(),
                    &new_status,
                    stored.metadata.resource_version.as_deref(),
                );
                api.patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
                    .await?;
                Ok(())
            }
        })
        .await?;

        debug!(
            clusterbom = %self.key,
            overall_state = %self.new_status.overall_state,
            "Updated clusterbom status"
        );
        Ok(())
    }
}

#[cfg(test)]
#[path = "status_tests.rs"]
mod status_tests;
