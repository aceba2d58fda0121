// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Typed view of a deploy item.
//!
//! A [`DeployItem`] carries its contract as an opaque `configuration` payload and
//! its progress as an opaque `providerStatus`. [`DeployData`] decodes both, offers
//! the decisions the deployment loop is built from, and encodes the result back
//! into a [`DeployItemStatus`].
//!
//! # Operation state machine
//!
//! ```text
//!   deletion requested ─────────────► remove   (until lastOperation = remove/ok)
//!   generation != observedGeneration ► install  (new operation, tries = 1)
//!   finallyFailed ──────────────────► stop
//!   lastOperation failed ───────────► retry    (after the premature-retry delay)
//!   reconcile annotation ───────────► re-run   (tries = 1)
//!   installed but not ready ────────► pending  (readiness poll every 15s)
//! ```

use crate::constants::{
    DEPLOY_ITEM_CONFIG_KIND, ERROR_HISTORY_SIZE, HUB_API_GROUP_VERSION, OPERATION_INSTALL,
    OPERATION_REMOVE, PHASE_DELETING, PHASE_FAILED, PHASE_PROGRESSING, PHASE_SUCCEEDED,
    PROVIDER_STATUS_KIND, READINESS_REQUEUE_SECS, REQUEUE_BASE_SECS, REQUEUE_MAX_EXPONENT,
    REQUEUE_MAX_SECS, STATE_FAILED, STATE_FINALLY_FAILED, STATE_OK,
    STATE_PENDING, STATE_UNKNOWN, UNREACHABLE_BACKOFF_SECS,
};
use crate::crd::{
    Condition, DeployItem, DeployItemStatus, InternalImportParameters, LastOperation,
    ObjectReference, Reachability, Readiness, ReadyRequirements,
};
use crate::errors::DeployError;
use crate::keys::{clusterbom_key_of_item, NamespacedName};
use crate::labels;
use crate::timestamps::{from_time, to_time};
use crate::status_reasons::{
    CONDITION_FALSE, CONDITION_TRUE, CONDITION_TYPE_READY, CONDITION_UNKNOWN,
    REASON_CLUSTER_UNREACHABLE, REASON_FINALLY_FAILED, REASON_INITIAL_STATE, REASON_NOT_RUNNING,
    REASON_REMOVED, REASON_REMOVE_PENDING, REASON_RUNNING, REASON_UPGRADE_PENDING,
};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::ResourceExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;

// ============================================================================
// Item contract
// ============================================================================

/// Contract embedded in `spec.configuration` of a deploy item.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeployItemConfiguration {
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub api_version: String,
    /// Name of the kubeconfig secret of the target cluster (item namespace).
    #[serde(default)]
    pub local_secret_ref: String,
    #[serde(default)]
    pub deployment_config: DeploymentConfig,
}

impl DeployItemConfiguration {
    #[must_use]
    pub fn new(local_secret_ref: &str, deployment_config: DeploymentConfig) -> Self {
        Self {
            kind: DEPLOY_ITEM_CONFIG_KIND.to_string(),
            api_version: HUB_API_GROUP_VERSION.to_string(),
            local_secret_ref: local_secret_ref.to_string(),
            deployment_config,
        }
    }
}

/// Materialised application config.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentConfig {
    /// Application config ID.
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub config_type: String,
    #[serde(default)]
    pub type_specific_data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<Value>,
    /// Secret holding the legacy secret values block.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub internal_secret_name: String,
    /// Logical secret name to the secret holding that block.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub named_internal_secret_names: BTreeMap<String, String>,
    #[serde(default)]
    pub ready_requirements: ReadyRequirements,
    /// Set when the periodic driver requested a reconcile.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconcile_time: Option<Time>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub import_parameters: Vec<ImportReference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub internal_import_parameters: Option<InternalImportParameters>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub export_parameters: Option<Value>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub no_reconcile: bool,
}

/// A resolved import: local name and `<clusterbom>::<appID>::<exportParam>` reference.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ImportReference {
    pub name: String,
    pub data_ref: String,
}

// ============================================================================
// Provider status
// ============================================================================

/// Progress record stored in `status.providerStatus`.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProviderStatus {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub api_version: String,
    #[serde(default)]
    pub last_operation: LastOperation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reachability: Option<Reachability>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub readiness: Option<Readiness>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub type_specific_status: Option<Value>,
    /// The most recent failures, oldest first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub error_history: Vec<ErrorEntry>,
}

/// One recorded failure.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ErrorEntry {
    pub description: String,
    pub time: Time,
}

// ============================================================================
// State lattice and timing
// ============================================================================

fn state_rank(state: &str) -> u8 {
    match state {
        STATE_OK => 0,
        STATE_PENDING => 1,
        STATE_UNKNOWN => 2,
        STATE_FAILED => 3,
        STATE_FINALLY_FAILED => 4,
        _ => 0,
    }
}

/// The worse of two states under `ok < pending < unknown < failed < finallyFailed`.
#[must_use]
pub fn worse_state<'a>(a: &'a str, b: &'a str) -> &'a str {
    if state_rank(b) > state_rank(a) {
        b
    } else {
        a
    }
}

/// Minimum delay between two tries of a failed operation.
///
/// Doubles from 10s with every try and is pinned to one hour after eight tries.
#[must_use]
pub fn calculate_requeue_timeout(number_of_tries: i64) -> Duration {
    if number_of_tries < 0 {
        return Duration::from_secs(REQUEUE_BASE_SECS);
    }
    if number_of_tries > REQUEUE_MAX_EXPONENT {
        return Duration::from_secs(REQUEUE_MAX_SECS);
    }
    // number_of_tries is within 0..=8 here
    let exponent = u32::try_from(number_of_tries).unwrap_or(0);
    Duration::from_secs((REQUEUE_BASE_SECS << exponent).min(REQUEUE_MAX_SECS))
}

fn remaining(until: DateTime<Utc>, now: DateTime<Utc>) -> Option<Duration> {
    (now < until).then(|| (until - now).to_std().unwrap_or_default())
}

/// Delay until a failed operation may be retried, `None` if it is due.
#[must_use]
pub fn premature_retry_delay(status: &ProviderStatus, now: DateTime<Utc>) -> Option<Duration> {
    let last = status.last_operation.time.as_ref()?;
    let timeout = calculate_requeue_timeout(status.last_operation.number_of_tries);
    let next = from_time(last) + ChronoDuration::from_std(timeout).unwrap_or_default();
    remaining(next, now)
}

/// Back-off after the target cluster was found unreachable.
#[must_use]
pub fn unreachable_requeue_delay(status: &ProviderStatus, now: DateTime<Utc>) -> Option<Duration> {
    let reachability = status.reachability.as_ref()?;
    if reachability.reachable {
        return None;
    }
    let since = reachability.time.as_ref()?;
    remaining(from_time(since) + ChronoDuration::seconds(UNREACHABLE_BACKOFF_SECS), now)
}

/// Delay until the readiness of a not yet ready install is checked again.
#[must_use]
pub fn not_ready_requeue_delay(status: &ProviderStatus, now: DateTime<Utc>) -> Option<Duration> {
    let readiness = status.readiness.as_ref()?;
    if readiness.state == STATE_OK {
        return None;
    }
    let since = readiness.time.as_ref()?;
    remaining(from_time(since) + ChronoDuration::seconds(READINESS_REQUEUE_SECS), now)
}

// ============================================================================
// DeployData
// ============================================================================

/// Decoded deploy item.
#[derive(Clone, Debug)]
pub struct DeployData {
    item: DeployItem,
    pub configuration: DeployItemConfiguration,
    pub provider_status: ProviderStatus,
    /// Values read from the target cluster after a ready install.
    pub export_values: Option<Value>,
    /// Import parameter tree with all imports substituted, set by preprocessing.
    pub import_values: Option<Value>,
}

impl DeployData {
    /// Decodes the contract and provider status of an item.
    ///
    /// # Errors
    ///
    /// Returns [`DeployError::Config`] if either payload does not parse.
    pub fn new(item: DeployItem) -> Result<Self, DeployError> {
        let configuration: DeployItemConfiguration =
            serde_json::from_value(item.spec.configuration.clone())
                .map_err(|e| DeployError::Config(format!("configuration: {e}")))?;

        let provider_status = match item.status.as_ref().and_then(|s| s.provider_status.clone()) {
            Some(raw) if !raw.is_null() => serde_json::from_value(raw)
                .map_err(|e| DeployError::Config(format!("provider status: {e}")))?,
            _ => ProviderStatus::default(),
        };

        Ok(Self {
            item,
            configuration,
            provider_status,
            export_values: None,
            import_values: None,
        })
    }

    #[must_use]
    pub fn item(&self) -> &DeployItem {
        &self.item
    }

    #[must_use]
    pub fn key(&self) -> NamespacedName {
        NamespacedName::of(&self.item)
    }

    #[must_use]
    pub fn clusterbom_key(&self) -> NamespacedName {
        clusterbom_key_of_item(&self.item)
    }

    /// Key of the kubeconfig secret of the target cluster.
    #[must_use]
    pub fn target_secret_key(&self) -> NamespacedName {
        NamespacedName::new(
            self.item.namespace().unwrap_or_default(),
            &self.configuration.local_secret_ref,
        )
    }

    #[must_use]
    pub fn config_id(&self) -> &str {
        &self.configuration.deployment_config.id
    }

    /// Config type from the contract, falling back to the item label.
    #[must_use]
    pub fn config_type(&self) -> String {
        let from_contract = &self.configuration.deployment_config.config_type;
        if from_contract.is_empty() {
            self.item
                .labels()
                .get(labels::CONFIG_TYPE)
                .cloned()
                .unwrap_or_default()
        } else {
            from_contract.clone()
        }
    }

    #[must_use]
    pub fn generation(&self) -> i64 {
        self.item.metadata.generation.unwrap_or(0)
    }

    #[must_use]
    pub fn observed_generation(&self) -> i64 {
        self.item.status.as_ref().map_or(0, |s| s.observed_generation)
    }

    #[must_use]
    pub fn is_delete_operation(&self) -> bool {
        self.item.metadata.deletion_timestamp.is_some()
    }

    /// A deletion not yet answered by a remove, or a generation not yet observed.
    #[must_use]
    pub fn is_new_operation(&self) -> bool {
        if self.is_delete_operation() {
            return self.provider_status.last_operation.operation != OPERATION_REMOVE;
        }
        self.observed_generation() != self.generation()
    }

    /// Readiness finally failed, or the failed operation ran out of tries.
    #[must_use]
    pub fn is_finally_failed(&self, max_number_of_tries: i64) -> bool {
        let readiness_failed = self
            .provider_status
            .readiness
            .as_ref()
            .is_some_and(|r| r.state == STATE_FINALLY_FAILED);
        let tries_exhausted = self.is_last_deploy_failed()
            && self.provider_status.last_operation.number_of_tries >= max_number_of_tries;
        readiness_failed || tries_exhausted
    }

    #[must_use]
    pub fn is_last_deploy_failed(&self) -> bool {
        self.provider_status.last_operation.state == STATE_FAILED
    }

    /// The last operation was an install whose readiness or Ready condition is not ok.
    #[must_use]
    pub fn is_install_but_not_ready(&self) -> bool {
        let is_install = self.provider_status.last_operation.operation == OPERATION_INSTALL;
        let readiness_not_ok = self
            .provider_status
            .readiness
            .as_ref()
            .is_none_or(|r| r.state != STATE_OK);
        is_install && (readiness_not_ok || !self.is_ready())
    }

    /// The item carries the reconcile annotation and takes part in reconciles.
    #[must_use]
    pub fn is_reconcile(&self) -> bool {
        !self.configuration.deployment_config.no_reconcile
            && !self.is_delete_operation()
            && labels::has_entry(
                self.item.metadata.annotations.as_ref(),
                labels::ANNOTATION_RECONCILE,
                labels::ANNOTATION_RECONCILE_VALUE,
            )
    }

    #[must_use]
    pub fn export_reference(&self) -> Option<&ObjectReference> {
        self.item.status.as_ref()?.export_reference.as_ref()
    }

    pub fn set_export_secret_name(&mut self, name: &str) {
        let namespace = self.item.namespace().unwrap_or_default();
        self.status_mut().export_reference = Some(ObjectReference {
            name: name.to_string(),
            namespace,
        });
    }

    pub fn set_phase(&mut self, phase: &str) {
        self.status_mut().phase = Some(phase.to_string());
    }

    fn status_mut(&mut self) -> &mut DeployItemStatus {
        self.item.status.get_or_insert_with(DeployItemStatus::default)
    }

    /// Initialises a never processed item so its status has a last operation.
    fn init_last_operation(&mut self, now: DateTime<Utc>) {
        if !self.provider_status.last_operation.state.is_empty() {
            return;
        }
        self.provider_status.last_operation = LastOperation {
            operation: OPERATION_INSTALL.to_string(),
            time: Some(to_time(now)),
            number_of_tries: 0,
            state: STATE_OK.to_string(),
            description: "no last operation".to_string(),
            success_generation: 0,
        };
    }

    pub fn set_status_for_unreachable_cluster(&mut self, now: DateTime<Utc>) {
        self.init_last_operation(now);
        self.provider_status.reachability = Some(Reachability {
            reachable: false,
            time: Some(to_time(now)),
        });
    }

    pub fn set_status_for_reachable_cluster(&mut self, now: DateTime<Utc>) {
        self.init_last_operation(now);
        self.provider_status.reachability = Some(Reachability {
            reachable: true,
            time: Some(to_time(now)),
        });
    }

    /// Records the outcome of an operation.
    ///
    /// The provider status is rebuilt from scratch: readiness and type specific
    /// status of the previous operation are dropped, the target counts as reachable.
    pub fn set_status(
        &mut self,
        state: &str,
        description: &str,
        number_of_tries: i64,
        now: DateTime<Utc>,
    ) {
        let generation = self.generation();
        let success_generation = if state == STATE_OK {
            generation
        } else {
            self.provider_status.last_operation.success_generation
        };
        let operation = if self.is_delete_operation() {
            OPERATION_REMOVE
        } else {
            OPERATION_INSTALL
        };
        let error_history = self.compute_error_history(state, description, number_of_tries, now);

        self.status_mut().observed_generation = generation;
        self.provider_status = ProviderStatus {
            kind: PROVIDER_STATUS_KIND.to_string(),
            api_version: HUB_API_GROUP_VERSION.to_string(),
            last_operation: LastOperation {
                operation: operation.to_string(),
                time: Some(to_time(now)),
                number_of_tries,
                state: state.to_string(),
                description: description.to_string(),
                success_generation,
            },
            reachability: Some(Reachability {
                reachable: true,
                time: Some(to_time(now)),
            }),
            readiness: None,
            type_specific_status: None,
            error_history,
        };
    }

    fn compute_error_history(
        &self,
        state: &str,
        description: &str,
        number_of_tries: i64,
        now: DateTime<Utc>,
    ) -> Vec<ErrorEntry> {
        if state != STATE_FAILED {
            return Vec::new();
        }

        let entry = ErrorEntry {
            description: description.to_string(),
            time: to_time(now),
        };
        let mut entries = self.provider_status.error_history.clone();
        if number_of_tries < 2 || entries.is_empty() {
            return vec![entry];
        }

        if entries.len() < ERROR_HISTORY_SIZE {
            entries.push(entry);
        } else {
            // Entry 0 is the first failure of the series and is never replaced.
            entries.sort_by(|a, b| a.time.0.cmp(&b.time.0));
            if let Some(same) = entries
                .iter_mut()
                .skip(1)
                .find(|e| e.description == description)
            {
                same.time = to_time(now);
            } else {
                entries[1] = entry;
            }
        }
        entries.sort_by(|a, b| a.time.0.cmp(&b.time.0));
        entries
    }

    pub fn set_readiness(&mut self, state: &str, now: DateTime<Utc>) {
        self.provider_status.readiness = Some(Readiness {
            state: state.to_string(),
            time: Some(to_time(now)),
        });
    }

    #[must_use]
    pub fn conditions(&self) -> &[Condition] {
        self.item
            .status
            .as_ref()
            .map_or(&[][..], |s| s.conditions.as_slice())
    }

    #[must_use]
    pub fn ready_condition(&self) -> Option<&Condition> {
        self.conditions()
            .iter()
            .find(|c| c.r#type == CONDITION_TYPE_READY)
    }

    /// Whether the Ready condition is `True`.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready_condition()
            .is_some_and(|c| c.status == CONDITION_TRUE)
    }

    /// Sets a condition. The transition time only moves when status, reason or
    /// message change; the update time always does.
    pub fn replace_condition(
        &mut self,
        condition_type: &str,
        status: &str,
        reason: &str,
        message: &str,
        now: DateTime<Utc>,
    ) {
        let now = now.to_rfc3339();
        let conditions = &mut self.status_mut().conditions;
        if let Some(existing) = conditions.iter_mut().find(|c| c.r#type == condition_type) {
            let unchanged = existing.status == status
                && existing.reason.as_deref() == Some(reason)
                && existing.message.as_deref() == Some(message);
            if !unchanged {
                existing.status = status.to_string();
                existing.reason = Some(reason.to_string());
                existing.message = Some(message.to_string());
                existing.last_transition_time = Some(now.clone());
            }
            existing.last_update_time = Some(now);
        } else {
            conditions.push(Condition {
                r#type: condition_type.to_string(),
                status: status.to_string(),
                reason: Some(reason.to_string()),
                message: Some(message.to_string()),
                last_update_time: Some(now.clone()),
                last_transition_time: Some(now),
            });
        }
    }

    /// Derives the Ready condition and phase from the provider status.
    pub fn compute_ready_condition(&mut self, now: DateTime<Utc>) {
        let unreachable = self
            .provider_status
            .reachability
            .as_ref()
            .is_some_and(|r| !r.reachable);
        if unreachable {
            self.replace_condition(
                CONDITION_TYPE_READY,
                CONDITION_UNKNOWN,
                REASON_CLUSTER_UNREACHABLE,
                "Cluster is unreachable",
                now,
            );
            return;
        }

        let readiness = self
            .provider_status
            .readiness
            .as_ref()
            .map_or_else(|| STATE_UNKNOWN.to_string(), |r| r.state.clone());
        let last_operation = self.provider_status.last_operation.clone();

        let (status, reason, message, phase) = if self.observed_generation() == 0 {
            (
                CONDITION_UNKNOWN,
                REASON_INITIAL_STATE,
                "No deployment executed until now".to_string(),
                PHASE_PROGRESSING,
            )
        } else if !self.is_delete_operation() {
            if self.generation() != last_operation.success_generation {
                (
                    CONDITION_UNKNOWN,
                    REASON_UPGRADE_PENDING,
                    "Upgrade pending".to_string(),
                    PHASE_PROGRESSING,
                )
            } else if readiness == STATE_OK {
                (CONDITION_TRUE, REASON_RUNNING, "Running".to_string(), PHASE_SUCCEEDED)
            } else if readiness == STATE_FINALLY_FAILED {
                (
                    CONDITION_FALSE,
                    REASON_FINALLY_FAILED,
                    "Finally Failed".to_string(),
                    PHASE_FAILED,
                )
            } else {
                (
                    CONDITION_UNKNOWN,
                    REASON_NOT_RUNNING,
                    format!("Readiness is {readiness}"),
                    PHASE_PROGRESSING,
                )
            }
        } else if last_operation.operation == OPERATION_INSTALL {
            (
                CONDITION_UNKNOWN,
                REASON_REMOVE_PENDING,
                "Remove pending".to_string(),
                PHASE_PROGRESSING,
            )
        } else if last_operation.state == STATE_OK {
            (CONDITION_TRUE, REASON_REMOVED, "Removed".to_string(), PHASE_SUCCEEDED)
        } else {
            (
                CONDITION_UNKNOWN,
                REASON_REMOVE_PENDING,
                "Last try to remove has failed".to_string(),
                PHASE_DELETING,
            )
        };

        self.replace_condition(CONDITION_TYPE_READY, status, reason, &message, now);
        self.set_phase(phase);
    }

    /// Encodes the provider status into the item status.
    ///
    /// # Errors
    ///
    /// Returns an error if the provider status cannot be serialised.
    pub fn status(&self) -> Result<DeployItemStatus, serde_json::Error> {
        let mut status = self.item.status.clone().unwrap_or_default();
        status.provider_status = Some(serde_json::to_value(&self.provider_status)?);
        Ok(status)
    }
}

#[cfg(test)]
#[path = "deploy_data_tests.rs"]
mod deploy_data_tests;
