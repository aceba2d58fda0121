// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Custom Resource Definitions (CRDs) used by the potter controller.
//!
//! # Resource Types
//!
//! - [`ClusterBom`] - User-authored list of applications for one target cluster
//! - [`DeployItem`] - One projected application, driven by the deployment loop
//! - [`ClusterBomSync`] - Per-ClusterBom lease serialising all loops
//!
//! Installations of the landscaper-managed variant are handled as dynamic objects
//! (see [`crate::reconcilers::installation`]).
//!
//! # Example: A ClusterBom with one Helm application
//!
//! ```rust,no_run
//! use potter_controller::crd::{ApplicationConfig, ClusterBomSpec};
//! use serde_json::json;
//!
//! let spec = ClusterBomSpec {
//!     secret_ref: "tgt.kubeconfig".to_string(),
//!     application_configs: vec![ApplicationConfig {
//!         id: "echo".to_string(),
//!         config_type: "helm".to_string(),
//!         type_specific_data: Some(json!({
//!             "installName": "echo",
//!             "namespace": "ns2",
//!             "catalogAccess": {
//!                 "repo": "stable",
//!                 "chartName": "echo-server",
//!                 "chartVersion": "1.0.5"
//!             }
//!         })),
//!         ..Default::default()
//!     }],
//!     auto_delete: None,
//! };
//! ```

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Schema for opaque payloads whose structure is owned by users or deployers.
fn preserve_unknown_fields(_gen: &mut schemars::SchemaGenerator) -> schemars::Schema {
    schemars::json_schema!({
        "type": "object",
        "x-kubernetes-preserve-unknown-fields": true
    })
}

/// Condition represents an observation of a resource's current state.
///
/// Equality for change detection only considers type, status, reason and message;
/// see [`crate::reconcilers::status::conditions_equal`].
#[derive(Clone, Debug, Serialize, Deserialize, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition: `Ready` or `ClusterReachable`.
    pub r#type: String,

    /// Status of the condition: True, False, or Unknown.
    pub status: String,

    /// Brief CamelCase reason for the condition's last transition.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Human-readable message indicating details about the transition.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Last time the condition was computed (RFC3339 format).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_update_time: Option<String>,

    /// Last time the condition transitioned from one status to another (RFC3339 format).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
}

// ============================================================================
// ClusterBom
// ============================================================================

/// `ClusterBom` lists the applications that must be deployed into one target cluster.
///
/// # Example
///
/// ```yaml
/// apiVersion: hub.k8s.sap.com/v1
/// kind: ClusterBom
/// metadata:
///   name: cb1
///   namespace: ns1
/// spec:
///   secretRef: tgt.kubeconfig
///   applicationConfigs:
///     - id: echo
///       configType: helm
///       typeSpecificData:
///         installName: echo
///         namespace: ns2
///         catalogAccess:
///           repo: stable
///           chartName: echo-server
///           chartVersion: 1.0.5
/// ```
#[derive(CustomResource, Clone, Debug, Default, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "hub.k8s.sap.com",
    version = "v1",
    kind = "ClusterBom",
    namespaced,
    shortname = "cbom",
    doc = "ClusterBom describes which application bundles must be present in a named target cluster."
)]
#[kube(status = "ClusterBomStatus")]
#[serde(rename_all = "camelCase")]
pub struct ClusterBomSpec {
    /// Name of the secret holding the kubeconfig of the target cluster (`<cluster>.kubeconfig`).
    pub secret_ref: String,

    /// Applications to deploy. IDs are unique within one `ClusterBom`.
    #[serde(default)]
    pub application_configs: Vec<ApplicationConfig>,

    /// Deletes the `ClusterBom` once its target cluster is gone.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_delete: Option<AutoDelete>,
}

/// Auto-delete policy of a `ClusterBom`.
#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AutoDelete {
    /// Minimum age in minutes. `0` disables auto-delete.
    pub cluster_bom_age: i64,
}

/// One application entry of a `ClusterBom`.
#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationConfig {
    /// Stable application ID.
    pub id: String,

    /// Deployer selection: `helm`, `kapp` or any other type without a deployer.
    pub config_type: String,

    /// Deployer specific payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub type_specific_data: Option<Value>,

    /// Plaintext values.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub values: Option<Value>,

    /// Legacy single block of secret values.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_values: Option<SecretValues>,

    /// Named blocks of secret values, keyed by logical name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub named_secret_values: BTreeMap<String, NamedSecretValues>,

    /// Additional readiness checks on the target cluster.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_requirements: Option<ReadyRequirements>,

    /// Values imported from exports of other applications.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub import_parameters: Vec<ImportParameter>,

    /// Values this application exports.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub export_parameters: Option<ExportParameters>,

    /// Value tree with `(( imports.<name> ))` placeholders merged into the values.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub internal_import_parameters: Option<InternalImportParameters>,

    /// Excludes this application from periodic reconciles.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub no_reconcile: bool,
}

/// Legacy secret values block.
#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SecretValues {
    /// One of `""`, `replace`, `keep`, `delete`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,

    /// Secret value tree. Never persisted in the `ClusterBom` after admission.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub data: Option<Value>,

    /// Name of the secret currently holding the values.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub internal_secret_name: Option<String>,
}

/// Named secret values block.
#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NamedSecretValues {
    /// One of `""`, `replace`, `keep`, `delete`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,

    /// Plain text entries; each value is a YAML document.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub string_data: BTreeMap<String, String>,

    /// Base64 encoded entries; each decoded value is a YAML document.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub data: BTreeMap<String, String>,

    /// Name of the secret currently holding the values.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub internal_secret_name: Option<String>,
}

/// Readiness checks evaluated on the target cluster.
#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReadyRequirements {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub jobs: Vec<JobRequirement>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<ResourceRequirement>,
}

/// A Job that must complete.
#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobRequirement {
    pub name: String,
    pub namespace: String,
}

/// A resource field that must hold one of a set of values.
#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRequirement {
    pub name: String,
    pub namespace: String,
    pub api_version: String,
    /// Plural resource name, e.g. `jobs`.
    pub resource: String,
    /// JSONPath, e.g. `{.status.conditions[?(@.type=="Complete")].status}`.
    pub field_path: String,
    #[serde(default)]
    pub success_values: Vec<SuccessValue>,
}

/// Accepted value of a [`ResourceRequirement`].
#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct SuccessValue {
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub value: Value,
}

/// Import of an export of another application.
#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ImportParameter {
    /// Local name, referenced as `(( imports.<name> ))`.
    pub name: String,
    /// Source `ClusterBom`; defaults to the importing one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_bom_name: Option<String>,
    /// Source application ID.
    pub app_id: String,
    /// Export parameter name of the source application.
    pub export_param_name: String,
}

/// Export declarations of an application.
#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct ExportParameters {
    /// Export name to raw value; may reference `(( internalExport.<key> ))`.
    #[serde(default)]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub parameters: Value,
}

/// Import parameter tree.
#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct InternalImportParameters {
    #[serde(default)]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub parameters: Value,
}

/// `ClusterBom` status
#[derive(Clone, Debug, Serialize, Deserialize, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterBomStatus {
    #[serde(default)]
    pub observed_generation: i64,
    #[serde(default)]
    pub overall_state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overall_time: Option<String>,
    #[serde(default)]
    pub overall_num_of_deployments: i32,
    #[serde(default)]
    pub overall_num_of_ready_deployments: i32,
    #[serde(default)]
    pub overall_progress: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub application_states: Vec<ApplicationState>,
}

/// State of one application in the `ClusterBom` status.
#[derive(Clone, Debug, Serialize, Deserialize, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationState {
    pub id: String,
    pub state: String,
    pub detailed_state: DetailedState,
}

/// Detail record of an application state, copied from its deploy item.
#[derive(Clone, Debug, Serialize, Deserialize, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DetailedState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_operation_time: Option<String>,
    #[serde(default)]
    pub last_operation: LastOperation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reachability: Option<Reachability>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub readiness: Option<Readiness>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deploy_item_conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub type_specific_status: Option<Value>,
    #[serde(default)]
    pub generation: i64,
    #[serde(default)]
    pub observed_generation: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<String>,
}

/// Record of the last deployment operation of an item.
#[derive(Clone, Debug, Serialize, Deserialize, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LastOperation {
    /// `install` or `remove`.
    #[serde(default)]
    pub operation: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<Time>,
    #[serde(default)]
    pub number_of_tries: i64,
    /// `ok`, `failed`, `pending` or `unknown`.
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub description: String,
    /// Generation at which the last operation fully succeeded.
    #[serde(default)]
    pub success_generation: i64,
}

/// Whether the target cluster answered the last call.
#[derive(Clone, Debug, Serialize, Deserialize, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Reachability {
    pub reachable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<Time>,
}

/// Convergence state of the deployed resources.
#[derive(Clone, Debug, Serialize, Deserialize, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Readiness {
    /// `ok`, `pending`, `unknown`, `failed`, `notRelevant` or `finallyFailed`.
    pub state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<Time>,
}

// ============================================================================
// DeployItem
// ============================================================================

/// `DeployItem` is the projection of one application config of a `ClusterBom`.
///
/// Its `configuration` embeds a `HubDeployItemConfiguration`
/// (see [`crate::deploy_data::DeployItemConfiguration`]).
#[derive(CustomResource, Clone, Debug, Default, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "landscaper.gardener.cloud",
    version = "v1alpha1",
    kind = "DeployItem",
    namespaced,
    shortname = "di",
    doc = "DeployItem is one application of a ClusterBom, driven to convergence by the deployment loop."
)]
#[kube(status = "DeployItemStatus")]
#[serde(rename_all = "camelCase")]
pub struct DeployItemSpec {
    /// Deployer type, e.g. `landscaper.gardener.cloud/helm`.
    #[serde(default)]
    pub r#type: String,

    /// Materialised item contract.
    #[serde(default)]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub configuration: Value,
}

/// `DeployItem` status
#[derive(Clone, Debug, Serialize, Deserialize, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeployItemStatus {
    #[serde(default)]
    pub observed_generation: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub provider_status: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub export_reference: Option<ObjectReference>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

/// Namespaced object reference.
#[derive(Clone, Debug, Serialize, Deserialize, Default, JsonSchema, PartialEq, Eq)]
pub struct ObjectReference {
    pub name: String,
    pub namespace: String,
}

// ============================================================================
// ClusterBomSync
// ============================================================================

/// `ClusterBomSync` is the persistent lease of one `ClusterBom`.
///
/// Name and namespace equal those of the `ClusterBom` it protects.
#[derive(CustomResource, Clone, Debug, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "hub.k8s.sap.com",
    version = "v1",
    kind = "ClusterBomSync",
    namespaced,
    doc = "ClusterBomSync is the lease serialising all reconciles of one ClusterBom across controller instances."
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterBomSyncSpec {
    /// ID of the controller instance holding the lease.
    pub id: String,

    /// Time of acquisition.
    pub timestamp: Time,

    /// The lease is not valid after this time.
    pub until: Time,
}
