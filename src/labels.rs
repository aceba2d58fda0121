// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Common label and annotation constants used across all reconcilers.
//!
//! Every object the controller creates on behalf of a `ClusterBom` carries
//! [`BOM_NAME`] so it can be found again by label selector. Lookups never rely
//! on owner references.

use std::collections::BTreeMap;

// ============================================================================
// Labels
// ============================================================================

/// Name of the parent `ClusterBom`
pub const BOM_NAME: &str = "hub.k8s.sap.com/bom-name";

/// Application config ID an object was projected from
pub const APPLICATION_CONFIG_ID: &str = "hub.k8s.sap.com/application-config-id";

/// Config type (`helm`, `kapp`) of a deploy item
pub const CONFIG_TYPE: &str = "hub.k8s.sap.com/configType";

/// Purpose of a secret created by the controller
pub const PURPOSE: &str = "hub.k8s.sap.com/purpose";

/// Logical name of a named secret-values block
pub const LOGICAL_SECRET_NAME: &str = "hub.k8s.sap.com/logical-secret-name";

/// Marks installations projected from a landscaper-managed `ClusterBom`
pub const LANDSCAPER_MANAGED_LABEL: &str = "potter.gardener.cloud/landscaper-managed";

// ============================================================================
// Label Values
// ============================================================================

/// Purpose of secrets holding merged secret values
pub const PURPOSE_SECRET_VALUES: &str = "secret-values";

/// Purpose of secrets holding export data of a deploy item
pub const PURPOSE_EXPORT_DATA: &str = "di-export-data";

/// Value of the landscaper-managed label and annotation
pub const LANDSCAPER_MANAGED_VALUE: &str = "true";

/// Selector matching deploy items that are not driven by landscaper
pub const NOT_LANDSCAPER_MANAGED: &str = "potter.gardener.cloud/landscaper-managed!=true";

// ============================================================================
// Annotations
// ============================================================================

/// `ClusterBom`s with this annotation are projected into installations
pub const ANNOTATION_LANDSCAPER_MANAGED: &str = "potter.gardener.cloud/landscaper-managed";

/// Forces a re-run of the last successful operation
pub const ANNOTATION_RECONCILE: &str = "hub.k8s.sap.com/reconcile";

/// Value of [`ANNOTATION_RECONCILE`]
pub const ANNOTATION_RECONCILE_VALUE: &str = "reconcile";

/// Requested (de)activation action
pub const ANNOTATION_ACTION_IGNORE: &str = "potter.gardener.cloud/action-ignore";

/// Confirmed deactivation
pub const ANNOTATION_STATUS_IGNORE: &str = "potter.gardener.cloud/status-ignore";

/// Value of [`ANNOTATION_ACTION_IGNORE`] requesting a deactivation
pub const ACTION_DEACTIVATE: &str = "deactivate";

/// Value of [`ANNOTATION_ACTION_IGNORE`] requesting a reactivation
pub const ACTION_REACTIVATE: &str = "reactivate";

/// Value of [`ANNOTATION_STATUS_IGNORE`]
pub const STATUS_IGNORE: &str = "ignore";

/// Structural hash of the contract projected into an installation
pub const ANNOTATION_INSTALLATION_HASH: &str = "potter.gardener.cloud/installation-hash";

/// Landscaper operation annotation
pub const ANNOTATION_LANDSCAPER_OPERATION: &str = "landscaper.gardener.cloud/operation";

/// Value of [`ANNOTATION_LANDSCAPER_OPERATION`] forcing a reconcile
pub const LANDSCAPER_OPERATION_FORCE_RECONCILE: &str = "forceReconcile";

// ============================================================================
// Helpers
// ============================================================================

/// Returns `true` if `map` contains `key` with exactly `value`.
#[must_use]
pub fn has_entry(map: Option<&BTreeMap<String, String>>, key: &str, value: &str) -> bool {
    map.and_then(|m| m.get(key)).is_some_and(|v| v == value)
}

/// Builds a label selector string (`k1=v1,k2=v2`) from key/value pairs.
#[must_use]
pub fn selector(pairs: &[(&str, &str)]) -> String {
    pairs
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Labels binding an object to a `ClusterBom` and one of its application configs.
#[must_use]
pub fn app_labels(clusterbom_name: &str, app_id: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (BOM_NAME.to_string(), clusterbom_name.to_string()),
        (APPLICATION_CONFIG_ID.to_string(), app_id.to_string()),
    ])
}

/// Whether a `ClusterBom` is projected into landscaper installations.
#[must_use]
pub fn clusterbom_is_landscaper_managed(annotations: &BTreeMap<String, String>) -> bool {
    has_entry(Some(annotations), ANNOTATION_LANDSCAPER_MANAGED, LANDSCAPER_MANAGED_VALUE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selector_joins_pairs() {
        assert_eq!(
            selector(&[(BOM_NAME, "cb1"), (PURPOSE, PURPOSE_SECRET_VALUES)]),
            "hub.k8s.sap.com/bom-name=cb1,hub.k8s.sap.com/purpose=secret-values"
        );
    }

    #[test]
    fn test_has_entry() {
        let map = BTreeMap::from([(ANNOTATION_RECONCILE.to_string(), "reconcile".to_string())]);
        assert!(has_entry(Some(&map), ANNOTATION_RECONCILE, ANNOTATION_RECONCILE_VALUE));
        assert!(!has_entry(Some(&map), ANNOTATION_RECONCILE, "other"));
        assert!(!has_entry(None, ANNOTATION_RECONCILE, ANNOTATION_RECONCILE_VALUE));
        assert!(!clusterbom_is_landscaper_managed(&map));
    }

    #[test]
    fn test_app_labels() {
        let labels = app_labels("cb1", "echo");
        assert_eq!(labels.get(BOM_NAME).map(String::as_str), Some("cb1"));
        assert_eq!(labels.get(APPLICATION_CONFIG_ID).map(String::as_str), Some("echo"));
    }
}
