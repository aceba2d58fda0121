// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Object keys and the naming scheme of projected objects.

use crate::labels;
use kube::ResourceExt;
use std::fmt;

/// Namespace and name of an object.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NamespacedName {
    pub namespace: String,
    pub name: String,
}

impl NamespacedName {
    #[must_use]
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Key of any namespaced resource.
    #[must_use]
    pub fn of<K: ResourceExt>(obj: &K) -> Self {
        Self::new(obj.namespace().unwrap_or_default(), obj.name_any())
    }
}

impl fmt::Display for NamespacedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Name of the work item projected from one application config.
#[must_use]
pub fn deploy_item_name(clusterbom_name: &str, app_id: &str) -> String {
    format!("{clusterbom_name}-{app_id}")
}

/// Fresh name for a value or export secret of an application config.
#[must_use]
pub fn random_secret_name(clusterbom_name: &str, app_id: &str) -> String {
    format!("{clusterbom_name}-{app_id}-{:016x}", rand::random::<u64>())
}

/// The `ClusterBom` a work item belongs to.
///
/// The bom-name label wins; items without it fall back to cutting the application
/// ID suffix from the item name.
#[must_use]
pub fn clusterbom_key_of_item<K: ResourceExt>(item: &K) -> NamespacedName {
    let namespace = item.namespace().unwrap_or_default();
    if let Some(name) = item.labels().get(labels::BOM_NAME) {
        return NamespacedName::new(namespace, name.clone());
    }
    let item_name = item.name_any();
    let cut = item_name
        .rfind("--")
        .or_else(|| item_name.rfind('-'))
        .unwrap_or(item_name.len());
    NamespacedName::new(namespace, &item_name[..cut])
}

/// The application config ID a work item was projected from.
#[must_use]
pub fn app_id_of_item<K: ResourceExt>(item: &K) -> String {
    item.labels()
        .get(labels::APPLICATION_CONFIG_ID)
        .cloned()
        .unwrap_or_default()
}
