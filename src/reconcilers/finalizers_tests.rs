// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Unit tests for `finalizers.rs`

#[cfg(test)]
mod tests {
    use crate::constants::HUB_CONTROLLER_FINALIZER;
    use crate::crd::{DeployItem, DeployItemSpec};
    use crate::reconcilers::finalizers::{finalizer_patch, has_finalizer};
    use serde_json::json;

    fn item_with(finalizers: Option<Vec<String>>) -> DeployItem {
        let mut item = DeployItem::new("cb1-echo", DeployItemSpec::default());
        item.metadata.namespace = Some("ns1".to_string());
        item.metadata.finalizers = finalizers;
        item
    }

    /// Test finalizer detection
    #[test]
    fn test_has_finalizer() {
        assert!(!has_finalizer(&item_with(None), HUB_CONTROLLER_FINALIZER));
        assert!(!has_finalizer(
            &item_with(Some(vec!["other".to_string()])),
            HUB_CONTROLLER_FINALIZER
        ));
        assert!(has_finalizer(
            &item_with(Some(vec!["other".to_string(), HUB_CONTROLLER_FINALIZER.to_string()])),
            HUB_CONTROLLER_FINALIZER
        ));
    }

    /// Test that finalizer patches are guarded by the resource version
    #[test]
    fn test_finalizer_patch() {
        let finalizers = vec![HUB_CONTROLLER_FINALIZER.to_string()];
        assert_eq!(
            finalizer_patch(&finalizers, Some("17")),
            json!({"metadata": {"finalizers": ["hub-controller"], "resourceVersion": "17"}})
        );
        assert_eq!(
            finalizer_patch(&[], None),
            json!({"metadata": {"finalizers": []}}),
            "an empty list clears all finalizers"
        );
    }
}
