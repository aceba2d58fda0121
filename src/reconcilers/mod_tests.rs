// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Unit tests for the shared reconciler helpers

#[cfg(test)]
mod tests {
    use crate::crd::{DeployItem, DeployItemSpec};
    use crate::labels::{ANNOTATION_RECONCILE, ANNOTATION_RECONCILE_VALUE};
    use crate::reconcilers::{annotations_patch, annotations_unchanged};
    use serde_json::json;
    use std::collections::BTreeMap;

    fn item_with_annotations(annotations: &[(&str, &str)]) -> DeployItem {
        let mut item = DeployItem::new("cb1-echo", DeployItemSpec::default());
        item.metadata.namespace = Some("ns1".to_string());
        item.metadata.annotations = Some(
            annotations
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect::<BTreeMap<_, _>>(),
        );
        item
    }

    /// Test that removed annotations are nulled in the merge patch
    #[test]
    fn test_annotations_patch() {
        let patch = annotations_patch(&[
            (ANNOTATION_RECONCILE, Some(ANNOTATION_RECONCILE_VALUE)),
            ("other", None),
        ]);
        assert_eq!(
            patch,
            json!({"metadata": {"annotations": {
                "hub.k8s.sap.com/reconcile": "reconcile",
                "other": null
            }}})
        );
    }

    /// Test detection of no-op annotation changes
    #[test]
    fn test_annotations_unchanged() {
        let item = item_with_annotations(&[(ANNOTATION_RECONCILE, ANNOTATION_RECONCILE_VALUE)]);

        assert!(annotations_unchanged(
            &item,
            &[(ANNOTATION_RECONCILE, Some(ANNOTATION_RECONCILE_VALUE))]
        ));
        assert!(annotations_unchanged(&item, &[("absent", None)]));
        assert!(!annotations_unchanged(&item, &[(ANNOTATION_RECONCILE, None)]));
        assert!(!annotations_unchanged(&item, &[("absent", Some("x"))]));
    }
}
