// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Unit tests for `kapp.rs`

#[cfg(test)]
mod tests {
    use super::super::{
        app_resource, app_spec, format_sync_period, is_current, replace_secret_names, rollout_of_app,
        state_namespace,
    };
    use crate::deployers::Rollout;
    use kube::api::DynamicObject;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn mapping() -> BTreeMap<String, String> {
        BTreeMap::from([("db-creds".to_string(), "cb1-db-7f3a".to_string())])
    }

    fn app_with(status: serde_json::Value, generation: i64) -> DynamicObject {
        let mut app = DynamicObject::new("cb1-echo", &app_resource()).within("ns1");
        app.metadata.generation = Some(generation);
        app.data = json!({ "spec": {}, "status": status });
        app
    }

    /// Test that only secretRef names are replaced
    #[test]
    fn test_replace_secret_names() {
        let tree = json!({
            "fetch": [{"http": {"url": "https://x", "secretRef": {"name": "db-creds"}}}],
            "template": [{"ytt": {"inline": {"pathsFrom": [{"secretRef": {"name": "db-creds"}}]}}}],
            "name": "db-creds",
            "other": {"name": "db-creds"},
            "secretRef": {"name": "unknown"}
        });
        let replaced = replace_secret_names(&tree, &mapping());

        assert_eq!(replaced["fetch"][0]["http"]["secretRef"]["name"], "cb1-db-7f3a");
        assert_eq!(
            replaced["template"][0]["ytt"]["inline"]["pathsFrom"][0]["secretRef"]["name"],
            "cb1-db-7f3a"
        );
        assert_eq!(replaced["name"], "db-creds", "top level name is not a secret reference");
        assert_eq!(replaced["other"]["name"], "db-creds");
        assert_eq!(replaced["secretRef"]["name"], "unknown", "unmapped names stay");
    }

    /// Test the defaults applied to an App spec
    #[test]
    fn test_app_spec_defaults() {
        let payload = json!({
            "fetch": [{"git": {"url": "https://git/x"}}],
            "internalExport": {"url": {"name": "x"}}
        });
        let spec = app_spec(&payload, &mapping(), "tgt.kubeconfig", 60).unwrap();

        assert!(spec.get("internalExport").is_none());
        assert_eq!(spec["cluster"]["namespace"], "default");
        assert_eq!(spec["cluster"]["kubeconfigSecretRef"]["name"], "tgt.kubeconfig");
        assert_eq!(spec["cluster"]["kubeconfigSecretRef"]["key"], "kubeconfig");
        assert_eq!(spec["syncPeriod"], "1h0m0s");
        assert_eq!(state_namespace(&spec), None, "default namespace is not created");

        let payload = json!({"cluster": {"namespace": "kapp-state"}, "syncPeriod": "5m0s"});
        let spec = app_spec(&payload, &BTreeMap::new(), "tgt.kubeconfig", 60).unwrap();
        assert_eq!(spec["syncPeriod"], "5m0s");
        assert_eq!(state_namespace(&spec), Some("kapp-state"));
    }

    /// Test that an App may not point to another cluster
    #[test]
    fn test_app_spec_rejects_foreign_cluster() {
        let foreign = json!({"cluster": {"kubeconfigSecretRef": {"name": "other"}}});
        let error = app_spec(&foreign, &BTreeMap::new(), "tgt.kubeconfig", 60).unwrap_err();
        assert!(error.to_string().contains("differs from localSecretRef"));

        let wrong_key = json!({"cluster": {"kubeconfigSecretRef": {"name": "tgt.kubeconfig", "key": "config"}}});
        let error = app_spec(&wrong_key, &BTreeMap::new(), "tgt.kubeconfig", 60).unwrap_err();
        assert!(error.to_string().contains("must be kubeconfig"));

        assert!(app_spec(&json!(["not", "an", "object"]), &BTreeMap::new(), "tgt.kubeconfig", 60).is_err());
    }

    /// Test duration formatting of sync periods
    #[test]
    fn test_format_sync_period() {
        assert_eq!(format_sync_period(30), "30m0s");
        assert_eq!(format_sync_period(90), "1h30m0s");
    }

    /// Test the rollout state derived from App conditions
    #[test]
    fn test_rollout_of_app() {
        let succeeded = app_with(json!({"conditions": [{"type": "ReconcileSucceeded", "status": "True"}]}), 1);
        assert_eq!(rollout_of_app(&succeeded), Rollout::Deployed);

        let failed = app_with(json!({"conditions": [{"type": "ReconcileFailed", "status": "True"}]}), 1);
        assert_eq!(rollout_of_app(&failed), Rollout::Failed);

        let reconciling = app_with(json!({"conditions": [{"type": "Reconciling", "status": "True"}]}), 1);
        assert_eq!(rollout_of_app(&reconciling), Rollout::Pending);

        let fresh = app_with(json!({}), 1);
        assert!(matches!(rollout_of_app(&fresh), Rollout::Unknown(_)));
    }

    /// Test the observed generation check
    #[test]
    fn test_is_current() {
        assert!(is_current(&app_with(json!({"observedGeneration": 3}), 3)));
        assert!(!is_current(&app_with(json!({"observedGeneration": 2}), 3)));
    }
}
