// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Unit tests for `clusterbom.rs`

#[cfg(test)]
mod tests {
    use super::super::{
        build_deploy_item, contract_changed, contract_hash, existing_contract,
        find_current_secret, normalise, orphans, SecretNames,
    };
    use crate::crd::{
        ApplicationConfig, ClusterBom, ClusterBomSpec, ImportParameter, ReadyRequirements,
    };
    use crate::labels::{self, APPLICATION_CONFIG_ID, BOM_NAME, CONFIG_TYPE};
    use k8s_openapi::api::core::v1::Secret;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use k8s_openapi::ByteString;
    use kube::ResourceExt;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn app(id: &str) -> ApplicationConfig {
        ApplicationConfig {
            id: id.to_string(),
            config_type: "helm".to_string(),
            type_specific_data: Some(json!({
                "installName": id,
                "namespace": "ns2",
                "catalogAccess": {"chartName": "echo-server", "repo": "stable", "chartVersion": "1.0.5"}
            })),
            ..Default::default()
        }
    }

    fn clusterbom(apps: Vec<ApplicationConfig>) -> ClusterBom {
        let mut clusterbom = ClusterBom::new(
            "cb1",
            ClusterBomSpec {
                secret_ref: "tgt.kubeconfig".to_string(),
                application_configs: apps,
                auto_delete: None,
            },
        );
        clusterbom.metadata.namespace = Some("ns1".to_string());
        clusterbom
    }

    fn value_secret(name: &str, app_id: &str, logical: Option<&str>, data: &[(&str, &str)]) -> Secret {
        let mut secret_labels = labels::app_labels("cb1", app_id);
        if let Some(logical) = logical {
            secret_labels.insert(labels::LOGICAL_SECRET_NAME.to_string(), logical.to_string());
        }
        Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("ns1".to_string()),
                labels: Some(secret_labels),
                ..Default::default()
            },
            data: Some(
                data.iter()
                    .map(|(k, v)| ((*k).to_string(), ByteString(v.as_bytes().to_vec())))
                    .collect(),
            ),
            ..Default::default()
        }
    }

    /// Test that key order and whitespace do not change the hash
    #[test]
    fn test_contract_hash_normalised() {
        let a: serde_json::Value = serde_json::from_str(r#"{"b": 1, "a": {"y": [1, 2], "x": null}}"#).unwrap();
        let b: serde_json::Value = serde_json::from_str(r#"{"a":{"x":null,"y":[1,2]},"b":1}"#).unwrap();
        assert_eq!(normalise(&a), normalise(&b));
        assert_eq!(contract_hash(&a).unwrap(), contract_hash(&b).unwrap());
        assert_eq!(contract_hash(&a).unwrap().len(), 64);

        let reordered = json!({"a": {"x": null, "y": [2, 1]}, "b": 1});
        assert_ne!(contract_hash(&a).unwrap(), contract_hash(&reordered).unwrap());
    }

    /// Test name, labels and contract of a projected item
    #[test]
    fn test_build_deploy_item() {
        let mut echo = app("echo");
        echo.values = Some(json!({"replicas": 1}));
        echo.ready_requirements = Some(ReadyRequirements::default());
        let secrets = SecretNames {
            internal: "cb1-echo-1".to_string(),
            named: BTreeMap::from([("test1".to_string(), "cb1-echo-2".to_string())]),
        };

        let item = build_deploy_item(&clusterbom(vec![echo.clone()]), &echo, &secrets).unwrap();
        assert_eq!(item.name_any(), "cb1-echo");
        assert_eq!(item.namespace().as_deref(), Some("ns1"));
        assert_eq!(item.spec.r#type, "helm");
        assert_eq!(item.labels().get(BOM_NAME).map(String::as_str), Some("cb1"));
        assert_eq!(item.labels().get(APPLICATION_CONFIG_ID).map(String::as_str), Some("echo"));
        assert_eq!(item.labels().get(CONFIG_TYPE).map(String::as_str), Some("helm"));

        let contract = existing_contract(&item).unwrap();
        assert_eq!(contract.id, "echo");
        assert_eq!(contract.internal_secret_name, "cb1-echo-1");
        assert_eq!(contract.named_internal_secret_names["test1"], "cb1-echo-2");
        assert_eq!(contract.type_specific_data["installName"], "echo");
        assert_eq!(contract.values, Some(json!({"replicas": 1})));
        assert_eq!(item.spec.configuration["localSecretRef"], "tgt.kubeconfig");
        assert_eq!(secrets.all().count(), 2);
    }

    /// Test that imports default to the importing clusterbom
    #[test]
    fn test_build_deploy_item_imports() {
        let mut echo = app("echo");
        echo.import_parameters = vec![
            ImportParameter {
                name: "db".to_string(),
                cluster_bom_name: None,
                app_id: "postgres".to_string(),
                export_param_name: "url".to_string(),
            },
            ImportParameter {
                name: "cache".to_string(),
                cluster_bom_name: Some("shared".to_string()),
                app_id: "redis".to_string(),
                export_param_name: "host".to_string(),
            },
        ];
        let item = build_deploy_item(&clusterbom(vec![]), &echo, &SecretNames::default()).unwrap();
        let contract = existing_contract(&item).unwrap();
        assert_eq!(contract.import_parameters[0].data_ref, "cb1::postgres::url");
        assert_eq!(contract.import_parameters[1].data_ref, "shared::redis::host");
    }

    /// Test that only user visible changes update an item
    #[test]
    fn test_contract_changed() {
        let clusterbom = clusterbom(vec![app("echo")]);
        let stored = build_deploy_item(&clusterbom, &app("echo"), &SecretNames::default()).unwrap();

        let mut annotated = stored.clone();
        annotated.metadata.resource_version = Some("42".to_string());
        annotated.metadata.annotations = Some(BTreeMap::from([("x".to_string(), "y".to_string())]));
        let desired = build_deploy_item(&clusterbom, &app("echo"), &SecretNames::default()).unwrap();
        assert!(!contract_changed(&annotated, &desired).unwrap());

        let mut upgraded = app("echo");
        upgraded.type_specific_data.as_mut().unwrap()["catalogAccess"]["chartVersion"] =
            json!("1.0.11111111");
        let desired = build_deploy_item(&clusterbom, &upgraded, &SecretNames::default()).unwrap();
        assert!(contract_changed(&stored, &desired).unwrap());

        let rotated = SecretNames {
            internal: String::new(),
            named: BTreeMap::from([("test1".to_string(), "cb1-echo-new".to_string())]),
        };
        let desired = build_deploy_item(&clusterbom, &app("echo"), &rotated).unwrap();
        assert!(contract_changed(&stored, &desired).unwrap());
    }

    /// Test detection of items whose application was removed
    #[test]
    fn test_orphans() {
        let full = clusterbom(vec![app("a"), app("b")]);
        let items: Vec<_> = ["a", "b"]
            .iter()
            .map(|id| build_deploy_item(&full, &app(id), &SecretNames::default()).unwrap())
            .collect();

        assert!(orphans(&items, &full).is_empty());
        let reduced = clusterbom(vec![app("a")]);
        let orphaned = orphans(&items, &reduced);
        assert_eq!(orphaned.len(), 1);
        assert_eq!(orphaned[0].name_any(), "cb1-b");
    }

    /// Test lookup of the secret currently holding a block
    #[test]
    fn test_find_current_secret() {
        let stored = vec![
            value_secret("cb1-echo-1", "echo", None, &[("secretValues", "{}")]),
            value_secret("cb1-echo-2", "echo", Some("test1"), &[("key3", "val31")]),
            value_secret("cb1-other-3", "other", Some("test1"), &[("key3", "val31")]),
        ];

        let current = find_current_secret(&stored, Some("cb1-echo-1"), "echo", None, None).unwrap();
        assert_eq!(current.0, "cb1-echo-1");
        assert_eq!(current.1["secretValues"], b"{}".to_vec());

        let content = BTreeMap::from([("key3".to_string(), b"val31".to_vec())]);
        let found = find_current_secret(&stored, None, "echo", Some("test1"), Some(&content)).unwrap();
        assert_eq!(found.0, "cb1-echo-2", "same content of the same app is reused");

        let changed = BTreeMap::from([("key3".to_string(), b"val33".to_vec())]);
        assert!(find_current_secret(&stored, None, "echo", Some("test1"), Some(&changed)).is_none());
        assert!(
            find_current_secret(&stored, Some("gone"), "echo", Some("test1"), None).is_none(),
            "a referenced secret that no longer exists is not current"
        );
    }
}
