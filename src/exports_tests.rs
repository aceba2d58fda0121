// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Unit tests for `exports.rs`

#[cfg(test)]
mod tests {
    use super::super::{
        data_ref, decode_export, export_owner_reference, import_references, merge_values,
        parse_data_ref, resolve_export_parameters, substitute_imports,
    };
    use crate::crd::{DeployItem, DeployItemSpec, ImportParameter};
    use crate::errors::DeployError;
    use k8s_openapi::api::core::v1::Secret;
    use k8s_openapi::ByteString;
    use serde_json::json;
    use std::collections::BTreeMap;

    /// Test that data references round through their string form
    #[test]
    fn test_data_ref() {
        let reference = data_ref("cb1", "db", "password");
        assert_eq!(reference, "cb1::db::password");
        assert_eq!(parse_data_ref(&reference), Some(("cb1", "db", "password")));
        assert_eq!(parse_data_ref("cb1::db"), None);
        assert_eq!(parse_data_ref("::db::password"), None);
    }

    /// Test that imports default to the importing ClusterBom
    #[test]
    fn test_import_references() {
        let imports = vec![
            ImportParameter {
                name: "dbPassword".to_string(),
                cluster_bom_name: None,
                app_id: "db".to_string(),
                export_param_name: "password".to_string(),
            },
            ImportParameter {
                name: "url".to_string(),
                cluster_bom_name: Some("shared".to_string()),
                app_id: "gateway".to_string(),
                export_param_name: "url".to_string(),
            },
        ];

        let references = import_references("cb1", &imports);
        assert_eq!(references[0].data_ref, "cb1::db::password");
        assert_eq!(references[1].data_ref, "shared::gateway::url");
        assert_eq!(references[1].name, "url");
    }

    /// Test that nested maps merge and the overlay wins on leaves
    #[test]
    fn test_merge_values() {
        let base = json!({"replicas": 1, "db": {"user": "admin", "port": 5432}, "tags": ["a"]});
        let overlay = json!({"db": {"user": "app"}, "tags": ["b"], "extra": true});

        let merged = merge_values(&base, &overlay);
        assert_eq!(
            merged,
            json!({
                "replicas": 1,
                "db": {"user": "app", "port": 5432},
                "tags": ["b"],
                "extra": true
            })
        );
        assert_eq!(merge_values(&base, &json!(null)), base, "null overlay keeps base");
        assert_eq!(merge_values(&json!(null), &overlay), overlay);
    }

    /// Test placeholder substitution at any depth
    #[test]
    fn test_substitute_imports() {
        let tree = json!({
            "database": {"password": "(( imports.dbPassword ))"},
            "urls": ["((imports.url))", "static"],
            "note": "imports.url is not a placeholder"
        });
        let imports = BTreeMap::from([
            ("dbPassword".to_string(), json!("s3cret")),
            ("url".to_string(), json!({"host": "gw", "port": 443})),
        ]);

        let resolved = substitute_imports(&tree, &imports).unwrap();
        assert_eq!(resolved["database"]["password"], "s3cret");
        assert_eq!(resolved["urls"][0], json!({"host": "gw", "port": 443}));
        assert_eq!(resolved["urls"][1], "static");
        assert_eq!(resolved["note"], "imports.url is not a placeholder");
    }

    /// Test that an unknown import is an error naming the import
    #[test]
    fn test_substitute_missing_import() {
        let tree = json!({"a": "(( imports.missing ))"});
        let result = substitute_imports(&tree, &BTreeMap::new());
        assert!(matches!(result, Err(DeployError::Import { name, .. }) if name == "missing"));
    }

    /// Test export parameter resolution
    #[test]
    fn test_resolve_export_parameters() {
        let export_values = json!({"pw": "abc", "svc": {"host": "db.ns"}});

        let params = json!({"password": "(( internalExport.pw ))", "host": "(( internalExport.svc ))", "fixed": 1});
        let resolved = resolve_export_parameters(Some(&params), &export_values);
        assert_eq!(
            resolved,
            json!({"password": "abc", "host": {"host": "db.ns"}, "fixed": 1})
        );

        assert_eq!(
            resolve_export_parameters(None, &export_values),
            export_values,
            "without declarations the raw values are exported"
        );
        let missing = json!({"x": "(( internalExport.none ))"});
        assert_eq!(resolve_export_parameters(Some(&missing), &export_values), json!({"x": null}));
    }

    /// Test decoding of the stored export
    #[test]
    fn test_decode_export() {
        let secret = Secret {
            data: Some(BTreeMap::from([(
                "config".to_string(),
                ByteString(b"password: abc\nport: 5432\n".to_vec()),
            )])),
            ..Default::default()
        };
        assert_eq!(decode_export(&secret).unwrap(), json!({"password": "abc", "port": 5432}));
        assert!(decode_export(&Secret::default()).is_err());
    }

    /// Test that export secrets are owned by their persisted deploy item
    #[test]
    fn test_export_owner_reference() {
        let mut item = DeployItem::new("cb1-echo", DeployItemSpec::default());
        assert!(export_owner_reference(&item).is_none(), "item without uid");

        item.metadata.uid = Some("1234-abcd".to_string());
        let owner = export_owner_reference(&item).unwrap();
        assert_eq!(owner.api_version, "landscaper.gardener.cloud/v1alpha1");
        assert_eq!(owner.kind, "DeployItem");
        assert_eq!(owner.name, "cb1-echo");
        assert_eq!(owner.uid, "1234-abcd");
        assert_eq!(owner.controller, Some(true));
    }
}
