// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Unit tests for `crd.rs`

#[cfg(test)]
mod tests {
    use crate::crd::*;
    use kube::{CustomResourceExt, Resource};
    use serde_json::json;

    /// Test that a user authored ClusterBom deserializes with defaults
    #[test]
    fn test_clusterbom_from_yaml() {
        let yaml = r"
apiVersion: hub.k8s.sap.com/v1
kind: ClusterBom
metadata:
  name: cb1
  namespace: ns1
spec:
  secretRef: tgt.kubeconfig
  autoDelete:
    clusterBomAge: 30
  applicationConfigs:
    - id: echo
      configType: helm
      typeSpecificData:
        installName: echo
        namespace: ns2
      namedSecretValues:
        test1:
          stringData:
            key1: val1
      importParameters:
        - name: db
          appId: postgres
          exportParamName: url
      readyRequirements:
        jobs:
          - name: migrate
            namespace: ns2
";
        let clusterbom: ClusterBom = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(clusterbom.spec.secret_ref, "tgt.kubeconfig");
        assert_eq!(clusterbom.spec.auto_delete, Some(AutoDelete { cluster_bom_age: 30 }));

        let app = &clusterbom.spec.application_configs[0];
        assert_eq!(app.id, "echo");
        assert_eq!(app.config_type, "helm");
        assert_eq!(app.type_specific_data.as_ref().unwrap()["installName"], "echo");
        assert_eq!(app.named_secret_values["test1"].string_data["key1"], "val1");
        assert_eq!(app.import_parameters[0].cluster_bom_name, None);
        assert_eq!(app.ready_requirements.as_ref().unwrap().jobs[0].name, "migrate");
        assert!(!app.no_reconcile);
        assert!(clusterbom.status.is_none());
    }

    /// Test that empty optional fields are omitted on serialization
    #[test]
    fn test_application_config_skips_empty_fields() {
        let app = ApplicationConfig {
            id: "echo".to_string(),
            config_type: "kapp".to_string(),
            ..Default::default()
        };
        let value = serde_json::to_value(&app).unwrap();
        assert_eq!(value, json!({"id": "echo", "configType": "kapp"}));
    }

    /// Test that the status keeps the fields written by the aggregation loop
    #[test]
    fn test_clusterbom_status_roundtrip_fields() {
        let status: ClusterBomStatus = serde_json::from_value(json!({
            "observedGeneration": 3,
            "overallState": "ok",
            "overallNumOfDeployments": 2,
            "overallNumOfReadyDeployments": 2,
            "overallProgress": 100,
            "conditions": [{"type": "Ready", "status": "True", "reason": "AllAppsReady"}],
            "applicationStates": [{
                "id": "echo",
                "state": "ok",
                "detailedState": {
                    "lastOperation": {"operation": "install", "state": "ok", "numberOfTries": 1},
                    "generation": 3,
                    "observedGeneration": 3
                }
            }]
        }))
        .unwrap();

        assert_eq!(status.overall_progress, 100);
        assert_eq!(status.conditions[0].reason.as_deref(), Some("AllAppsReady"));
        let detailed = &status.application_states[0].detailed_state;
        assert_eq!(detailed.last_operation.operation, "install");
        assert_eq!(detailed.last_operation.number_of_tries, 1);
        assert_eq!(detailed.last_operation.success_generation, 0);
    }

    /// Test group, version and scope of the resources
    #[test]
    fn test_resource_metadata() {
        assert_eq!(ClusterBom::api_version(&()), "hub.k8s.sap.com/v1");
        assert_eq!(ClusterBom::plural(&()), "clusterboms");
        assert_eq!(DeployItem::api_version(&()), "landscaper.gardener.cloud/v1alpha1");
        assert_eq!(ClusterBomSync::kind(&()), "ClusterBomSync");

        let crd = ClusterBom::crd();
        assert_eq!(crd.spec.scope, "Namespaced");
        assert_eq!(crd.spec.names.short_names, Some(vec!["cbom".to_string()]));
    }

    /// Test that opaque payloads keep unknown fields in the schema
    #[test]
    fn test_crd_preserves_opaque_payloads() {
        let crd = serde_json::to_value(DeployItem::crd()).unwrap();
        let configuration = &crd["spec"]["versions"][0]["schema"]["openAPIV3Schema"]["properties"]
            ["spec"]["properties"]["configuration"];
        assert_eq!(configuration["x-kubernetes-preserve-unknown-fields"], true);
    }
}
