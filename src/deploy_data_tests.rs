// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Unit tests for `deploy_data.rs`

#[cfg(test)]
mod tests {
    use super::super::{
        calculate_requeue_timeout, not_ready_requeue_delay, premature_retry_delay,
        unreachable_requeue_delay, worse_state, DeployData, DeployItemConfiguration,
        DeploymentConfig, ProviderStatus,
    };
    use crate::crd::{DeployItem, DeployItemSpec, DeployItemStatus, Reachability, Readiness};
    use crate::labels;
    use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
    use crate::timestamps::to_time;
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn item(generation: i64, observed_generation: i64) -> DeployItem {
        let config = DeployItemConfiguration::new(
            "tgt.kubeconfig",
            DeploymentConfig {
                id: "echo".to_string(),
                config_type: "helm".to_string(),
                type_specific_data: json!({"installName": "echo", "namespace": "ns2"}),
                ..Default::default()
            },
        );
        let mut item = DeployItem::new(
            "cb1-echo",
            DeployItemSpec {
                r#type: "landscaper.gardener.cloud/helm".to_string(),
                configuration: serde_json::to_value(config).unwrap(),
            },
        );
        item.metadata.namespace = Some("ns1".to_string());
        item.metadata.generation = Some(generation);
        item.metadata.labels = Some(labels::app_labels("cb1", "echo"));
        item.status = Some(DeployItemStatus {
            observed_generation,
            ..Default::default()
        });
        item
    }

    fn data(generation: i64, observed_generation: i64) -> DeployData {
        DeployData::new(item(generation, observed_generation)).unwrap()
    }

    /// Test that the contract is decoded and keys are derived from it
    #[test]
    fn test_new_decodes_contract() {
        let data = data(1, 0);
        assert_eq!(data.config_id(), "echo");
        assert_eq!(data.config_type(), "helm");
        assert_eq!(data.target_secret_key().to_string(), "ns1/tgt.kubeconfig");
        assert_eq!(data.clusterbom_key().to_string(), "ns1/cb1");
        assert_eq!(data.provider_status, ProviderStatus::default());
    }

    /// Test that a malformed contract is a config error
    #[test]
    fn test_new_rejects_malformed_contract() {
        let mut broken = item(1, 0);
        broken.spec.configuration = json!({"deploymentConfig": "not an object"});
        let err = DeployData::new(broken).unwrap_err();
        assert!(
            err.to_string().starts_with("could not parse deployment config"),
            "unexpected error: {err}"
        );
    }

    /// Test that an unobserved generation and an unanswered deletion are new operations
    #[test]
    fn test_is_new_operation() {
        assert!(data(2, 1).is_new_operation());
        assert!(!data(2, 2).is_new_operation());

        let mut deleting = item(2, 2);
        deleting.metadata.deletion_timestamp = Some(to_time(now()));
        let mut deleting = DeployData::new(deleting).unwrap();
        assert!(deleting.is_new_operation(), "deletion without remove is new");

        deleting.set_status("failed", "remove failed", 1, now());
        assert_eq!(deleting.provider_status.last_operation.operation, "remove");
        assert!(!deleting.is_new_operation());
    }

    /// Test that a successful operation records the success generation
    #[test]
    fn test_set_status_ok() {
        let mut data = data(3, 2);
        data.set_readiness("pending", now());
        data.set_status("ok", "install successful", 1, now());

        let op = &data.provider_status.last_operation;
        assert_eq!(op.operation, "install");
        assert_eq!(op.success_generation, 3);
        assert_eq!(op.number_of_tries, 1);
        assert_eq!(data.observed_generation(), 3);
        assert!(data.provider_status.readiness.is_none(), "readiness is reset");
        assert!(data.provider_status.reachability.as_ref().unwrap().reachable);
        assert!(data.provider_status.error_history.is_empty());
    }

    /// Test that a failure keeps the previous success generation
    #[test]
    fn test_set_status_failed_keeps_success_generation() {
        let mut data = data(3, 2);
        data.set_status("ok", "install successful", 1, now());
        data.item.metadata.generation = Some(4);
        data.set_status("failed", "chart not found", 1, now());

        assert_eq!(data.provider_status.last_operation.success_generation, 3);
        assert!(data.is_last_deploy_failed());
        assert_eq!(data.provider_status.error_history.len(), 1);
    }

    /// Test that the error history keeps five entries and never drops the first failure
    #[test]
    fn test_error_history_is_bounded() {
        let mut data = data(1, 0);
        for tries in 1..=7_i64 {
            let at = now() + ChronoDuration::seconds(tries * 60);
            data.set_status("failed", &format!("error {tries}"), tries, at);
        }

        let history = &data.provider_status.error_history;
        assert_eq!(history.len(), 5);
        assert_eq!(history[0].description, "error 1", "first failure is kept");
        assert_eq!(history[4].description, "error 7", "newest failure is last");
        assert!(
            history.windows(2).all(|w| w[0].time.0 <= w[1].time.0),
            "entries are sorted by time"
        );

        // A repeated error refreshes its entry instead of evicting another one
        let at = now() + ChronoDuration::seconds(3600);
        data.set_status("failed", "error 5", 8, at);
        let history = &data.provider_status.error_history;
        assert_eq!(history.len(), 5);
        assert_eq!(history[4].description, "error 5");
        assert_eq!(
            history.iter().filter(|e| e.description == "error 5").count(),
            1
        );

        // A new series starts from scratch
        data.set_status("failed", "fresh", 1, at);
        assert_eq!(data.provider_status.error_history.len(), 1);
    }

    /// Test that finally failed covers readiness and exhausted tries
    #[test]
    fn test_is_finally_failed() {
        let mut data = data(1, 0);
        data.set_status("failed", "boom", 11, now());
        assert!(!data.is_finally_failed(12));
        data.set_status("failed", "boom", 12, now());
        assert!(data.is_finally_failed(12));

        let mut ready_failed = self::data(1, 0);
        ready_failed.set_status("ok", "install successful", 1, now());
        ready_failed.set_readiness("finallyFailed", now());
        assert!(ready_failed.is_finally_failed(12));
    }

    /// Test that the reconcile annotation is honoured unless noReconcile is set
    #[test]
    fn test_is_reconcile() {
        let mut annotated = item(1, 1);
        annotated.metadata.annotations = Some(BTreeMap::from([(
            labels::ANNOTATION_RECONCILE.to_string(),
            labels::ANNOTATION_RECONCILE_VALUE.to_string(),
        )]));
        let mut data = DeployData::new(annotated).unwrap();
        assert!(data.is_reconcile());

        data.configuration.deployment_config.no_reconcile = true;
        assert!(!data.is_reconcile());
    }

    /// Test that the Ready condition follows the provider status
    #[test]
    fn test_compute_ready_condition() {
        let mut fresh = data(1, 0);
        fresh.compute_ready_condition(now());
        let ready = fresh.ready_condition().unwrap();
        assert_eq!((ready.status.as_str(), ready.reason.as_deref()), ("Unknown", Some("InitialState")));

        let mut running = data(1, 0);
        running.set_status("ok", "install successful", 1, now());
        running.set_readiness("ok", now());
        running.compute_ready_condition(now());
        assert!(running.is_ready());
        assert_eq!(running.item().status.as_ref().unwrap().phase.as_deref(), Some("Succeeded"));

        running.set_readiness("pending", now());
        running.compute_ready_condition(now());
        let ready = running.ready_condition().unwrap();
        assert_eq!(ready.reason.as_deref(), Some("NotRunning"));
        assert_eq!(ready.message.as_deref(), Some("Readiness is pending"));

        running.item.metadata.generation = Some(2);
        running.compute_ready_condition(now());
        assert_eq!(running.ready_condition().unwrap().reason.as_deref(), Some("UpgradePending"));

        running.set_status_for_unreachable_cluster(now());
        running.compute_ready_condition(now());
        assert_eq!(
            running.ready_condition().unwrap().reason.as_deref(),
            Some("ClusterUnreachable")
        );
        assert_eq!(running.conditions().len(), 1, "Ready is replaced, not appended");
    }

    /// Test the Ready condition while an item is removed
    #[test]
    fn test_compute_ready_condition_for_remove() {
        let mut deleting = item(1, 1);
        deleting.metadata.deletion_timestamp = Some(to_time(now()));
        let mut data = DeployData::new(deleting).unwrap();

        data.set_status("failed", "uninstall failed", 1, now());
        data.compute_ready_condition(now());
        assert_eq!(data.ready_condition().unwrap().message.as_deref(), Some("Last try to remove has failed"));
        assert_eq!(data.item().status.as_ref().unwrap().phase.as_deref(), Some("Deleting"));

        data.set_status("ok", "remove successful", 1, now());
        data.compute_ready_condition(now());
        assert_eq!(data.ready_condition().unwrap().reason.as_deref(), Some("Removed"));
    }

    /// Test that the transition time only moves on a real change
    #[test]
    fn test_replace_condition_transition_time() {
        let mut data = data(1, 1);
        data.replace_condition("Ready", "True", "Running", "Running", now());
        let later = now() + ChronoDuration::seconds(30);
        data.replace_condition("Ready", "True", "Running", "Running", later);

        let ready = data.ready_condition().unwrap();
        assert_eq!(ready.last_transition_time, Some(now().to_rfc3339()));
        assert_eq!(ready.last_update_time, Some(later.to_rfc3339()));
    }

    /// Test the worse-state lattice
    #[test]
    fn test_worse_state() {
        assert_eq!(worse_state("ok", "pending"), "pending");
        assert_eq!(worse_state("unknown", "pending"), "unknown");
        assert_eq!(worse_state("failed", "unknown"), "failed");
        assert_eq!(worse_state("failed", "finallyFailed"), "finallyFailed");
        assert_eq!(worse_state("ok", "ok"), "ok");
    }

    /// Test the premature-retry curve
    #[test]
    fn test_calculate_requeue_timeout() {
        assert_eq!(calculate_requeue_timeout(-1), Duration::from_secs(10));
        assert_eq!(calculate_requeue_timeout(0), Duration::from_secs(10));
        assert_eq!(calculate_requeue_timeout(1), Duration::from_secs(20));
        assert_eq!(calculate_requeue_timeout(3), Duration::from_secs(80));
        assert_eq!(calculate_requeue_timeout(8), Duration::from_secs(2560));
        assert_eq!(calculate_requeue_timeout(9), Duration::from_secs(3600));
    }

    /// Test the requeue delays derived from the provider status
    #[test]
    fn test_requeue_delays() {
        let mut data = data(1, 0);
        data.set_status("failed", "boom", 2, now());
        let status = &data.provider_status;

        assert_eq!(
            premature_retry_delay(status, now() + ChronoDuration::seconds(10)),
            Some(Duration::from_secs(30))
        );
        assert_eq!(premature_retry_delay(status, now() + ChronoDuration::seconds(40)), None);

        let unreachable = ProviderStatus {
            reachability: Some(Reachability {
                reachable: false,
                time: Some(to_time(now())),
            }),
            ..Default::default()
        };
        assert_eq!(
            unreachable_requeue_delay(&unreachable, now() + ChronoDuration::seconds(60)),
            Some(Duration::from_secs(240))
        );
        assert_eq!(unreachable_requeue_delay(status, now()), None, "reachable");

        let pending = ProviderStatus {
            readiness: Some(Readiness {
                state: "pending".to_string(),
                time: Some(to_time(now())),
            }),
            ..Default::default()
        };
        assert_eq!(
            not_ready_requeue_delay(&pending, now() + ChronoDuration::seconds(5)),
            Some(Duration::from_secs(10))
        );
        assert_eq!(not_ready_requeue_delay(&pending, now() + ChronoDuration::seconds(15)), None);
    }

    /// Test that the encoded status carries the provider status
    #[test]
    fn test_status_encodes_provider_status() {
        let mut data = data(1, 0);
        data.set_status("ok", "install successful", 1, now());
        data.set_export_secret_name("cb1-echo-export");

        let status = data.status().unwrap();
        let provider = status.provider_status.unwrap();
        assert_eq!(provider["lastOperation"]["state"], "ok");
        assert_eq!(provider["kind"], "HubDeployItemProviderStatus");
        assert_eq!(status.export_reference.unwrap().name, "cb1-echo-export");
    }
}
