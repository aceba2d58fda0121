// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Unit tests for `deployment.rs`

#[cfg(test)]
mod tests {
    use super::super::{next_step, Step};
    use crate::constants::{STATE_FAILED, STATE_FINALLY_FAILED, STATE_OK, STATE_PENDING};
    use crate::crd::{DeployItem, DeployItemSpec};
    use crate::deploy_data::{DeployData, DeployItemConfiguration, DeploymentConfig};
    use crate::labels::{self, ANNOTATION_RECONCILE, ANNOTATION_RECONCILE_VALUE};
    use chrono::{DateTime, TimeZone, Utc};
    use crate::timestamps::to_time;
    use serde_json::json;
    use std::collections::BTreeMap;

    const MAX_TRIES: i64 = 12;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn item(generation: i64) -> DeployItem {
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
        item
    }

    /// Data whose last operation at generation 1 ended in `state` after `tries` tries
    fn processed(state: &str, tries: i64) -> DeployData {
        let mut data = DeployData::new(item(1)).unwrap();
        data.set_status(state, "done", tries, now());
        data
    }

    fn reprocess(data: &DeployData, item: DeployItem) -> DeployData {
        let mut item = item;
        item.status = Some(data.status().unwrap());
        DeployData::new(item).unwrap()
    }

    /// Test that an unobserved generation is processed as new operation
    #[test]
    fn test_next_step_new_generation() {
        let data = DeployData::new(item(1)).unwrap();
        assert_eq!(next_step(&data, MAX_TRIES), Step::New);

        let upgraded = reprocess(&processed(STATE_OK, 1), item(2));
        assert_eq!(next_step(&upgraded, MAX_TRIES), Step::New);
    }

    /// Test that a deletion without a remove yet is a new operation
    #[test]
    fn test_next_step_deletion() {
        let mut deleting = item(1);
        deleting.metadata.deletion_timestamp = Some(to_time(now()));
        let data = reprocess(&processed(STATE_OK, 1), deleting);
        assert_eq!(next_step(&data, MAX_TRIES), Step::New);
    }

    /// Test that a successful remove only needs hub side cleanup
    #[test]
    fn test_next_step_removed() {
        let mut deleting = item(1);
        deleting.metadata.deletion_timestamp = Some(to_time(now()));
        let mut data = DeployData::new(deleting.clone()).unwrap();
        data.set_status(STATE_OK, "remove successful", 1, now());
        let data = reprocess(&data, deleting);
        assert_eq!(next_step(&data, MAX_TRIES), Step::Removed);
    }

    /// Test that failures are retried until the tries run out
    #[test]
    fn test_next_step_failed() {
        let data = reprocess(&processed(STATE_FAILED, 3), item(1));
        assert_eq!(next_step(&data, MAX_TRIES), Step::Retry);

        let data = reprocess(&processed(STATE_FAILED, MAX_TRIES), item(1));
        assert_eq!(next_step(&data, MAX_TRIES), Step::FinallyFailed);
    }

    /// Test that a finally failed readiness stops processing
    #[test]
    fn test_next_step_finally_failed_readiness() {
        let mut data = processed(STATE_OK, 1);
        data.set_readiness(STATE_FINALLY_FAILED, now());
        let data = reprocess(&data, item(1));
        assert_eq!(next_step(&data, MAX_TRIES), Step::FinallyFailed);
    }

    /// Test that an install without ok readiness is polled
    #[test]
    fn test_next_step_pending() {
        let mut data = processed(STATE_OK, 1);
        data.set_readiness(STATE_PENDING, now());
        data.compute_ready_condition(now());
        let data = reprocess(&data, item(1));
        assert_eq!(next_step(&data, MAX_TRIES), Step::Pending);
    }

    /// Test that a ready install is converged unless a reconcile is requested
    #[test]
    fn test_next_step_converged_and_reconcile() {
        let mut data = processed(STATE_OK, 1);
        data.set_readiness(STATE_OK, now());
        data.compute_ready_condition(now());
        assert!(data.is_ready());
        let converged = reprocess(&data, item(1));
        assert_eq!(next_step(&converged, MAX_TRIES), Step::Converged);

        let mut annotated = item(1);
        annotated.metadata.annotations = Some(BTreeMap::from([(
            ANNOTATION_RECONCILE.to_string(),
            ANNOTATION_RECONCILE_VALUE.to_string(),
        )]));
        let reconcile = reprocess(&data, annotated);
        assert_eq!(next_step(&reconcile, MAX_TRIES), Step::Reconcile);
    }
}
