// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Unit tests for `status.rs`

#[cfg(test)]
mod tests {
    use crate::crd::{
        ApplicationState, ClusterBom, ClusterBomSpec, ClusterBomStatus, Condition, DetailedState,
        LastOperation,
    };
    use crate::reconcilers::status::{
        carry_forward_transition_times, clusterbom_status_equal, condition_changed,
        condition_status, conditions_equal, create_condition, find_condition,
        null_removed_fields, status_patch, ClusterBomStatusUpdater,
    };
    use chrono::Utc;
    use serde_json::json;

    const READY: &str = "Ready";
    const REACHABLE: &str = "ClusterReachable";

    fn with_times(mut condition: Condition, time: &str) -> Condition {
        condition.last_update_time = Some(time.to_string());
        condition.last_transition_time = Some(time.to_string());
        condition
    }

    fn status_with(state: &str, op_time: &str) -> ClusterBomStatus {
        ClusterBomStatus {
            observed_generation: 3,
            overall_state: state.to_string(),
            overall_time: Some(op_time.to_string()),
            overall_num_of_deployments: 1,
            overall_num_of_ready_deployments: 1,
            overall_progress: 100,
            description: None,
            conditions: vec![with_times(
                create_condition(READY, "True", "AllAppsReady", "All applications are ready", Utc::now()),
                op_time,
            )],
            application_states: vec![ApplicationState {
                id: "echo".to_string(),
                state: state.to_string(),
                detailed_state: DetailedState {
                    current_operation_time: Some(op_time.to_string()),
                    last_operation: LastOperation {
                        operation: "install".to_string(),
                        state: "ok".to_string(),
                        number_of_tries: 1,
                        success_generation: 2,
                        ..Default::default()
                    },
                    generation: 2,
                    observed_generation: 2,
                    ..Default::default()
                },
            }],
        }
    }

    #[test]
    fn test_create_condition_basic() {
        let condition = create_condition(READY, "True", "AllAppsReady", "All applications are ready", Utc::now());

        assert_eq!(condition.r#type, READY);
        assert_eq!(condition.status, "True");
        assert_eq!(condition.reason.as_deref(), Some("AllAppsReady"));
        assert_eq!(condition.message.as_deref(), Some("All applications are ready"));
        assert_eq!(
            condition.last_update_time, condition.last_transition_time,
            "a fresh condition has equal update and transition times"
        );
    }

    #[test]
    fn test_condition_changed() {
        let existing = create_condition(READY, "True", "AllAppsReady", "ok", Utc::now());

        assert!(condition_changed(None, &existing), "missing condition counts as changed");
        assert!(!condition_changed(
            Some(&existing),
            &with_times(existing.clone(), "2020-01-01T00:00:00Z")
        ));
        assert!(condition_changed(
            Some(&existing),
            &create_condition(READY, "False", "AllAppsReady", "ok", Utc::now())
        ));
        assert!(
            condition_changed(
                Some(&existing),
                &create_condition(READY, "True", "PendingApps", "ok", Utc::now())
            ),
            "a reason change is a change"
        );
        assert!(condition_changed(
            Some(&existing),
            &create_condition(READY, "True", "AllAppsReady", "other", Utc::now())
        ));
    }

    #[test]
    fn test_find_condition_and_status() {
        let conditions = vec![
            create_condition(READY, "False", "FailedApps", "Failed applications: echo", Utc::now()),
            create_condition(REACHABLE, "True", "ClusterReachable", "Cluster reachable", Utc::now()),
        ];

        assert_eq!(find_condition(&conditions, REACHABLE).map(|c| c.status.as_str()), Some("True"));
        assert_eq!(condition_status(&conditions, READY), "False");
        assert_eq!(condition_status(&conditions, "Other"), "Unknown");
        assert_eq!(condition_status(&[], READY), "Unknown");
    }

    #[test]
    fn test_carry_forward_transition_times() {
        let old_time = "2020-01-01T00:00:00Z";
        let old = vec![
            with_times(create_condition(READY, "True", "AllAppsReady", "ok", Utc::now()), old_time),
            with_times(create_condition(REACHABLE, "True", "ClusterReachable", "ok", Utc::now()), old_time),
        ];
        let mut new = vec![
            create_condition(READY, "True", "AllAppsReady", "ok", Utc::now()),
            create_condition(REACHABLE, "False", "ClusterNotReachable", "gone", Utc::now()),
        ];

        carry_forward_transition_times(&old, &mut new);

        assert_eq!(new[0].last_transition_time.as_deref(), Some(old_time));
        assert_ne!(
            new[1].last_transition_time.as_deref(),
            Some(old_time),
            "a changed condition gets a new transition time"
        );
    }

    #[test]
    fn test_conditions_equal_ignores_order_and_times() {
        let a = vec![
            with_times(create_condition(READY, "True", "AllAppsReady", "ok", Utc::now()), "2020-01-01T00:00:00Z"),
            create_condition(REACHABLE, "True", "ClusterReachable", "ok", Utc::now()),
        ];
        let b = vec![
            create_condition(REACHABLE, "True", "ClusterReachable", "ok", Utc::now()),
            create_condition(READY, "True", "AllAppsReady", "ok", Utc::now()),
        ];
        assert!(conditions_equal(&a, &b));
        assert!(!conditions_equal(&a, &b[..1]));

        let c = vec![
            create_condition(REACHABLE, "True", "ClusterReachable", "ok", Utc::now()),
            create_condition(READY, "False", "FailedApps", "Failed applications: echo", Utc::now()),
        ];
        assert!(!conditions_equal(&a, &c));
    }

    #[test]
    fn test_status_equal_ignores_moving_timestamps() {
        let current = status_with("ok", "2020-01-01T00:00:00Z");
        let recomputed = status_with("ok", "2024-05-01T12:00:00Z");
        assert!(clusterbom_status_equal(&current, &recomputed));

        let failed = status_with("failed", "2020-01-01T00:00:00Z");
        assert!(!clusterbom_status_equal(&current, &failed));

        let mut other_op = current.clone();
        other_op.application_states[0].detailed_state.last_operation.number_of_tries = 2;
        assert!(!clusterbom_status_equal(&current, &other_op));
    }

    #[test]
    fn test_status_updater_has_changes() {
        let mut clusterbom = ClusterBom::new("cb1", ClusterBomSpec::default());
        clusterbom.metadata.namespace = Some("ns1".to_string());

        let mut updater = ClusterBomStatusUpdater::new(&clusterbom);
        assert!(updater.has_changes(), "a missing status must be written");

        clusterbom.status = Some(status_with("ok", "2020-01-01T00:00:00Z"));
        let mut updater = ClusterBomStatusUpdater::new(&clusterbom);
        assert!(!updater.has_changes());

        updater.set_status(status_with("ok", "2024-05-01T12:00:00Z"));
        assert!(!updater.has_changes(), "only timestamps moved");
        assert_eq!(
            updater.status().conditions[0].last_transition_time.as_deref(),
            Some("2020-01-01T00:00:00Z"),
            "transition time is carried forward"
        );

        updater.set_status(status_with("pending", "2024-05-01T12:00:00Z"));
        assert!(updater.has_changes());
    }

    /// Test that fields missing from the new status are removed by the patch
    #[test]
    fn test_null_removed_fields() {
        let old = json!({"phase": "Failed", "providerStatus": {"readiness": {"state": "ok"}, "lastOperation": {"state": "ok"}}});
        let new = json!({"providerStatus": {"lastOperation": {"state": "failed"}}});
        assert_eq!(
            null_removed_fields(&old, &new),
            json!({"phase": null, "providerStatus": {"readiness": null, "lastOperation": {"state": "failed"}}})
        );

        let arrays = null_removed_fields(&json!({"c": [1, 2]}), &json!({"c": [3]}));
        assert_eq!(arrays, json!({"c": [3]}), "arrays are replaced");
    }

    /// Test that the status patch carries the resource version
    #[test]
    fn test_status_patch() {
        let patch = status_patch(None, &json!({"overallState": "ok"}), Some("42"));
        assert_eq!(patch["metadata"]["resourceVersion"], "42");
        assert_eq!(patch["status"]["overallState"], "ok");

        let patch = status_patch(Some(&json!({"description": "x"})), &json!({}), None);
        assert!(patch.get("metadata").is_none());
        assert_eq!(patch["status"], json!({"description": null}));
    }
}
