// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Unit tests for `config.rs`

#[cfg(test)]
mod tests {
    use super::super::{
        parse_bool, parse_duration, parse_listen_addr, unknown_config_types, Args,
        AvailabilityCheckConfig, ControllerConfig,
    };
    use crate::errors::ConfigError;
    use crate::keys::NamespacedName;
    use clap::Parser;
    use std::collections::{BTreeSet, HashMap};
    use std::time::Duration;

    const AVAILABILITY_CHECK: &str = r#"{
        "namespace": "garden-avcheck",
        "bomName": "avcheck",
        "secretRef": "avcheck.kubeconfig",
        "installNamespace": "avcheck",
        "tarballUrl": "https://charts/echo-1.0.0.tgz",
        "catalogDefinition": "",
        "changeInterval": "1m",
        "failureThreshold": "2m30s"
    }"#;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    /// Test the flag defaults
    #[test]
    fn test_args_defaults() {
        let args = Args::parse_from(["potter-controller"]);
        assert_eq!(args.metrics_addr, ":8080");
        assert_eq!(args.reconcile_interval_minutes, 60);
        assert_eq!(args.restart_kapp_interval_minutes, 0);
        assert_eq!(args.loglevel, "info");
        assert_eq!(args.configtypes, "helm");
        assert!(!args.enable_leader_election);
        assert!(!args.runs_locally);
        assert!(!args.landscaper_enabled);
        assert!(args.inert_flags().is_empty());
    }

    /// Test that booleans accept both the bare and the `=value` form
    #[test]
    fn test_args_boolean_forms() {
        let args = Args::parse_from([
            "potter-controller",
            "--enable-leader-election",
            "--runs-locally=true",
            "--skip-reconcile=false",
            "--audit-log",
        ]);
        assert!(args.enable_leader_election);
        assert!(args.runs_locally);
        assert!(!args.skip_reconcile);
        assert_eq!(args.inert_flags(), vec!["audit-log"]);
    }

    /// Test that unknown log levels are rejected
    #[test]
    fn test_args_rejects_unknown_loglevel() {
        assert!(Args::try_parse_from(["potter-controller", "--loglevel", "trace"]).is_err());
    }

    /// Test the tracing filter derived from the log flags
    #[test]
    fn test_log_filter() {
        let args = Args::parse_from(["potter-controller", "--loglevel", "warning"]);
        assert_eq!(args.log_filter(), "warn");

        let args = Args::parse_from([
            "potter-controller",
            "--loglevel",
            "error",
            "--extended-log-enabled",
        ]);
        assert_eq!(args.log_filter(), "error,potter_controller=debug");

        let args = Args::parse_from([
            "potter-controller",
            "--loglevel",
            "debug",
            "--extended-log-enabled",
        ]);
        assert_eq!(args.log_filter(), "debug");
    }

    /// Test config type parsing and the unknown type check
    #[test]
    fn test_config_types() {
        let args = Args::parse_from(["potter-controller", "--configtypes", "helm, kapp,,ytt"]);
        let types = args.config_types();
        assert_eq!(
            types,
            BTreeSet::from(["helm".to_string(), "kapp".to_string(), "ytt".to_string()])
        );
        assert_eq!(unknown_config_types(&types), vec!["ytt".to_string()]);
    }

    /// Test listen address parsing
    #[test]
    fn test_parse_listen_addr() {
        assert_eq!(
            parse_listen_addr(":8080").unwrap(),
            "0.0.0.0:8080".parse().unwrap()
        );
        assert_eq!(
            parse_listen_addr("127.0.0.1:9090").unwrap(),
            "127.0.0.1:9090".parse().unwrap()
        );
        assert!(matches!(
            parse_listen_addr("localhost"),
            Err(ConfigError::ListenAddress(_))
        ));
    }

    /// Test duration parsing
    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("10s").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration("1m30s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse_duration("1.5s").unwrap(), Duration::from_millis(1500));
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert!(parse_duration("").is_err());
        assert!(parse_duration("10").is_err());
        assert!(parse_duration("10d").is_err());
        assert!(parse_duration("s").is_err());
    }

    /// Test parsing of a valid availability check
    #[test]
    fn test_availability_check_parse() {
        let config = AvailabilityCheckConfig::parse(AVAILABILITY_CHECK).unwrap();
        assert_eq!(config.bom_name, "avcheck");
        assert_eq!(config.tarball_url, "https://charts/echo-1.0.0.tgz");
        assert_eq!(
            config.clusterbom_key(),
            NamespacedName::new("garden-avcheck", "avcheck")
        );
    }

    /// Test the availability check validation rules
    #[test]
    fn test_availability_check_validation() {
        assert!(matches!(
            AvailabilityCheckConfig::parse("{not json"),
            Err(ConfigError::AvailabilityCheckFormat(_))
        ));

        let missing_ns = AVAILABILITY_CHECK.replace("\"garden-avcheck\"", "\"\"");
        let error = AvailabilityCheckConfig::parse(&missing_ns).unwrap_err();
        assert!(error.to_string().contains("namespace"));

        let short_interval = AVAILABILITY_CHECK.replace("\"1m\"", "\"5s\"");
        let error = AvailabilityCheckConfig::parse(&short_interval).unwrap_err();
        assert!(error.to_string().contains("changeInterval"));

        let short_threshold = AVAILABILITY_CHECK.replace("\"2m30s\"", "\"10s\"");
        let error = AvailabilityCheckConfig::parse(&short_threshold).unwrap_err();
        assert!(error.to_string().contains("failureThreshold"));

        let bad_duration = AVAILABILITY_CHECK.replace("\"1m\"", "\"soon\"");
        assert!(matches!(
            AvailabilityCheckConfig::parse(&bad_duration),
            Err(ConfigError::Duration(_))
        ));
    }

    /// Test environment defaults
    #[test]
    fn test_controller_config_defaults() {
        let config = ControllerConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.pod_namespace, "hub");
        assert_eq!(config.threads_clusterbom_controller, 15);
        assert_eq!(config.threads_state_controller, 35);
        assert_eq!(config.threads_deployment_controller, 35);
        assert!(!config.disable_deploy_preprocess);
        assert!(config.helm_driver.is_none());
        assert!(config.block_exclusions().is_empty());
    }

    /// Test environment overrides and fallbacks
    #[test]
    fn test_controller_config_from_lookup() {
        let config = ControllerConfig::from_lookup(lookup(&[
            ("POD_NAMESPACE", "potter"),
            ("POD_NAME", "potter-0"),
            ("HELM_DRIVER", "configmap"),
            ("MAX_THREADS_STATE_CONTROLLER", "7"),
            ("MAX_THREADS_DEPLOYMENT_CONTROLLER", "many"),
            ("DISABLE_DEPLOY_PREPROCESS", "T"),
            ("AVAILABILITY_CHECK", AVAILABILITY_CHECK),
        ]))
        .unwrap();

        assert_eq!(config.pod_namespace, "potter");
        assert_eq!(config.helm_driver.as_deref(), Some("configmap"));
        assert_eq!(config.threads_state_controller, 7);
        assert_eq!(
            config.threads_deployment_controller, 35,
            "invalid integers fall back to the default"
        );
        assert!(config.disable_deploy_preprocess);
        assert_eq!(
            config.block_exclusions(),
            vec![NamespacedName::new("garden-avcheck", "avcheck")]
        );
        assert!(config.unique_id().starts_with("potter-0-"));
    }

    /// Test that an invalid availability check fails start-up
    #[test]
    fn test_controller_config_invalid_availability_check() {
        let result = ControllerConfig::from_lookup(lookup(&[("AVAILABILITY_CHECK", "{}")]));
        assert!(result.is_err());
    }

    /// Test boolean environment parsing
    #[test]
    fn test_parse_bool() {
        assert_eq!(parse_bool("true"), Some(true));
        assert_eq!(parse_bool("1"), Some(true));
        assert_eq!(parse_bool("FALSE"), Some(false));
        assert_eq!(parse_bool("yes"), None);
    }

    /// Test that instance IDs differ
    #[test]
    fn test_unique_id() {
        let config = ControllerConfig::default();
        assert_ne!(config.unique_id(), config.unique_id());
    }
}
