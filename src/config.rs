// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Command line flags and environment of the controller binary.
//!
//! Flags keep the names and defaults of the existing deployments, including the
//! Go style `--flag=true` form for booleans. Environment variables are read once
//! at start-up into a [`ControllerConfig`].
//!
//! | Variable | Default | Used for |
//! |---|---|---|
//! | `AVAILABILITY_CHECK` | unset | `ClusterBom` excluded from leases |
//! | `HELM_DRIVER` | unset | storage driver of the Helm deployer |
//! | `MAX_THREADS_CLUSTER_BOM_CONTROLLER` | 15 | projection loop concurrency |
//! | `MAX_THREADS_STATE_CONTROLLER` | 35 | aggregation loop concurrency |
//! | `MAX_THREADS_DEPLOYMENT_CONTROLLER` | 35 | deployment loop concurrency |
//! | `DISABLE_DEPLOY_PREPROCESS` | false | skips import resolution before deploys |
//! | `POD_NAMESPACE` | `hub` | deletion keys, periodic state, kapp-controller pods |
//! | `POD_NAME` | unset | prefix of the controller instance ID |

use crate::constants::{
    DEFAULT_CONFIG_TYPES, DEFAULT_POD_NAMESPACE, DEFAULT_RECONCILE_INTERVAL_MINUTES,
    DEFAULT_THREADS_CLUSTERBOM_CONTROLLER, DEFAULT_THREADS_DEPLOYMENT_CONTROLLER,
    DEFAULT_THREADS_STATE_CONTROLLER,
};
use crate::deployers::DeployerFactory;
use crate::errors::ConfigError;
use crate::keys::NamespacedName;
use clap::{ArgAction, Parser};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::warn;

/// Minimum change interval of the availability check.
const MIN_CHANGE_INTERVAL: Duration = Duration::from_secs(10);

/// Minimum failure threshold of the availability check.
const MIN_FAILURE_THRESHOLD: Duration = Duration::from_secs(15);

/// ClusterBom reconciliation controller
#[derive(Parser, Debug, Clone)]
#[command(name = "potter-controller", version, about, long_about = None)]
pub struct Args {
    /// The address the metric endpoint binds to
    #[arg(long = "metrics-addr", default_value = ":8080")]
    pub metrics_addr: String,

    /// Kubeconfig of the cluster with the app repository resources
    #[arg(long = "apprepo-kubeconfig", default_value = "")]
    pub apprepo_kubeconfig: String,

    /// Kubeconfig of the cluster the controller runs in (only with --runs-locally)
    #[arg(long = "hubcontroller-kubeconfig", default_value = "")]
    pub hubcontroller_kubeconfig: String,

    /// Enable additional logs
    #[arg(long = "extended-log-enabled", action = ArgAction::Set, num_args = 0..=1,
          default_value_t = false, default_missing_value = "true")]
    pub extended_log_enabled: bool,

    /// Project landscaper-managed ClusterBoms into installations
    #[arg(long = "landscaper-enabled", action = ArgAction::Set, num_args = 0..=1,
          default_value_t = false, default_missing_value = "true")]
    pub landscaper_enabled: bool,

    /// Enable token reviewing for the admission webhook
    #[arg(long = "tokenreview-enabled", action = ArgAction::Set, num_args = 0..=1,
          default_value_t = false, default_missing_value = "true")]
    pub tokenreview_enabled: bool,

    /// Issuer for validation of webhook tokens
    #[arg(long = "token-issuer", default_value = "")]
    pub token_issuer: String,

    /// Run the controllers only while holding the leader lease
    #[arg(long = "enable-leader-election", action = ArgAction::Set, num_args = 0..=1,
          default_value_t = false, default_missing_value = "true")]
    pub enable_leader_election: bool,

    /// Local run: disables persistent leases
    #[arg(long = "runs-locally", action = ArgAction::Set, num_args = 0..=1,
          default_value_t = false, default_missing_value = "true")]
    pub runs_locally: bool,

    /// Run without the admission hook
    #[arg(long = "skip-admission-hook", action = ArgAction::Set, num_args = 0..=1,
          default_value_t = false, default_missing_value = "true")]
    pub skip_admission_hook: bool,

    /// Run without the periodic reconcile loop
    #[arg(long = "skip-reconcile", action = ArgAction::Set, num_args = 0..=1,
          default_value_t = false, default_missing_value = "true")]
    pub skip_reconcile: bool,

    /// Interval of the periodic reconcile in minutes
    #[arg(long = "reconcile-interval-minutes", default_value_t = DEFAULT_RECONCILE_INTERVAL_MINUTES)]
    pub reconcile_interval_minutes: i64,

    /// Interval for restarting kapp-controller pods in minutes, 0 disables restarts
    #[arg(long = "restart-kapp-interval-minutes", default_value_t = 0)]
    pub restart_kapp_interval_minutes: i64,

    /// Log level
    #[arg(long = "loglevel", default_value = "info",
          value_parser = ["debug", "info", "warning", "error"])]
    pub loglevel: String,

    /// Supported config types, comma separated
    #[arg(long = "configtypes", default_value = DEFAULT_CONFIG_TYPES)]
    pub configtypes: String,

    /// Enable audit logging
    #[arg(long = "audit-log", action = ArgAction::Set, num_args = 0..=1,
          default_value_t = false, default_missing_value = "true")]
    pub audit_log: bool,
}

impl Args {
    /// Default tracing filter for the `--loglevel` and `--extended-log-enabled` flags.
    #[must_use]
    pub fn log_filter(&self) -> String {
        let level = match self.loglevel.as_str() {
            "debug" => "debug",
            "warning" => "warn",
            "error" => "error",
            _ => "info",
        };
        if self.extended_log_enabled && level != "debug" {
            format!("{level},potter_controller=debug")
        } else {
            level.to_string()
        }
    }

    /// The enabled config types.
    #[must_use]
    pub fn config_types(&self) -> BTreeSet<String> {
        self.configtypes
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// Socket address of the metrics endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the address does not parse.
    pub fn metrics_socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        parse_listen_addr(&self.metrics_addr)
    }

    /// Flags that are accepted but have no effect in this controller.
    #[must_use]
    pub fn inert_flags(&self) -> Vec<&'static str> {
        let mut inert = Vec::new();
        if !self.apprepo_kubeconfig.is_empty() {
            inert.push("apprepo-kubeconfig");
        }
        if self.tokenreview_enabled {
            inert.push("tokenreview-enabled");
        }
        if !self.token_issuer.is_empty() {
            inert.push("token-issuer");
        }
        if self.skip_admission_hook {
            inert.push("skip-admission-hook");
        }
        if self.audit_log {
            inert.push("audit-log");
        }
        inert
    }
}

/// Config types that no deployer implements.
#[must_use]
pub fn unknown_config_types(config_types: &BTreeSet<String>) -> Vec<String> {
    let known = DeployerFactory::known_types();
    config_types
        .iter()
        .filter(|t| !known.contains(&t.as_str()))
        .cloned()
        .collect()
}

/// Parses `host:port`; an empty host (`:8080`) binds all interfaces.
///
/// # Errors
///
/// Returns an error if the address does not parse.
pub fn parse_listen_addr(addr: &str) -> Result<SocketAddr, ConfigError> {
    let full = if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    };
    full.parse()
        .map_err(|_| ConfigError::ListenAddress(addr.to_string()))
}

/// Parses a duration like `90s`, `1m30s` or `1h`.
///
/// # Errors
///
/// Returns an error for an empty string, a missing unit or an unknown unit.
pub fn parse_duration(text: &str) -> Result<Duration, ConfigError> {
    let invalid = || ConfigError::Duration(text.to_string());
    if text.is_empty() {
        return Err(invalid());
    }

    let mut total = Duration::ZERO;
    let mut rest = text;
    while !rest.is_empty() {
        let digits = rest
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .ok_or_else(invalid)?;
        if digits == 0 {
            return Err(invalid());
        }
        let value: f64 = rest[..digits].parse().map_err(|_| invalid())?;
        rest = &rest[digits..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit())
            .unwrap_or(rest.len());
        let seconds = match &rest[..unit_len] {
            "ms" => value / 1000.0,
            "s" => value,
            "m" => value * 60.0,
            "h" => value * 3600.0,
            _ => return Err(invalid()),
        };
        total += Duration::from_secs_f64(seconds);
        rest = &rest[unit_len..];
    }
    Ok(total)
}

/// `AVAILABILITY_CHECK` payload.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AvailabilityCheckConfig {
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub bom_name: String,
    #[serde(default)]
    pub secret_ref: String,
    #[serde(default)]
    pub install_namespace: String,
    #[serde(default, rename = "tarballUrl")]
    pub tarball_url: String,
    #[serde(default)]
    pub catalog_definition: String,
    #[serde(default)]
    pub change_interval: String,
    #[serde(default)]
    pub failure_threshold: String,
}

impl AvailabilityCheckConfig {
    /// Parses and validates the JSON payload.
    ///
    /// # Errors
    ///
    /// Returns an error for malformed JSON, an empty required field or an
    /// interval below its minimum.
    pub fn parse(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| ConfigError::AvailabilityCheckFormat(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let required = [
            ("namespace", &self.namespace),
            ("bomName", &self.bom_name),
            ("secretRef", &self.secret_ref),
            ("installNamespace", &self.install_namespace),
        ];
        if let Some((field, _)) = required.iter().find(|(_, value)| value.is_empty()) {
            return Err(ConfigError::AvailabilityCheckInvalid(format!(
                "{field} must not be empty"
            )));
        }

        if parse_duration(&self.change_interval)? < MIN_CHANGE_INTERVAL {
            return Err(ConfigError::AvailabilityCheckInvalid(format!(
                "changeInterval must be greater than {}s",
                MIN_CHANGE_INTERVAL.as_secs()
            )));
        }
        if parse_duration(&self.failure_threshold)? < MIN_FAILURE_THRESHOLD {
            return Err(ConfigError::AvailabilityCheckInvalid(format!(
                "failureThreshold must be greater than {}s",
                MIN_FAILURE_THRESHOLD.as_secs()
            )));
        }
        Ok(())
    }

    /// Key of the availability check `ClusterBom`.
    #[must_use]
    pub fn clusterbom_key(&self) -> NamespacedName {
        NamespacedName::new(&self.namespace, &self.bom_name)
    }
}

/// Environment of the controller, read once at start-up.
#[derive(Clone, Debug)]
pub struct ControllerConfig {
    pub availability_check: Option<AvailabilityCheckConfig>,
    pub helm_driver: Option<String>,
    pub threads_clusterbom_controller: u16,
    pub threads_state_controller: u16,
    pub threads_deployment_controller: u16,
    pub disable_deploy_preprocess: bool,
    pub pod_namespace: String,
    pub pod_name: Option<String>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            availability_check: None,
            helm_driver: None,
            threads_clusterbom_controller: DEFAULT_THREADS_CLUSTERBOM_CONTROLLER,
            threads_state_controller: DEFAULT_THREADS_STATE_CONTROLLER,
            threads_deployment_controller: DEFAULT_THREADS_DEPLOYMENT_CONTROLLER,
            disable_deploy_preprocess: false,
            pod_namespace: DEFAULT_POD_NAMESPACE.to_string(),
            pod_name: None,
        }
    }
}

impl ControllerConfig {
    /// Reads the process environment.
    ///
    /// # Errors
    ///
    /// Returns an error if `AVAILABILITY_CHECK` is set but invalid.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Reads the environment through `lookup`.
    ///
    /// # Errors
    ///
    /// Returns an error if `AVAILABILITY_CHECK` is set but invalid.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let non_empty = |name: &str| lookup(name).filter(|v| !v.is_empty());

        let availability_check = non_empty("AVAILABILITY_CHECK")
            .map(|json| AvailabilityCheckConfig::parse(&json))
            .transpose()?;

        let threads = |name: &str, default: u16| match lookup(name) {
            Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
                warn!(name = name, value = %raw, "Environment value is not a valid integer, using {default}");
                default
            }),
            None => default,
        };

        Ok(Self {
            availability_check,
            helm_driver: non_empty("HELM_DRIVER"),
            threads_clusterbom_controller: threads(
                "MAX_THREADS_CLUSTER_BOM_CONTROLLER",
                DEFAULT_THREADS_CLUSTERBOM_CONTROLLER,
            ),
            threads_state_controller: threads(
                "MAX_THREADS_STATE_CONTROLLER",
                DEFAULT_THREADS_STATE_CONTROLLER,
            ),
            threads_deployment_controller: threads(
                "MAX_THREADS_DEPLOYMENT_CONTROLLER",
                DEFAULT_THREADS_DEPLOYMENT_CONTROLLER,
            ),
            disable_deploy_preprocess: lookup("DISABLE_DEPLOY_PREPROCESS")
                .and_then(|v| parse_bool(&v))
                .unwrap_or(false),
            pod_namespace: non_empty("POD_NAMESPACE")
                .unwrap_or_else(|| DEFAULT_POD_NAMESPACE.to_string()),
            pod_name: non_empty("POD_NAME"),
        })
    }

    /// `ClusterBom` keys for which leases are trivially acquired.
    #[must_use]
    pub fn block_exclusions(&self) -> Vec<NamespacedName> {
        self.availability_check
            .iter()
            .map(AvailabilityCheckConfig::clusterbom_key)
            .collect()
    }

    /// A fresh ID for this controller instance.
    #[must_use]
    pub fn unique_id(&self) -> String {
        let suffix = rand::random::<u64>();
        match &self.pod_name {
            Some(pod) => format!("{pod}-{suffix:016x}"),
            None => format!("{suffix:016x}"),
        }
    }
}

/// Boolean environment values: `1`, `t`, `true`, `0`, `f`, `false` in any case.
#[must_use]
pub fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "t" | "true" => Some(true),
        "0" | "f" | "false" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod config_tests;
