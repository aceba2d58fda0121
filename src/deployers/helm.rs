// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Helm deployer.
//!
//! Charts are installed with the `helm` binary against a kubeconfig written to a
//! scratch directory. The chart comes either from a chart repository
//! (`catalogAccess`) or from a tarball URL (`tarballAccess`) that is downloaded
//! first.
//!
//! ## Values
//!
//! The values handed to Helm are merged in this order, later sources win:
//!
//! 1. plaintext `values` of the application
//! 2. the legacy secret values block
//! 3. every named secret (each entry decoded as YAML), except the one holding
//!    the tarball credentials
//! 4. the import parameter tree after import substitution

use super::{target, Deployer, DeployerContext, Observation, Rollout};
use crate::constants::{CONFIG_TYPE_HELM, DEFAULT_HELM_TIMEOUT_MINUTES, REBLOCK_EXTRA_SECS};
use crate::deploy_data::DeployData;
use crate::errors::DeployError;
use crate::exports::{self, merge_values};
use crate::readiness::workloads_from_manifest;
use crate::secrets::{decode_legacy_values, decode_named_values};
use crate::synchronize::BlockGuard;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use k8s_openapi::api::core::v1::Secret;
use kube::Api;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Release argument keyword for an atomic install or upgrade
pub const HELM_ARG_ATOMIC: &str = "atomic";

/// Data key of the authorization header in the tarball credentials secret
pub const AUTH_HEADER_KEY: &str = "authHeader";

/// Upper bound of kept revisions on upgrade
const HELM_MAX_HISTORY: u32 = 10;

// ============================================================================
// Type specific data
// ============================================================================

/// Helm part of an application config.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HelmSpecificData {
    #[serde(default)]
    pub install_name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub catalog_access: Option<CatalogAccess>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tarball_access: Option<TarballAccess>,
    /// Minutes; zero or absent means the default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub install_timeout: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upgrade_timeout: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback_timeout: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uninstall_timeout: Option<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub install_arguments: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub update_arguments: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub remove_arguments: Vec<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CatalogAccess {
    #[serde(default)]
    pub repo: String,
    #[serde(default)]
    pub chart_name: String,
    #[serde(default)]
    pub chart_version: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TarballAccess {
    #[serde(default)]
    pub url: String,
    /// Base64 encoded PEM bundle.
    #[serde(default, rename = "customCAData")]
    pub custom_ca_data: String,
    #[serde(default)]
    pub auth_header: String,
    /// Logical name of a named secret holding `authHeader`.
    #[serde(default)]
    pub secret_ref: SecretRef,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SecretRef {
    #[serde(default)]
    pub name: String,
}

fn minutes_or_default(minutes: Option<i64>) -> Duration {
    let minutes = match minutes {
        Some(m) if m > 0 => m,
        _ => DEFAULT_HELM_TIMEOUT_MINUTES,
    };
    Duration::from_secs(u64::try_from(minutes).unwrap_or(0) * 60)
}

impl HelmSpecificData {
    /// Decodes and validates the type specific payload of an item.
    ///
    /// # Errors
    ///
    /// Returns [`DeployError::Config`] for a payload that does not decode or
    /// lacks a required property.
    pub fn parse(raw: &Value) -> Result<Self, DeployError> {
        let data: Self = serde_json::from_value(raw.clone()).map_err(|e| DeployError::Config(e.to_string()))?;
        data.validate().map_err(DeployError::Config)?;
        Ok(data)
    }

    /// Checks the required properties.
    ///
    /// # Errors
    ///
    /// Returns the message naming the first missing property.
    pub fn validate(&self) -> Result<(), String> {
        let missing = |property: &str| Err(format!("property \"{property}\" not found"));
        if self.install_name.is_empty() {
            return missing("installName");
        }
        if self.namespace.is_empty() {
            return missing("namespace");
        }
        if let Some(catalog) = &self.catalog_access {
            if catalog.repo.is_empty() {
                return missing("repo");
            }
            if catalog.chart_name.is_empty() {
                return missing("chartName");
            }
            if catalog.chart_version.is_empty() {
                return missing("chartVersion");
            }
        }
        if let Some(tarball) = &self.tarball_access {
            if tarball.url.is_empty() {
                return missing("url");
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn install_timeout(&self) -> Duration {
        minutes_or_default(self.install_timeout)
    }

    #[must_use]
    pub fn upgrade_timeout(&self) -> Duration {
        minutes_or_default(self.upgrade_timeout)
    }

    #[must_use]
    pub fn rollback_timeout(&self) -> Duration {
        minutes_or_default(self.rollback_timeout)
    }

    #[must_use]
    pub fn uninstall_timeout(&self) -> Duration {
        minutes_or_default(self.uninstall_timeout)
    }

    /// Lease time needed for the operation, the longest timeout plus a minute.
    #[must_use]
    pub fn reblock_duration(&self, install: bool) -> Duration {
        let extra = Duration::from_secs(u64::try_from(REBLOCK_EXTRA_SECS).unwrap_or(60));
        if install {
            self.install_timeout().max(self.upgrade_timeout()) + extra
        } else {
            self.uninstall_timeout() + extra
        }
    }

    /// Logical name of the named secret with the tarball credentials.
    #[must_use]
    pub fn credentials_secret(&self) -> Option<&str> {
        self.tarball_access
            .as_ref()
            .map(|t| t.secret_ref.name.as_str())
            .filter(|name| !name.is_empty())
    }
}

// ============================================================================
// Chart data
// ============================================================================

/// Where the chart is loaded from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChartSource {
    Catalog {
        repo: String,
        chart_name: String,
        chart_version: String,
    },
    Tarball {
        url: String,
        /// Decoded PEM bundle trusted in addition to the system roots.
        custom_ca: Option<String>,
        auth_header: Option<String>,
    },
}

/// Everything the Helm facade needs for one release.
#[derive(Clone, Debug, PartialEq)]
pub struct ChartData {
    pub install_name: String,
    pub namespace: String,
    /// Absent for removals.
    pub source: Option<ChartSource>,
    pub values: Value,
    pub install_timeout: Duration,
    pub upgrade_timeout: Duration,
    pub uninstall_timeout: Duration,
    pub install_arguments: Vec<String>,
    pub update_arguments: Vec<String>,
}

impl ChartData {
    /// Chart data for a removal; no chart and no values are needed.
    #[must_use]
    pub fn for_removal(helm: &HelmSpecificData) -> Self {
        Self {
            install_name: helm.install_name.clone(),
            namespace: helm.namespace.clone(),
            source: None,
            values: Value::Object(serde_json::Map::new()),
            install_timeout: helm.install_timeout(),
            upgrade_timeout: helm.upgrade_timeout(),
            uninstall_timeout: helm.uninstall_timeout(),
            install_arguments: Vec::new(),
            update_arguments: Vec::new(),
        }
    }

    /// Chart data for an install or upgrade.
    ///
    /// # Errors
    ///
    /// Returns [`DeployError::Config`] if no chart source is given or the CA data
    /// does not decode.
    pub fn for_install(helm: &HelmSpecificData, values: Value, auth_header: Option<String>) -> Result<Self, DeployError> {
        let source = if let Some(tarball) = &helm.tarball_access {
            let custom_ca = if tarball.custom_ca_data.is_empty() {
                None
            } else {
                let decoded = BASE64
                    .decode(tarball.custom_ca_data.trim())
                    .map_err(|e| DeployError::Config(format!("could not decode customCAData: {e}")))?;
                Some(String::from_utf8_lossy(&decoded).into_owned())
            };
            ChartSource::Tarball {
                url: tarball.url.clone(),
                custom_ca,
                auth_header,
            }
        } else if let Some(catalog) = &helm.catalog_access {
            ChartSource::Catalog {
                repo: catalog.repo.clone(),
                chart_name: catalog.chart_name.clone(),
                chart_version: catalog.chart_version.clone(),
            }
        } else {
            return Err(DeployError::Config(
                "could not find property catalogAccess or tarballAccess".to_string(),
            ));
        };

        Ok(Self {
            source: Some(source),
            values,
            install_arguments: helm.install_arguments.clone(),
            update_arguments: helm.update_arguments.clone(),
            ..Self::for_removal(helm)
        })
    }
}

/// Merges the value sources of a release in their precedence order.
#[must_use]
pub fn merge_helm_values(
    values: Option<&Value>,
    legacy: Option<&Value>,
    named: &[Value],
    imports: Option<&Value>,
) -> Value {
    let mut merged = values
        .filter(|v| v.is_object())
        .cloned()
        .unwrap_or_else(|| Value::Object(serde_json::Map::new()));
    for overlay in legacy.into_iter().chain(named.iter()).chain(imports) {
        merged = merge_values(&merged, overlay);
    }
    merged
}

// ============================================================================
// Releases
// ============================================================================

/// A Helm release as reported by `helm status`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Release {
    pub name: String,
    pub namespace: String,
    pub status: String,
    pub manifest: String,
}

/// Written into the release description.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseMetadata {
    pub bom_name: String,
}

/// Rollout state of a release.
#[must_use]
pub fn rollout_of(release: &Release) -> Rollout {
    match release.status.as_str() {
        "deployed" => Rollout::Deployed,
        "pending-install" | "pending-upgrade" => Rollout::Pending,
        "failed" => Rollout::Failed,
        other => Rollout::Unknown(other.to_string()),
    }
}

#[must_use]
pub fn is_release_not_found(message: &str) -> bool {
    message.to_lowercase().contains("release: not found")
}

/// Classifies the error output of a failed `helm` call.
#[must_use]
pub fn classify_helm_failure(stderr: &str) -> DeployError {
    let message = stderr.trim();
    let message = message.strip_prefix("Error: ").unwrap_or(message).to_string();
    if message.to_lowercase().contains("kubernetes cluster unreachable") {
        DeployError::ClusterUnreachable(message)
    } else {
        DeployError::Deployer(message)
    }
}

/// Command line flags for the release argument keywords. Unknown keywords are
/// ignored.
#[must_use]
pub fn release_flags(arguments: &[String]) -> Vec<String> {
    arguments
        .iter()
        .filter_map(|argument| match argument.as_str() {
            HELM_ARG_ATOMIC => Some(format!("--{HELM_ARG_ATOMIC}")),
            other => {
                debug!(argument = %other, "Ignoring unsupported helm argument");
                None
            }
        })
        .collect()
}

fn timeout_flag(timeout: Duration) -> String {
    format!("{}s", timeout.as_secs())
}

/// Arguments of `helm install` (or `helm upgrade` for an existing release).
///
/// `chart_ref` is the chart name for repository charts or the path of a
/// downloaded tarball.
#[must_use]
pub fn release_command(chart: &ChartData, chart_ref: &str, values_file: &Path, description: &str, upgrade: bool) -> Vec<String> {
    let verb = if upgrade { "upgrade" } else { "install" };
    let mut args = vec![
        verb.to_string(),
        chart.install_name.clone(),
        chart_ref.to_string(),
        "--namespace".to_string(),
        chart.namespace.clone(),
        "--values".to_string(),
        values_file.display().to_string(),
        "--description".to_string(),
        description.to_string(),
    ];
    if let Some(ChartSource::Catalog { repo, chart_version, .. }) = &chart.source {
        args.extend(["--repo".to_string(), repo.clone(), "--version".to_string(), chart_version.clone()]);
    }
    if upgrade {
        args.extend([
            "--timeout".to_string(),
            timeout_flag(chart.upgrade_timeout),
            "--history-max".to_string(),
            HELM_MAX_HISTORY.to_string(),
        ]);
        args.extend(release_flags(&chart.update_arguments));
    } else {
        args.extend([
            "--timeout".to_string(),
            timeout_flag(chart.install_timeout),
            "--create-namespace".to_string(),
        ]);
        args.extend(release_flags(&chart.install_arguments));
    }
    args
}

#[derive(Deserialize)]
struct StatusOutput {
    name: String,
    #[serde(default)]
    namespace: String,
    info: StatusInfo,
    #[serde(default)]
    manifest: String,
}

#[derive(Deserialize)]
struct StatusInfo {
    #[serde(default)]
    status: String,
}

/// Decodes the output of `helm status -o json`.
///
/// # Errors
///
/// Returns [`DeployError::Deployer`] for output that is not a release.
pub fn parse_release(output: &str) -> Result<Release, DeployError> {
    let status: StatusOutput = serde_json::from_str(output)
        .map_err(|e| DeployError::Deployer(format!("cannot decode helm status: {e}")))?;
    Ok(Release {
        name: status.name,
        namespace: status.namespace,
        status: status.info.status,
        manifest: status.manifest,
    })
}

// ============================================================================
// Facade
// ============================================================================

/// Release operations against a target cluster.
#[async_trait]
pub trait HelmFacade: Send + Sync {
    /// The release of `chart`, `None` if it does not exist.
    async fn get_release(&self, chart: &ChartData, kubeconfig: &str) -> Result<Option<Release>, DeployError>;

    /// Installs the release, or upgrades it if it exists.
    async fn install_or_update(&self, chart: &ChartData, kubeconfig: &str, metadata: &ReleaseMetadata) -> Result<(), DeployError>;

    /// Uninstalls the release. A missing release is not an error.
    async fn remove(&self, chart: &ChartData, kubeconfig: &str) -> Result<(), DeployError>;
}

/// Scratch directory for one helm call, removed on drop.
struct WorkDir {
    path: PathBuf,
}

impl WorkDir {
    async fn create() -> Result<Self, DeployError> {
        let path = std::env::temp_dir().join(format!("potter-helm-{:016x}", rand::random::<u64>()));
        tokio::fs::create_dir_all(&path)
            .await
            .map_err(|e| DeployError::Deployer(format!("cannot create work directory: {e}")))?;
        Ok(Self { path })
    }

    async fn write(&self, name: &str, content: &[u8]) -> Result<PathBuf, DeployError> {
        let file = self.path.join(name);
        tokio::fs::write(&file, content)
            .await
            .map_err(|e| DeployError::Deployer(format!("cannot write {name}: {e}")))?;
        Ok(file)
    }
}

impl Drop for WorkDir {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir_all(&self.path) {
            debug!(path = %self.path.display(), error = %e, "Could not remove work directory");
        }
    }
}

/// [`HelmFacade`] running the `helm` binary.
pub struct HelmCli {
    binary: String,
    helm_driver: Option<String>,
}

impl HelmCli {
    /// `helm_driver` selects the release storage (`HELM_DRIVER`).
    #[must_use]
    pub fn new(helm_driver: Option<String>) -> Self {
        Self {
            binary: "helm".to_string(),
            helm_driver,
        }
    }

    /// Runs helm and returns its standard output.
    async fn run(&self, args: &[String], kubeconfig: &Path) -> Result<String, DeployError> {
        let mut command = Command::new(&self.binary);
        command.args(args).arg("--kubeconfig").arg(kubeconfig);
        if let Some(driver) = &self.helm_driver {
            command.env("HELM_DRIVER", driver);
        }
        debug!(command = %args.first().map_or("", String::as_str), "Running helm");

        let output = command
            .output()
            .await
            .map_err(|e| DeployError::Deployer(format!("failed to execute helm: {e}")))?;
        if !output.status.success() {
            return Err(classify_helm_failure(&String::from_utf8_lossy(&output.stderr)));
        }
        String::from_utf8(output.stdout).map_err(|e| DeployError::Deployer(format!("helm output is not UTF-8: {e}")))
    }

    async fn status(&self, chart: &ChartData, kubeconfig: &Path) -> Result<Option<Release>, DeployError> {
        let args = vec![
            "status".to_string(),
            chart.install_name.clone(),
            "--namespace".to_string(),
            chart.namespace.clone(),
            "--output".to_string(),
            "json".to_string(),
        ];
        match self.run(&args, kubeconfig).await {
            Ok(output) => parse_release(&output).map(Some),
            Err(DeployError::Deployer(message)) if is_release_not_found(&message) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Resolves the chart argument, downloading a tarball into `work_dir`.
    async fn chart_ref(chart: &ChartData, work_dir: &WorkDir) -> Result<String, DeployError> {
        match &chart.source {
            Some(ChartSource::Catalog { chart_name, .. }) => Ok(chart_name.clone()),
            Some(ChartSource::Tarball {
                url,
                custom_ca,
                auth_header,
            }) => {
                let archive = download_chart(url, custom_ca.as_deref(), auth_header.as_deref()).await?;
                let file = work_dir.write("chart.tgz", &archive).await?;
                Ok(file.display().to_string())
            }
            None => Err(DeployError::Config(
                "could not find property catalogAccess or tarballAccess".to_string(),
            )),
        }
    }
}

/// Downloads a chart archive.
async fn download_chart(url: &str, custom_ca: Option<&str>, auth_header: Option<&str>) -> Result<Vec<u8>, DeployError> {
    let fetch_error = |reason: String| DeployError::Deployer(format!("could not fetch chart {url}: {reason}"));

    let mut builder = reqwest::Client::builder();
    if let Some(pem) = custom_ca {
        let certificate = reqwest::Certificate::from_pem(pem.as_bytes())
            .map_err(|e| DeployError::Config(format!("invalid customCAData: {e}")))?;
        builder = builder.add_root_certificate(certificate);
    }
    let client = builder.build().map_err(|e| fetch_error(e.to_string()))?;

    let mut request = client.get(url);
    if let Some(header) = auth_header.filter(|h| !h.is_empty()) {
        request = request.header(reqwest::header::AUTHORIZATION, header);
    }
    let response = request.send().await.map_err(|e| fetch_error(e.to_string()))?;
    if !response.status().is_success() {
        return Err(fetch_error(response.status().to_string()));
    }
    let body = response.bytes().await.map_err(|e| fetch_error(e.to_string()))?;
    Ok(body.to_vec())
}

#[async_trait]
impl HelmFacade for HelmCli {
    async fn get_release(&self, chart: &ChartData, kubeconfig: &str) -> Result<Option<Release>, DeployError> {
        let work_dir = WorkDir::create().await?;
        let kubeconfig = work_dir.write("kubeconfig", kubeconfig.as_bytes()).await?;
        self.status(chart, &kubeconfig).await
    }

    async fn install_or_update(&self, chart: &ChartData, kubeconfig: &str, metadata: &ReleaseMetadata) -> Result<(), DeployError> {
        let work_dir = WorkDir::create().await?;
        let kubeconfig = work_dir.write("kubeconfig", kubeconfig.as_bytes()).await?;

        let upgrade = self.status(chart, &kubeconfig).await?.is_some();
        let chart_ref = Self::chart_ref(chart, &work_dir).await?;
        let values = serde_yaml::to_string(&chart.values)
            .map_err(|e| DeployError::Config(format!("cannot encode values: {e}")))?;
        let values_file = work_dir.write("values.yaml", values.as_bytes()).await?;
        let description = serde_json::to_string(metadata)
            .map_err(|e| DeployError::Deployer(format!("cannot marshal release metadata: {e}")))?;

        let args = release_command(chart, &chart_ref, &values_file, &description, upgrade);
        info!(
            release = %chart.install_name,
            namespace = %chart.namespace,
            upgrade,
            "Installing helm release"
        );
        self.run(&args, &kubeconfig).await.map(|_| ())
    }

    async fn remove(&self, chart: &ChartData, kubeconfig: &str) -> Result<(), DeployError> {
        let work_dir = WorkDir::create().await?;
        let kubeconfig = work_dir.write("kubeconfig", kubeconfig.as_bytes()).await?;

        if self.status(chart, &kubeconfig).await?.is_none() {
            warn!(release = %chart.install_name, namespace = %chart.namespace, "Release could not be found");
            return Ok(());
        }
        let args = vec![
            "uninstall".to_string(),
            chart.install_name.clone(),
            "--namespace".to_string(),
            chart.namespace.clone(),
            "--timeout".to_string(),
            timeout_flag(chart.uninstall_timeout),
        ];
        info!(release = %chart.install_name, namespace = %chart.namespace, "Uninstalling helm release");
        self.run(&args, &kubeconfig).await.map(|_| ())
    }
}

// ============================================================================
// Deployer
// ============================================================================

/// Deploys `helm` application configs.
pub struct HelmDeployer {
    context: DeployerContext,
    facade: Arc<dyn HelmFacade>,
}

impl HelmDeployer {
    #[must_use]
    pub fn new(context: DeployerContext, facade: Arc<dyn HelmFacade>) -> Self {
        Self { context, facade }
    }

    /// The authorization header for a tarball download.
    ///
    /// The `authHeader` entry of the credentials secret wins over the inline header.
    async fn auth_header(&self, data: &DeployData, helm: &HelmSpecificData) -> Result<Option<String>, DeployError> {
        let Some(tarball) = &helm.tarball_access else {
            return Ok(None);
        };
        if let Some(logical_name) = helm.credentials_secret() {
            let secret_name = data
                .configuration
                .deployment_config
                .named_internal_secret_names
                .get(logical_name)
                .map_or(logical_name, String::as_str);
            let secrets: Api<Secret> = Api::namespaced(self.context.client.clone(), &data.key().namespace);
            let secret = secrets.get(secret_name).await?;
            if let Some(header) = secret.data.as_ref().and_then(|d| d.get(AUTH_HEADER_KEY)) {
                return Ok(Some(String::from_utf8_lossy(&header.0).into_owned()));
            }
        }
        Ok(Some(tarball.auth_header.clone()).filter(|h| !h.is_empty()))
    }

    /// Reads the secret value sources and merges all values of the release.
    async fn release_values(&self, data: &DeployData, helm: &HelmSpecificData) -> Result<Value, DeployError> {
        let config = &data.configuration.deployment_config;
        let secrets: Api<Secret> = Api::namespaced(self.context.client.clone(), &data.key().namespace);
        let read_error = |what: String, e: &dyn std::fmt::Display| DeployError::Deployer(format!("{what}: {e}"));

        let legacy = if config.internal_secret_name.is_empty() {
            None
        } else {
            let secret = secrets
                .get(&config.internal_secret_name)
                .await
                .map_err(|e| read_error("could not read secret values".to_string(), &e))?;
            decode_legacy_values(&secret).map_err(|e| read_error("could not unmarshal secret values".to_string(), &e))?
        };

        let excluded = helm.credentials_secret();
        let mut named = Vec::with_capacity(config.named_internal_secret_names.len());
        for (logical_name, secret_name) in &config.named_internal_secret_names {
            if excluded == Some(logical_name.as_str()) {
                continue;
            }
            let secret = secrets
                .get(secret_name)
                .await
                .map_err(|e| read_error(format!("could not read named secret values for {logical_name}"), &e))?;
            named.push(
                decode_named_values(&secret)
                    .map_err(|e| read_error(format!("could not decode named secret values for {logical_name}"), &e))?,
            );
        }

        let imports = match &data.import_values {
            Some(imports) => Some(imports.clone()),
            None => exports::resolve_imports(&self.context.client, data).await?,
        };

        Ok(merge_helm_values(config.values.as_ref(), legacy.as_ref(), &named, imports.as_ref()))
    }

    async fn observe_release(&self, chart: &ChartData, kubeconfig: &str) -> Result<Observation, DeployError> {
        let release = self.facade.get_release(chart, kubeconfig).await?;
        Ok(match release {
            Some(release) => Observation {
                rollout: Some(rollout_of(&release)),
                workloads: workloads_from_manifest(&release.manifest, &chart.namespace),
                ..Default::default()
            },
            None => Observation::default(),
        })
    }
}

#[async_trait]
impl Deployer for HelmDeployer {
    fn config_type(&self) -> &'static str {
        CONFIG_TYPE_HELM
    }

    fn context(&self) -> &DeployerContext {
        &self.context
    }

    async fn preprocess(&self, data: &mut DeployData) {
        match exports::resolve_imports(&self.context.client, data).await {
            Ok(imports) => data.import_values = imports,
            Err(e) => warn!(item = %data.key(), error = %e, "Could not resolve imports"),
        }
    }

    async fn apply(&self, data: &mut DeployData, guard: &BlockGuard) -> Result<Observation, DeployError> {
        let helm = HelmSpecificData::parse(&data.configuration.deployment_config.type_specific_data)?;
        let kubeconfig = target::target_kubeconfig(&self.context.client, &data.target_secret_key()).await?;
        let reblock = |install: bool| {
            let ttl = helm.reblock_duration(install);
            async move {
                guard
                    .reblock(ttl)
                    .await
                    .map_err(|e| DeployError::Deployer(e.to_string()))
            }
        };

        if data.is_delete_operation() {
            let chart = ChartData::for_removal(&helm);
            if !helm.remove_arguments.is_empty() {
                debug!(item = %data.key(), "Remove arguments are not passed to helm uninstall");
            }
            reblock(false).await?;
            self.facade.remove(&chart, &kubeconfig).await?;
            return Ok(Observation::default());
        }

        let auth_header = self.auth_header(data, &helm).await?;
        let values = self.release_values(data, &helm).await?;
        let chart = ChartData::for_install(&helm, values, auth_header)?;
        reblock(true).await?;

        let metadata = ReleaseMetadata {
            bom_name: data.clusterbom_key().name,
        };
        self.facade.install_or_update(&chart, &kubeconfig, &metadata).await?;
        self.observe_release(&chart, &kubeconfig).await
    }

    async fn observe(&self, data: &DeployData) -> Result<Observation, DeployError> {
        let helm = HelmSpecificData::parse(&data.configuration.deployment_config.type_specific_data)?;
        let kubeconfig = target::target_kubeconfig(&self.context.client, &data.target_secret_key()).await?;
        self.observe_release(&ChartData::for_removal(&helm), &kubeconfig).await
    }

    async fn cleanup(&self, _data: &DeployData, _cluster_exists: bool) -> Result<(), DeployError> {
        Ok(())
    }
}

#[cfg(test)]
#[path = "helm_tests.rs"]
mod helm_tests;
