// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Access to target clusters through the kubeconfig secrets on the hub cluster.

use crate::constants::KUBECONFIG_KEY;
use crate::errors::DeployError;
use crate::keys::NamespacedName;
use k8s_openapi::api::core::v1::Secret;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Api, Client, Config};

/// Whether the kubeconfig secret of a target cluster exists.
///
/// # Errors
///
/// Returns the API error if the secret cannot be read.
pub async fn target_exists(hub: &Client, key: &NamespacedName) -> Result<bool, kube::Error> {
    let api: Api<Secret> = Api::namespaced(hub.clone(), &key.namespace);
    Ok(api.get_opt(&key.name).await?.is_some())
}

/// Reads the kubeconfig of a target cluster.
///
/// # Errors
///
/// A missing secret is reported as an unreachable cluster, a secret without
/// kubeconfig as a configuration error.
pub async fn target_kubeconfig(hub: &Client, key: &NamespacedName) -> Result<String, DeployError> {
    let api: Api<Secret> = Api::namespaced(hub.clone(), &key.namespace);
    let secret = api
        .get_opt(&key.name)
        .await?
        .ok_or_else(|| DeployError::ClusterUnreachable(format!("target cluster secret {key} does not exist")))?;
    let raw = secret
        .data
        .as_ref()
        .and_then(|d| d.get(KUBECONFIG_KEY))
        .ok_or_else(|| DeployError::Config(format!("secret {key} has no {KUBECONFIG_KEY} entry")))?;
    String::from_utf8(raw.0.clone())
        .map_err(|e| DeployError::Config(format!("kubeconfig in secret {key} is not UTF-8: {e}")))
}

/// Builds a client from a kubeconfig document.
///
/// # Errors
///
/// Returns [`DeployError::Config`] for an unusable kubeconfig.
pub async fn client_from_kubeconfig(kubeconfig: &str) -> Result<Client, DeployError> {
    let parsed = Kubeconfig::from_yaml(kubeconfig)
        .map_err(|e| DeployError::Config(format!("invalid kubeconfig: {e}")))?;
    let config = Config::from_custom_kubeconfig(parsed, &KubeConfigOptions::default())
        .await
        .map_err(|e| DeployError::Config(format!("invalid kubeconfig: {e}")))?;
    Client::try_from(config).map_err(|e| DeployError::Config(format!("cannot build target client: {e}")))
}

/// Client for the target cluster referenced by `key`.
///
/// # Errors
///
/// See [`target_kubeconfig`] and [`client_from_kubeconfig`].
pub async fn target_client(hub: &Client, key: &NamespacedName) -> Result<Client, DeployError> {
    let kubeconfig = target_kubeconfig(hub, key).await?;
    client_from_kubeconfig(&kubeconfig).await
}

/// Classifies an error of a call against a target cluster.
///
/// Answers of the API server are deployer errors, everything else means the
/// cluster could not be reached.
#[must_use]
pub fn classify_target_error(err: kube::Error) -> DeployError {
    match err {
        kube::Error::Api(response) => DeployError::Deployer(format!(
            "{} ({})",
            response.message, response.reason
        )),
        other => DeployError::ClusterUnreachable(other.to_string()),
    }
}
