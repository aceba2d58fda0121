// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Classified errors that drive control flow in the reconcilers.
//!
//! Plumbing errors are carried as [`anyhow::Error`]. The types here exist where a
//! caller branches on the kind of failure.

use thiserror::Error;

/// Outcome of a failed deployer call.
#[derive(Debug, Error)]
pub enum DeployError {
    /// The target cluster did not answer. Recorded as `reachability=false`.
    #[error("target cluster unreachable: {0}")]
    ClusterUnreachable(String),

    /// The type specific data or values could not be parsed.
    #[error("could not parse deployment config: {0}")]
    Config(String),

    /// The deployer (Helm, kapp) returned an error.
    #[error("{0}")]
    Deployer(String),

    /// An import could not be resolved.
    #[error("could not resolve import {name}: {reason}")]
    Import { name: String, reason: String },

    /// Kubernetes API error on the hub cluster.
    #[error(transparent)]
    Kube(#[from] kube::Error),
}

impl DeployError {
    /// Whether the failure should be treated as an unreachable target cluster.
    #[must_use]
    pub fn is_cluster_unreachable(&self) -> bool {
        matches!(self, Self::ClusterUnreachable(_))
    }
}

/// Errors of the lease layer.
#[derive(Debug, Error)]
pub enum BlockError {
    #[error("reblock failed; wrong id (blocked by {owner})")]
    WrongOwner { owner: String },

    #[error("reblock failed; block is expired")]
    Expired,

    #[error(transparent)]
    Kube(#[from] kube::Error),
}

/// Errors of the secret manager.
#[derive(Debug, Error)]
pub enum SecretError {
    #[error("deletion key secret {0} has no usable key")]
    MissingDeletionKey(String),

    #[error("secret {0} does not carry our deletion token")]
    TokenMismatch(String),

    #[error("unknown secret values operation {0:?}")]
    UnknownOperation(String),

    #[error("could not decode secret value {key}: {reason}")]
    Decode { key: String, reason: String },

    #[error(transparent)]
    Kube(#[from] kube::Error),
}

/// Invalid start-up configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot parse AVAILABILITY_CHECK: {0}")]
    AvailabilityCheckFormat(String),

    #[error("invalid AVAILABILITY_CHECK: {0}")]
    AvailabilityCheckInvalid(String),

    #[error("invalid duration {0:?}")]
    Duration(String),

    #[error("invalid listen address {0:?}")]
    ListenAddress(String),
}

/// Returns `true` for an HTTP 404 from the API server.
#[must_use]
pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(api_err) if api_err.code == 404)
}

/// Returns `true` for an HTTP 409 (optimistic concurrency conflict or already exists).
#[must_use]
pub fn is_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(api_err) if api_err.code == 409)
}

/// Returns `true` if the chain of an [`anyhow::Error`] contains a 409.
#[must_use]
pub fn is_conflict_anyhow(err: &anyhow::Error) -> bool {
    err.chain()
        .any(|cause| cause.downcast_ref::<kube::Error>().is_some_and(is_conflict))
}

#[cfg(test)]
#[path = "errors_tests.rs"]
mod errors_tests;
