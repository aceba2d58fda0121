// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

#![allow(unexpected_cfgs)]

//! # Potter Controller - ClusterBom reconciliation for Kubernetes
//!
//! The potter controller deploys bundles of applications into target clusters.
//! Users describe the bundle for one cluster as a `ClusterBom`; the controller
//! projects it into one `DeployItem` per application, drives every item to
//! convergence with the Helm or kapp deployer, and folds the outcome back into
//! the `ClusterBom` status.
//!
//! ## Modules
//!
//! - [`crd`] - `ClusterBom`, `DeployItem` and `ClusterBomSync` resource types
//! - [`reconcilers`] - projection, deployment, aggregation and periodic loops
//! - [`deployers`] - Helm and kapp deployers behind one trait
//! - [`synchronize`] - per-`ClusterBom` leases shared by all loops
//! - [`secrets`] - value secrets and their deletion tokens
//! - [`exports`] - export secrets and import resolution between applications
//! - [`readiness`] - readiness of deployed workloads in the target cluster
//! - [`context`] - shared state handed to every reconcile
//! - [`config`] - command line flags and environment
//!
//! ## Example
//!
//! ```rust,no_run
//! use potter_controller::crd::{ApplicationConfig, ClusterBom, ClusterBomSpec};
//!
//! let clusterbom = ClusterBom::new(
//!     "cb1",
//!     ClusterBomSpec {
//!         secret_ref: "tgt.kubeconfig".to_string(),
//!         application_configs: vec![ApplicationConfig {
//!             id: "echo".to_string(),
//!             config_type: "helm".to_string(),
//!             ..Default::default()
//!         }],
//!         auto_delete: None,
//!     },
//! );
//! ```

pub mod config;
pub mod constants;
pub mod context;
pub mod crd;
pub mod deploy_data;
pub mod deployers;
pub mod errors;
pub mod events;
pub mod exports;
pub mod keys;
pub mod labels;
pub mod metrics;
pub mod readiness;
pub mod reconcilers;
pub mod secrets;
pub mod status_reasons;
pub mod synchronize;
pub mod timestamps;

#[cfg(test)]
mod crd_tests;
