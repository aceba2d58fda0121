// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Shared context for all controllers.
//!
//! All loops receive an `Arc<Context>` that contains:
//! - the client of the gardener cluster holding `ClusterBom`s and deploy items
//! - the client of the cluster the controller runs in (deletion keys, periodic state)
//! - the per-ClusterBom block, the secret manager and the deployers
//! - settings derived from flags and environment

use crate::config::{Args, ControllerConfig};
use crate::constants::DEFAULT_MAX_NUMBER_OF_TRIES;
use crate::deployers::{DeployerContext, DeployerFactory};
use crate::events::EventPublisher;
use crate::secrets::SecretManager;
use crate::synchronize::BlockObject;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use kube::Client;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Settings that steer the loops.
#[derive(Clone, Debug)]
pub struct Settings {
    /// Project landscaper-managed `ClusterBom`s into installations.
    pub landscaper_enabled: bool,
    pub reconcile_interval_minutes: i64,
    /// 0 disables the kapp-controller restart.
    pub restart_kapp_interval_minutes: i64,
    pub disable_deploy_preprocess: bool,
    /// Namespace of the controller itself.
    pub pod_namespace: String,
    /// Number of failed tries after which an item is finally failed.
    pub max_number_of_tries: i64,
}

impl Settings {
    #[must_use]
    pub fn new(args: &Args, config: &ControllerConfig) -> Self {
        Self {
            landscaper_enabled: args.landscaper_enabled,
            reconcile_interval_minutes: args.reconcile_interval_minutes,
            restart_kapp_interval_minutes: args.restart_kapp_interval_minutes,
            disable_deploy_preprocess: config.disable_deploy_preprocess,
            pod_namespace: config.pod_namespace.clone(),
            max_number_of_tries: DEFAULT_MAX_NUMBER_OF_TRIES,
        }
    }
}

/// Rate limit of the empty-ClusterBom sweep, shared by all workers of one instance.
pub struct SweepSchedule {
    interval: ChronoDuration,
    last: Mutex<Option<DateTime<Utc>>>,
}

impl SweepSchedule {
    #[must_use]
    pub fn new(interval: ChronoDuration) -> Self {
        Self {
            interval,
            last: Mutex::new(None),
        }
    }

    /// Claims the next sweep if it is due. At most one caller per interval gets `true`.
    pub async fn try_claim(&self, now: DateTime<Utc>) -> bool {
        let mut last = self.last.lock().await;
        match *last {
            Some(previous) if previous + self.interval > now => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }
}

/// Shared context passed to all controllers.
pub struct Context {
    /// Client of the cluster holding `ClusterBom`s, deploy items and value secrets
    pub client: Client,

    /// Client of the cluster the controller runs in
    pub hub_client: Client,

    pub settings: Settings,

    /// Per-ClusterBom leases of this instance
    pub block: BlockObject,

    pub secrets: Arc<SecretManager>,

    pub deployers: DeployerFactory,

    pub events: EventPublisher,

    /// Schedule of the empty-ClusterBom sweep of the aggregation loop
    pub empty_sweep: SweepSchedule,
}

impl Context {
    /// Wires the shared collaborators of all loops.
    #[must_use]
    pub fn new(client: Client, hub_client: Client, args: &Args, config: &ControllerConfig) -> Self {
        let settings = Settings::new(args, config);
        let events = EventPublisher::new(client.clone());
        let deployer_context = DeployerContext {
            client: client.clone(),
            events: events.clone(),
        };
        let deployers = DeployerFactory::with_defaults(
            &deployer_context,
            config.helm_driver.clone(),
            settings.reconcile_interval_minutes,
            &args.config_types(),
        );
        let block = BlockObject::new(
            client.clone(),
            config.unique_id(),
            config.block_exclusions(),
            args.runs_locally,
        );
        let secrets = Arc::new(SecretManager::new(
            client.clone(),
            hub_client.clone(),
            &settings.pod_namespace,
        ));

        Self {
            client,
            hub_client,
            settings,
            block,
            secrets,
            deployers,
            events,
            empty_sweep: SweepSchedule::new(ChronoDuration::seconds(
                crate::constants::EMPTY_CLUSTERBOM_SWEEP_SECS,
            )),
        }
    }
}

#[cfg(test)]
#[path = "context_tests.rs"]
mod context_tests;
