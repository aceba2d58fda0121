// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Global constants for the potter controller.
//!
//! This module contains all numeric and string constants used throughout the codebase.
//! Constants are organized by category for easy maintenance.

// ============================================================================
// API Constants
// ============================================================================

/// API version of the hub resources (`ClusterBom`, `ClusterBomSync`)
pub const HUB_API_GROUP_VERSION: &str = "hub.k8s.sap.com/v1";

/// API group of deploy items and installations
pub const LANDSCAPER_API_GROUP: &str = "landscaper.gardener.cloud";

/// API version of deploy items and installations
pub const LANDSCAPER_API_VERSION: &str = "v1alpha1";

/// Kind name for `ClusterBom` resource
pub const KIND_CLUSTER_BOM: &str = "ClusterBom";

/// Kind name for `DeployItem` resource
pub const KIND_DEPLOY_ITEM: &str = "DeployItem";

/// Kind name for landscaper `Installation` resource
pub const KIND_INSTALLATION: &str = "Installation";

/// Plural name for landscaper `Installation` resource
pub const INSTALLATION_PLURAL: &str = "installations";

/// Kind name for `ClusterBomSync` resource (the per-ClusterBom lease)
pub const KIND_CLUSTER_BOM_SYNC: &str = "ClusterBomSync";

/// Kind of the configuration object embedded in a deploy item
pub const DEPLOY_ITEM_CONFIG_KIND: &str = "HubDeployItemConfiguration";

/// API group of kapp-controller
pub const KAPP_API_GROUP: &str = "kappctrl.k14s.io";

/// API version of kapp-controller apps
pub const KAPP_API_VERSION: &str = "v1alpha1";

/// Kind name for kapp-controller `App` resource
pub const KIND_KAPP_APP: &str = "App";

/// Plural name for kapp-controller `App` resource
pub const KAPP_APP_PLURAL: &str = "apps";

// ============================================================================
// Config Types and Operations
// ============================================================================

/// Config type for Helm charts
pub const CONFIG_TYPE_HELM: &str = "helm";

/// Config type for kapp-controller apps
pub const CONFIG_TYPE_KAPP: &str = "kapp";

/// Default value of `--configtypes`
pub const DEFAULT_CONFIG_TYPES: &str = "helm";

/// Operation recorded when an application is installed or updated
pub const OPERATION_INSTALL: &str = "install";

/// Operation recorded when an application is removed
pub const OPERATION_REMOVE: &str = "remove";

/// Finalizer set on deploy items and `ClusterBom`s by this controller
pub const HUB_CONTROLLER_FINALIZER: &str = "hub-controller";

// ============================================================================
// Item and Readiness States
// ============================================================================

/// Operation or readiness succeeded
pub const STATE_OK: &str = "ok";

/// Operation or readiness is still in progress
pub const STATE_PENDING: &str = "pending";

/// Operation or readiness failed
pub const STATE_FAILED: &str = "failed";

/// No reliable information available
pub const STATE_UNKNOWN: &str = "unknown";

/// Readiness does not apply (e.g. after a remove)
pub const STATE_NOT_RELEVANT: &str = "notRelevant";

/// Readiness failed permanently; no further retries
pub const STATE_FINALLY_FAILED: &str = "finallyFailed";

/// Deploy item phase while an operation or readiness is outstanding
pub const PHASE_PROGRESSING: &str = "Progressing";

/// Deploy item phase after a successful, ready operation
pub const PHASE_SUCCEEDED: &str = "Succeeded";

/// Deploy item phase after a final failure
pub const PHASE_FAILED: &str = "Failed";

/// Deploy item phase while a failed remove is retried
pub const PHASE_DELETING: &str = "Deleting";

/// Kind of the provider status embedded in a deploy item status
pub const PROVIDER_STATUS_KIND: &str = "HubDeployItemProviderStatus";

/// Description written when the target cluster secret is gone
pub const TEXT_SHOOT_NOT_EXISTING: &str = "shoot cluster does not exist";

// ============================================================================
// Lease (ClusterBomSync) Timing
// ============================================================================

/// Default lease duration for a reconcile (5 minutes)
pub const BLOCK_DURATION_SECS: i64 = 300;

/// Grace period after lease expiry before another owner may take over (1 minute)
pub const BLOCK_GRACE_SECS: i64 = 60;

/// Extra wait added to the retry hint when the lease is held by someone else
pub const BLOCK_TAKEOVER_SLACK_SECS: i64 = 5;

/// Minimum retry hint when the lease is held by someone else
pub const BLOCK_MIN_RETRY_SECS: i64 = 1;

/// Retry hint after a failed lease update (conflict)
pub const BLOCK_CONFLICT_RETRY_SECS: u64 = 10;

/// Retry hint after an error reading or creating the lease
pub const BLOCK_ERROR_RETRY_SECS: u64 = 1;

/// Maximum wait for the in-process mutex of a key before giving up
pub const BLOCK_LOCAL_WAIT_SECS: u64 = 2;

/// Retry hint when the in-process mutex of a key is busy
pub const BLOCK_LOCAL_RETRY_SECS: u64 = 5;

/// Extra lease time added to deployer timeouts before long running operations
pub const REBLOCK_EXTRA_SECS: i64 = 60;

/// Age past expiry after which an orphaned lease is removed (5 hours)
pub const STALE_BLOCK_AGE_SECS: i64 = 5 * 3600;

// ============================================================================
// Retry and Requeue Timing
// ============================================================================

/// First premature-retry delay for failed operations
pub const REQUEUE_BASE_SECS: u64 = 10;

/// Upper bound of the premature-retry delay (1 hour)
pub const REQUEUE_MAX_SECS: u64 = 3600;

/// Number of tries after which the retry delay is pinned to the upper bound
pub const REQUEUE_MAX_EXPONENT: i64 = 8;

/// Default number of tries after which a failed item is finally failed
pub const DEFAULT_MAX_NUMBER_OF_TRIES: i64 = 12;

/// Delay between readiness checks of a pending install
pub const READINESS_REQUEUE_SECS: i64 = 15;

/// Back-off after an unreachable target cluster was observed
pub const UNREACHABLE_BACKOFF_SECS: i64 = 300;

/// Requeue while a deactivation or reactivation is in progress
pub const DEACTIVATION_REQUEUE_SECS: u64 = 3;

/// Number of attempts when an update hits an optimistic-concurrency conflict
pub const CONFLICT_RETRY_ATTEMPTS: u32 = 10;

/// Spacing between conflict retries
pub const CONFLICT_RETRY_INTERVAL_SECS: u64 = 1;

/// Requeue after a reconcile error
pub const ERROR_POLICY_REQUEUE_SECS: u64 = 30;

/// Requeue when the target cluster secret is missing
pub const MISSING_TARGET_REQUEUE_SECS: u64 = 60;

/// Number of failures kept in the error history of an item
pub const ERROR_HISTORY_SIZE: usize = 5;

/// Default Helm timeout in minutes for install, upgrade, rollback and uninstall
pub const DEFAULT_HELM_TIMEOUT_MINUTES: i64 = 5;

/// Attempts when waiting for a kapp `App` to disappear
pub const KAPP_DELETE_WAIT_ATTEMPTS: u32 = 5;

/// Spacing between checks when waiting for a kapp `App` to disappear
pub const KAPP_DELETE_WAIT_SECS: u64 = 3;

// ============================================================================
// Secrets
// ============================================================================

/// Age after which unreferenced value secrets may be garbage collected (1 hour)
pub const SECRET_GC_GRACE_SECS: i64 = 3600;

/// Name of the secret holding the deletion keys (in the controller namespace)
pub const DELETION_KEY_SECRET_NAME: &str = "secret-private-keys";

/// Data key of the primary deletion key
pub const DELETION_KEY_DATA_KEY: &str = "secretDeletionKey";

/// Data key of the secondary deletion key (used during key rotation)
pub const DELETION_KEY_SECONDARY_DATA_KEY: &str = "secretDeletionKeyOld";

/// Data key holding the deletion token on a value secret
pub const DELETION_TOKEN_KEY: &str = "deletionToken";

/// Data key of the legacy single secret-values block
pub const SECRET_VALUES_KEY: &str = "secretValues";

/// Data key holding the serialised export values
pub const EXPORT_DATA_KEY: &str = "config";

/// Data key of the kubeconfig in the target cluster secret
pub const KUBECONFIG_KEY: &str = "kubeconfig";

// ============================================================================
// Periodic Driver
// ============================================================================

/// Name of the config map holding the periodic driver state
pub const PERIODIC_STATE_CONFIGMAP: &str = "reconcilemap";

/// Default interval between periodic reconciles (minutes)
pub const DEFAULT_RECONCILE_INTERVAL_MINUTES: i64 = 60;

/// Delay before retrying after the periodic state object was created
pub const PERIODIC_INITIAL_DELAY_SECS: u64 = 10;

/// Pause between two stamped `ClusterBom`s
pub const PERIODIC_PACING_SECS: u64 = 10;

/// Pause after losing the periodic lease
pub const PERIODIC_LOCK_RETRY_SECS: u64 = 300;

/// Duration of the periodic lease, renewed between `ClusterBom`s
pub const PERIODIC_BLOCK_DURATION_SECS: i64 = 600;

/// Interval between empty-ClusterBom sweeps (1 hour)
pub const EMPTY_CLUSTERBOM_SWEEP_SECS: i64 = 3600;

/// Pod name prefix of the kapp-controller restarted by the periodic driver
pub const KAPP_CONTROLLER_POD_PREFIX: &str = "kapp-controller";

// ============================================================================
// Controller Runtime
// ============================================================================

/// Default namespace of the controller when `POD_NAMESPACE` is not set
pub const DEFAULT_POD_NAMESPACE: &str = "hub";

/// Default worker count of the projection loop
pub const DEFAULT_THREADS_CLUSTERBOM_CONTROLLER: u16 = 15;

/// Default worker count of the aggregation loop
pub const DEFAULT_THREADS_STATE_CONTROLLER: u16 = 35;

/// Default worker count of the deployment loop
pub const DEFAULT_THREADS_DEPLOYMENT_CONTROLLER: u16 = 35;

/// Tokio worker threads
pub const TOKIO_WORKER_THREADS: usize = 4;

/// Name of the leader election lease
pub const LEADER_LEASE_NAME: &str = "potter-controller-leader";

/// Leader lease duration in seconds
pub const LEADER_LEASE_DURATION_SECS: u64 = 15;

/// Leader lease grace period in seconds
pub const LEADER_LEASE_GRACE_SECS: u64 = 5;

/// Reporter name used for Kubernetes events
pub const EVENT_REPORTER: &str = "potter-controller";
