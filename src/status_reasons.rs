// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Condition types and reasons written by the controller.
//!
//! Reasons are programmatic identifiers in CamelCase that explain why a condition has
//! a particular status.
//!
//! # Example Status
//!
//! ```yaml
//! status:
//!   overallState: failed
//!   conditions:
//!     - type: Ready
//!       status: "False"
//!       reason: FailedApps
//!       message: "Failed applications: echo"
//!     - type: ClusterReachable
//!       status: "True"
//!       reason: ClusterReachable
//!       message: "Cluster reachable"
//! ```

// ============================================================================
// Condition Types
// ============================================================================

/// Ready condition on `ClusterBom`s and deploy items
pub const CONDITION_TYPE_READY: &str = "Ready";

/// Reachability of the target cluster, on `ClusterBom`s
pub const CONDITION_TYPE_CLUSTER_REACHABLE: &str = "ClusterReachable";

// ============================================================================
// Condition Status Values
// ============================================================================

/// Condition status `True`
pub const CONDITION_TRUE: &str = "True";

/// Condition status `False`
pub const CONDITION_FALSE: &str = "False";

/// Condition status `Unknown`
pub const CONDITION_UNKNOWN: &str = "Unknown";

// ============================================================================
// ClusterBom Ready Reasons
// ============================================================================

/// All applications are ready
pub const REASON_ALL_APPS_READY: &str = "AllAppsReady";

/// At least one application failed and at least one is pending
pub const REASON_FAILED_AND_PENDING_APPS: &str = "FailedAndPendingApps";

/// At least one application failed
pub const REASON_FAILED_APPS: &str = "FailedApps";

/// At least one application is pending
pub const REASON_PENDING_APPS: &str = "PendingApps";

/// The `ClusterBom` has no applications and no items
pub const REASON_EMPTY_CLUSTER_BOM: &str = "EmptyClusterBom";

/// The target cluster secret does not exist
pub const REASON_TARGET_CLUSTER_DOES_NOT_EXIST: &str = "TargetClusterDoesNotExist";

// ============================================================================
// ClusterBom Reachability Reasons
// ============================================================================

/// The last call to the target cluster succeeded
pub const REASON_CLUSTER_REACHABLE: &str = "ClusterReachable";

/// The last call to the target cluster failed
pub const REASON_CLUSTER_NOT_REACHABLE: &str = "ClusterNotReachable";

/// No item has reported reachability yet
pub const REASON_CLUSTER_REACHABILITY_UNKNOWN: &str = "ClusterReachabilityUnknown";

/// The target cluster secret does not exist
pub const REASON_CLUSTER_DOES_NOT_EXIST: &str = "ClusterDoesNotExist";

// ============================================================================
// Deploy Item Ready Reasons
// ============================================================================

/// The target cluster could not be reached
pub const REASON_CLUSTER_UNREACHABLE: &str = "ClusterUnreachable";

/// No deployment was executed yet
pub const REASON_INITIAL_STATE: &str = "InitialState";

/// A new generation waits for deployment
pub const REASON_UPGRADE_PENDING: &str = "UpgradePending";

/// The application is deployed and ready
pub const REASON_RUNNING: &str = "Running";

/// The application failed permanently
pub const REASON_FINALLY_FAILED: &str = "FinallyFailed";

/// The application is deployed but not (yet) ready
pub const REASON_NOT_RUNNING: &str = "NotRunning";

/// The deployer has not yet applied the latest spec
pub const REASON_NOT_CURRENT_GENERATION: &str = "NotCurrentGeneration";

/// The application waits for removal
pub const REASON_REMOVE_PENDING: &str = "RemovePending";

/// The application was removed
pub const REASON_REMOVED: &str = "Removed";

/// Export values could not be read from the target cluster
pub const REASON_COULD_NOT_GET_EXPORT: &str = "CouldNotGetExport";

// ============================================================================
// Event Reasons
// ============================================================================

/// Deployment operation succeeded
pub const EVENT_SUCCESSFUL_DEPLOYMENT: &str = "SuccessfulDeployment";

/// Deployment operation failed
pub const EVENT_FAILED_DEPLOYMENT: &str = "FailedDeployment";

/// Target cluster was unreachable during a deployment
pub const EVENT_FAILED_CLUSTER_UNREACHABLE: &str = "FailedClusterUnreachable";

/// An object could not be fetched
pub const EVENT_FAILED_FETCH: &str = "FailedFetch";

/// Item status could not be written
pub const EVENT_FAILED_WRITE_STATE: &str = "FailedWriteState";

/// A readiness job failed
pub const EVENT_FAILED_JOB: &str = "FailedJob";

// ============================================================================
// Helper Functions
// ============================================================================

/// Rank of a condition status under `True < Unknown < False`.
#[must_use]
pub fn condition_status_rank(status: &str) -> u8 {
    match status {
        CONDITION_TRUE => 0,
        CONDITION_UNKNOWN => 1,
        _ => 2,
    }
}

/// The worse of two condition statuses under `True < Unknown < False`.
#[must_use]
pub fn worse_condition_status<'a>(a: &'a str, b: &'a str) -> &'a str {
    if condition_status_rank(b) > condition_status_rank(a) {
        b
    } else {
        a
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worse_condition_status() {
        assert_eq!(worse_condition_status(CONDITION_TRUE, CONDITION_UNKNOWN), CONDITION_UNKNOWN);
        assert_eq!(worse_condition_status(CONDITION_FALSE, CONDITION_UNKNOWN), CONDITION_FALSE);
        assert_eq!(worse_condition_status(CONDITION_TRUE, CONDITION_TRUE), CONDITION_TRUE);
    }
}
