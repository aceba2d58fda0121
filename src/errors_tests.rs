// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Unit tests for `errors.rs`

#[cfg(test)]
mod tests {
    use super::super::{is_conflict, is_conflict_anyhow, is_not_found, DeployError};

    fn api_error(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(Box::new(kube::core::Status {
            status: Some(kube::core::response::StatusSummary::Failure),
            message: format!("{reason} happened"),
            reason: reason.to_string(),
            code,
            metadata: None,
            details: None,
        }))
    }

    /// Test that 404 and 409 are classified
    #[test]
    fn test_classification() {
        assert!(is_not_found(&api_error(404, "NotFound")));
        assert!(!is_not_found(&api_error(409, "Conflict")));
        assert!(is_conflict(&api_error(409, "Conflict")));
        assert!(!is_conflict(&api_error(500, "InternalError")));
    }

    /// Test that conflicts are found through anyhow context layers
    #[test]
    fn test_conflict_through_context() {
        let err = anyhow::Error::new(api_error(409, "Conflict")).context("updating item");
        assert!(is_conflict_anyhow(&err), "409 wrapped in context should be detected");

        let other = anyhow::anyhow!("plain failure");
        assert!(!is_conflict_anyhow(&other));
    }

    /// Test that only the unreachable variant reports unreachable
    #[test]
    fn test_unreachable_flag() {
        assert!(DeployError::ClusterUnreachable("timeout".into()).is_cluster_unreachable());
        assert!(!DeployError::Deployer("boom".into()).is_cluster_unreachable());
        assert_eq!(
            DeployError::Config("bad".into()).to_string(),
            "could not parse deployment config: bad"
        );
    }
}
