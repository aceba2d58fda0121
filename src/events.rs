// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Kubernetes Events about applications of a `ClusterBom`.
//!
//! Events are created as `core/v1` objects regarding the parent `ClusterBom`, so
//! `kubectl describe clusterbom` shows the deployment history of all its
//! applications. Publishing is best effort.

use crate::constants::{EVENT_REPORTER, HUB_API_GROUP_VERSION, KIND_CLUSTER_BOM};
use crate::keys::NamespacedName;
use crate::timestamps::{to_micro_time, to_time};
use chrono::Utc;
use k8s_openapi::api::core::v1::{Event, EventSource, ObjectReference};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::PostParams;
use kube::{Api, Client};
use tracing::warn;

pub const EVENT_TYPE_NORMAL: &str = "Normal";
pub const EVENT_TYPE_WARNING: &str = "Warning";

/// Publishes Events through the hub cluster API.
#[derive(Clone)]
pub struct EventPublisher {
    client: Client,
}

/// Builds the Event object. The name is unique per call.
#[must_use]
pub fn build_event(clusterbom: &NamespacedName, event_type: &str, reason: &str, message: &str) -> Event {
    let now = Utc::now();
    let suffix = format!("{:x}", rand::random::<u64>());
    Event {
        metadata: ObjectMeta {
            name: Some(format!("{}.{}", clusterbom.name, &suffix[..suffix.len().min(10)])),
            namespace: Some(clusterbom.namespace.clone()),
            ..Default::default()
        },
        involved_object: ObjectReference {
            api_version: Some(HUB_API_GROUP_VERSION.to_string()),
            kind: Some(KIND_CLUSTER_BOM.to_string()),
            name: Some(clusterbom.name.clone()),
            namespace: Some(clusterbom.namespace.clone()),
            ..Default::default()
        },
        type_: Some(event_type.to_string()),
        reason: Some(reason.to_string()),
        message: Some(message.to_string()),
        count: Some(1),
        first_timestamp: Some(to_time(now)),
        last_timestamp: Some(to_time(now)),
        event_time: Some(to_micro_time(now)),
        reporting_component: Some(EVENT_REPORTER.to_string()),
        reporting_instance: Some(EVENT_REPORTER.to_string()),
        action: Some(reason.to_string()),
        source: Some(EventSource {
            component: Some(EVENT_REPORTER.to_string()),
            host: None,
        }),
        ..Default::default()
    }
}

impl EventPublisher {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Publishes an Event; failures are logged and dropped.
    pub async fn publish(&self, clusterbom: &NamespacedName, event_type: &str, reason: &str, message: &str) {
        let event = build_event(clusterbom, event_type, reason, message);
        let api: Api<Event> = Api::namespaced(self.client.clone(), &clusterbom.namespace);
        if let Err(e) = api.create(&PostParams::default(), &event).await {
            warn!(clusterbom = %clusterbom, reason, error = %e, "Failed to publish event");
        }
    }

    pub async fn success(&self, clusterbom: &NamespacedName, reason: &str, message: &str) {
        self.publish(clusterbom, EVENT_TYPE_NORMAL, reason, message).await;
    }

    pub async fn failure(&self, clusterbom: &NamespacedName, reason: &str, message: &str) {
        self.publish(clusterbom, EVENT_TYPE_WARNING, reason, message).await;
    }
}

#[cfg(test)]
#[path = "events_tests.rs"]
mod events_tests;
