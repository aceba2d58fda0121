// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Secret values of application configs.
//!
//! Every block of secret values (the legacy `secretValues` block and each entry of
//! `namedSecretValues`) is stored in its own secret. A changed block always gets a
//! fresh secret name, so the projected item changes and gets re-deployed.
//!
//! Value secrets are only deleted after a deletion token was written into them:
//! `hex(HMAC-SHA256(deletionKey, secretName))` under data key `deletionToken`. The
//! deletion keys live in the `secret-private-keys` secret of the controller
//! namespace; the secondary key is used while keys are rotated.

use crate::constants::{
    DELETION_KEY_DATA_KEY, DELETION_KEY_SECONDARY_DATA_KEY, DELETION_KEY_SECRET_NAME,
    DELETION_TOKEN_KEY, SECRET_GC_GRACE_SECS, SECRET_VALUES_KEY,
};
use crate::crd::{NamedSecretValues, SecretValues};
use crate::errors::{is_not_found, SecretError};
use crate::keys::random_secret_name;
use crate::labels;
use crate::metrics;
use crate::timestamps::from_time;
use base64::Engine;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use hmac::{Hmac, Mac};
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kube::api::{DeleteParams, ListParams, PostParams, Preconditions};
use kube::{Api, Client, ResourceExt};
use serde_json::Value;
use sha2::Sha256;
use std::collections::{BTreeMap, BTreeSet};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

type HmacSha256 = Hmac<Sha256>;

/// Secret operation: write new content, replacing the current one.
pub const OPERATION_REPLACE: &str = "replace";

/// Secret operation: keep the currently referenced secret.
pub const OPERATION_KEEP: &str = "keep";

/// Secret operation: drop the reference.
pub const OPERATION_DELETE: &str = "delete";

/// Content of a value secret, keyed like its data entries.
pub type SecretContent = BTreeMap<String, Vec<u8>>;

/// Token proving that the holder of the deletion key asked for the deletion.
#[must_use]
pub fn deletion_token(key: &[u8], secret_name: &str) -> String {
    // HMAC accepts keys of any length
    let mut mac = match HmacSha256::new_from_slice(key) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(secret_name.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Whether `secret` carries `expected` as its deletion token.
#[must_use]
pub fn token_matches(secret: &Secret, expected: &str) -> bool {
    secret
        .data
        .as_ref()
        .and_then(|data| data.get(DELETION_TOKEN_KEY))
        .is_some_and(|stored| stored.0 == expected.as_bytes())
}

/// What to do with one block of secret values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecretPlan {
    /// Keep referencing the given secret (or nothing).
    Keep(Option<String>),
    /// Write the content into a new secret.
    Create(SecretContent),
    /// Drop the reference.
    Drop,
}

/// Decides what happens to a block of secret values.
///
/// `current` is the referenced secret name with its stored content, if any.
///
/// # Errors
///
/// Returns [`SecretError::UnknownOperation`] for an operation other than
/// `""`, `replace`, `keep` or `delete`.
pub fn plan_secret_values(
    operation: Option<&str>,
    content: Option<SecretContent>,
    current: Option<(&str, &SecretContent)>,
) -> Result<SecretPlan, SecretError> {
    let current_name = current.map(|(name, _)| name.to_string());
    match operation.unwrap_or_default() {
        "" | OPERATION_REPLACE => match content {
            Some(content) if current.is_some_and(|(_, stored)| *stored == content) => {
                Ok(SecretPlan::Keep(current_name))
            }
            Some(content) => Ok(SecretPlan::Create(content)),
            None => Ok(SecretPlan::Keep(current_name)),
        },
        OPERATION_KEEP => Ok(SecretPlan::Keep(current_name)),
        OPERATION_DELETE => Ok(SecretPlan::Drop),
        other => Err(SecretError::UnknownOperation(other.to_string())),
    }
}

/// Content of the legacy block: the value tree as JSON under `secretValues`.
///
/// # Errors
///
/// Returns an error if the tree cannot be serialised.
pub fn legacy_content(values: &SecretValues) -> Result<Option<SecretContent>, SecretError> {
    let Some(data) = values.data.as_ref().filter(|d| !d.is_null()) else {
        return Ok(None);
    };
    let encoded = serde_json::to_vec(data).map_err(|e| SecretError::Decode {
        key: SECRET_VALUES_KEY.to_string(),
        reason: e.to_string(),
    })?;
    Ok(Some(BTreeMap::from([(SECRET_VALUES_KEY.to_string(), encoded)])))
}

/// Content of a named block: `stringData` verbatim, `data` base64 decoded.
///
/// # Errors
///
/// Returns an error if a `data` entry is not valid base64.
pub fn named_content(values: &NamedSecretValues) -> Result<Option<SecretContent>, SecretError> {
    if values.string_data.is_empty() && values.data.is_empty() {
        return Ok(None);
    }
    let mut content = SecretContent::new();
    for (key, encoded) in &values.data {
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| SecretError::Decode {
                key: key.clone(),
                reason: e.to_string(),
            })?;
        content.insert(key.clone(), decoded);
    }
    for (key, plain) in &values.string_data {
        content.insert(key.clone(), plain.as_bytes().to_vec());
    }
    Ok(Some(content))
}

/// Stored content of a value secret, without the deletion token.
#[must_use]
pub fn stored_content(secret: &Secret) -> SecretContent {
    secret
        .data
        .iter()
        .flatten()
        .filter(|(key, _)| key.as_str() != DELETION_TOKEN_KEY)
        .map(|(key, value)| (key.clone(), value.0.clone()))
        .collect()
}

/// Decodes the legacy block stored in a value secret.
///
/// # Errors
///
/// Returns an error if the entry is not JSON.
pub fn decode_legacy_values(secret: &Secret) -> Result<Option<Value>, SecretError> {
    let Some(raw) = secret.data.as_ref().and_then(|d| d.get(SECRET_VALUES_KEY)) else {
        return Ok(None);
    };
    serde_json::from_slice(&raw.0)
        .map(Some)
        .map_err(|e| SecretError::Decode {
            key: SECRET_VALUES_KEY.to_string(),
            reason: e.to_string(),
        })
}

/// Decodes a named value secret into a map of its entries.
///
/// Every entry (except the deletion token) holds a YAML document and is placed
/// under its own key.
///
/// # Errors
///
/// Returns an error if an entry is not valid YAML.
pub fn decode_named_values(secret: &Secret) -> Result<Value, SecretError> {
    let mut values = serde_json::Map::new();
    for (key, raw) in secret.data.iter().flatten() {
        if key == DELETION_TOKEN_KEY {
            continue;
        }
        let document: Value =
            serde_yaml::from_slice(&raw.0).map_err(|e| SecretError::Decode {
                key: key.clone(),
                reason: e.to_string(),
            })?;
        values.insert(key.clone(), document);
    }
    Ok(Value::Object(values))
}

/// Whether an unreferenced value secret is old enough to be removed.
#[must_use]
pub fn is_collectable(secret: &Secret, referenced: &BTreeSet<String>, now: DateTime<Utc>) -> bool {
    if referenced.contains(&secret.name_any()) {
        return false;
    }
    secret
        .metadata
        .creation_timestamp
        .as_ref()
        .is_some_and(|created| from_time(created) + ChronoDuration::seconds(SECRET_GC_GRACE_SECS) < now)
}

#[derive(Clone)]
struct DeletionKeys {
    primary: Vec<u8>,
    secondary: Option<Vec<u8>>,
}

/// Creates, reads and deletes value secrets.
pub struct SecretManager {
    client: Client,
    key_client: Client,
    key_namespace: String,
    keys: RwLock<Option<DeletionKeys>>,
}

impl SecretManager {
    /// The deletion key secret is read through `key_client` from `key_namespace`.
    #[must_use]
    pub fn new(client: Client, key_client: Client, key_namespace: &str) -> Self {
        Self {
            client,
            key_client,
            key_namespace: key_namespace.to_string(),
            keys: RwLock::new(None),
        }
    }

    async fn deletion_keys(&self, refresh: bool) -> Result<DeletionKeys, SecretError> {
        if !refresh {
            if let Some(keys) = self.keys.read().await.as_ref() {
                return Ok(keys.clone());
            }
        }

        let api: Api<Secret> = Api::namespaced(self.key_client.clone(), &self.key_namespace);
        let secret = api.get(DELETION_KEY_SECRET_NAME).await?;
        let data = secret.data.unwrap_or_default();
        let primary = data
            .get(DELETION_KEY_DATA_KEY)
            .map(|k| k.0.clone())
            .filter(|k| !k.is_empty())
            .ok_or_else(|| {
                SecretError::MissingDeletionKey(format!(
                    "{}/{DELETION_KEY_SECRET_NAME}",
                    self.key_namespace
                ))
            })?;
        let secondary = data
            .get(DELETION_KEY_SECONDARY_DATA_KEY)
            .map(|k| k.0.clone())
            .filter(|k| !k.is_empty());

        let keys = DeletionKeys { primary, secondary };
        *self.keys.write().await = Some(keys.clone());
        Ok(keys)
    }

    /// Lists the value secrets of a `ClusterBom`.
    ///
    /// # Errors
    ///
    /// Returns an error if the list call fails.
    pub async fn list_value_secrets(
        &self,
        namespace: &str,
        clusterbom_name: &str,
    ) -> Result<Vec<Secret>, SecretError> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let selector = labels::selector(&[
            (labels::BOM_NAME, clusterbom_name),
            (labels::PURPOSE, labels::PURPOSE_SECRET_VALUES),
        ]);
        Ok(api.list(&ListParams::default().labels(&selector)).await?.items)
    }

    /// Stores a block of secret values under a fresh name and returns the name.
    ///
    /// # Errors
    ///
    /// Returns an error if the secret cannot be created.
    pub async fn create_value_secret(
        &self,
        namespace: &str,
        clusterbom_name: &str,
        app_id: &str,
        logical_name: Option<&str>,
        content: SecretContent,
    ) -> Result<String, SecretError> {
        let name = random_secret_name(clusterbom_name, app_id);
        let mut secret_labels = labels::app_labels(clusterbom_name, app_id);
        secret_labels.insert(
            labels::PURPOSE.to_string(),
            labels::PURPOSE_SECRET_VALUES.to_string(),
        );
        if let Some(logical_name) = logical_name {
            secret_labels.insert(
                labels::LOGICAL_SECRET_NAME.to_string(),
                logical_name.to_string(),
            );
        }

        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                namespace: Some(namespace.to_string()),
                labels: Some(secret_labels),
                ..Default::default()
            },
            type_: Some("Opaque".to_string()),
            data: Some(
                content
                    .into_iter()
                    .map(|(key, value)| (key, ByteString(value)))
                    .collect(),
            ),
            ..Default::default()
        };

        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        api.create(&PostParams::default(), &secret).await?;
        metrics::record_resource_created("Secret");
        info!(secret = %name, namespace = %namespace, app = %app_id, "Created value secret");
        Ok(name)
    }

    /// Fetches a secret, `None` if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error for API failures other than not-found.
    pub async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, SecretError> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    /// Stamps `secret` with the deletion token of `key` and returns the token.
    async fn write_token(&self, api: &Api<Secret>, secret: &Secret, key: &[u8]) -> Result<String, kube::Error> {
        let name = secret.name_any();
        let token = deletion_token(key, &name);
        let mut stamped = secret.clone();
        stamped
            .data
            .get_or_insert_with(BTreeMap::new)
            .insert(DELETION_TOKEN_KEY.to_string(), ByteString(token.clone().into_bytes()));
        api.replace(&name, &PostParams::default(), &stamped).await?;
        Ok(token)
    }

    /// Deletes a value secret after stamping it with a deletion token.
    ///
    /// A secret that is already gone counts as deleted.
    ///
    /// # Errors
    ///
    /// Returns an error if no deletion key is available or every token write fails.
    pub async fn delete_secret(&self, secret: &Secret) -> Result<(), SecretError> {
        let namespace = secret.namespace().unwrap_or_default();
        let name = secret.name_any();
        let api: Api<Secret> = Api::namespaced(self.client.clone(), &namespace);

        let keys = self.deletion_keys(false).await?;
        let token = match self.write_token(&api, secret, &keys.primary).await {
            Ok(token) => token,
            Err(first) if is_not_found(&first) => return Ok(()),
            Err(first) => {
                warn!(secret = %name, namespace = %namespace, error = %first,
                    "Writing deletion token failed, reloading deletion keys");

                let fresh = self.deletion_keys(true).await?;
                let current = api.get_opt(&name).await?;
                let Some(current) = current else {
                    return Ok(());
                };

                let mut candidates = vec![fresh.primary.clone()];
                candidates.extend(fresh.secondary);
                let mut written = None;
                let mut last_error = first;
                for key in candidates {
                    match self.write_token(&api, &current, &key).await {
                        Ok(token) => {
                            written = Some(token);
                            break;
                        }
                        Err(e) => last_error = e,
                    }
                }
                match written {
                    Some(token) => token,
                    None => return Err(SecretError::Kube(last_error)),
                }
            }
        };

        // Confirm the token write before deleting
        let Some(confirmed) = api.get_opt(&name).await? else {
            return Ok(());
        };
        if !token_matches(&confirmed, &token) {
            return Err(SecretError::TokenMismatch(format!("{namespace}/{name}")));
        }
        let params = DeleteParams {
            preconditions: Some(Preconditions {
                uid: confirmed.uid(),
                resource_version: confirmed.resource_version(),
            }),
            ..DeleteParams::default()
        };
        match api.delete(&name, &params).await {
            Ok(_) => {
                metrics::record_resource_deleted("Secret");
                debug!(secret = %name, namespace = %namespace, "Deleted value secret");
                Ok(())
            }
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Deletes unreferenced value secrets older than the grace period.
    ///
    /// Returns the number of deleted secrets. Failures are logged and skipped.
    pub async fn collect_unreferenced(
        &self,
        secrets: &[Secret],
        referenced: &BTreeSet<String>,
        now: DateTime<Utc>,
    ) -> usize {
        let mut deleted = 0;
        for secret in secrets.iter().filter(|s| is_collectable(s, referenced, now)) {
            match self.delete_secret(secret).await {
                Ok(()) => deleted += 1,
                Err(e) => warn!(secret = %secret.name_any(), error = %e, "Could not delete unreferenced value secret"),
            }
        }
        deleted
    }

    /// Deletes all given value secrets.
    ///
    /// # Errors
    ///
    /// Returns the first error; remaining secrets are still attempted.
    pub async fn delete_all(&self, secrets: &[Secret]) -> Result<(), SecretError> {
        let mut first_error = None;
        for secret in secrets {
            if let Err(e) = self.delete_secret(secret).await {
                warn!(secret = %secret.name_any(), error = %e, "Could not delete value secret");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
#[path = "secrets_tests.rs"]
mod secrets_tests;
