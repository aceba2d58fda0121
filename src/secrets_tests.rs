// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Unit tests for `secrets.rs`

#[cfg(test)]
mod tests {
    use super::super::{
        decode_legacy_values, decode_named_values, deletion_token, is_collectable, legacy_content,
        named_content, plan_secret_values, stored_content, token_matches, SecretContent,
        SecretPlan,
    };
    use crate::crd::{NamedSecretValues, SecretValues};
    use crate::errors::SecretError;
    use chrono::{Duration as ChronoDuration, TimeZone, Utc};
    use crate::timestamps::to_time;
    use k8s_openapi::api::core::v1::Secret;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use k8s_openapi::ByteString;
    use serde_json::json;
    use std::collections::{BTreeMap, BTreeSet};

    fn content(pairs: &[(&str, &str)]) -> SecretContent {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.as_bytes().to_vec()))
            .collect()
    }

    fn secret(name: &str, data: &[(&str, &str)]) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("ns1".to_string()),
                creation_timestamp: Some(to_time(Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap())),
                ..Default::default()
            },
            data: Some(
                data.iter()
                    .map(|(k, v)| ((*k).to_string(), ByteString(v.as_bytes().to_vec())))
                    .collect(),
            ),
            ..Default::default()
        }
    }

    /// Test the token against the RFC 4231 HMAC-SHA256 vector
    #[test]
    fn test_deletion_token_is_hmac_sha256() {
        assert_eq!(
            deletion_token(b"Jefe", "what do ya want for nothing?"),
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
        assert_ne!(
            deletion_token(b"key", "cb1-echo-1"),
            deletion_token(b"key", "cb1-echo-2"),
            "tokens are bound to the secret name"
        );
    }

    /// Test that only a secret stamped with our token is confirmed for deletion
    #[test]
    fn test_token_matches() {
        let token = deletion_token(b"key", "cb1-echo-1");
        assert!(token_matches(&secret("cb1-echo-1", &[("deletionToken", &token)]), &token));

        let recreated = secret("cb1-echo-1", &[("secretValues", "{}")]);
        assert!(!token_matches(&recreated, &token), "recreated secret has no token");

        let other = deletion_token(b"other-key", "cb1-echo-1");
        assert!(!token_matches(&secret("cb1-echo-1", &[("deletionToken", &other)]), &token));
    }

    /// Test that changed content rotates and equal content keeps the name
    #[test]
    fn test_plan_replace() {
        let stored = content(&[("key3", "val31")]);

        let same = plan_secret_values(None, Some(content(&[("key3", "val31")])), Some(("old", &stored)));
        assert_eq!(same.unwrap(), SecretPlan::Keep(Some("old".to_string())));

        let changed = plan_secret_values(
            Some("replace"),
            Some(content(&[("key3", "val33")])),
            Some(("old", &stored)),
        );
        assert_eq!(changed.unwrap(), SecretPlan::Create(content(&[("key3", "val33")])));

        let first = plan_secret_values(Some(""), Some(content(&[("a", "b")])), None);
        assert!(matches!(first.unwrap(), SecretPlan::Create(_)));
    }

    /// Test keep, delete and missing content
    #[test]
    fn test_plan_keep_delete() {
        let stored = content(&[("a", "b")]);
        assert_eq!(
            plan_secret_values(Some("keep"), None, Some(("old", &stored))).unwrap(),
            SecretPlan::Keep(Some("old".to_string()))
        );
        assert_eq!(
            plan_secret_values(None, None, Some(("old", &stored))).unwrap(),
            SecretPlan::Keep(Some("old".to_string())),
            "a block without content keeps its reference"
        );
        assert_eq!(
            plan_secret_values(Some("delete"), Some(stored.clone()), Some(("old", &stored))).unwrap(),
            SecretPlan::Drop
        );
        assert!(matches!(
            plan_secret_values(Some("purge"), None, None),
            Err(SecretError::UnknownOperation(op)) if op == "purge"
        ));
    }

    /// Test the content of legacy and named blocks
    #[test]
    fn test_block_content() {
        let legacy = SecretValues {
            data: Some(json!({"password": "secret"})),
            ..Default::default()
        };
        let encoded = legacy_content(&legacy).unwrap().unwrap();
        assert_eq!(encoded["secretValues"], br#"{"password":"secret"}"#.to_vec());
        assert!(legacy_content(&SecretValues::default()).unwrap().is_none());

        let named = NamedSecretValues {
            string_data: BTreeMap::from([("key3".to_string(), "val31".to_string())]),
            data: BTreeMap::from([("key4".to_string(), "dmFsNDE=".to_string())]),
            ..Default::default()
        };
        assert_eq!(
            named_content(&named).unwrap().unwrap(),
            content(&[("key3", "val31"), ("key4", "val41")])
        );

        let broken = NamedSecretValues {
            data: BTreeMap::from([("key".to_string(), "%%%".to_string())]),
            ..Default::default()
        };
        assert!(matches!(named_content(&broken), Err(SecretError::Decode { .. })));
    }

    /// Test that stored content ignores the deletion token
    #[test]
    fn test_stored_content_skips_token() {
        let stored = secret("s1", &[("key3", "val31"), ("deletionToken", "abc")]);
        assert_eq!(stored_content(&stored), content(&[("key3", "val31")]));
    }

    /// Test decoding of stored values
    #[test]
    fn test_decode_values() {
        let legacy = secret("s1", &[("secretValues", r#"{"db":{"password":"pw"}}"#)]);
        assert_eq!(
            decode_legacy_values(&legacy).unwrap(),
            Some(json!({"db": {"password": "pw"}}))
        );

        let named = secret(
            "s2",
            &[
                ("db", "user: admin\nport: 5432\n"),
                ("replicas", "3"),
                ("deletionToken", "ff00"),
            ],
        );
        assert_eq!(
            decode_named_values(&named).unwrap(),
            json!({"db": {"user": "admin", "port": 5432}, "replicas": 3})
        );
    }

    /// Test the garbage collection grace period
    #[test]
    fn test_is_collectable() {
        let old = secret("cb1-echo-1", &[]);
        let created = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
        let referenced = BTreeSet::from(["cb1-echo-2".to_string()]);

        assert!(!is_collectable(&old, &referenced, created + ChronoDuration::minutes(30)));
        assert!(is_collectable(&old, &referenced, created + ChronoDuration::minutes(61)));

        let referenced = BTreeSet::from(["cb1-echo-1".to_string()]);
        assert!(!is_collectable(&old, &referenced, created + ChronoDuration::hours(5)));
    }
}
