// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Unit tests for `mutex.rs`

#[cfg(test)]
mod tests {
    use super::super::MutexRegistry;
    use crate::keys::NamespacedName;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    /// Test that entries are dropped once the last guard is released
    #[tokio::test]
    async fn test_entry_removed_after_release() {
        let registry = MutexRegistry::new();
        let key = NamespacedName::new("ns1", "cb1");

        {
            let _guard = registry.lock(&key).await;
            assert_eq!(registry.len(), 1, "held key should have an entry");
        }

        assert!(registry.is_empty(), "released key should not leak an entry");
    }

    /// Test that two tasks on the same key never overlap
    #[tokio::test]
    async fn test_same_key_is_exclusive() {
        let registry = MutexRegistry::new();
        let key = NamespacedName::new("ns1", "cb1");
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let registry = registry.clone();
            let key = key.clone();
            let inside = Arc::clone(&inside);
            let max_inside = Arc::clone(&max_inside);
            handles.push(tokio::spawn(async move {
                let _guard = registry.lock(&key).await;
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                max_inside.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(max_inside.load(Ordering::SeqCst), 1, "critical sections overlapped");
        assert!(registry.is_empty());
    }

    /// Test that different keys do not block each other
    #[tokio::test]
    async fn test_different_keys_are_independent() {
        let registry = MutexRegistry::new();
        let _a = registry.lock(&NamespacedName::new("ns1", "a")).await;
        let b = tokio::time::timeout(
            Duration::from_millis(100),
            registry.lock(&NamespacedName::new("ns1", "b")),
        )
        .await;
        assert!(b.is_ok(), "second key should be acquired immediately");
        assert_eq!(registry.len(), 2);
    }

    /// Test that a lock wait cut short by a timeout does not leak an entry
    #[tokio::test]
    async fn test_cancelled_wait_releases_entry() {
        let registry = MutexRegistry::new();
        let key = NamespacedName::new("ns1", "cb1");

        let holder = registry.lock(&key).await;
        let waited = tokio::time::timeout(Duration::from_millis(20), registry.lock(&key)).await;
        assert!(waited.is_err(), "contended lock should time out");
        assert_eq!(registry.len(), 1, "holder still owns the entry");

        drop(holder);
        assert!(registry.is_empty(), "timed out waiter must not keep the entry alive");

        let _again = registry.lock(&key).await;
        assert_eq!(registry.len(), 1);
    }
}
