// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! In-process keyed mutex with reference counted entries.
//!
//! Entries exist only while at least one task holds or waits for the key, so the
//! map does not grow with the number of `ClusterBom`s ever seen.

use crate::keys::NamespacedName;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

struct Entry {
    mutex: Arc<AsyncMutex<()>>,
    counter: usize,
}

type EntryMap = Arc<Mutex<HashMap<NamespacedName, Entry>>>;

/// Registry of per-key async mutexes.
#[derive(Clone, Default)]
pub struct MutexRegistry {
    entries: EntryMap,
}

/// Counts one holder or waiter of a key; releases the registry entry on drop.
struct Reservation {
    key: NamespacedName,
    entries: EntryMap,
}

/// Holds the mutex of one key; releases the registry entry on drop.
pub struct KeyGuard {
    _guard: OwnedMutexGuard<()>,
    _reservation: Reservation,
}

impl MutexRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for the mutex of `key`.
    ///
    /// Cancelling the returned future while it waits gives up the entry again.
    pub async fn lock(&self, key: &NamespacedName) -> KeyGuard {
        let (mutex, reservation) = self.acquire(key);
        let guard = mutex.lock_owned().await;
        KeyGuard {
            _guard: guard,
            _reservation: reservation,
        }
    }

    /// Number of keys currently held or waited for.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn acquire(&self, key: &NamespacedName) -> (Arc<AsyncMutex<()>>, Reservation) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = entries.entry(key.clone()).or_insert_with(|| Entry {
            mutex: Arc::new(AsyncMutex::new(())),
            counter: 0,
        });
        entry.counter += 1;
        let reservation = Reservation {
            key: key.clone(),
            entries: Arc::clone(&self.entries),
        };
        (Arc::clone(&entry.mutex), reservation)
    }
}

fn release(entries: &EntryMap, key: &NamespacedName) {
    let mut entries = entries.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(entry) = entries.get_mut(key) {
        entry.counter -= 1;
        if entry.counter == 0 {
            entries.remove(key);
        }
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        release(&self.entries, &self.key);
    }
}

#[cfg(test)]
#[path = "mutex_tests.rs"]
mod mutex_tests;
