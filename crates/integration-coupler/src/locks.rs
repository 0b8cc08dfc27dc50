//! Per-object exclusive locks
//!
//! A coupling pass touches both the plug and the socket, so the plug and
//! socket controllers serialize on `kind/namespace/name` keys held for the
//! whole pass.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Map of async mutexes keyed by object identity
#[derive(Default)]
pub struct KeyedLocks {
    locks: RwLock<HashMap<String, Arc<Mutex<()>>>>,
}

impl KeyedLocks {
    /// Create an empty lock map
    pub fn new() -> Self {
        Self::default()
    }

    /// Key for an object of `kind` at `namespace/name`
    pub fn key(kind: &str, namespace: &str, name: &str) -> String {
        format!("{}/{}/{}", kind, namespace, name)
    }

    /// Wait for exclusive ownership of `key`
    pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let existing = self.locks.read().get(key).cloned();
        let mutex = match existing {
            Some(mutex) => mutex,
            None => self
                .locks
                .write()
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone(),
        };
        mutex.lock_owned().await
    }

    /// Drop entries nobody holds or waits on
    pub fn prune(&self) -> usize {
        let mut locks = self.locks.write();
        let before = locks.len();
        locks.retain(|_, mutex| Arc::strong_count(mutex) > 1);
        before - locks.len()
    }

    /// Drop `key` once its object is gone
    ///
    /// Called by the holder of `key` (or with no holder). The entry stays
    /// while another task waits on it.
    pub fn forget(&self, key: &str) -> bool {
        let mut locks = self.locks.write();
        let idle = locks
            .get(key)
            .is_some_and(|mutex| Arc::strong_count(mutex) <= 2);
        idle && locks.remove(key).is_some()
    }

    /// Number of tracked keys
    pub fn len(&self) -> usize {
        self.locks.read().len()
    }

    /// Whether no keys are tracked
    pub fn is_empty(&self) -> bool {
        self.locks.read().is_empty()
    }
}
