//! Correlation table for outstanding requests.
//!
//! A [`PendingTable`] maps a correlation key to the one-shot sender of the
//! caller waiting for the reply. The receiving side resolves entries as
//! replies arrive; the waiting side removes its own entry if the wait times
//! out, so a late reply finds nothing to resolve.

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::oneshot;

use meshlink_core::error::{Error, Result};

/// Outstanding requests keyed by correlation key.
pub struct PendingTable<K, V> {
    entries: Mutex<HashMap<K, oneshot::Sender<V>>>,
}

impl<K, V> Default for PendingTable<K, V> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl<K, V> PendingTable<K, V>
where
    K: Eq + Hash + Clone + Debug,
{
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<K, oneshot::Sender<V>>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a request before it is sent.
    ///
    /// Fails if a request with the same key is already outstanding.
    pub fn register(&self, key: K) -> Result<oneshot::Receiver<V>> {
        let mut entries = self.lock();
        if entries.contains_key(&key) {
            return Err(Error::Bus(format!("request {:?} is already pending", key)));
        }
        let (tx, rx) = oneshot::channel();
        entries.insert(key, tx);
        Ok(rx)
    }

    /// Hand a reply to the waiting caller.
    ///
    /// Returns `false` if no request with this key is outstanding.
    pub fn resolve(&self, key: &K, value: V) -> bool {
        let sender = self.lock().remove(key);
        match sender {
            Some(tx) => tx.send(value).is_ok(),
            None => false,
        }
    }

    /// Drop an outstanding request without resolving it.
    pub fn remove(&self, key: &K) -> bool {
        self.lock().remove(key).is_some()
    }

    /// Whether a request with this key is outstanding.
    pub fn contains(&self, key: &K) -> bool {
        self.lock().contains_key(key)
    }

    /// Number of outstanding requests.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no requests are outstanding.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Wait up to `timeout` for the reply to `key`.
    ///
    /// On timeout the entry is removed and [`Error::Timeout`] returned.
    pub async fn wait(&self, key: &K, rx: oneshot::Receiver<V>, timeout: Duration) -> Result<V> {
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => {
                self.remove(key);
                Err(Error::NotConnected)
            }
            Err(_) => {
                self.remove(key);
                Err(Error::Timeout)
            }
        }
    }
}
