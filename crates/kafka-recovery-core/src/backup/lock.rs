//! Keyed backup locks.
//!
//! One backup per (cluster, topic) at a time, and at most `max_concurrent`
//! backups overall. Acquisition never waits: a taken key or a full map is a
//! [`Error::Conflict`].

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::{Error, Result};

type LockKey = (String, String);

#[derive(Debug)]
struct Inner {
    /// (cluster, topic) -> backup id holding it
    held: Mutex<HashMap<LockKey, String>>,
    max_concurrent: usize,
}

/// Lock map owned by one backup coordinator
#[derive(Debug, Clone)]
pub struct BackupLockMap {
    inner: Arc<Inner>,
}

impl BackupLockMap {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                held: Mutex::new(HashMap::new()),
                max_concurrent: max_concurrent.max(1),
            }),
        }
    }

    /// Take the lock for `(cluster, topic)` on behalf of `backup_id`.
    pub fn try_acquire(&self, cluster: &str, topic: &str, backup_id: &str) -> Result<BackupLock> {
        let key = (cluster.to_string(), topic.to_string());
        let mut held = self.inner.held.lock();

        if let Some(owner) = held.get(&key) {
            return Err(Error::Conflict(format!(
                "backup {} already running for topic '{}' on cluster '{}'",
                owner, topic, cluster
            )));
        }
        if held.len() >= self.inner.max_concurrent {
            return Err(Error::Conflict(format!(
                "{} backups already running (max_concurrent_backups = {})",
                held.len(),
                self.inner.max_concurrent
            )));
        }

        held.insert(key.clone(), backup_id.to_string());
        debug!(cluster, topic, backup_id, "Acquired backup lock");

        Ok(BackupLock {
            inner: Arc::clone(&self.inner),
            key,
        })
    }

    pub fn is_locked(&self, cluster: &str, topic: &str) -> bool {
        self.inner
            .held
            .lock()
            .contains_key(&(cluster.to_string(), topic.to_string()))
    }

    /// Number of backups currently holding a lock
    pub fn active(&self) -> usize {
        self.inner.held.lock().len()
    }
}

/// Held lock; released on drop
#[derive(Debug)]
pub struct BackupLock {
    inner: Arc<Inner>,
    key: LockKey,
}

impl BackupLock {
    pub fn cluster(&self) -> &str {
        &self.key.0
    }

    pub fn topic(&self) -> &str {
        &self.key.1
    }
}

impl Drop for BackupLock {
    fn drop(&mut self) {
        self.inner.held.lock().remove(&self.key);
        debug!(cluster = %self.key.0, topic = %self.key.1, "Released backup lock");
    }
}
