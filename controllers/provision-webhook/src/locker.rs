//! Per-resource serialization
//!
//! `ResourceLocker` hands out one async mutex per resource name. Entries are
//! created on first use and live for the lifetime of the process. The guard
//! is dropped on every exit path of the critical section, including when the
//! surrounding future is cancelled by a timeout.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::Mutex as AsyncMutex;

/// Keyed lock table
#[derive(Debug, Default, Clone)]
pub struct ResourceLocker {
    locks: Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
}

impl ResourceLocker {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, name: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(name.to_string()).or_default())
    }

    /// Runs `f` while holding the lock for `name` and returns its result.
    ///
    /// Waiters are served in FIFO order.
    pub async fn with_lock<F, Fut, T>(&self, name: &str, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let lock = self.entry(name);
        let _guard = lock.lock().await;
        f().await
    }

    /// Number of resource names seen so far
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}
