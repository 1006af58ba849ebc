//! Per-resource mutex map
//!
//! Mutating workflows hold the guard for a resource name for their whole
//! duration; callers on the same name queue in FIFO order (tokio mutexes are
//! fair). Idle entries are dropped when the last guard goes away.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

#[derive(Default)]
pub struct ResourceLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

/// Held while a workflow owns a resource name.
pub struct ResourceGuard {
    name: String,
    locks: Arc<ResourceLocks>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl ResourceGuard {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for ResourceGuard {
    fn drop(&mut self) {
        // release before checking whether anyone else still waits
        drop(self.guard.take());
        let mut locks = self.locks.locks.lock();
        if let Some(lock) = locks.get(&self.name) {
            if Arc::strong_count(lock) == 1 {
                locks.remove(&self.name);
            }
        }
    }
}

impl ResourceLocks {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn acquire(self: &Arc<Self>, name: &str) -> ResourceGuard {
        let lock = {
            let mut locks = self.locks.lock();
            Arc::clone(
                locks
                    .entry(name.to_string())
                    .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
            )
        };
        let guard = lock.lock_owned().await;
        ResourceGuard {
            name: name.to_string(),
            locks: Arc::clone(self),
            guard: Some(guard),
        }
    }

    /// Number of names with a live lock entry
    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
