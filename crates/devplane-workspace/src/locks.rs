//! Per-identity advisory locks
//!
//! Workflows for the same workspace id run one at a time in this process.
//! Different ids never contend. Entries are dropped once nobody holds or waits
//! on them, so the map stays as small as the number of in-flight ids.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::trace;

type LockMap = DashMap<String, Arc<Mutex<()>>>;

/// Registry of per-id async mutexes
#[derive(Default, Clone)]
pub struct IdentityLocks {
    locks: Arc<LockMap>,
}

/// Held lock on one id; released on drop
pub struct IdentityGuard {
    id: String,
    guard: Option<OwnedMutexGuard<()>>,
    locks: Arc<LockMap>,
}

impl IdentityLocks {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive use of `id`
    pub async fn acquire(&self, id: &str) -> IdentityGuard {
        let mutex = self
            .locks
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = mutex.lock_owned().await;
        trace!(workspace = id, "acquired workspace lock");
        IdentityGuard {
            id: id.to_string(),
            guard: Some(guard),
            locks: self.locks.clone(),
        }
    }

    /// Number of ids currently held or waited on
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// True when no id is held or waited on
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

impl Drop for IdentityGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Only the map's own reference left: no holder, no waiter.
        self.locks
            .remove_if(&self.id, |_, m| Arc::strong_count(m) == 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn same_id_is_serialized() {
        let locks = IdentityLocks::new();
        let first = locks.acquire("alice").await;

        let contender = locks.clone();
        let waiter = tokio::spawn(async move {
            let _g = contender.acquire("alice").await;
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(first);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should acquire after release")
            .unwrap();
    }

    #[tokio::test]
    async fn different_ids_do_not_contend() {
        let locks = IdentityLocks::new();
        let _a = locks.acquire("alice").await;
        let b = tokio::time::timeout(Duration::from_millis(100), locks.acquire("bob")).await;
        assert!(b.is_ok());
        assert_eq!(locks.len(), 2);
    }

    #[tokio::test]
    async fn entries_are_removed_after_release() {
        let locks = IdentityLocks::new();
        {
            let _g = locks.acquire("alice").await;
            assert_eq!(locks.len(), 1);
        }
        assert!(locks.is_empty());
    }
}
