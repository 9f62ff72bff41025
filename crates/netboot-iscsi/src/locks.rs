//! Per-image-name mutual exclusion.
//!
//! Lifecycle and linkage operations on the same name never interleave.
//! Operations touching two names (copy, rename) lock both in sorted order.
//! Operations that read or write `assigned_to` also take the global linkage
//! lock, always before any name lock.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Held lock on one image name; released on drop.
pub struct NameGuard {
    name: String,
    locks: Arc<DashMap<String, Arc<AsyncMutex<()>>>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl NameGuard {
    /// The locked name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for NameGuard {
    fn drop(&mut self) {
        self.guard.take();
        self.locks
            .remove_if(&self.name, |_, lock| Arc::strong_count(lock) == 1);
    }
}

/// Name-keyed async locks plus the global linkage lock.
#[derive(Default)]
pub struct NameLocks {
    locks: Arc<DashMap<String, Arc<AsyncMutex<()>>>>,
    linkage: Arc<AsyncMutex<()>>,
}

impl NameLocks {
    /// Create an empty lock table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Locks one image name.
    pub async fn lock(&self, name: &str) -> NameGuard {
        use dashmap::mapref::entry::Entry;
        let lock = match self.locks.entry(name.to_string()) {
            Entry::Occupied(entry) => entry.get().clone(),
            Entry::Vacant(entry) => entry.insert(Arc::new(AsyncMutex::new(()))).clone(),
        };
        NameGuard {
            name: name.to_string(),
            locks: self.locks.clone(),
            guard: Some(lock.lock_owned().await),
        }
    }

    /// Locks two names in a fixed order; equal names are locked once.
    pub async fn lock_pair(&self, a: &str, b: &str) -> Vec<NameGuard> {
        if a == b {
            return vec![self.lock(a).await];
        }
        let (first, second) = if a < b { (a, b) } else { (b, a) };
        let first = self.lock(first).await;
        let second = self.lock(second).await;
        vec![first, second]
    }

    /// Serializes writers of image assignments.
    pub async fn lock_linkage(&self) -> OwnedMutexGuard<()> {
        self.linkage.clone().lock_owned().await
    }

    /// Number of names with a live lock entry.
    pub fn tracked(&self) -> usize {
        self.locks.len()
    }
}
