//! Lock manager: per-operator cache of lock handles plus acquire/release.
//!
//! Each lock name maps to exactly one handle for the lifetime of the
//! operator. The cache mutex is held only for the lookup-or-insert, never
//! while waiting on the backend, so one slow acquisition does not block
//! others.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use tokio_util::sync::CancellationToken;

use super::Operator;
use crate::{
    backend::{LockHandle, LockOutcome},
    Error, Result,
};

/// Lock name to handle map owned by one operator.
#[derive(Debug, Default)]
pub(crate) struct LockCache {
    handles: Mutex<HashMap<String, Arc<dyn LockHandle>>>,
}

impl LockCache {
    fn handles(&self) -> MutexGuard<'_, HashMap<String, Arc<dyn LockHandle>>> {
        self.handles.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Cached handle for `name`, building it with `create` on first use.
    ///
    /// `create` runs under the cache mutex and must not block.
    pub(crate) fn get_or_create(
        &self,
        name: &str,
        create: impl FnOnce() -> Result<Arc<dyn LockHandle>>,
    ) -> Result<Arc<dyn LockHandle>> {
        let mut handles = self.handles();
        if let Some(handle) = handles.get(name) {
            return Ok(Arc::clone(handle));
        }
        let handle = create()?;
        handles.insert(name.to_string(), Arc::clone(&handle));
        Ok(handle)
    }

    pub(crate) fn get(&self, name: &str) -> Option<Arc<dyn LockHandle>> {
        self.handles().get(name).cloned()
    }
}

impl Operator {
    /// Wait for cluster-wide exclusive ownership of `name`.
    ///
    /// Returns [`LockOutcome::Cancelled`] if `cancel` fires first, including
    /// when it has already fired on entry.
    ///
    /// # Errors
    ///
    /// Returns `Backend` if the handle already holds the lock or the backend
    /// fails while waiting
    pub async fn acquire(&self, name: &str, cancel: &CancellationToken) -> Result<LockOutcome> {
        let backend = self.backend()?;
        let handle = self
            .locks
            .get_or_create(name, || backend.lock_handle(name))?;

        let key = handle.key();
        tracing::debug!("Acquiring lock '{key}'");
        let outcome = handle.lock(cancel).await?;
        match outcome {
            LockOutcome::Held => tracing::info!("Acquired lock '{key}'"),
            LockOutcome::Cancelled => tracing::info!("Acquisition of lock '{key}' cancelled"),
        }
        Ok(outcome)
    }

    /// Release `name`.
    ///
    /// # Errors
    ///
    /// Returns `LockNotAcquired` if `acquire` was never called for `name` on
    /// this operator; otherwise the handle's own error (for example when the
    /// lock is not currently held)
    pub async fn release(&self, name: &str) -> Result<()> {
        self.backend()?;
        let handle = self
            .locks
            .get(name)
            .ok_or_else(|| Error::LockNotAcquired(name.to_string()))?;
        handle.unlock().await?;
        tracing::info!("Released lock '{}'", handle.key());
        Ok(())
    }

    /// Whether this operator currently holds `name`.
    pub fn is_held(&self, name: &str) -> bool {
        self.locks.get(name).is_some_and(|handle| handle.is_held())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::backend::{Backend, MemoryBackend};

    #[test]
    fn test_cache_builds_once_per_name() -> Result<()> {
        let backend = MemoryBackend::new();
        let cache = LockCache::default();
        let built = AtomicUsize::new(0);
        let create = || {
            built.fetch_add(1, Ordering::SeqCst);
            backend.lock_handle("a")
        };

        let first = cache.get_or_create("a", create)?;
        let second = cache.get_or_create("a", || unreachable!("handle is cached"))?;

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.key(), "a");
        assert_eq!(built.load(Ordering::SeqCst), 1);
        assert!(cache.get("b").is_none());
        Ok(())
    }

    #[test]
    fn test_failed_creation_is_not_cached() -> Result<()> {
        let backend = MemoryBackend::new();
        let cache = LockCache::default();

        let failed = cache.get_or_create("a", || Err(Error::backend("lock", "boom")));
        assert!(failed.is_err());
        assert!(cache.get("a").is_none());

        cache.get_or_create("a", || backend.lock_handle("a"))?;
        assert!(cache.get("a").is_some());
        Ok(())
    }
}
