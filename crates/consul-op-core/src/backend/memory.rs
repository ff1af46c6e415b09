//! In-process backend.
//!
//! Several operators can share one [`MemoryBackend`] through a
//! [`MemoryConnector`] to exercise cross-operator lock contention without a
//! Consul agent. Locks behave like session-backed Consul locks: a handle that
//! is dropped while holding its lock releases it, as a session would expire
//! when its owner dies.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use super::{
    Backend, CatalogService, Connector, KvPair, LockHandle, LockOutcome, ServiceRegistration,
};
use crate::{agent_url::agent_base_url, Error, OperatorConfig, Result};

const NODE_NAME: &str = "memory";
const DATACENTER: &str = "dc1";

#[derive(Debug, Default)]
struct State {
    index: u64,
    kv: BTreeMap<String, KvPair>,
    /// lock name -> owning handle id
    locks: HashMap<String, u64>,
    services: BTreeMap<String, (ServiceRegistration, u64)>,
}

impl State {
    fn next_index(&mut self) -> u64 {
        self.index += 1;
        self.index
    }
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<State>,
    released: Notify,
    next_owner: AtomicU64,
    handles_created: AtomicUsize,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn try_lock(&self, key: &str, owner: u64) -> bool {
        let mut state = self.state();
        match state.locks.get(key) {
            Some(_) => false,
            None => {
                state.locks.insert(key.to_string(), owner);
                true
            }
        }
    }

    fn unlock(&self, key: &str, owner: u64) -> bool {
        let released = {
            let mut state = self.state();
            if state.locks.get(key) == Some(&owner) {
                state.locks.remove(key);
                true
            } else {
                false
            }
        };
        if released {
            self.released.notify_waiters();
        }
        released
    }
}

/// Backend keeping all state in process memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    shared: Arc<Shared>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of lock handles built so far.
    pub fn handles_created(&self) -> usize {
        self.shared.handles_created.load(Ordering::SeqCst)
    }

    /// Current holder id of `key`, if locked.
    pub fn lock_holder(&self, key: &str) -> Option<u64> {
        self.shared.state().locks.get(key).copied()
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn kv_get(&self, key: &str) -> Result<Option<KvPair>> {
        Ok(self.shared.state().kv.get(key).cloned())
    }

    async fn kv_put(&self, key: &str, value: &[u8]) -> Result<()> {
        let mut state = self.shared.state();
        let modify_index = state.next_index();
        state.kv.insert(
            key.to_string(),
            KvPair {
                key: key.to_string(),
                value: value.to_vec(),
                modify_index,
                flags: 0,
                session: None,
            },
        );
        Ok(())
    }

    async fn kv_delete(&self, key: &str) -> Result<()> {
        let mut state = self.shared.state();
        if state.kv.remove(key).is_some() {
            state.next_index();
        }
        Ok(())
    }

    fn lock_handle(&self, key: &str) -> Result<Arc<dyn LockHandle>> {
        self.shared.handles_created.fetch_add(1, Ordering::SeqCst);
        let owner = self.shared.next_owner.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Arc::new(MemoryLock {
            key: key.to_string(),
            owner,
            shared: Arc::clone(&self.shared),
            guard: tokio::sync::Mutex::new(()),
            held: AtomicBool::new(false),
        }))
    }

    async fn register_service(&self, registration: &ServiceRegistration) -> Result<()> {
        if registration.name.is_empty() {
            return Err(Error::backend(
                "register service",
                "400 Bad Request: missing service name",
            ));
        }
        let mut state = self.shared.state();
        let index = state.next_index();
        let id = if registration.id.is_empty() {
            registration.name.clone()
        } else {
            registration.id.clone()
        };
        state.services.insert(id, (registration.clone(), index));
        Ok(())
    }

    async fn deregister_service(&self, service_id: &str) -> Result<()> {
        let mut state = self.shared.state();
        match state.services.remove(service_id) {
            Some(_) => {
                state.next_index();
                Ok(())
            }
            None => Err(Error::backend(
                format!("deregister service '{service_id}'"),
                format!("404 Not Found: Unknown service ID \"{service_id}\""),
            )),
        }
    }

    async fn catalog_service(&self, name: &str) -> Result<Vec<CatalogService>> {
        let state = self.shared.state();
        Ok(state
            .services
            .iter()
            .filter(|(_, (registration, _))| registration.name == name)
            .map(|(id, (registration, index))| CatalogService {
                id: String::new(),
                node: NODE_NAME.to_string(),
                address: registration.address.clone(),
                datacenter: DATACENTER.to_string(),
                service_id: id.clone(),
                service_name: registration.name.clone(),
                service_address: registration.address.clone(),
                service_port: registration.port,
                service_tags: Vec::new(),
                create_index: *index,
                modify_index: *index,
            })
            .collect())
    }

    async fn catalog_services(&self) -> Result<HashMap<String, Vec<String>>> {
        let state = self.shared.state();
        Ok(state
            .services
            .values()
            .map(|(registration, _)| (registration.name.clone(), Vec::new()))
            .collect())
    }
}

/// Exclusive lock on one key of a [`MemoryBackend`].
#[derive(Debug)]
struct MemoryLock {
    key: String,
    owner: u64,
    shared: Arc<Shared>,
    /// Serializes `lock` calls on this handle.
    guard: tokio::sync::Mutex<()>,
    held: AtomicBool,
}

#[async_trait]
impl LockHandle for MemoryLock {
    fn key(&self) -> &str {
        &self.key
    }

    async fn lock(&self, cancel: &CancellationToken) -> Result<LockOutcome> {
        let _guard = tokio::select! {
            biased;
            () = cancel.cancelled() => return Ok(LockOutcome::Cancelled),
            guard = self.guard.lock() => guard,
        };

        if self.held.load(Ordering::SeqCst) {
            return Err(Error::backend(
                format!("acquire lock '{}'", self.key),
                "lock is already held",
            ));
        }

        loop {
            if cancel.is_cancelled() {
                return Ok(LockOutcome::Cancelled);
            }

            // Register for the wake-up before checking so a release between
            // the check and the wait is not lost.
            let notified = self.shared.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.shared.try_lock(&self.key, self.owner) {
                self.held.store(true, Ordering::SeqCst);
                return Ok(LockOutcome::Held);
            }

            tokio::select! {
                biased;
                () = cancel.cancelled() => return Ok(LockOutcome::Cancelled),
                () = &mut notified => {}
            }
        }
    }

    async fn unlock(&self) -> Result<()> {
        if !self.held.swap(false, Ordering::SeqCst) {
            return Err(Error::backend(
                format!("release lock '{}'", self.key),
                "lock not held",
            ));
        }
        self.shared.unlock(&self.key, self.owner);
        Ok(())
    }

    fn is_held(&self) -> bool {
        self.held.load(Ordering::SeqCst)
    }
}

impl Drop for MemoryLock {
    fn drop(&mut self) {
        if self.held.load(Ordering::SeqCst) && self.shared.unlock(&self.key, self.owner) {
            tracing::debug!("Released lock '{}' held by dropped handle", self.key);
        }
    }
}

/// Connector handing out one shared [`MemoryBackend`].
#[derive(Debug, Default)]
pub struct MemoryConnector {
    backend: MemoryBackend,
    failure: Option<String>,
    attempts: AtomicUsize,
}

impl MemoryConnector {
    pub fn new(backend: MemoryBackend) -> Self {
        Self {
            backend,
            failure: None,
            attempts: AtomicUsize::new(0),
        }
    }

    /// Connector whose every attempt fails with `message`.
    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            failure: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn backend(&self) -> &MemoryBackend {
        &self.backend
    }

    /// Number of times `connect` ran.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, config: &OperatorConfig) -> Result<Arc<dyn Backend>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        // Yield so concurrent first callers genuinely overlap.
        tokio::task::yield_now().await;

        agent_base_url(&config.agent)?;
        if let Some(message) = &self.failure {
            return Err(Error::ConnectionFailed(message.clone()));
        }
        Ok(Arc::new(self.backend.clone()))
    }
}
