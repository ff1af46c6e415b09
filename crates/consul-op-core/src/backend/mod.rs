//! Backend abstraction over a Consul-compatible coordination service.
//!
//! The [`Operator`](crate::Operator) only talks to these traits. Two
//! implementations ship with the crate:
//!
//! - [`http`]: the Consul HTTP API (production)
//! - [`memory`]: an in-process backend for tests and local runs

use std::{collections::HashMap, fmt, sync::Arc};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::{OperatorConfig, Result};

pub mod http;
pub mod memory;

pub use http::{HttpBackend, HttpConnector, LockTiming};
pub use memory::{MemoryBackend, MemoryConnector};

/// A key-value entry as stored by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvPair {
    pub key: String,
    pub value: Vec<u8>,
    /// Backend-assigned counter, increases on every write to the key.
    pub modify_index: u64,
    pub flags: u64,
    /// Session currently holding the key as a lock, if any.
    pub session: Option<String>,
}

/// Terminal outcome of a lock acquisition.
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOutcome {
    /// Cluster-wide exclusive ownership granted.
    Held,
    /// The caller's cancellation token fired before the lock was granted.
    Cancelled,
}

impl LockOutcome {
    pub const fn is_held(self) -> bool {
        matches!(self, Self::Held)
    }
}

/// Health check attached to a service registration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AgentServiceCheck {
    #[serde(rename = "HTTP", skip_serializing_if = "Option::is_none")]
    pub http: Option<String>,
    #[serde(rename = "TCP", skip_serializing_if = "Option::is_none")]
    pub tcp: Option<String>,
    pub interval: String,
    pub deregister_critical_service_after: String,
}

/// Service descriptor submitted to the agent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServiceRegistration {
    #[serde(rename = "ID")]
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub address: String,
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub check: Option<AgentServiceCheck>,
}

/// One catalog entry for a service instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct CatalogService {
    #[serde(rename = "ID")]
    pub id: String,
    pub node: String,
    pub address: String,
    pub datacenter: String,
    #[serde(rename = "ServiceID")]
    pub service_id: String,
    pub service_name: String,
    pub service_address: String,
    pub service_port: u16,
    #[serde(deserialize_with = "null_as_default")]
    pub service_tags: Vec<String>,
    pub create_index: u64,
    pub modify_index: u64,
}

fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Option::unwrap_or_default)
}

/// Per-name distributed lock handle.
///
/// A handle is created once per lock name and reused across acquisitions.
#[async_trait]
pub trait LockHandle: Send + Sync + fmt::Debug {
    /// Lock name this handle is bound to.
    fn key(&self) -> &str;

    /// Wait until the lock is granted or `cancel` fires.
    ///
    /// Fails if this handle already holds the lock.
    async fn lock(&self, cancel: &CancellationToken) -> Result<LockOutcome>;

    /// Give the lock back. Fails if it is not held.
    async fn unlock(&self) -> Result<()>;

    /// Whether this handle currently believes it holds the lock.
    fn is_held(&self) -> bool;
}

/// Connected client of the coordination backend.
#[async_trait]
pub trait Backend: Send + Sync + fmt::Debug {
    /// `Ok(None)` when the key has no entry.
    async fn kv_get(&self, key: &str) -> Result<Option<KvPair>>;

    async fn kv_put(&self, key: &str, value: &[u8]) -> Result<()>;

    /// Deleting an absent key succeeds.
    async fn kv_delete(&self, key: &str) -> Result<()>;

    /// Build a lock handle for `key`. Local only; no network round trip.
    fn lock_handle(&self, key: &str) -> Result<Arc<dyn LockHandle>>;

    async fn register_service(&self, registration: &ServiceRegistration) -> Result<()>;

    async fn deregister_service(&self, service_id: &str) -> Result<()>;

    async fn catalog_service(&self, name: &str) -> Result<Vec<CatalogService>>;

    /// Every known service name mapped to its tags.
    async fn catalog_services(&self) -> Result<HashMap<String, Vec<String>>>;
}

/// Builds a [`Backend`] from an operator's configuration.
#[async_trait]
pub trait Connector: Send + Sync + fmt::Debug {
    async fn connect(&self, config: &OperatorConfig) -> Result<Arc<dyn Backend>>;
}
