//! The [`Operator`]: one logical client of the coordination backend.
//!
//! An operator is configured, connected once, and then used for key-value
//! access ([`kv`]), distributed locks ([`locks`]), service registration
//! ([`registrar`]) and catalog queries ([`catalog`]). Every operation other
//! than [`Operator::connect`] fails with [`Error::NotConnected`] until a
//! connect has succeeded.

use std::sync::Arc;

use tokio::sync::OnceCell;

use crate::{
    backend::{Backend, Connector, HttpConnector},
    Error, OperatorConfig, Result,
};

pub mod catalog;
pub mod kv;
pub mod locks;
pub mod registrar;

use locks::LockCache;

/// Client of a Consul-compatible backend.
///
/// Shareable across tasks behind an `Arc`; every method takes `&self`
/// except configuration mutation.
#[derive(Debug)]
pub struct Operator {
    config: OperatorConfig,
    connector: Arc<dyn Connector>,
    /// Result of the single connect attempt.
    backend: OnceCell<Result<Arc<dyn Backend>>>,
    locks: LockCache,
}

impl Operator {
    /// Operator talking HTTP to `agent`, all other fields unset.
    pub fn new(agent: impl Into<String>) -> Self {
        Self::from_config(OperatorConfig::new(agent))
    }

    /// Operator talking HTTP to the agent named in `config`.
    pub fn from_config(config: OperatorConfig) -> Self {
        Self::with_connector(config, Arc::new(HttpConnector::new()))
    }

    /// Operator building its backend through `connector`.
    pub fn with_connector(config: OperatorConfig, connector: Arc<dyn Connector>) -> Self {
        Self {
            config,
            connector,
            backend: OnceCell::new(),
            locks: LockCache::default(),
        }
    }

    pub const fn config(&self) -> &OperatorConfig {
        &self.config
    }

    /// Changes made after `connect()` do not affect the existing backend.
    pub fn config_mut(&mut self) -> &mut OperatorConfig {
        &mut self.config
    }

    /// Fill unset configuration fields with defaults.
    pub fn fix_defaults(&mut self) {
        self.config.fix_defaults();
    }

    /// Build the backend client, exactly once.
    ///
    /// Concurrent callers wait for the same attempt. A failed attempt is
    /// never retried: this and every later call return its error.
    ///
    /// # Errors
    ///
    /// Returns `ConnectionFailed` if the agent address is malformed or the
    /// agent is unreachable
    pub async fn connect(&self) -> Result<()> {
        let result = self
            .backend
            .get_or_init(|| async {
                tracing::debug!("Connecting to agent {}", self.config.agent);
                match self.connector.connect(&self.config).await {
                    Ok(backend) => {
                        tracing::info!("Connected to agent {}", self.config.agent);
                        Ok(backend)
                    }
                    Err(e) => {
                        let e = match e {
                            Error::ConnectionFailed(_) => e,
                            other => Error::ConnectionFailed(other.to_string()),
                        };
                        tracing::error!("Failed to connect to agent {}: {e}", self.config.agent);
                        Err(e)
                    }
                }
            })
            .await;

        result.as_ref().map(|_| ()).map_err(Clone::clone)
    }

    /// Whether a connect attempt has completed successfully.
    pub fn is_connected(&self) -> bool {
        matches!(self.backend.get(), Some(Ok(_)))
    }

    fn backend(&self) -> Result<&Arc<dyn Backend>> {
        match self.backend.get() {
            Some(Ok(backend)) => Ok(backend),
            Some(Err(e)) => Err(e.clone()),
            None => Err(Error::NotConnected),
        }
    }
}
