//! consul-op-core - Client-side coordination over a Consul-compatible backend
//!
//! This crate provides:
//! - A one-shot connected [`Operator`]
//! - Key-value access with modify indexes
//! - Distributed locks with a per-name handle cache and cancelable acquire
//! - Service registration with an attached health check
//! - Catalog queries
//!
//! ## Usage
//!
//! ```no_run
//! # async fn run() -> consul_op_core::Result<()> {
//! use consul_op_core::{LockOutcome, Operator};
//! use tokio_util::sync::CancellationToken;
//!
//! let mut operator = Operator::new("localhost:8500");
//! operator.fix_defaults();
//! operator.connect().await?;
//!
//! operator.put("app/config", b"v1").await?;
//! let cancel = CancellationToken::new();
//! if operator.acquire("deploy-lock", &cancel).await? == LockOutcome::Held {
//!     operator.release("deploy-lock").await?;
//! }
//! # Ok(())
//! # }
//! ```

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

pub mod agent_url;
pub mod backend;
pub mod config;
pub mod error;
pub mod netaddr;
pub mod operator;
pub mod shutdown;

pub use agent_url::AgentUrl;
pub use backend::{
    AgentServiceCheck, Backend, CatalogService, Connector, HttpBackend, HttpConnector, KvPair,
    LockHandle, LockOutcome, LockTiming, MemoryBackend, MemoryConnector, ServiceRegistration,
};
pub use config::OperatorConfig;
pub use error::{Error, Result};
pub use netaddr::IpDiscovery;
pub use operator::Operator;
pub use shutdown::{cancel_on_signal, signal_channels, wait_for_signal};
