//! Service registrar.

use super::Operator;
use crate::{
    backend::{AgentServiceCheck, ServiceRegistration},
    Result,
};

/// How long a service may stay critical before the agent drops it.
pub const DEREGISTER_CRITICAL_AFTER: &str = "1m";

impl Operator {
    /// Descriptor this operator registers: ID and name are the service name,
    /// with an HTTP health check on `http://{ip}:{port}/{path}` unless the
    /// agent URL overrode the probe.
    pub fn service_registration(&self) -> ServiceRegistration {
        let config = self.config();

        let check = match &config.check_tcp {
            Some(tcp) => AgentServiceCheck {
                tcp: Some(tcp.clone()),
                ..AgentServiceCheck::default()
            },
            None => AgentServiceCheck {
                http: Some(config.check_http.clone().unwrap_or_else(|| {
                    format!(
                        "http://{}:{}/{}",
                        config.ip,
                        config.port,
                        config.path.trim_start_matches('/')
                    )
                })),
                ..AgentServiceCheck::default()
            },
        };

        ServiceRegistration {
            id: config.name.clone(),
            name: config.name.clone(),
            address: config.ip.clone(),
            port: config.port,
            check: Some(AgentServiceCheck {
                interval: config.interval.clone(),
                deregister_critical_service_after: DEREGISTER_CRITICAL_AFTER.to_string(),
                ..check
            }),
        }
    }

    /// Register this operator's service with the agent.
    ///
    /// Registering an unchanged descriptor again is a no-op for the agent.
    pub async fn register_service(&self) -> Result<()> {
        let backend = self.backend()?;
        let registration = self.service_registration();
        tracing::info!(
            "Registering service {}",
            serde_json::to_string(&registration).unwrap_or_default()
        );
        backend.register_service(&registration).await
    }

    /// Remove this operator's service from the agent.
    ///
    /// Whether removing an unknown service fails is up to the backend.
    pub async fn deregister_service(&self) -> Result<()> {
        let backend = self.backend()?;
        let id = &self.config().name;
        backend.deregister_service(id).await?;
        tracing::info!("Deregistered service {id}");
        Ok(())
    }
}
