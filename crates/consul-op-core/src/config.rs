//! Operator configuration loading and defaults
//!
//! # Hierarchy
//!
//! Configuration is loaded in this order (later overrides earlier):
//! 1. Built-in defaults (empty; filled by [`OperatorConfig::fix_defaults`])
//! 2. YAML file: explicit path, or `<application name>.yml` in the current directory
//! 3. Environment variables: `CONSUL_OP_*`
//! 4. CLI flags (applied by the binary)
//!
//! # Example Config
//!
//! ```yaml
//! agent: consul://10.0.0.5:8500/app?check_interval=5s
//! name: billing
//! port: 9000
//! path: health
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{
    agent_url::{AgentUrl, AGENT_URL_SCHEME},
    netaddr::{detect_ip, IpDiscovery},
    Error, Result,
};

/// Agent used when none is configured.
pub const DEFAULT_AGENT: &str = "localhost:8500";
/// Health-check path used when none is configured.
pub const DEFAULT_HEALTH_PATH: &str = "health";
/// Service port used when none is configured.
pub const DEFAULT_SERVICE_PORT: u16 = 80;
/// Health-check interval used when none is configured.
pub const DEFAULT_CHECK_INTERVAL: &str = "10s";

const ENV_PREFIX: &str = "CONSUL_OP_";

/// Identity and settings for one logical client of the backend.
///
/// Empty strings and a zero port mean "unset".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OperatorConfig {
    /// Agent address, `host:port` or a `consul://` URL.
    pub agent: String,
    /// Address other services reach this one on.
    pub ip: String,
    pub port: u16,
    /// Service name, used as both ID and Name on registration. Older config
    /// files spell the key `Name`.
    #[serde(alias = "Name")]
    pub name: String,
    /// Path of the HTTP health endpoint, without leading slash.
    pub path: String,
    /// Health-check interval in Consul duration syntax (`10s`).
    pub interval: String,
    /// ACL token sent as `X-Consul-Token`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Full HTTP probe URL replacing the generated one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub check_http: Option<String>,
    /// `host:port` for a TCP probe, used instead of HTTP.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub check_tcp: Option<String>,
    /// Order of self-IP discovery strategies.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub ip_discovery: Vec<IpDiscovery>,
}

impl OperatorConfig {
    /// Config for the given agent with every other field unset.
    pub fn new(agent: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
            ..Self::default()
        }
    }

    /// Fill unset fields, detecting the service IP if needed.
    pub fn fix_defaults(&mut self) {
        let order = if self.ip_discovery.is_empty() {
            IpDiscovery::DEFAULT_ORDER.to_vec()
        } else {
            self.ip_discovery.clone()
        };
        self.fix_defaults_with(|| detect_ip(&order).map(|ip| ip.to_string()));
    }

    /// Fill unset fields, using `detect_ip` only when no IP is configured.
    pub fn fix_defaults_with(&mut self, detect_ip: impl FnOnce() -> Option<String>) {
        self.normalize_agent();

        if self.path.is_empty() {
            self.path = DEFAULT_HEALTH_PATH.to_string();
        }
        if self.port == 0 {
            self.port = DEFAULT_SERVICE_PORT;
        }
        if self.ip.is_empty() {
            match detect_ip() {
                Some(ip) => self.ip = ip,
                None => tracing::warn!("Could not detect a service IP; registration will omit it"),
            }
        }
        if self.interval.is_empty() {
            self.interval = DEFAULT_CHECK_INTERVAL.to_string();
        }
    }

    fn normalize_agent(&mut self) {
        if self.agent.trim().is_empty() {
            self.agent = DEFAULT_AGENT.to_string();
            return;
        }
        if !self.agent.starts_with(&format!("{AGENT_URL_SCHEME}://")) {
            return;
        }

        match AgentUrl::parse(&self.agent) {
            Ok(url) => {
                self.agent = url.address();
                if self.interval.is_empty() {
                    if let Some(interval) = url.check_interval {
                        self.interval = interval;
                    }
                }
                if url.check_http.is_some() {
                    self.check_http = url.check_http;
                }
                if url.check_tcp.is_some() {
                    self.check_tcp = url.check_tcp;
                }
            }
            Err(e) => {
                tracing::warn!("Parse agent url ({}) failed ({e}), keeping it as is", self.agent);
            }
        }
    }

    /// Apply `CONSUL_OP_*` environment overrides.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if `CONSUL_OP_PORT` is not a valid port.
    pub fn apply_env_vars(mut self) -> Result<Self> {
        let var = |name: &str| {
            std::env::var(format!("{ENV_PREFIX}{name}"))
                .ok()
                .filter(|v| !v.is_empty())
        };

        if let Some(agent) = var("AGENT") {
            self.agent = agent;
        }
        if let Some(ip) = var("IP") {
            self.ip = ip;
        }
        if let Some(port) = var("PORT") {
            self.port = port.parse().map_err(|e| {
                Error::InvalidConfig(format!("{ENV_PREFIX}PORT='{port}' is not a port: {e}"))
            })?;
        }
        if let Some(name) = var("NAME") {
            self.name = name;
        }
        if let Some(path) = var("PATH") {
            self.path = path;
        }
        if let Some(interval) = var("INTERVAL") {
            self.interval = interval;
        }
        if let Some(token) = var("TOKEN") {
            self.token = Some(token);
        }

        Ok(self)
    }
}

/// Default config file: `<application name>.yml` in the current directory.
///
/// # Errors
///
/// Returns error if the executable name cannot be determined
pub fn default_config_path() -> Result<PathBuf> {
    let exe = std::env::current_exe()
        .map_err(|e| Error::IoError(format!("Failed to get executable path: {e}")))?;
    let name = exe
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| Error::IoError(format!("Executable path has no name: {}", exe.display())))?;
    Ok(PathBuf::from(format!("{name}.yml")))
}

/// Load a YAML config file.
///
/// # Errors
///
/// Returns error if:
/// - File cannot be read
/// - Path is a directory instead of a file
/// - YAML is malformed
pub fn load(path: Option<&Path>) -> Result<OperatorConfig> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => default_config_path()?,
    };

    if path.is_dir() {
        return Err(Error::IoError(format!(
            "Config path is a directory, not a file: {}",
            path.display()
        )));
    }

    let content = std::fs::read_to_string(&path).map_err(|e| {
        Error::IoError(format!("Failed to read config file {}: {e}", path.display()))
    })?;

    serde_yaml::from_str(&content).map_err(|e| {
        Error::ParseError(format!("Failed to parse config file {}: {e}", path.display()))
    })
}

/// Load a config from YAML held in memory.
///
/// # Errors
///
/// Returns `ParseError` if the YAML is malformed
pub fn load_str(yaml: &str) -> Result<OperatorConfig> {
    Ok(serde_yaml::from_str(yaml)?)
}

/// Save a config as YAML.
///
/// # Errors
///
/// Returns error if the config cannot be serialized or the file written
pub fn save(config: &OperatorConfig, path: Option<&Path>) -> Result<()> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => default_config_path()?,
    };
    let yaml = serde_yaml::to_string(config)?;
    std::fs::write(&path, yaml).map_err(|e| {
        Error::IoError(format!("Failed to write config file {}: {e}", path.display()))
    })
}

/// Load configuration from all sources.
///
/// An explicit `path` must exist; the default file is optional.
///
/// # Errors
///
/// Returns error if a file is unreadable or malformed, or an environment
/// override is invalid
pub fn load_config(path: Option<&Path>) -> Result<OperatorConfig> {
    let config = match path {
        Some(p) => load(Some(p))?,
        None => {
            let default_path = default_config_path()?;
            if default_path.is_file() {
                load(Some(&default_path))?
            } else {
                OperatorConfig::default()
            }
        }
    };

    config.apply_env_vars()
}

#[cfg(test)]
mod tests {
    use serial_test::serial;

    use super::*;

    fn no_ip() -> Option<String> {
        None
    }

    #[test]
    fn test_fix_defaults_on_empty_config() {
        let mut config = OperatorConfig::new("");
        config.fix_defaults_with(|| Some("192.168.1.7".to_string()));

        assert_eq!(config.agent, "localhost:8500");
        assert_eq!(config.path, "health");
        assert_eq!(config.port, 80);
        assert_eq!(config.interval, "10s");
        assert_eq!(config.ip, "192.168.1.7");
    }

    #[test]
    fn test_fix_defaults_keeps_set_fields() {
        let mut config = OperatorConfig {
            agent: "consul.local:8501".into(),
            ip: "10.0.0.1".into(),
            port: 9000,
            path: "ready".into(),
            interval: "3s".into(),
            ..OperatorConfig::default()
        };
        config.fix_defaults_with(|| unreachable!("IP is already set"));

        assert_eq!(config.agent, "consul.local:8501");
        assert_eq!(config.ip, "10.0.0.1");
        assert_eq!(config.port, 9000);
        assert_eq!(config.path, "ready");
        assert_eq!(config.interval, "3s");
    }

    #[test]
    fn test_fix_defaults_normalizes_agent_url() {
        let mut config = OperatorConfig::new(
            "consul://10.9.8.7:8500/cfg?check_interval=30s&check_tcp=10.0.0.2:9000",
        );
        config.fix_defaults_with(no_ip);

        assert_eq!(config.agent, "10.9.8.7:8500");
        assert_eq!(config.interval, "30s");
        assert_eq!(config.check_tcp.as_deref(), Some("10.0.0.2:9000"));
        assert_eq!(config.check_http, None);
        assert_eq!(config.ip, "");
    }

    #[test]
    fn test_configured_interval_wins_over_url() {
        let mut config = OperatorConfig {
            agent: "consul://a:1?check_interval=30s".into(),
            interval: "2s".into(),
            ..OperatorConfig::default()
        };
        config.fix_defaults_with(no_ip);
        assert_eq!(config.interval, "2s");
    }

    #[test]
    fn test_load_str_yaml() -> Result<()> {
        let config = load_str(
            "agent: localhost:8500\nname: svc-a\nport: 9000\nip_discovery: [internal]\n",
        )?;
        assert_eq!(config.name, "svc-a");
        assert_eq!(config.port, 9000);
        assert_eq!(config.ip_discovery, vec![IpDiscovery::Internal]);
        assert!(config.path.is_empty());
        Ok(())
    }

    #[test]
    fn test_load_str_accepts_capitalized_name() -> Result<()> {
        let config = load_str("agent: localhost:8500\nName: legacy-svc\nport: 8080\n")?;
        assert_eq!(config.name, "legacy-svc");
        assert_eq!(config.port, 8080);
        Ok(())
    }

    #[test]
    fn test_load_str_rejects_bad_yaml() {
        assert!(matches!(load_str("port: [not a port"), Err(Error::ParseError(_))));
    }

    #[test]
    fn test_save_and_load_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("svc.yml");
        let config = OperatorConfig {
            agent: "localhost:8500".into(),
            name: "svc-a".into(),
            port: 9000,
            token: Some("secret".into()),
            ..OperatorConfig::default()
        };

        save(&config, Some(&path))?;
        assert_eq!(load(Some(&path))?, config);
        Ok(())
    }

    #[test]
    fn test_load_directory_is_error() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let result = load(Some(dir.path()));
        assert!(matches!(result, Err(Error::IoError(msg)) if msg.contains("directory")));
        Ok(())
    }

    #[test]
    fn test_load_missing_explicit_file_is_error() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let result = load_config(Some(&dir.path().join("absent.yml")));
        assert!(matches!(result, Err(Error::IoError(_))));
        Ok(())
    }

    #[test]
    #[serial]
    fn test_env_overrides() -> Result<()> {
        std::env::set_var("CONSUL_OP_AGENT", "env-agent:8500");
        std::env::set_var("CONSUL_OP_PORT", "7000");
        std::env::set_var("CONSUL_OP_TOKEN", "tok");
        let config = OperatorConfig::new("file-agent:8500").apply_env_vars();
        std::env::remove_var("CONSUL_OP_AGENT");
        std::env::remove_var("CONSUL_OP_PORT");
        std::env::remove_var("CONSUL_OP_TOKEN");

        let config = config?;
        assert_eq!(config.agent, "env-agent:8500");
        assert_eq!(config.port, 7000);
        assert_eq!(config.token.as_deref(), Some("tok"));
        Ok(())
    }

    #[test]
    #[serial]
    fn test_env_invalid_port() {
        std::env::set_var("CONSUL_OP_PORT", "eighty");
        let result = OperatorConfig::default().apply_env_vars();
        std::env::remove_var("CONSUL_OP_PORT");
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }
}
