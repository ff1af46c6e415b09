//! Agent address parsing.
//!
//! An agent is configured either as a bare `host:port` or as
//! `consul://host:port/configPath?check_interval=..&check_http=..&check_tcp=..`.

use url::Url;

use crate::{Error, Result};

/// Scheme accepted by [`AgentUrl::parse`].
pub const AGENT_URL_SCHEME: &str = "consul";

/// Port used when a `consul://` URL omits one.
pub const DEFAULT_AGENT_PORT: u16 = 8500;

/// A parsed `consul://` agent URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentUrl {
    pub host: String,
    pub port: u16,
    /// Path component, e.g. `/service/config`.
    pub config_path: String,
    /// Every query parameter in order of appearance.
    pub values: Vec<(String, String)>,
    pub check_interval: Option<String>,
    pub check_http: Option<String>,
    pub check_tcp: Option<String>,
}

impl AgentUrl {
    /// Parse a `consul://` URL.
    ///
    /// # Errors
    ///
    /// Returns `ParseError` when the string is not a URL and `InvalidConfig`
    /// when the scheme is not `consul` or the host is missing.
    pub fn parse(input: &str) -> Result<Self> {
        let url = Url::parse(input)
            .map_err(|e| Error::ParseError(format!("invalid agent url '{input}': {e}")))?;

        if url.scheme() != AGENT_URL_SCHEME {
            return Err(Error::InvalidConfig(format!(
                "expected scheme {AGENT_URL_SCHEME}, not {}",
                url.scheme()
            )));
        }

        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| Error::InvalidConfig(format!("agent url '{input}' has no host")))?
            .to_string();

        let values: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();

        let query = |name: &str| {
            values
                .iter()
                .find(|(k, v)| k == name && !v.is_empty())
                .map(|(_, v)| v.clone())
        };

        Ok(Self {
            port: url.port().unwrap_or(DEFAULT_AGENT_PORT),
            config_path: url.path().to_string(),
            check_interval: query("check_interval"),
            check_http: query("check_http"),
            check_tcp: query("check_tcp"),
            host,
            values,
        })
    }

    /// Normalized `host:port` form handed to the connection layer.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Build the HTTP base URL for an agent address.
///
/// Accepts `host:port`, or an explicit `http://` / `https://` URL.
///
/// # Errors
///
/// Returns `ConnectionFailed` when the address is empty or malformed.
pub fn agent_base_url(agent: &str) -> Result<Url> {
    let agent = agent.trim();
    if agent.is_empty() {
        return Err(Error::ConnectionFailed("agent address is empty".into()));
    }

    let candidate = if agent.contains("://") {
        agent.to_string()
    } else {
        format!("http://{agent}")
    };

    let url = Url::parse(&candidate)
        .map_err(|e| Error::ConnectionFailed(format!("malformed agent address '{agent}': {e}")))?;

    match url.scheme() {
        "http" | "https" => {}
        other => {
            return Err(Error::ConnectionFailed(format!(
                "unsupported agent scheme '{other}' in '{agent}'"
            )))
        }
    }

    if url.host_str().map_or(true, str::is_empty) {
        return Err(Error::ConnectionFailed(format!(
            "agent address '{agent}' has no host"
        )));
    }

    Ok(url)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn test_parse_full_url() -> Result<()> {
        let parsed = AgentUrl::parse(
            "consul://10.1.2.3:8600/app/config?check_interval=5s&check_http=http://me/ping&check_tcp=",
        )?;
        assert_eq!(parsed.host, "10.1.2.3");
        assert_eq!(parsed.port, 8600);
        assert_eq!(parsed.config_path, "/app/config");
        assert_eq!(parsed.check_interval.as_deref(), Some("5s"));
        assert_eq!(parsed.check_http.as_deref(), Some("http://me/ping"));
        assert_eq!(parsed.check_tcp, None);
        assert_eq!(parsed.address(), "10.1.2.3:8600");
        assert_eq!(parsed.values.len(), 3);
        Ok(())
    }

    #[test]
    fn test_parse_defaults_port() -> Result<()> {
        let parsed = AgentUrl::parse("consul://agent.local")?;
        assert_eq!(parsed.port, DEFAULT_AGENT_PORT);
        assert_eq!(parsed.address(), "agent.local:8500");
        Ok(())
    }

    #[test]
    fn test_parse_rejects_other_scheme() {
        let result = AgentUrl::parse("http://localhost:8500");
        assert!(matches!(result, Err(Error::InvalidConfig(msg)) if msg.contains("http")));
    }

    #[test]
    fn test_bare_host_port_is_not_an_agent_url() {
        assert!(AgentUrl::parse("localhost:8500").is_err());
        assert!(AgentUrl::parse("10.0.0.1:8500").is_err());
    }

    #[test]
    fn test_agent_base_url() -> Result<()> {
        assert_eq!(
            agent_base_url("localhost:8500")?.as_str(),
            "http://localhost:8500/"
        );
        assert_eq!(
            agent_base_url("https://consul.internal")?.as_str(),
            "https://consul.internal/"
        );
        Ok(())
    }

    #[test]
    fn test_agent_base_url_rejects_malformed() {
        assert!(matches!(agent_base_url(""), Err(Error::ConnectionFailed(_))));
        assert!(matches!(
            agent_base_url("localhost:notaport"),
            Err(Error::ConnectionFailed(_))
        ));
        assert!(matches!(
            agent_base_url("bad host:8500"),
            Err(Error::ConnectionFailed(_))
        ));
        assert!(matches!(
            agent_base_url("ftp://localhost:8500"),
            Err(Error::ConnectionFailed(_))
        ));
    }

    proptest! {
        #[test]
        fn prop_host_and_port_survive_parsing(
            host in "[a-z][a-z0-9]{0,15}(\\.[a-z][a-z0-9]{0,7}){0,2}",
            port in 1u16..,
        ) {
            let parsed = AgentUrl::parse(&format!("consul://{host}:{port}/cfg"));
            prop_assert!(parsed.is_ok());
            if let Ok(parsed) = parsed {
                prop_assert_eq!(parsed.address(), format!("{host}:{port}"));
            }
        }
    }
}
