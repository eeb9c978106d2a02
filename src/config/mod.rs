//! Connection configuration.
//!
//! Supports configuration from:
//! - Builder-style `with_*` methods
//! - TOML config files
//! - Environment variables (`C2S_` prefix)

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{C2sError, Result};

/// TLS policy for the stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecurityMode {
    /// Never attempt STARTTLS, even if offered.
    Disabled,
    /// Use STARTTLS when the server offers it (default).
    #[default]
    IfPossible,
    /// Refuse to authenticate unless TLS was established.
    Required,
}

impl std::str::FromStr for SecurityMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "disabled" | "off" => Ok(Self::Disabled),
            "ifpossible" | "if-possible" | "opportunistic" => Ok(Self::IfPossible),
            "required" => Ok(Self::Required),
            _ => Err(format!("Unknown security mode: {s}")),
        }
    }
}

/// Connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// XMPP service domain, e.g. `example.org`.
    pub domain: String,

    /// Host override. When unset the domain is used as the host.
    pub host: Option<String>,

    /// Server port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Requested resourcepart. The server may assign a different one.
    pub resource: Option<String>,

    /// Authorization identity forwarded to SASL mechanisms.
    pub authzid: Option<String>,

    /// TLS policy.
    #[serde(default)]
    pub security: SecurityMode,

    /// Attempt stream compression when the server offers it.
    #[serde(default)]
    pub compression_enabled: bool,

    /// Treat compression as mandatory: a login walk must pass through the
    /// compression state and fails outright when entering it fails.
    #[serde(default)]
    pub compression_required: bool,

    /// Reply timeout for negotiation round trips, in milliseconds.
    #[serde(default = "default_reply_timeout_ms")]
    pub reply_timeout_ms: u64,

    /// Capacity of the diagnostic event queue. Events beyond this are
    /// dropped rather than blocking the negotiation thread.
    #[serde(default = "default_event_queue_capacity")]
    pub event_queue_capacity: usize,
}

fn default_port() -> u16 {
    5222
}

fn default_reply_timeout_ms() -> u64 {
    5_000
}

fn default_event_queue_capacity() -> usize {
    256
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            domain: "localhost".to_string(),
            host: None,
            port: 5222,
            resource: None,
            authzid: None,
            security: SecurityMode::IfPossible,
            compression_enabled: false,
            compression_required: false,
            reply_timeout_ms: 5_000,
            event_queue_capacity: 256,
        }
    }
}

impl ConnectionConfig {
    /// Create a configuration for the given service domain.
    pub fn new(domain: &str) -> Self {
        Self {
            domain: domain.to_string(),
            ..Self::default()
        }
    }

    /// Load configuration from a TOML file.
    pub fn from_file(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let content = std::fs::read_to_string(&path)
            .map_err(|e| C2sError::Config(format!("Failed to read config file: {e}")))?;

        Ok(toml::from_str(&content)?)
    }

    /// Load configuration from environment variables, starting from defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(domain) = std::env::var("C2S_DOMAIN") {
            config.domain = domain;
        }
        if let Ok(host) = std::env::var("C2S_HOST") {
            config.host = Some(host);
        }
        if let Ok(port) = std::env::var("C2S_PORT") {
            if let Ok(port) = port.parse() {
                config.port = port;
            }
        }
        if let Ok(resource) = std::env::var("C2S_RESOURCE") {
            config.resource = Some(resource);
        }
        if let Ok(mode) = std::env::var("C2S_SECURITY") {
            if let Ok(mode) = mode.parse() {
                config.security = mode;
            }
        }
        if let Ok(val) = std::env::var("C2S_COMPRESSION") {
            config.compression_enabled = matches!(val.as_str(), "1" | "true" | "yes");
        }
        if let Ok(val) = std::env::var("C2S_REPLY_TIMEOUT_MS") {
            if let Ok(val) = val.parse() {
                config.reply_timeout_ms = val;
            }
        }

        config
    }

    /// Set the host override.
    pub fn with_host(mut self, host: &str) -> Self {
        self.host = Some(host.to_string());
        self
    }

    /// Set the server port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the requested resourcepart.
    pub fn with_resource(mut self, resource: &str) -> Self {
        self.resource = Some(resource.to_string());
        self
    }

    /// Set the TLS policy.
    pub fn with_security(mut self, security: SecurityMode) -> Self {
        self.security = security;
        self
    }

    /// Enable or disable stream compression.
    pub fn with_compression(mut self, enabled: bool) -> Self {
        self.compression_enabled = enabled;
        self
    }

    /// Make stream compression mandatory for login walks. Implies
    /// enabling it.
    pub fn with_required_compression(mut self) -> Self {
        self.compression_enabled = true;
        self.compression_required = true;
        self
    }

    /// Set the reply timeout.
    pub fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// The host to connect to: the override if set, the domain otherwise.
    pub fn effective_host(&self) -> &str {
        self.host.as_deref().unwrap_or(&self.domain)
    }

    /// Reply timeout as a [`Duration`].
    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ConnectionConfig::default();
        assert_eq!(config.port, 5222);
        assert_eq!(config.security, SecurityMode::IfPossible);
        assert!(!config.compression_enabled);
        assert_eq!(config.reply_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_effective_host_prefers_override() {
        let config = ConnectionConfig::new("example.org");
        assert_eq!(config.effective_host(), "example.org");

        let config = config.with_host("xmpp.example.org");
        assert_eq!(config.effective_host(), "xmpp.example.org");
    }

    #[test]
    fn test_config_from_toml() {
        let toml = r#"
            domain = "example.org"
            port = 5223
            resource = "laptop"
            security = "required"
            compression_enabled = true
            reply_timeout_ms = 10000
            event_queue_capacity = 64
        "#;

        let config: ConnectionConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.domain, "example.org");
        assert_eq!(config.port, 5223);
        assert_eq!(config.resource.as_deref(), Some("laptop"));
        assert_eq!(config.security, SecurityMode::Required);
        assert!(config.compression_enabled);
        assert_eq!(config.reply_timeout_ms, 10_000);
    }

    #[test]
    fn test_security_mode_from_str() {
        assert_eq!(
            "required".parse::<SecurityMode>().unwrap(),
            SecurityMode::Required
        );
        assert_eq!(
            "if-possible".parse::<SecurityMode>().unwrap(),
            SecurityMode::IfPossible
        );
        assert!("sometimes".parse::<SecurityMode>().is_err());
    }
}
