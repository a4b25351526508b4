//! Broker configuration.
//!
//! Loaded from a YAML file (`--config <path>`) with in-file environment
//! variable substitution: `${VAR}` or `${VAR:-default}`. Keys are camelCase:
//!
//! ```yaml
//! tcpAddress: "127.0.0.1:9798"
//! heartbeatTimeout: 60000        # milliseconds
//! flushInterval: 250             # milliseconds
//! maxMsgSize: 1048576            # bytes
//! mstorage:
//!   provider: fjall
//!   config:
//!     path: "${MQTRIE_DATA:-/var/lib/mqtrie}/messages"
//! ```

mod storage;
mod tls;

pub use storage::ProviderInfo;
pub use tls::TlsConfig;

use std::path::Path;
use std::time::Duration;

use config::{File, FileFormat};
use regex::Regex;
use serde::Deserialize;
use thiserror::Error;

/// Configuration error.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Validation error: {0}")]
    Validation(String),
}

/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> String {
    let re = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}").unwrap();
    re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        std::env::var(var_name).unwrap_or_else(|_| default.to_string())
    })
    .to_string()
}

/// Root configuration structure.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// Default log filter level.
    pub log_level: String,
    /// TCP listen address for the MQTT wire protocol.
    pub tcp_address: String,
    /// Reserved for the HTTP admin/query surface.
    pub http_address: String,
    /// Heartbeat timeout in milliseconds; reads deadline at half of this.
    /// Zero disables the read deadline.
    pub heartbeat_timeout: u64,
    /// Outbound flush tick in milliseconds.
    pub flush_interval: u64,
    /// Maximum wire packet size in bytes (0 = unlimited).
    pub max_msg_size: usize,
    /// Treat publish payloads as identity-bearing JSON envelopes and
    /// validate them against the connection.
    pub structured_payload: bool,
    /// Message storage provider.
    pub mstorage: ProviderInfo,
    /// Subscription storage provider.
    pub sstorage: ProviderInfo,
    /// Sequence generator provider.
    pub seqgen: ProviderInfo,
    /// TLS settings (validated; transport wiring is not part of the core).
    pub tls: TlsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            tcp_address: "127.0.0.1:9798".to_string(),
            http_address: "127.0.0.1:9799".to_string(),
            heartbeat_timeout: 60_000,
            flush_interval: 250,
            max_msg_size: 1024 * 1024,
            structured_payload: false,
            mstorage: ProviderInfo::default(),
            sstorage: ProviderInfo::default(),
            seqgen: ProviderInfo::default(),
            tls: TlsConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a YAML file. A missing path yields defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse configuration from a YAML string.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let substituted = substitute_env_vars(content);
        let cfg = config::Config::builder()
            .add_source(File::from_str(&substituted, FileFormat::Yaml))
            .build()?;
        let config: Config = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.tls.validate().map_err(ConfigError::Validation)?;
        if self.tcp_address.parse::<std::net::SocketAddr>().is_err() {
            return Err(ConfigError::Validation(format!(
                "tcpAddress '{}' is not a socket address",
                self.tcp_address
            )));
        }
        Ok(())
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval)
    }
}
