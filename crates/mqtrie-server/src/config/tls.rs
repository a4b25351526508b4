//! TLS configuration keys.
//!
//! Parsed and validated so deployments can carry the section; the transport
//! wiring itself is outside the broker core.

use std::path::PathBuf;

use serde::Deserialize;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TlsConfig {
    pub enabled: bool,
    pub cert: PathBuf,
    pub key: PathBuf,
    /// Minimum TLS version, e.g. "1.2".
    pub min_version: Option<String>,
}

impl TlsConfig {
    pub fn validate(&self) -> Result<(), String> {
        if let Some(ref version) = self.min_version {
            if !matches!(version.as_str(), "1.0" | "1.1" | "1.2" | "1.3") {
                return Err(format!("tls.minVersion '{}' is not a TLS version", version));
            }
        }
        if !self.enabled {
            return Ok(());
        }
        if self.cert.as_os_str().is_empty() {
            return Err("tls.cert is required when tls.enabled".to_string());
        }
        if self.key.as_os_str().is_empty() {
            return Err("tls.key is required when tls.enabled".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_is_valid() {
        assert!(TlsConfig::default().validate().is_ok());
    }

    #[test]
    fn test_min_version_checked() {
        let tls = TlsConfig {
            min_version: Some("1.4".to_string()),
            ..Default::default()
        };
        assert!(tls.validate().is_err());

        let tls = TlsConfig {
            min_version: Some("1.2".to_string()),
            ..Default::default()
        };
        assert!(tls.validate().is_ok());
    }

    #[test]
    fn test_enabled_requires_cert_and_key() {
        let tls = TlsConfig {
            enabled: true,
            ..Default::default()
        };
        assert!(tls.validate().is_err());

        let tls = TlsConfig {
            enabled: true,
            cert: PathBuf::from("/etc/mqtrie/cert.pem"),
            key: PathBuf::from("/etc/mqtrie/key.pem"),
            ..Default::default()
        };
        assert!(tls.validate().is_ok());
    }
}
