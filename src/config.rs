// src/config.rs
//! Relay configuration.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::allocator::{AllocatorError, AllocatorResult};

/// Relay allocation configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// IP relayed addresses are bound on
    pub relay_ip: IpAddr,
    /// Port scanning starts just above this one
    pub base_port: u16,
    /// Highest relay port
    pub max_port: u16,
    /// Bind attempts per allocation before giving up
    pub max_bind_attempts: u32,
    /// Seconds between expiry sweeps
    pub collect_interval_secs: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            relay_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            base_port: 49151,
            max_port: 65535,
            max_bind_attempts: 16,
            collect_interval_secs: 10,
        }
    }
}

impl RelayConfig {
    /// Load configuration from a JSON file; missing fields take defaults
    pub fn from_file(path: impl AsRef<Path>) -> AllocatorResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| AllocatorError::Config(format!("{}: {}", path.display(), e)))?;

        let config: Self = serde_json::from_str(&raw)
            .map_err(|e| AllocatorError::Config(format!("{}: {}", path.display(), e)))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> AllocatorResult<()> {
        if self.base_port >= self.max_port {
            return Err(AllocatorError::Config(format!(
                "base_port {} must be below max_port {}", self.base_port, self.max_port
            )));
        }
        if self.max_bind_attempts == 0 {
            return Err(AllocatorError::Config("max_bind_attempts must be at least 1".into()));
        }
        if self.collect_interval_secs == 0 {
            return Err(AllocatorError::Config("collect_interval_secs must be positive".into()));
        }
        Ok(())
    }

    pub fn base_addr(&self) -> SocketAddr {
        SocketAddr::new(self.relay_ip, self.base_port)
    }

    pub fn collect_interval(&self) -> Duration {
        Duration::from_secs(self.collect_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = RelayConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.base_addr(), "0.0.0.0:49151".parse().unwrap());
        assert_eq!(config.collect_interval(), Duration::from_secs(10));
    }

    #[test]
    fn test_load_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let raw = r#"{ "relay_ip": "127.0.0.1", "base_port": 5000, "max_port": 5100 }"#;
        file.write_all(raw.as_bytes()).unwrap();

        let config = RelayConfig::from_file(file.path()).unwrap();
        assert_eq!(config.relay_ip, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!((config.base_port, config.max_port), (5000, 5100));
        assert_eq!(config.max_bind_attempts, 16);
    }

    #[test]
    fn test_rejects_inverted_range() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "base_port": 6000, "max_port": 5000 }}"#).unwrap();

        assert!(matches!(RelayConfig::from_file(file.path()), Err(AllocatorError::Config(_))));
    }

    #[test]
    fn test_rejects_zero_collect_interval() {
        let config = RelayConfig { collect_interval_secs: 0, ..RelayConfig::default() };
        assert!(matches!(config.validate(), Err(AllocatorError::Config(_))));
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let err = RelayConfig::from_file("/nonexistent/sharp-relay.json").unwrap_err();
        assert!(err.to_string().contains("sharp-relay.json"));
    }
}
