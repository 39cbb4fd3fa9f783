//! Relay configuration, loaded from a YAML file. Every field has a default,
//! so a partial file only overrides what it names.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    #[serde(rename = "Host")]
    pub host: String,

    #[serde(rename = "Port")]
    pub port: u16,

    /// Per-request dispatch timeout, in milliseconds: how long the relay
    /// searches for an idle tunnel connection before giving up.
    #[serde(rename = "Timeout")]
    pub timeout: u64,

    /// Idle-connection timeout, in milliseconds: surplus idle connections
    /// older than this are reaped by the pool cleaner.
    #[serde(rename = "IdleTimeout")]
    pub idle_timeout: u64,

    /// Shared secret agents must present in `X-SECRET-KEY`. Registration is
    /// refused while this is empty.
    #[serde(rename = "SecretKey")]
    pub secret_key: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            timeout: 1_000,
            idle_timeout: 60_000,
            secret_key: String::new(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("unable to read configuration from {}", path.display()))?;
        let config = serde_yaml::from_str(&raw)
            .with_context(|| format!("unable to parse configuration from {}", path.display()))?;
        Ok(config)
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_values() {
        let config = Config::default();
        assert_eq!(config.addr(), "127.0.0.1:8080");
        assert_eq!(config.dispatch_timeout(), Duration::from_millis(1_000));
        assert_eq!(config.idle_timeout(), Duration::from_millis(60_000));
        assert!(config.secret_key.is_empty());
    }

    #[test]
    fn partial_file_keeps_defaults_for_missing_fields() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "Port: 9000\nSecretKey: hunter2").unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.secret_key, "hunter2");
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.timeout, 1_000);
        assert_eq!(config.idle_timeout, 60_000);
    }

    #[test]
    fn full_file_overrides_everything() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "Host: 0.0.0.0\nPort: 8000\nTimeout: 250\nIdleTimeout: 5000\nSecretKey: s3cret"
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.addr(), "0.0.0.0:8000");
        assert_eq!(config.dispatch_timeout(), Duration::from_millis(250));
        assert_eq!(config.idle_timeout(), Duration::from_millis(5_000));
        assert_eq!(config.secret_key, "s3cret");
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(Config::load(Path::new("/nonexistent/relay.yaml")).is_err());
    }

    #[test]
    fn malformed_yaml_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "Port: [not a number").unwrap();
        assert!(Config::load(file.path()).is_err());
    }
}
