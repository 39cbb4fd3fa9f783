//! Agent configuration, loaded from a YAML file. Every field has a default;
//! the generated identity is stable for the process lifetime.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use url::Url;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Agent identity; connections greet the relay with it so they all land
    /// in the same pool.
    #[serde(rename = "ID")]
    pub id: String,

    /// Relay registration endpoints, e.g. `ws://relay.example:8080/register`.
    #[serde(rename = "Targets")]
    pub targets: Vec<String>,

    /// Desired number of warm idle connections per target.
    #[serde(rename = "PoolIdleSize")]
    pub pool_idle_size: usize,

    /// Hard ceiling on connections per target, idle or busy.
    #[serde(rename = "PoolMaxSize")]
    pub pool_max_size: usize,

    #[serde(rename = "SecretKey")]
    pub secret_key: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            targets: vec!["ws://127.0.0.1:8000/register".to_string()],
            pool_idle_size: 10,
            pool_max_size: 100,
            secret_key: String::new(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("unable to read configuration from {}", path.display()))?;
        let config: Config = serde_yaml::from_str(&raw)
            .with_context(|| format!("unable to parse configuration from {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects targets that are not websocket URLs before any dialing
    /// starts, so a typo fails the process instead of looping forever.
    pub fn validate(&self) -> Result<()> {
        for target in &self.targets {
            let url = Url::parse(target)
                .with_context(|| format!("invalid target URL {target:?}"))?;
            if url.scheme() != "ws" && url.scheme() != "wss" {
                bail!("target {target:?} must use the ws or wss scheme");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_values() {
        let config = Config::default();
        assert!(Uuid::parse_str(&config.id).is_ok());
        assert_eq!(config.targets, vec!["ws://127.0.0.1:8000/register"]);
        assert_eq!(config.pool_idle_size, 10);
        assert_eq!(config.pool_max_size, 100);
        assert!(config.secret_key.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn generated_ids_are_unique() {
        assert_ne!(Config::default().id, Config::default().id);
    }

    #[test]
    fn partial_file_keeps_defaults_for_missing_fields() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "ID: my-agent\nTargets:\n  - ws://relay.internal:8080/register\nSecretKey: hunter2"
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.id, "my-agent");
        assert_eq!(config.targets, vec!["ws://relay.internal:8080/register"]);
        assert_eq!(config.pool_idle_size, 10);
        assert_eq!(config.pool_max_size, 100);
        assert_eq!(config.secret_key, "hunter2");
    }

    #[test]
    fn non_websocket_target_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "Targets:\n  - http://relay.internal:8080/register").unwrap();
        assert!(Config::load(file.path()).is_err());
    }

    #[test]
    fn unparseable_target_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "Targets:\n  - 'not a url'").unwrap();
        assert!(Config::load(file.path()).is_err());
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(Config::load(Path::new("/nonexistent/agent.yaml")).is_err());
    }
}
