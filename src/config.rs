use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context as _;
use log::warn;
use serde_derive::Deserialize;

use crate::presence::PatientIdentity;

#[derive(Deserialize, Debug, Default, Clone)]
pub struct AppConfig {
    pub gateway: Option<GatewayConfig>,
    pub mqtt: Option<MqttConfig>,
    pub patients: Option<Vec<PatientIdentity>>,
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct GatewayConfig {
    pub poll_interval_ms: Option<u64>,
    /// Where the persisted gateway host lives.
    pub settings_path: Option<PathBuf>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct MqttConfig {
    pub host: String,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub publisher_id: Option<String>,
    pub topic_path: Option<String>,
    pub keep_alive_seconds: Option<u64>,
}

impl AppConfig {
    /// Reads `path`, or falls back to an empty config if it doesn't exist.
    pub fn load(path: &Path) -> anyhow::Result<AppConfig> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                warn!("Config file {} not found, using defaults", path.display());
                return Ok(AppConfig::default());
            }
            Err(err) => {
                return Err(err).with_context(|| format!("reading {}", path.display()));
            }
        };
        toml::de::from_str(&contents).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn poll_interval(&self) -> Duration {
        let ms = self
            .gateway
            .as_ref()
            .and_then(|g| g.poll_interval_ms)
            .unwrap_or(2000);
        Duration::from_millis(ms)
    }

    pub fn settings_path(&self) -> PathBuf {
        self.gateway
            .as_ref()
            .and_then(|g| g.settings_path.clone())
            .unwrap_or_else(|| PathBuf::from("settings.json"))
    }

    pub fn roster(&self) -> Vec<PatientIdentity> {
        self.patients.clone().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config() {
        let config_str = r#"
            [gateway]
            poll_interval_ms = 1000
            settings_path = "/var/lib/locator/settings.json"

            [mqtt]
            host = "localhost"
            port = 1883
            username = "user"
            password = "pass"

            [[patients]]
            id = "p1"
            name = "John"
            device = "AA:BB:CC"

            [[patients]]
            id = "p2"
            display_name = "Mary"
        "#;
        let config: AppConfig = toml::de::from_str(&config_str).unwrap();
        assert!(config.mqtt.as_ref().unwrap().host == "localhost");
        assert_eq!(config.poll_interval(), Duration::from_millis(1000));
        assert_eq!(
            config.settings_path(),
            PathBuf::from("/var/lib/locator/settings.json")
        );

        let roster = config.roster();
        assert_eq!(roster.len(), 2);
        assert_eq!(roster[0].device_identifier(), Some("AA:BB:CC"));
        assert_eq!(roster[1].name, "Mary");
        assert_eq!(roster[1].device_identifier(), None);
    }

    #[test]
    fn test_config_defaults() {
        let config: AppConfig = toml::de::from_str("").unwrap();
        assert!(config.mqtt.is_none());
        assert!(config.roster().is_empty());
        assert_eq!(config.poll_interval(), Duration::from_millis(2000));
        assert_eq!(config.settings_path(), PathBuf::from("settings.json"));
    }

    #[test]
    fn test_missing_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::load(&dir.path().join("nope.toml")).unwrap();
        assert!(config.patients.is_none());
    }
}
