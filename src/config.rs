//! Panel configuration file
//!
//! A single TOML file holds every tunable of the panel. Missing sections and
//! fields fall back to defaults, so an empty file is a valid configuration.
//! Fields missing from a partially written `[cloud]` section take the plain
//! broker defaults, not the cloud ones.

use crate::mqtt::config::MqttConfig;
use crate::mqtt::transport::ChannelKind;
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn, Level};

const CONFIG_DIR: &str = "fleetpanel";
const CONFIG_FILE: &str = "config.toml";
/// Overrides the config file location
pub const CONFIG_ENV: &str = "FLEETPANEL_CONFIG";

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct FleetConfig {
    /// Devices known before any of them reported
    pub devices: Vec<String>,
    /// Silence after which a device counts as disconnected
    pub liveness_timeout_secs: u64,
    /// Interval between broadcast status requests
    pub poll_period_secs: u64,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            devices: (1..=6).map(|n| format!("ESP32-{n}")).collect(),
            liveness_timeout_secs: 10,
            poll_period_secs: 5,
        }
    }
}

impl FleetConfig {
    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_secs(self.liveness_timeout_secs)
    }

    pub fn poll_period(&self) -> Duration {
        Duration::from_secs(self.poll_period_secs)
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct DispatchConfig {
    /// Upper bound for an operator connect to be acknowledged
    pub connect_timeout_secs: u64,
    /// Capacity of the queues feeding the dispatcher
    pub queue_capacity: usize,
    /// Number of traffic records kept for display
    pub traffic_history: usize,
    /// Channel selected at startup
    pub active_channel: ChannelKind,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10,
            queue_capacity: 100,
            traffic_history: 200,
            active_channel: ChannelKind::Local,
        }
    }
}

impl DispatchConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct PanelConfig {
    /// Issuer id stamped into every control envelope
    pub controller_id: String,
    pub log_level: String,
    pub fleet: FleetConfig,
    pub dispatch: DispatchConfig,
    pub local: MqttConfig,
    pub cloud: MqttConfig,
}

impl Default for PanelConfig {
    fn default() -> Self {
        Self {
            controller_id: "MQTT_master".to_string(),
            log_level: "info".to_string(),
            fleet: FleetConfig::default(),
            dispatch: DispatchConfig::default(),
            local: MqttConfig::local(),
            cloud: MqttConfig::cloud(),
        }
    }
}

impl PanelConfig {
    pub fn channel(&self, kind: ChannelKind) -> &MqttConfig {
        match kind {
            ChannelKind::Local => &self.local,
            ChannelKind::Cloud => &self.cloud,
        }
    }

    pub fn log_level(&self) -> Level {
        self.log_level.parse().unwrap_or(Level::INFO)
    }

    pub fn validate(&self) -> Result<()> {
        if self.controller_id.trim().is_empty() {
            return Err(eyre!("controller_id must not be empty"));
        }
        if self.fleet.poll_period_secs == 0 {
            return Err(eyre!("fleet.poll_period_secs must be at least 1"));
        }
        if self.dispatch.queue_capacity == 0 {
            return Err(eyre!("dispatch.queue_capacity must be at least 1"));
        }
        Ok(())
    }

    /// Settings that load fine but are probably not what the operator meant
    ///
    /// Loading runs before logging is set up, so these are returned for the
    /// caller to report.
    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.fleet.liveness_timeout_secs < self.fleet.poll_period_secs {
            warnings.push(format!(
                "Liveness timeout ({}s) is shorter than the poll period ({}s), devices will flap",
                self.fleet.liveness_timeout_secs, self.fleet.poll_period_secs
            ));
        }
        if self.log_level.parse::<Level>().is_err() {
            warnings.push(format!("Unknown log_level {:?}, using info", self.log_level));
        }
        warnings
    }

    /// Loads the config from the default location, creating it if needed
    pub async fn load() -> Result<(Self, PathBuf)> {
        let path = config_path();
        Self::ensure_default_config(&path).await?;
        let config = Self::load_from(&path).await?;
        Ok((config, path))
    }

    pub async fn load_from(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

        let config: PanelConfig = toml::from_str(&content)
            .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;
        config.validate()?;
        Ok(config)
    }

    pub async fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| eyre!("Failed to create config directory: {}", e))?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| eyre!("Failed to serialize config: {}", e))?;
        tokio::fs::write(path, content)
            .await
            .map_err(|e| eyre!("Failed to write config file {}: {}", path.display(), e))?;
        Ok(())
    }

    /// Writes the default config unless a file already exists
    pub async fn ensure_default_config(path: &Path) -> Result<()> {
        if tokio::fs::try_exists(path)
            .await
            .map_err(|e| eyre!("Failed to check if config file exists: {}", e))?
        {
            return Ok(());
        }

        info!("No config found, writing defaults to {}", path.display());
        PanelConfig::default().save_to(path).await
    }
}

pub fn config_path() -> PathBuf {
    if let Ok(path) = std::env::var(CONFIG_ENV) {
        return PathBuf::from(path);
    }

    let mut path = dirs::config_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| {
            warn!("Could not determine config directory, using current directory");
            PathBuf::from(".")
        });
    path.push(CONFIG_DIR);
    path.push(CONFIG_FILE);
    path
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn defaults_are_written_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(CONFIG_FILE);

        PanelConfig::ensure_default_config(&path).await.unwrap();
        let config = PanelConfig::load_from(&path).await.unwrap();

        assert_eq!(config, PanelConfig::default());
        assert_eq!(config.fleet.devices.len(), 6);
        assert_eq!(config.channel(ChannelKind::Cloud).port, 8883);
    }

    #[tokio::test]
    async fn existing_file_is_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        tokio::fs::write(&path, "controller_id = \"bench\"\n").await.unwrap();

        PanelConfig::ensure_default_config(&path).await.unwrap();
        let config = PanelConfig::load_from(&path).await.unwrap();

        assert_eq!(config.controller_id, "bench");
        assert_eq!(config.fleet, FleetConfig::default());
    }

    #[tokio::test]
    async fn partial_sections_fill_in_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        let content = r#"
            [fleet]
            liveness_timeout_secs = 20
            poll_period_secs = 10

            [dispatch]
            active_channel = "cloud"
        "#;
        tokio::fs::write(&path, content).await.unwrap();

        let config = PanelConfig::load_from(&path).await.unwrap();
        assert_eq!(config.fleet.liveness_timeout(), Duration::from_secs(20));
        assert_eq!(config.fleet.poll_period(), Duration::from_secs(10));
        assert_eq!(config.fleet.devices.len(), 6);
        assert_eq!(config.dispatch.active_channel, ChannelKind::Cloud);
        assert_eq!(config.dispatch.queue_capacity, 100);
    }

    #[tokio::test]
    async fn zero_poll_period_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        tokio::fs::write(&path, "[fleet]\npoll_period_secs = 0\n").await.unwrap();

        assert!(PanelConfig::load_from(&path).await.is_err());
    }

    #[tokio::test]
    async fn short_liveness_loads_with_a_warning() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        let content = "[fleet]\nliveness_timeout_secs = 3\npoll_period_secs = 5\n";
        tokio::fs::write(&path, content).await.unwrap();

        let config = PanelConfig::load_from(&path).await.unwrap();
        let warnings = config.warnings();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("shorter than the poll period"));

        assert!(PanelConfig::default().warnings().is_empty());
    }

    #[tokio::test]
    async fn broken_toml_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        tokio::fs::write(&path, "[fleet\n").await.unwrap();

        assert!(PanelConfig::load_from(&path).await.is_err());
    }

    #[test]
    fn log_level_falls_back_to_info() {
        let config = PanelConfig {
            log_level: "chatty".into(),
            ..PanelConfig::default()
        };
        assert_eq!(config.log_level(), Level::INFO);
        assert_eq!(config.warnings().len(), 1);

        let config = PanelConfig {
            log_level: "debug".into(),
            ..PanelConfig::default()
        };
        assert_eq!(config.log_level(), Level::DEBUG);
    }
}
