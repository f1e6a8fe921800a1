//! SchoolCast configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, SchoolCastError};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchoolCastConfig {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub poller: PollerConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
}

impl SchoolCastConfig {
    /// Load config from the default path (~/.schoolcast/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| SchoolCastError::Config(format!("Failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| SchoolCastError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to the given path, creating parent directories.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| SchoolCastError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Save config to the default path.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::default_path())
    }

    /// Reject settings the dispatcher or poller cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.dispatch.break_min_secs > self.dispatch.break_max_secs {
            return Err(SchoolCastError::Config(format!(
                "dispatch.break_min_secs ({}) exceeds dispatch.break_max_secs ({})",
                self.dispatch.break_min_secs, self.dispatch.break_max_secs
            )));
        }
        if self.poller.interval_secs == 0 {
            return Err(SchoolCastError::Config("poller.interval_secs must be > 0".into()));
        }
        if self.api.dispatch_timeout_secs == 0 || self.api.status_timeout_secs == 0 {
            return Err(SchoolCastError::Config("api timeouts must be > 0".into()));
        }
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the SchoolCast home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".schoolcast")
    }
}

/// Backend API connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Bearer token sent with every request.
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_dispatch_timeout")]
    pub dispatch_timeout_secs: u64,
    #[serde(default = "default_status_timeout")]
    pub status_timeout_secs: u64,
}

fn default_base_url() -> String { "http://localhost:8000/api".into() }
fn default_dispatch_timeout() -> u64 { 60 }
fn default_status_timeout() -> u64 { 10 }

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            token: None,
            dispatch_timeout_secs: default_dispatch_timeout(),
            status_timeout_secs: default_status_timeout(),
        }
    }
}

impl ApiConfig {
    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_secs(self.dispatch_timeout_secs)
    }

    pub fn status_timeout(&self) -> Duration {
        Duration::from_secs(self.status_timeout_secs)
    }
}

/// Bulk dispatch settings. The break threshold itself is decided server side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    #[serde(default = "default_break_min")]
    pub break_min_secs: u64,
    #[serde(default = "default_break_max")]
    pub break_max_secs: u64,
    #[serde(default = "bool_true")]
    pub skip_already_sent: bool,
}

fn bool_true() -> bool { true }
fn default_break_min() -> u64 { 120 }
fn default_break_max() -> u64 { 180 }

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            break_min_secs: default_break_min(),
            break_max_secs: default_break_max(),
            skip_already_sent: true,
        }
    }
}

/// Connection poller settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollerConfig {
    #[serde(default = "default_poll_interval")]
    pub interval_secs: u64,
    /// Instance ids watched by `schoolcast watch` when none are given.
    #[serde(default)]
    pub instances: Vec<String>,
}

fn default_poll_interval() -> u64 { 3 }

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_poll_interval(),
            instances: Vec::new(),
        }
    }
}

impl PollerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Where sink notifications are forwarded besides the log.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotifyConfig {
    #[serde(default)]
    pub webhook_url: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SchoolCastConfig::default();
        assert_eq!(config.dispatch.break_min_secs, 120);
        assert_eq!(config.dispatch.break_max_secs, 180);
        assert_eq!(config.poller.interval(), Duration::from_secs(3));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: SchoolCastConfig = toml::from_str(
            r#"
            [api]
            base_url = "https://school.example/api"

            [poller]
            instances = ["inst-1", "inst-2"]
            "#,
        )
        .unwrap();
        assert_eq!(config.api.base_url, "https://school.example/api");
        assert_eq!(config.api.status_timeout_secs, 10);
        assert_eq!(config.poller.instances.len(), 2);
        assert!(config.dispatch.skip_already_sent);
    }

    #[test]
    fn test_validate_rejects_inverted_break_window() {
        let mut config = SchoolCastConfig::default();
        config.dispatch.break_min_secs = 200;
        assert!(matches!(config.validate(), Err(SchoolCastError::Config(_))));
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = std::env::temp_dir().join("schoolcast-test-config");
        let path = dir.join("config.toml");
        let mut config = SchoolCastConfig::default();
        config.poller.instances = vec!["inst-9".into()];
        config.save_to(&path).unwrap();

        let loaded = SchoolCastConfig::load_from(&path).unwrap();
        assert_eq!(loaded.poller.instances, vec!["inst-9".to_string()]);
        std::fs::remove_dir_all(&dir).ok();
    }
}
