//! USB host configuration management
//!
//! # Example Configuration
//! ```toml
//! [session]
//! debug_level = "level1"
//! event_timeout_ms = 100
//! transfer_timeout_ms = 1000
//! detach_kernel_driver = true
//!
//! [logging]
//! level = "debug"
//!
//! [devices]
//! filters = ["0x04f9:*", "0x1234:0x5678"]
//! ```

use crate::filter::DeviceFilter;
use crate::logging::VALID_LEVELS;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsbConfig {
    #[serde(default)]
    pub session: SessionSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
    #[serde(default)]
    pub devices: DeviceSettings,
}

/// Verbosity of the native USB library
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DebugLevel {
    #[default]
    Off,
    Level1,
    Level2,
    Level3,
}

/// Session-wide settings, applied when a session is created
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSettings {
    /// Native library log verbosity
    #[serde(default)]
    pub debug_level: DebugLevel,
    /// Upper bound on one event-processing call (0 = poll)
    #[serde(default = "SessionSettings::default_event_timeout")]
    pub event_timeout_ms: u64,
    /// Ignore `event_timeout_ms` and wait until the library reports activity
    #[serde(default)]
    pub block_on_events: bool,
    /// Timeout given to transfers that don't set their own (0 = unlimited)
    #[serde(default)]
    pub transfer_timeout_ms: u32,
    /// Let the library detach kernel drivers while an interface is claimed
    #[serde(default = "SessionSettings::default_detach")]
    pub detach_kernel_driver: bool,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            debug_level: DebugLevel::Off,
            event_timeout_ms: Self::default_event_timeout(),
            block_on_events: false,
            transfer_timeout_ms: 0,
            detach_kernel_driver: Self::default_detach(),
        }
    }
}

impl SessionSettings {
    fn default_event_timeout() -> u64 {
        100
    }

    fn default_detach() -> bool {
        true
    }

    /// Wait bound for one event-processing call, None to block
    pub fn event_timeout(&self) -> Option<Duration> {
        (!self.block_on_events).then(|| Duration::from_millis(self.event_timeout_ms))
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_millis(self.transfer_timeout_ms as u64)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceSettings {
    /// VID:PID patterns, empty = all devices
    #[serde(default)]
    pub filters: Vec<String>,
}

impl UsbConfig {
    /// Load configuration from the specified path
    ///
    /// Without a path, the default location and `/etc/usbhost/config.toml`
    /// are tried in order.
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = match path {
            Some(p) => p,
            None => [Self::default_path(), PathBuf::from("/etc/usbhost/config.toml")]
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| Error::Config("No configuration file found".to_string()))?,
        };

        let content = fs::read_to_string(&config_path)?;
        let config: UsbConfig = toml::from_str(&content).map_err(|source| Error::Parse {
            path: config_path.display().to_string(),
            source,
        })?;

        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load configuration from a user-supplied path string, expanding `~`
    pub fn load_from(path: &str) -> Result<Self> {
        let expanded = PathBuf::from(shellexpand::tilde(path).as_ref());
        Self::load(Some(expanded))
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Failed to load config: {}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(path, content)?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("usbhost").join("config.toml")
        } else {
            PathBuf::from(".config/usbhost/config.toml")
        }
    }

    /// Parsed `[devices]` filters
    pub fn device_filters(&self) -> Result<Vec<DeviceFilter>> {
        self.devices.filters.iter().map(|f| f.parse()).collect()
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if !VALID_LEVELS.contains(&self.logging.level.as_str()) {
            return Err(Error::Config(format!(
                "Invalid log level '{}', must be one of: {}",
                self.logging.level,
                VALID_LEVELS.join(", ")
            )));
        }

        self.device_filters()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = UsbConfig::default();
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.session.debug_level, DebugLevel::Off);
        assert_eq!(
            config.session.event_timeout(),
            Some(Duration::from_millis(100))
        );
        assert_eq!(config.session.transfer_timeout(), Duration::ZERO);
        assert!(config.session.detach_kernel_driver);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_blocking_event_wait() {
        let settings = SessionSettings {
            block_on_events: true,
            ..SessionSettings::default()
        };
        assert_eq!(settings.event_timeout(), None);
    }

    #[test]
    fn test_validate_log_level() {
        let mut config = UsbConfig::default();
        config.logging.level = "invalid".to_string();
        assert!(config.validate().is_err());

        config.logging.level = "debug".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_filters() {
        let mut config = UsbConfig::default();
        config.devices.filters = vec!["0x1234:*".to_string()];
        assert!(config.validate().is_ok());

        config.devices.filters.push("1234:5678".to_string());
        assert!(matches!(config.validate(), Err(Error::Filter { .. })));
    }

    #[test]
    fn test_config_serialization() {
        let mut config = UsbConfig::default();
        config.session.debug_level = DebugLevel::Level2;
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: UsbConfig = toml::from_str(&toml_str).unwrap();

        assert_eq!(parsed.session.debug_level, DebugLevel::Level2);
        assert_eq!(parsed.logging.level, config.logging.level);
    }
}
