//! Device manager configuration

use anyhow::{Context, Result, anyhow};
use common::DEFAULT_QUEUE_CAPACITY;
use protocol::UsbApiType;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Layout version written to new configuration files
pub const CONFIG_VERSION: u32 = 1;

const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagerConfig {
    #[serde(default = "ManagerConfig::default_version")]
    pub version: u32,
    #[serde(default = "ManagerConfig::default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub usb: UsbSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsbSettings {
    /// Backend name (nullusb_api, libusb_api, winusb_api)
    #[serde(default = "UsbSettings::default_api")]
    pub usb_api: String,
    /// When false, transfer requests fail immediately and no worker thread runs
    #[serde(default = "UsbSettings::default_enable_transfers")]
    pub enable_usb_transfers: bool,
    /// Capacity of the request and result queues
    #[serde(default = "UsbSettings::default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for UsbSettings {
    fn default() -> Self {
        Self {
            usb_api: Self::default_api(),
            enable_usb_transfers: Self::default_enable_transfers(),
            queue_capacity: Self::default_queue_capacity(),
        }
    }
}

impl UsbSettings {
    fn default_api() -> String {
        UsbApiType::LibUsb.config_name().to_string()
    }

    fn default_enable_transfers() -> bool {
        true
    }

    fn default_queue_capacity() -> usize {
        DEFAULT_QUEUE_CAPACITY
    }

    /// Settings for a specific backend, everything else default
    pub fn with_api(api_type: UsbApiType) -> Self {
        Self {
            usb_api: api_type.config_name().to_string(),
            ..Self::default()
        }
    }

    /// Resolve the configured backend name, falling back to libusb
    pub fn api_type(&self) -> UsbApiType {
        UsbApiType::from_config_name(&self.usb_api).unwrap_or_else(|| {
            tracing::warn!(
                "Unknown usb_api '{}', defaulting to {}",
                self.usb_api,
                UsbApiType::LibUsb.config_name()
            );
            UsbApiType::LibUsb
        })
    }
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            log_level: Self::default_log_level(),
            usb: UsbSettings::default(),
        }
    }
}

impl ManagerConfig {
    fn default_version() -> u32 {
        CONFIG_VERSION
    }

    fn default_log_level() -> String {
        "info".to_string()
    }

    /// Load configuration from `path`, or the default location
    ///
    /// A file written for a different layout version is ignored in favour of
    /// the defaults.
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = path.unwrap_or_else(Self::default_path);

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: ManagerConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        if config.version != CONFIG_VERSION {
            tracing::warn!(
                "Config file {} has version {}, expected {}; using defaults",
                config_path.display(),
                config.version,
                CONFIG_VERSION
            );
            return Ok(Self::default());
        }

        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Failed to load config: {:#}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Load configuration from `path` (defaults if unreadable) and write it back
    pub fn load_or_create(path: &Path) -> Result<Self> {
        let config = match Self::load(Some(path.to_path_buf())) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Failed to load config: {:#}, using defaults", e);
                Self::default()
            }
        };

        config.save(path)?;
        Ok(config)
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("psvr-usb").join("usb_manager.toml")
        } else {
            PathBuf::from(".config/psvr-usb/usb_manager.toml")
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if !VALID_LOG_LEVELS.contains(&self.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.log_level,
                VALID_LOG_LEVELS.join(", ")
            ));
        }

        if self.usb.queue_capacity == 0 {
            return Err(anyhow!("usb.queue_capacity must be greater than zero"));
        }

        Ok(())
    }
}

/// Expand `~` in a user-supplied config path
pub fn expand_path(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ManagerConfig::default();
        assert_eq!(config.version, CONFIG_VERSION);
        assert_eq!(config.log_level, "info");
        assert_eq!(config.usb.usb_api, "libusb_api");
        assert!(config.usb.enable_usb_transfers);
        assert_eq!(config.usb.queue_capacity, 128);
    }

    #[test]
    fn test_api_type_resolution() {
        assert_eq!(UsbSettings::with_api(UsbApiType::NullUsb).api_type(), UsbApiType::NullUsb);
        assert_eq!(UsbSettings::with_api(UsbApiType::WinUsb).api_type(), UsbApiType::WinUsb);

        let settings = UsbSettings {
            usb_api: "bogus_api".to_string(),
            ..UsbSettings::default()
        };
        assert_eq!(settings.api_type(), UsbApiType::LibUsb);
    }

    #[test]
    fn test_missing_fields_take_defaults() {
        let config: ManagerConfig = toml::from_str("[usb]\nusb_api = \"nullusb_api\"\n").unwrap();
        assert_eq!(config.version, CONFIG_VERSION);
        assert_eq!(config.usb.api_type(), UsbApiType::NullUsb);
        assert_eq!(config.usb.queue_capacity, DEFAULT_QUEUE_CAPACITY);
    }

    #[test]
    fn test_validate() {
        let mut config = ManagerConfig::default();
        assert!(config.validate().is_ok());

        config.log_level = "loud".to_string();
        assert!(config.validate().is_err());

        config.log_level = "debug".to_string();
        config.usb.queue_capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_expand_path() {
        assert_eq!(expand_path("/etc/usb_manager.toml"), PathBuf::from("/etc/usb_manager.toml"));
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_path("~/usb_manager.toml"), home.join("usb_manager.toml"));
        }
    }
}
