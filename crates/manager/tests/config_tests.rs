//! Integration tests for configuration files
//!
//! Tests loading, saving and validating the manager configuration:
//! - Full and minimal files
//! - Version mismatch and unknown backend fallbacks
//! - Invalid values
//! - load_or_create round trips

use manager::{CONFIG_VERSION, ManagerConfig};
use protocol::UsbApiType;
use tempfile::tempdir;

const FULL_CONFIG: &str = r#"
version = 1
log_level = "debug"

[usb]
usb_api = "nullusb_api"
enable_usb_transfers = false
queue_capacity = 32
"#;

mod loading {
    use super::*;

    #[test]
    fn test_load_full_config() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("usb_manager.toml");
        std::fs::write(&path, FULL_CONFIG).unwrap();

        let config = ManagerConfig::load(Some(path)).unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.usb.api_type(), UsbApiType::NullUsb);
        assert!(!config.usb.enable_usb_transfers);
        assert_eq!(config.usb.queue_capacity, 32);
    }

    #[test]
    fn test_load_minimal_config() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("usb_manager.toml");
        std::fs::write(&path, "version = 1\n").unwrap();

        let config = ManagerConfig::load(Some(path)).unwrap();
        assert_eq!(config, ManagerConfig::default());
    }

    #[test]
    fn test_version_mismatch_uses_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("usb_manager.toml");
        std::fs::write(&path, FULL_CONFIG.replace("version = 1", "version = 7")).unwrap();

        let config = ManagerConfig::load(Some(path)).unwrap();
        assert_eq!(config, ManagerConfig::default());
        assert_eq!(config.version, CONFIG_VERSION);
    }

    #[test]
    fn test_unknown_backend_falls_back_to_libusb() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("usb_manager.toml");
        std::fs::write(&path, "version = 1\n[usb]\nusb_api = \"carrier_pigeon_api\"\n").unwrap();

        let config = ManagerConfig::load(Some(path)).unwrap();
        assert_eq!(config.usb.api_type(), UsbApiType::LibUsb);
    }

    #[test]
    fn test_winusb_name_is_accepted() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("usb_manager.toml");
        std::fs::write(&path, "[usb]\nusb_api = \"winusb_api\"\n").unwrap();

        let config = ManagerConfig::load(Some(path)).unwrap();
        assert_eq!(config.usb.api_type(), UsbApiType::WinUsb);
    }
}

mod invalid {
    use super::*;

    #[test]
    fn test_missing_file_is_an_error() {
        let dir = tempdir().unwrap();
        assert!(ManagerConfig::load(Some(dir.path().join("missing.toml"))).is_err());
    }

    #[test]
    fn test_malformed_toml_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("usb_manager.toml");
        std::fs::write(&path, "version = [").unwrap();
        assert!(ManagerConfig::load(Some(path)).is_err());
    }

    #[test]
    fn test_invalid_values_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("usb_manager.toml");

        std::fs::write(&path, "version = 1\nlog_level = \"chatty\"\n").unwrap();
        assert!(ManagerConfig::load(Some(path.clone())).is_err());

        std::fs::write(&path, "version = 1\n[usb]\nqueue_capacity = 0\n").unwrap();
        assert!(ManagerConfig::load(Some(path)).is_err());
    }
}

mod saving {
    use super::*;

    #[test]
    fn test_save_then_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("usb_manager.toml");

        let mut config = ManagerConfig::default();
        config.usb.usb_api = UsbApiType::NullUsb.config_name().to_string();
        config.usb.queue_capacity = 64;
        config.save(&path).unwrap();

        assert_eq!(ManagerConfig::load(Some(path)).unwrap(), config);
    }

    #[test]
    fn test_load_or_create_writes_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("usb_manager.toml");

        let config = ManagerConfig::load_or_create(&path).unwrap();
        assert_eq!(config, ManagerConfig::default());
        assert!(path.exists());

        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.contains("usb_api = \"libusb_api\""));
        assert!(written.contains("queue_capacity = 128"));
    }

    #[test]
    fn test_load_or_create_keeps_existing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("usb_manager.toml");
        std::fs::write(&path, FULL_CONFIG).unwrap();

        let config = ManagerConfig::load_or_create(&path).unwrap();
        assert_eq!(config.usb.queue_capacity, 32);
        assert_eq!(ManagerConfig::load(Some(path)).unwrap(), config);
    }
}
