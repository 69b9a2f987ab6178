//! Configuration file support for the drivesync CLI.
//!
//! Configuration is stored at `~/.config/drivesync/config.toml` (XDG standard)
//! or `~/Library/Application Support/com.drivesync.drivesync/config.toml` on macOS,
//! and can be pointed elsewhere with `--config` or `DRIVESYNC_CONFIG`.
//!
//! # Example configuration
//!
//! ```toml
//! [defaults]
//! verbosity = 1
//!
//! [bridge]
//! content_dir = "/var/cache/drivesync/content"
//! store_path = "/var/lib/drivesync/catalog.json"
//! page_size = 200
//! retry_backoff = "500ms"
//! poll_interval = "1m"
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use drivesync_bridge::BridgeConfig;
use serde::{Deserialize, Serialize};

/// Main configuration structure
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    /// Default settings applied to all commands
    #[serde(default)]
    pub defaults: Defaults,

    /// Bridge component settings
    #[serde(default)]
    pub bridge: BridgeConfig,
}

/// Default settings
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Defaults {
    /// Default verbosity level (0-3)
    pub verbosity: Option<u8>,
}

impl Config {
    /// Load configuration from `explicit` if given, otherwise from the default path.
    ///
    /// A missing default file yields the built-in defaults; a missing explicit file is
    /// an error.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let path = match explicit {
            Some(path) => path.to_path_buf(),
            None => {
                let path = config_path()?;
                if !path.exists() {
                    return Ok(Config::default());
                }
                path
            }
        };

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config
            .bridge
            .validate()
            .with_context(|| format!("Invalid bridge settings in {}", path.display()))?;

        Ok(config)
    }
}

/// Get the path to the configuration file.
///
/// Uses XDG config directory on Linux, Application Support on macOS.
pub fn config_path() -> Result<PathBuf> {
    let base_dirs = directories::BaseDirs::new()
        .ok_or_else(|| anyhow::anyhow!("Could not determine home directory"))?;

    #[cfg(target_os = "macos")]
    {
        let config_dir = base_dirs
            .home_dir()
            .join("Library/Application Support/com.drivesync.drivesync");
        Ok(config_dir.join("config.toml"))
    }

    #[cfg(not(target_os = "macos"))]
    {
        let config_dir = base_dirs.config_dir().join("drivesync");
        Ok(config_dir.join("config.toml"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_parse_empty_config() {
        let config: Config = toml::from_str("").unwrap();
        assert!(config.defaults.verbosity.is_none());
        assert_eq!(config.bridge, BridgeConfig::default());
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
            [defaults]
            verbosity = 2

            [bridge]
            content_dir = "/tmp/ds/content"
            store_path = "/tmp/ds/catalog.json"
            page_size = 50
            retry_backoff = "500ms"
            poll_interval = "1m"
        "#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.defaults.verbosity, Some(2));
        assert_eq!(config.bridge.content_dir, PathBuf::from("/tmp/ds/content"));
        assert_eq!(
            config.bridge.store_path,
            Some(PathBuf::from("/tmp/ds/catalog.json"))
        );
        assert_eq!(config.bridge.page_size, 50);
        assert_eq!(config.bridge.retry_backoff, Duration::from_millis(500));
        assert_eq!(config.bridge.poll_interval, Duration::from_secs(60));
        // Unset fields keep their defaults.
        assert_eq!(
            config.bridge.fetch_retries,
            BridgeConfig::default().fetch_retries
        );
    }

    #[test]
    fn test_unknown_bridge_key_is_rejected() {
        let result: Result<Config, _> = toml::from_str("[bridge]\npage_sise = 5\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_explicit_missing_file_is_an_error() {
        let temp = tempfile::TempDir::new().unwrap();
        assert!(Config::load(Some(&temp.path().join("absent.toml"))).is_err());
    }

    #[test]
    fn test_invalid_values_are_rejected_on_load() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("config.toml");
        std::fs::write(&path, "[bridge]\npage_size = 0\n").unwrap();
        assert!(Config::load(Some(&path)).is_err());
    }
}
