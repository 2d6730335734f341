//! Preferences for the protocol access layer
//!
//! Settings are layered like this (highest priority last):
//! 1. Default values (embedded in structs)
//! 2. TOML preferences file
//! 3. Environment variables `GRAIL__<group>__<key>`
//!
//! # Usage
//!
//! ```no_run
//! use grail_access::config::Config;
//!
//! let config = Config::load().expect("Failed to load configuration");
//! println!("Connection limit: {}", config.sockets.number);
//! ```
//!
//! # Environment Variables
//!
//! - `GRAIL__SOCKETS__NUMBER=8`
//! - `GRAIL__PROXIES__HTTP_PROXY=http://proxy.local:8080`
//! - `GRAIL__FETCH__CHUNK_SIZE=16KB`
//!
//! # Configuration File
//!
//! By default the preferences live in `config/grail.toml`; `GRAIL_CONFIG`
//! points elsewhere. The file is also where the one-time proxy seeding
//! decision is persisted (see [`Config::save_to_path`]).

mod models;
mod sources;
mod validation;

pub use crate::humanize::ByteSize;
pub use models::{
    Config, FetchConfig, FtpConfig, LoggingConfig, ProxiesConfig, SocketsConfig,
};
pub use sources::config_path;
pub use validation::ValidationError;

use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    LoadError(#[from] config::ConfigError),

    #[error("Configuration validation failed: {0}")]
    ValidationError(#[from] ValidationError),

    #[error("Failed to serialize configuration: {0}")]
    SerializeError(#[from] toml::ser::Error),

    #[error("Failed to write configuration: {0}")]
    WriteError(#[from] std::io::Error),
}

impl Config {
    /// Load configuration from all sources (file + environment)
    ///
    /// # Errors
    ///
    /// Returns an error if the file is malformed or validation fails.
    pub fn load() -> Result<Self, ConfigError> {
        let config = sources::load()?;
        validation::validate(&config)?;
        Ok(config)
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let config = sources::load_from_sources(path.as_ref().to_path_buf())?;
        validation::validate(&config)?;
        Ok(config)
    }

    /// Persist the configuration as TOML, creating parent directories.
    pub fn save_to_path(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let rendered = toml::to_string_pretty(self)?;
        std::fs::write(path, rendered)?;
        tracing::info!(path = %path.display(), "Configuration saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_load_minimal_config() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("grail.toml");

        fs::write(&config_path, "[sockets]\nnumber = 3\n").unwrap();

        let config = Config::load_from_path(&config_path).unwrap();
        assert_eq!(config.sockets.number, 3);
        assert_eq!(config.ftp.max_idle_per_host, 4);
    }

    #[test]
    fn test_validation_catches_zero_sockets() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("grail.toml");

        fs::write(&config_path, "[sockets]\nnumber = 0\n").unwrap();

        let result = Config::load_from_path(&config_path);
        assert!(matches!(
            result.unwrap_err(),
            ConfigError::ValidationError(ValidationError::InvalidSocketCount(0))
        ));
    }

    #[test]
    fn test_save_and_reload_keeps_seeded_proxies() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("nested").join("grail.toml");

        let mut config = Config::default();
        config.proxies.manual_proxy_enabled = Some(true);
        config.proxies.no_proxy_enabled = Some(false);
        config.proxies.set_proxy("http", "http://proxy.local:8080");
        config.save_to_path(&config_path).unwrap();

        let reloaded = Config::load_from_path(&config_path).unwrap();
        assert_eq!(reloaded.proxies, config.proxies);
        assert_eq!(reloaded.fetch.chunk_size, config.fetch.chunk_size);
    }
}
