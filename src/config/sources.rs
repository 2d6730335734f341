use super::models::Config;
use config::{ConfigError, Environment, File};
use std::env;
use std::path::PathBuf;

pub(crate) const CONFIG_ENV_VAR: &str = "GRAIL_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "config/grail.toml";
const ENV_PREFIX: &str = "GRAIL";
const ENV_SEPARATOR: &str = "__";

/// Path of the preferences file: `GRAIL_CONFIG` or `config/grail.toml`
pub fn config_path() -> PathBuf {
    env::var(CONFIG_ENV_VAR)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH))
}

/// Load configuration from multiple sources with priority:
/// 1. Defaults (embedded in structs)
/// 2. TOML file (if exists)
/// 3. Environment variables from .env file (via dotenvy)
/// 4. System environment variables (highest priority)
pub fn load() -> Result<Config, ConfigError> {
    // A missing .env is the common case
    let _ = dotenvy::dotenv();

    load_from_sources(config_path())
}

/// Load configuration from a specific path and environment
pub fn load_from_sources(config_path: PathBuf) -> Result<Config, ConfigError> {
    let mut builder = config::Config::builder();

    if config_path.exists() {
        tracing::info!("Loading configuration from: {}", config_path.display());
        builder = builder.add_source(File::from(config_path).required(false));
    } else {
        tracing::debug!(
            "Configuration file not found at {}, using defaults and environment overrides",
            config_path.display()
        );
    }

    // GRAIL__SOCKETS__NUMBER -> sockets.number
    builder = builder.add_source(
        Environment::with_prefix(ENV_PREFIX)
            .separator(ENV_SEPARATOR)
            .try_parsing(true),
    );

    let config = builder.build()?;
    config.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_load_defaults_only() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("nonexistent.toml");

        let config = load_from_sources(config_path).unwrap();
        assert_eq!(config.sockets.number, 5);
        assert_eq!(config.proxies.manual_proxy_enabled, None);
    }

    #[test]
    fn test_load_from_toml() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("grail.toml");

        let toml_content = r#"
[sockets]
number = 2

[fetch]
chunk_size = "1KB"

[ftp]
idle_timeout_secs = 60
max_idle_per_host = 1
        "#;

        fs::write(&config_path, toml_content).unwrap();

        let config = load_from_sources(config_path).unwrap();
        assert_eq!(config.sockets.number, 2);
        assert_eq!(config.fetch.chunk_size.as_u64(), 1024);
        assert_eq!(config.ftp.idle_timeout_secs, 60);
        assert_eq!(config.ftp.max_idle_per_host, 1);
    }

    #[test]
    fn test_load_proxy_settings() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("grail.toml");

        let toml_content = r#"
[proxies]
manual_proxy_enabled = false
ftp_proxy = "http://gateway:3128"
        "#;

        fs::write(&config_path, toml_content).unwrap();

        let config = load_from_sources(config_path).unwrap();
        assert_eq!(config.proxies.manual_proxy_enabled, Some(false));
        assert_eq!(config.proxies.proxy_for("ftp"), Some("http://gateway:3128"));
    }
}
