use crate::humanize::ByteSize;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub sockets: SocketsConfig,
    #[serde(default)]
    pub proxies: ProxiesConfig,
    #[serde(default)]
    pub ftp: FtpConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Connection admission limits
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SocketsConfig {
    /// Maximum number of concurrently open network connections
    #[serde(default = "default_socket_number")]
    pub number: usize,
}

impl Default for SocketsConfig {
    fn default() -> Self {
        Self {
            number: default_socket_number(),
        }
    }
}

fn default_socket_number() -> usize {
    5
}

/// Proxy preferences.
///
/// `manual_proxy_enabled` is tri-state: absent means the preferences were
/// never configured, which is what triggers the one-time environment seeding
/// (see [`crate::proxy::seed_from_env`]). Per-scheme proxy URLs live next to
/// the flags as `<scheme>_proxy` keys.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct ProxiesConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manual_proxy_enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub no_proxy_enabled: Option<bool>,
    /// Comma-separated hosts or `.domain` suffixes that bypass the proxy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub no_proxy: Option<String>,
    #[serde(flatten)]
    pub schemes: BTreeMap<String, String>,
}

impl ProxiesConfig {
    /// Proxy URL configured for an already-normalised scheme name.
    pub fn proxy_for(&self, scheme: &str) -> Option<&str> {
        self.schemes
            .get(&format!("{scheme}_proxy"))
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
    }

    pub fn set_proxy(&mut self, scheme: &str, url: impl Into<String>) {
        self.schemes.insert(format!("{scheme}_proxy"), url.into());
    }

    /// Exception list, split on commas and trimmed; empty when disabled.
    pub fn no_proxy_list(&self) -> Vec<String> {
        if self.no_proxy_enabled != Some(true) {
            return Vec::new();
        }
        self.no_proxy
            .as_deref()
            .map(|list| {
                list.split(',')
                    .map(|entry| entry.trim().to_lowercase())
                    .filter(|entry| !entry.is_empty())
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// FTP connection cache settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FtpConfig {
    /// Idle connections older than this are closed on the next acquire
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Upper bound on idle cached connections per host
    #[serde(default = "default_max_idle_per_host")]
    pub max_idle_per_host: usize,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

impl FtpConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl Default for FtpConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_idle_timeout_secs(),
            max_idle_per_host: default_max_idle_per_host(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

fn default_idle_timeout_secs() -> u64 {
    300
}

fn default_max_idle_per_host() -> usize {
    4
}

fn default_connect_timeout_secs() -> u64 {
    30
}

/// Read loop settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FetchConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: ByteSize,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            user_agent: default_user_agent(),
        }
    }
}

fn default_chunk_size() -> ByteSize {
    ByteSize::kib(8)
}

fn default_user_agent() -> String {
    format!("Grail/{}", env!("CARGO_PKG_VERSION"))
}

/// Log output settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// `tracing_subscriber::EnvFilter` directive; `RUST_LOG` wins when set
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
        }
    }
}

fn default_log_filter() -> String {
    "info".to_string()
}
