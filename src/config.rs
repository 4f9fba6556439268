//! Service configuration

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::listener::ListenerConfig;
use crate::reconcile::{ChainMode, ReconcileOptions};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub reconcile: ReconcileConfig,
    #[serde(default)]
    pub dashboard: DashboardConfig,
    #[serde(default)]
    pub platform: PlatformConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Directory holding one sub-directory of rule tables per community
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Timeout for a single store read or write
    #[serde(default = "default_io_timeout")]
    pub io_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            io_timeout_ms: default_io_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileConfig {
    #[serde(default)]
    pub chain_mode: ChainMode,

    /// Process updates of the same member one at a time
    #[serde(default = "default_true")]
    pub serialize_per_member: bool,

    /// Longest advertised rate-limit delay worth waiting for
    #[serde(default = "default_retry_cap")]
    pub rate_limit_retry_cap_ms: u64,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            chain_mode: ChainMode::default(),
            serialize_per_member: true,
            rate_limit_retry_cap_ms: default_retry_cap(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DashboardConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_listen")]
    pub listen: SocketAddr,

    /// login.html, index.html and assets
    #[serde(default = "default_static_dir")]
    pub static_dir: PathBuf,

    /// `{ "<community>": "<password>" }`
    #[serde(default = "default_passwords_file")]
    pub passwords_file: PathBuf,

    /// Shared secret of the gateway relay; event ingestion is off without it
    #[serde(default)]
    pub relay_token: Option<String>,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen: default_listen(),
            static_dir: default_static_dir(),
            passwords_file: default_passwords_file(),
            relay_token: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformConfig {
    #[serde(default = "default_api_base")]
    pub api_base: String,

    /// Bot token. Without it the service runs against an empty in-process platform.
    #[serde(default)]
    pub token: Option<String>,

    #[serde(default)]
    pub application_id: Option<String>,

    /// Hex Ed25519 key used to verify interaction requests
    #[serde(default)]
    pub public_key: Option<String>,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,

    #[serde(default = "default_role_cache_ttl")]
    pub role_cache_ttl_secs: u64,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            api_base: default_api_base(),
            token: None,
            application_id: None,
            public_key: None,
            request_timeout_ms: default_request_timeout(),
            role_cache_ttl_secs: default_role_cache_ttl(),
        }
    }
}

// Defaults
fn default_data_dir() -> PathBuf { PathBuf::from("data") }
fn default_io_timeout() -> u64 { 5000 }
fn default_true() -> bool { true }
fn default_retry_cap() -> u64 { 10_000 }
fn default_listen() -> SocketAddr { SocketAddr::from(([0, 0, 0, 0], 3000)) }
fn default_static_dir() -> PathBuf { PathBuf::from("static") }
fn default_passwords_file() -> PathBuf { PathBuf::from("password.json") }
fn default_api_base() -> String { "https://discord.com/api/v10".to_string() }
fn default_request_timeout() -> u64 { 10_000 }
fn default_role_cache_ttl() -> u64 { 60 }

impl Config {
    /// Read a TOML file; a missing file yields the defaults
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(content) => Self::parse(&content)
                .map_err(|e| anyhow::anyhow!("invalid config {}: {e}", path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(anyhow::anyhow!("cannot read config {}: {e}", path.display())),
        }
    }

    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.store.io_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.platform.request_timeout_ms)
    }

    pub fn role_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.platform.role_cache_ttl_secs)
    }

    pub fn listener(&self) -> ListenerConfig {
        ListenerConfig {
            reconcile: ReconcileOptions {
                chain_mode: self.reconcile.chain_mode,
            },
            serialize_per_member: self.reconcile.serialize_per_member,
            rate_limit_retry_cap: Duration::from_millis(self.reconcile.rate_limit_retry_cap_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_gives_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.store.data_dir, PathBuf::from("data"));
        assert_eq!(config.dashboard.listen.port(), 3000);
        assert_eq!(config.reconcile.chain_mode, ChainMode::SingleHop);
        assert!(config.reconcile.serialize_per_member);
        assert!(config.platform.token.is_none());
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let config = Config::load(Path::new("/nonexistent/rolegate.toml")).unwrap();
        assert_eq!(config.store.io_timeout_ms, 5000);
    }
}
