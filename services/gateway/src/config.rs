//! Configuration types and loading
//!
//! Config precedence: CLI `--config` > `CONFIG_PATH` env var > default file.
//! Every section is optional; missing keys fall back to the defaults below.

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use upstream::constants::{DEFAULT_API_BASE_URL, DEFAULT_LABS_BASE_URL};

/// Root configuration
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub cache: CacheConfig,
}

/// Listener settings for the health and metrics surface
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

#[derive(Debug, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

/// Backend hosts and the outbound HTTP client
#[derive(Debug, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_labs_base_url")]
    pub labs_base_url: String,
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    /// Outbound proxy URL applied to every backend call
    #[serde(default)]
    pub proxy: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_error_ban_threshold")]
    pub error_ban_threshold: u32,
    #[serde(default = "default_unban_interval")]
    pub unban_interval_secs: u64,
}

#[derive(Debug, Deserialize)]
pub struct GenerationConfig {
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_max_poll_attempts")]
    pub max_poll_attempts: u32,
}

/// Local media cache
#[derive(Debug, Deserialize)]
pub struct CacheConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_cache_dir")]
    pub dir: PathBuf,
    /// Public base the cached files are served from
    #[serde(default = "default_cache_base_url")]
    pub base_url: String,
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8000))
}

fn default_max_connections() -> usize {
    1000
}

fn default_store_path() -> PathBuf {
    PathBuf::from("data/store.json")
}

fn default_labs_base_url() -> String {
    DEFAULT_LABS_BASE_URL.to_string()
}

fn default_api_base_url() -> String {
    DEFAULT_API_BASE_URL.to_string()
}

fn default_timeout() -> u64 {
    120
}

fn default_error_ban_threshold() -> u32 {
    3
}

fn default_unban_interval() -> u64 {
    3600
}

fn default_poll_interval() -> u64 {
    3
}

fn default_max_poll_attempts() -> u32 {
    500
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("tmp")
}

fn default_cache_base_url() -> String {
    "http://127.0.0.1:8000".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            max_connections: default_max_connections(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            labs_base_url: default_labs_base_url(),
            api_base_url: default_api_base_url(),
            timeout_secs: default_timeout(),
            proxy: None,
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            error_ban_threshold: default_error_ban_threshold(),
            unban_interval_secs: default_unban_interval(),
        }
    }
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            max_poll_attempts: default_max_poll_attempts(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            dir: default_cache_dir(),
            base_url: default_cache_base_url(),
        }
    }
}

fn require_http_url(field: &str, value: &str) -> common::Result<()> {
    if value.starts_with("http://") || value.starts_with("https://") {
        Ok(())
    } else {
        Err(common::Error::Config(format!(
            "{field} must start with http:// or https://, got: {value}"
        )))
    }
}

fn require_positive(field: &str, value: u64) -> common::Result<()> {
    if value == 0 {
        return Err(common::Error::Config(format!(
            "{field} must be greater than 0"
        )));
    }
    Ok(())
}

impl Config {
    /// Load and validate configuration from a TOML file.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        require_http_url("upstream.labs_base_url", &self.upstream.labs_base_url)?;
        require_http_url("upstream.api_base_url", &self.upstream.api_base_url)?;
        if let Some(proxy) = &self.upstream.proxy {
            require_http_url("upstream.proxy", proxy)?;
        }
        require_http_url("cache.base_url", &self.cache.base_url)?;

        require_positive("upstream.timeout_secs", self.upstream.timeout_secs)?;
        require_positive("server.max_connections", self.server.max_connections as u64)?;
        require_positive("pool.error_ban_threshold", self.pool.error_ban_threshold.into())?;
        require_positive("pool.unban_interval_secs", self.pool.unban_interval_secs)?;
        require_positive("generation.poll_interval_secs", self.generation.poll_interval_secs)?;
        require_positive(
            "generation.max_poll_attempts",
            self.generation.max_poll_attempts.into(),
        )?;
        Ok(())
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream.timeout_secs)
    }

    pub fn unban_interval(&self) -> Duration {
        Duration::from_secs(self.pool.unban_interval_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.generation.poll_interval_secs)
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("flow-gateway.toml")
    }
}
