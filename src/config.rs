//! Configuration management with serde serialization/deserialization
//!
//! Values are layered: built-in defaults, then an optional JSON file, then
//! process environment (with `.env` support), then command-line overrides.

use crate::ConfigError;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use std::time::Duration;

/// Top-level configuration for the screenshot server
///
/// # Examples
///
/// ```rust
/// use screenshot_server::{Config, StorageBackend};
///
/// let mut config = Config::default();
/// config.server.port = 8080;
/// config.storage.backend = StorageBackend::Memory;
/// config.renderer.pool_size = 2;
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub renderer: RendererConfig,
    pub rate_limit: RateLimitConfig,
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// S3-compatible object storage
    S3,
    /// In-process map, lost on restart
    Memory,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub bucket: String,
    /// `auto` works for R2; AWS needs a real region
    pub region: String,
    /// Custom endpoint for S3-compatible services
    pub endpoint: Option<String>,
    pub access_key: String,
    pub secret_key: String,
    /// Path-style addressing, required by MinIO
    pub force_path_style: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::S3,
            bucket: String::new(),
            region: "auto".to_string(),
            endpoint: None,
            access_key: String::new(),
            secret_key: String::new(),
            force_path_style: false,
        }
    }
}

/// Rendering engine settings
///
/// The defaults describe a server profile: headless, no sandbox, no GPU and a
/// single browser process.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RendererConfig {
    /// Path to Chrome/Chromium executable (default: auto-detect)
    pub chrome_path: Option<String>,

    /// Maximum number of engines checked out at once
    pub pool_size: usize,

    /// Warm engines kept for reuse between requests; 0 launches one per request
    pub max_idle: usize,

    /// Renders after which an engine is closed instead of returned to the pool
    pub max_engine_uses: usize,

    pub headless: bool,
    pub disable_sandbox: bool,
    pub disable_gpu: bool,
    pub single_process: bool,

    /// Bound on page navigation including the network-idle wait (default: 30s)
    pub navigation_timeout: Duration,

    /// Bound on a whole session, engine launch through capture (default: 60s)
    pub launch_timeout: Duration,

    /// Navigation is settled once at most this many requests are in flight...
    pub network_idle_connections: usize,

    /// ...for at least this long
    pub network_idle_time: Duration,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            chrome_path: None,
            pool_size: num_cpus::get().max(1),
            max_idle: 2,
            max_engine_uses: 100,
            headless: true,
            disable_sandbox: true,
            disable_gpu: true,
            single_process: true,
            navigation_timeout: Duration::from_secs(30),
            launch_timeout: Duration::from_secs(60),
            network_idle_connections: 2,
            network_idle_time: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub window: Duration,
    pub max_requests: u64,
    /// Shared counter store; in-process counters are used when unset
    pub redis_url: Option<String>,
    /// Take the client address from the first `X-Forwarded-For` entry
    pub trust_proxy: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window: Duration::from_secs(5 * 60),
            max_requests: 25,
            redis_url: None,
            trust_proxy: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Expose Prometheus metrics at `/metrics`
    pub enabled: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl Config {
    /// Reads a JSON configuration file. Missing sections keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Applies recognised environment variables on top of `self`.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_vars(|name| env::var(name).ok())
    }

    pub(crate) fn apply_vars<F>(&mut self, var: F) -> Result<(), ConfigError>
    where
        F: Fn(&'static str) -> Option<String>,
    {
        if let Some(port) = var("PORT") {
            self.server.port = parse_var("PORT", &port)?;
        }
        if let Some(host) = var("HOST") {
            self.server.host = host;
        }

        if let Some(backend) = var("STORAGE_BACKEND") {
            self.storage.backend = match backend.to_ascii_lowercase().as_str() {
                "s3" => StorageBackend::S3,
                "memory" => StorageBackend::Memory,
                _ => {
                    return Err(ConfigError::InvalidEnv {
                        var: "STORAGE_BACKEND",
                        value: backend,
                    })
                }
            };
        }
        if let Some(bucket) = var("S3_BUCKET_NAME") {
            self.storage.bucket = bucket;
        }
        if let Some(region) = var("S3_REGION") {
            self.storage.region = region;
        }
        if let Some(endpoint) = var("S3_ENDPOINT").filter(|e| !e.is_empty()) {
            self.storage.endpoint = Some(endpoint);
        }
        if let Some(key) = var("S3_ACCESS_KEY") {
            self.storage.access_key = key;
        }
        if let Some(secret) = var("S3_SECRET_KEY") {
            self.storage.secret_key = secret;
        }
        if let Some(path_style) = var("S3_FORCE_PATH_STYLE") {
            self.storage.force_path_style = parse_bool("S3_FORCE_PATH_STYLE", &path_style)?;
        }

        if let Some(path) = var("CHROME_PATH").filter(|p| !p.is_empty()) {
            self.renderer.chrome_path = Some(path);
        }
        if let Some(size) = var("RENDERER_POOL_SIZE") {
            self.renderer.pool_size = parse_var("RENDERER_POOL_SIZE", &size)?;
        }

        if let Some(url) = var("REDIS_URL").filter(|u| !u.is_empty()) {
            self.rate_limit.redis_url = Some(url);
        }
        if let Some(secs) = var("RATE_LIMIT_WINDOW_SECS") {
            self.rate_limit.window = Duration::from_secs(parse_var("RATE_LIMIT_WINDOW_SECS", &secs)?);
        }
        if let Some(max) = var("RATE_LIMIT_MAX") {
            self.rate_limit.max_requests = parse_var("RATE_LIMIT_MAX", &max)?;
        }
        if let Some(enabled) = var("RATE_LIMIT_ENABLED") {
            self.rate_limit.enabled = parse_bool("RATE_LIMIT_ENABLED", &enabled)?;
        }
        if let Some(trust) = var("TRUST_PROXY") {
            self.rate_limit.trust_proxy = parse_bool("TRUST_PROXY", &trust)?;
        }

        if let Some(enabled) = var("METRICS_ENABLED") {
            self.metrics.enabled = parse_bool("METRICS_ENABLED", &enabled)?;
        }

        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if self.renderer.pool_size == 0 {
            return invalid("renderer pool size must be greater than 0");
        }
        if self.renderer.max_engine_uses == 0 {
            return invalid("max engine uses must be greater than 0");
        }
        if self.renderer.navigation_timeout.is_zero() || self.renderer.launch_timeout.is_zero() {
            return invalid("renderer timeouts must be greater than 0");
        }
        if self.renderer.navigation_timeout >= self.renderer.launch_timeout {
            return invalid("navigation timeout must be shorter than the launch timeout");
        }
        if self.rate_limit.enabled && (self.rate_limit.window.is_zero() || self.rate_limit.max_requests == 0) {
            return invalid("rate limit window and max requests must be greater than 0");
        }
        if self.storage.backend == StorageBackend::S3 && self.storage.bucket.is_empty() {
            return invalid("S3 storage requires a bucket name (S3_BUCKET_NAME)");
        }

        Ok(())
    }
}

fn parse_var<T: std::str::FromStr>(var: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        var,
        value: value.to_string(),
    })
}

fn parse_bool(var: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidEnv {
            var,
            value: value.to_string(),
        }),
    }
}
