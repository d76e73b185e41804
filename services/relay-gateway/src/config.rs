//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! The admin token is loaded from the ADMIN_TOKEN env var or token_file,
//! never stored in the TOML directly to avoid leaking secrets.

use common::Secret;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    pub store: StoreConfig,
    #[serde(default)]
    pub admin: AdminConfig,
}

/// Main listener settings
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

/// Upstream service settings
#[derive(Debug, Deserialize)]
pub struct UpstreamConfig {
    pub url: String,
    /// Path segment prepended to every relayed path
    #[serde(default = "default_api_version")]
    pub api_version: String,
    /// Per-attempt deadline
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

/// Relay pipeline settings
#[derive(Debug, Deserialize)]
pub struct RelayConfig {
    /// Inbound prefix stripped before forwarding
    #[serde(default = "default_path_prefix")]
    pub path_prefix: String,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            path_prefix: default_path_prefix(),
            max_retries: default_max_retries(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_quarantine_threshold")]
    pub quarantine_threshold: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            quarantine_threshold: default_quarantine_threshold(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RateLimitConfig {
    /// How often empty rate windows are purged
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct StoreConfig {
    pub data_dir: PathBuf,
}

/// Admin API settings. The admin listener is disabled when `listen_addr` is absent.
#[derive(Debug, Default, Deserialize)]
pub struct AdminConfig {
    #[serde(default)]
    pub listen_addr: Option<SocketAddr>,
    #[serde(skip)]
    pub token: Option<Secret<String>>,
    /// Path to a file containing the admin token (alternative to ADMIN_TOKEN env var)
    #[serde(default)]
    pub token_file: Option<PathBuf>,
}

fn default_max_connections() -> usize {
    1000
}

fn default_api_version() -> String {
    "/v1".into()
}

fn default_timeout() -> u64 {
    10
}

fn default_path_prefix() -> String {
    "/v1".into()
}

fn default_max_retries() -> u32 {
    3
}

fn default_quarantine_threshold() -> u32 {
    token_pool::DEFAULT_QUARANTINE_THRESHOLD
}

fn default_sweep_interval() -> u64 {
    60
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    ///
    /// Admin token resolution order:
    /// 1. ADMIN_TOKEN env var
    /// 2. token_file path from config
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;
        config.validate()?;

        if let Ok(token) = std::env::var("ADMIN_TOKEN") {
            if !token.trim().is_empty() {
                config.admin.token = Some(Secret::new(token.trim().to_owned()));
            }
        } else if let Some(ref token_file) = config.admin.token_file {
            let token = std::fs::read_to_string(token_file).map_err(|source| {
                common::Error::SecretFile {
                    path: token_file.clone(),
                    source,
                }
            })?;
            let token = token.trim().to_owned();
            if !token.is_empty() {
                config.admin.token = Some(Secret::new(token));
            }
        }

        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        if !self.upstream.url.starts_with("http://") && !self.upstream.url.starts_with("https://")
        {
            return Err(common::Error::invalid(
                "upstream.url",
                format!(
                    "upstream url must start with http:// or https://, got: {}",
                    self.upstream.url
                ),
            ));
        }
        if !self.upstream.api_version.is_empty() && !self.upstream.api_version.starts_with('/') {
            return Err(common::Error::invalid(
                "upstream.api_version",
                format!("must start with '/', got: {}", self.upstream.api_version),
            ));
        }
        if !self.relay.path_prefix.starts_with('/') {
            return Err(common::Error::invalid(
                "relay.path_prefix",
                format!("must start with '/', got: {}", self.relay.path_prefix),
            ));
        }

        let nonzero = [
            ("timeout_secs", self.upstream.timeout_secs == 0),
            ("max_connections", self.server.max_connections == 0),
            ("max_retries", self.relay.max_retries == 0),
            ("quarantine_threshold", self.pool.quarantine_threshold == 0),
            ("sweep_interval_secs", self.rate_limit.sweep_interval_secs == 0),
        ];
        for (field, is_zero) in nonzero {
            if is_zero {
                return Err(common::Error::invalid(field, "must be greater than 0"));
            }
        }
        Ok(())
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("relay-gateway.toml")
    }
}
