use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};

/// Top-level configuration, deserialized from a TOML file. Every field has a
/// default so a deployment only needs to override the knobs it cares about.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub pool: PoolConfig,
    pub client: ClientConfig,
    pub server: ServerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pool: PoolConfig::default(),
            client: ClientConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

impl Config {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| Error::InvalidArgument(format!("bad config: {e}")))
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let s = std::fs::read_to_string(path)?;
        Self::from_toml_str(&s)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub max_conns: u64,
    pub max_conns_per_host: u64,
    pub max_conn_age_secs: u64,
    pub io_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_conns: 256,
            max_conns_per_host: 8,
            max_conn_age_secs: 300,
            io_timeout_ms: 1_000,
        }
    }
}

impl PoolConfig {
    pub fn max_conn_age(&self) -> Duration {
        Duration::from_secs(self.max_conn_age_secs)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub max_concurrent_tasks: usize,
    pub max_concurrent_tasks_per_host: usize,
    pub tolerate_failures: bool,
    pub idle_timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 128,
            max_concurrent_tasks_per_host: 4,
            tolerate_failures: true,
            idle_timeout_ms: 5_000,
        }
    }
}

impl ClientConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// `server.query_progress_rate_limit` in the wire spec; microseconds
    /// between QueryProgress frames.
    pub query_progress_rate_limit_us: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            query_progress_rate_limit_us: 100_000,
        }
    }
}

impl ServerConfig {
    pub fn query_progress_rate_limit(&self) -> Duration {
        Duration::from_micros(self.query_progress_rate_limit_us)
    }
}
