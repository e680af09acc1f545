//! Controller configuration file.
//!
//! Every field has a default, so an empty file is a valid configuration.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use sluice_core::RoutingTable;

use crate::error::ConfigError;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ControllerConfig {
    /// Control channel to the data plane.
    pub control: ControlConfig,
    /// Full reload of the data plane.
    pub reload: ReloadConfig,
    /// Shutdown drain detection.
    pub drain: DrainSettings,
    /// Backend selection tuning.
    pub balancer: BalancerConfig,
    /// Log output.
    pub log: LogConfig,
}

impl ControllerConfig {
    /// Read and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&raw)
    }

    /// Parse and validate configuration text.
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..1.0).contains(&self.balancer.ewma_decay) {
            return Err(ConfigError::Invalid {
                field: "balancer.ewma_decay",
                reason: format!("{} is outside [0, 1)", self.balancer.ewma_decay),
            });
        }
        if self.drain.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "drain.poll_interval_ms",
                reason: "must be positive".to_string(),
            });
        }
        for (field, command) in [
            ("reload.test_command", &self.reload.test_command),
            ("reload.reload_command", &self.reload.reload_command),
        ] {
            if matches!(command, Some(argv) if argv.is_empty()) {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "command must not be empty".to_string(),
                });
            }
        }
        Ok(())
    }
}

/// `[control]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ControlConfig {
    /// Data plane admin server.
    pub endpoint: SocketAddr,
    /// Bound on one control request, in milliseconds.
    pub timeout_ms: u64,
    /// Request bodies larger than this many bytes are staged to a file.
    pub body_buffer_threshold: usize,
    /// Where staged bodies go; the system temp dir when unset.
    pub staging_dir: Option<PathBuf>,
    /// Retries of transient failures before escalating.
    pub retries: usize,
    /// First retry delay, in milliseconds.
    pub retry_delay_ms: u64,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            endpoint: SocketAddr::from(([127, 0, 0, 1], 10246)),
            timeout_ms: 5_000,
            body_buffer_threshold: 16 * 1024,
            staging_dir: None,
            retries: 2,
            retry_delay_ms: 100,
        }
    }
}

impl ControlConfig {
    /// Request timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// First retry delay.
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// `[reload]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReloadConfig {
    /// The data plane's configuration file.
    pub config_path: PathBuf,
    /// Validates a candidate file; `{config}` is replaced with its path.
    pub test_command: Option<Vec<String>>,
    /// Signals the data plane to reload.
    pub reload_command: Option<Vec<String>>,
}

impl Default for ReloadConfig {
    fn default() -> Self {
        Self {
            config_path: PathBuf::from("/etc/sluice/proxy.json"),
            test_command: None,
            reload_command: None,
        }
    }
}

/// `[drain]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DrainSettings {
    /// Status surface as `host:port/path`.
    pub status_endpoint: String,
    /// Give up after this long, in milliseconds.
    pub max_wait_ms: u64,
    /// Poll period, in milliseconds.
    pub poll_interval_ms: u64,
    /// New connections per poll still considered drained.
    pub threshold: u64,
    /// Consecutive failed polls before giving up.
    pub max_retries: u32,
    /// Bound on one poll, in milliseconds.
    pub client_timeout_ms: u64,
}

impl Default for DrainSettings {
    fn default() -> Self {
        Self {
            status_endpoint: "127.0.0.1:10246/nginx_status".to_string(),
            max_wait_ms: 30_000,
            poll_interval_ms: 1_000,
            threshold: 2,
            max_retries: 3,
            client_timeout_ms: 1_000,
        }
    }
}

/// `[balancer]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BalancerConfig {
    /// Weight of the previous average when folding in a latency sample.
    pub ewma_decay: f64,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self { ewma_decay: 0.5 }
    }
}

impl BalancerConfig {
    /// An empty routing table tuned by this section.
    pub fn routing_table(&self) -> RoutingTable {
        RoutingTable::new(self.ewma_decay)
    }
}

/// `[log]` section.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LogConfig {
    /// `EnvFilter` directives; `RUST_LOG` wins when set.
    pub filter: Option<String>,
    /// Emit JSON lines instead of text.
    pub json: bool,
}
