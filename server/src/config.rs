//! Server configuration
//!
//! Values are layered: built-in defaults, then an optional TOML file, then
//! command-line flags. The resulting [`ServerConfig`] is passed explicitly to
//! everything that needs it.

use clap::Parser;
use cmdbroker_shared::{codec, limits};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Extra time past the OS command timeout before shutdown aborts tasks
const SHUTDOWN_MARGIN: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Runtime configuration for the broker
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Address the router socket binds to
    pub listen_addr: SocketAddr,
    /// Number of handler invocations allowed to run at once
    pub worker_pool_size: usize,
    /// Requests allowed to wait for a worker slot; `None` means unbounded
    pub queue_capacity: Option<usize>,
    /// Wall-clock bound on a single OS command
    #[serde(with = "secs")]
    pub command_timeout: Duration,
    /// Programs the OS handler may run
    pub allowed_commands: BTreeSet<String>,
    /// How long shutdown waits for outstanding tasks before aborting them;
    /// unset means slightly longer than `command_timeout`
    #[serde(with = "secs_opt")]
    pub shutdown_grace: Option<Duration>,
    /// Outstanding tasks older than this are reported by the stall monitor
    #[serde(with = "secs")]
    pub stall_warning: Duration,
    /// Largest accepted request frame, in bytes
    pub max_frame_size: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], limits::DEFAULT_PORT)),
            worker_pool_size: limits::DEFAULT_WORKER_POOL_SIZE,
            queue_capacity: Some(limits::DEFAULT_QUEUE_CAPACITY),
            command_timeout: limits::DEFAULT_COMMAND_TIMEOUT,
            allowed_commands: ["ping", "dir", "ls"].into_iter().map(String::from).collect(),
            shutdown_grace: None,
            stall_warning: Duration::from_secs(10),
            max_frame_size: codec::MAX_FRAME_SIZE,
        }
    }
}

impl ServerConfig {
    /// Load a config file, filling unspecified fields with defaults
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Build the effective configuration from command-line arguments
    pub fn from_args(args: &Args) -> Result<Self, ConfigError> {
        let mut config = match &args.config {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        args.apply(&mut config);
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_pool_size == 0 {
            return Err(ConfigError::Invalid("worker_pool_size must be at least 1".into()));
        }
        if self.command_timeout.is_zero() {
            return Err(ConfigError::Invalid("command_timeout must be non-zero".into()));
        }
        if self.max_frame_size == 0 || self.max_frame_size > codec::MAX_FRAME_SIZE {
            return Err(ConfigError::Invalid(format!(
                "max_frame_size must be between 1 and {}",
                codec::MAX_FRAME_SIZE
            )));
        }
        Ok(())
    }

    /// Effective drain period at shutdown
    pub fn shutdown_grace(&self) -> Duration {
        self.shutdown_grace
            .unwrap_or(self.command_timeout + SHUTDOWN_MARGIN)
    }

    /// Outstanding tasks beyond which new requests are refused
    pub fn max_outstanding(&self) -> Option<usize> {
        self.queue_capacity
            .map(|queued| self.worker_pool_size.saturating_add(queued))
    }
}

/// Command-line flags for the server binary
#[derive(Parser, Debug, Default)]
#[command(name = "cmdbroker-server", about = "Command-execution broker")]
pub struct Args {
    /// TOML config file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Listen address, e.g. 0.0.0.0:5555
    #[arg(short, long)]
    pub listen: Option<SocketAddr>,

    /// Number of worker slots
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// Requests allowed to queue for a worker slot
    #[arg(long, conflicts_with = "unbounded_queue")]
    pub queue_capacity: Option<usize>,

    /// Never refuse work with "Server busy"
    #[arg(long)]
    pub unbounded_queue: bool,

    /// OS command timeout in seconds
    #[arg(long)]
    pub command_timeout: Option<u64>,

    /// Replace the OS handler allow-list (repeatable)
    #[arg(long = "allow")]
    pub allowed_commands: Vec<String>,
}

impl Args {
    fn apply(&self, config: &mut ServerConfig) {
        if let Some(listen) = self.listen {
            config.listen_addr = listen;
        }
        if let Some(workers) = self.workers {
            config.worker_pool_size = workers;
        }
        if self.unbounded_queue {
            config.queue_capacity = None;
        } else if let Some(capacity) = self.queue_capacity {
            config.queue_capacity = Some(capacity);
        }
        if let Some(secs) = self.command_timeout {
            config.command_timeout = Duration::from_secs(secs);
        }
        if !self.allowed_commands.is_empty() {
            config.allowed_commands = self
                .allowed_commands
                .iter()
                .map(|name| name.to_lowercase())
                .collect();
        }
    }
}

/// Durations are written as whole (or fractional) seconds in config files
mod secs {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

mod secs_opt {
    use serde::Deserializer;
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
        super::secs::deserialize(deserializer).map(Some)
    }
}
