//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/ic-audit/config.toml`. Every field
//! has a default, so the file is optional.
//!
//! This module follows the XDG Base Directory Specification for its own files:
//! - Config: `$XDG_CONFIG_HOME/ic-audit/` (~/.config/ic-audit/)
//! - State/Logs: `$XDG_STATE_HOME/ic-audit/` (~/.local/state/ic-audit/)
//!
//! The audit snapshot itself lives at `~/.cellar/loser_audit.jsonl`, a location
//! shared with older collectors on the same machine.

use crate::error::{Error, Result};
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Port the collector listens on unless configured otherwise.
pub const DEFAULT_PORT: u16 = 9324;

/// Returns a best-effort home directory path.
pub(crate) fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Returns XDG_CONFIG_HOME or ~/.config
fn xdg_config_home() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
}

/// Returns XDG_STATE_HOME or ~/.local/state
fn xdg_state_home() -> PathBuf {
    std::env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/state"))
}

/// Main configuration struct
#[derive(Debug, Deserialize, Default, Clone)]
pub struct Config {
    /// Collector server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Dump output configuration
    #[serde(default)]
    pub dump: DumpConfig,

    /// Client-side notifier configuration
    #[serde(default)]
    pub notifier: NotifierConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Collector server configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Interface to bind
    #[serde(default = "default_host")]
    pub host: IpAddr,

    /// TCP port; 0 picks an ephemeral port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Snapshot file override (default: ~/.cellar/loser_audit.jsonl)
    pub snapshot_path: Option<PathBuf>,

    /// Seconds between periodic snapshots
    #[serde(default = "default_snapshot_interval")]
    pub snapshot_interval_secs: u64,

    /// Idle seconds before a client connection is dropped
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,

    /// Largest accepted frame in bytes
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,

    /// Oldest events of a project are evicted past this count (0 = unbounded)
    #[serde(default = "default_max_events_per_project")]
    pub max_events_per_project: usize,

    /// How long shutdown waits for in-flight connections
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_ms: u64,

    /// Dump settings used by `dump_now`; filled from the top-level `[dump]`
    /// section by [`Config::server_config`]
    #[serde(skip)]
    pub dump: DumpConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            snapshot_path: None,
            snapshot_interval_secs: default_snapshot_interval(),
            read_timeout_secs: default_read_timeout(),
            max_frame_bytes: default_max_frame_bytes(),
            max_events_per_project: default_max_events_per_project(),
            shutdown_grace_ms: default_shutdown_grace(),
            dump: DumpConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Address the listener binds to
    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    /// Resolved snapshot path
    pub fn snapshot_path(&self) -> PathBuf {
        self.snapshot_path
            .clone()
            .unwrap_or_else(Config::snapshot_path)
    }

    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_secs(self.snapshot_interval_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Per-project event cap, `None` when unbounded
    pub fn event_cap(&self) -> Option<usize> {
        (self.max_events_per_project > 0).then_some(self.max_events_per_project)
    }

    /// Validate configuration, returning error message if invalid
    pub fn validate(&self) -> Result<()> {
        if self.snapshot_interval_secs == 0 {
            return Err(Error::Config(
                "server.snapshot_interval_secs must be greater than 0".to_string(),
            ));
        }
        if self.read_timeout_secs == 0 {
            return Err(Error::Config(
                "server.read_timeout_secs must be greater than 0".to_string(),
            ));
        }
        if self.max_frame_bytes == 0 {
            return Err(Error::Config(
                "server.max_frame_bytes must be greater than 0".to_string(),
            ));
        }
        self.dump.validate()
    }
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_snapshot_interval() -> u64 {
    30
}

fn default_read_timeout() -> u64 {
    30
}

fn default_max_frame_bytes() -> usize {
    1024 * 1024
}

fn default_max_events_per_project() -> usize {
    250_000
}

fn default_shutdown_grace() -> u64 {
    500
}

/// Dump output configuration
#[derive(Debug, Deserialize, Clone)]
pub struct DumpConfig {
    /// Trailing window in hours for the default dump
    #[serde(default = "default_window_hours")]
    pub window_hours: u64,

    /// JSON dump file (relative paths resolve against the working directory)
    #[serde(default = "default_dump_path")]
    pub path: PathBuf,

    /// Compact text dump file
    #[serde(default = "default_compact_path")]
    pub compact_path: PathBuf,
}

impl Default for DumpConfig {
    fn default() -> Self {
        Self {
            window_hours: default_window_hours(),
            path: default_dump_path(),
            compact_path: default_compact_path(),
        }
    }
}

impl DumpConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_hours * 60 * 60)
    }

    pub fn validate(&self) -> Result<()> {
        if self.window_hours == 0 {
            return Err(Error::Config(
                "dump.window_hours must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

// 30 hours covers a trading day plus the overnight gap.
fn default_window_hours() -> u64 {
    30
}

fn default_dump_path() -> PathBuf {
    PathBuf::from("dumped_audit_trails.json")
}

fn default_compact_path() -> PathBuf {
    PathBuf::from("compact_audit_dump.txt")
}

/// Client-side notifier configuration
#[derive(Debug, Deserialize, Clone)]
pub struct NotifierConfig {
    /// Collector address
    #[serde(default = "default_notifier_address")]
    pub address: SocketAddr,

    /// Connect-and-write budget in milliseconds
    #[serde(default = "default_notifier_timeout")]
    pub timeout_ms: u64,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            address: default_notifier_address(),
            timeout_ms: default_notifier_timeout(),
        }
    }
}

impl NotifierConfig {
    /// Notifier aimed at a specific collector address
    pub fn for_address(address: SocketAddr) -> Self {
        Self {
            address,
            ..Default::default()
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.address.port() == 0 {
            return Err(Error::Config(
                "notifier.address must include a non-zero port".to_string(),
            ));
        }
        if self.timeout_ms == 0 {
            return Err(Error::Config(
                "notifier.timeout_ms must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_notifier_address() -> SocketAddr {
    SocketAddr::new(default_host(), DEFAULT_PORT)
}

fn default_notifier_timeout() -> u64 {
    500
}

/// Logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Maximum number of log files to keep
    #[serde(default = "default_max_log_files")]
    pub max_files: usize,

    /// Also log warnings and errors to stderr
    #[serde(default)]
    pub stderr: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            max_files: default_max_log_files(),
            stderr: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_log_files() -> usize {
    5
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            return Ok(Config::default());
        }

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate every section
    pub fn validate(&self) -> Result<()> {
        self.server.validate()?;
        self.dump.validate()?;
        self.notifier.validate()
    }

    /// Server configuration with the top-level `[dump]` section applied
    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            dump: self.dump.clone(),
            ..self.server.clone()
        }
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/ic-audit/config.toml` (~/.config/ic-audit/config.toml)
    pub fn config_path() -> PathBuf {
        xdg_config_home().join("ic-audit").join("config.toml")
    }

    /// Returns the state directory path (for logs)
    ///
    /// `$XDG_STATE_HOME/ic-audit/` (~/.local/state/ic-audit/)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("ic-audit")
    }

    /// Returns the log file path
    ///
    /// `$XDG_STATE_HOME/ic-audit/ic-audit.log` (~/.local/state/ic-audit/ic-audit.log)
    pub fn log_path() -> PathBuf {
        Self::state_dir().join("ic-audit.log")
    }

    /// Returns the directory holding the audit snapshot (~/.cellar/)
    pub fn cellar_dir() -> PathBuf {
        home_dir().join(".cellar")
    }

    /// Returns the default snapshot path
    ///
    /// `~/.cellar/loser_audit.jsonl`
    pub fn snapshot_path() -> PathBuf {
        Self::cellar_dir().join("loser_audit.jsonl")
    }
}
