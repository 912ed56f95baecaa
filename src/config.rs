//! Process configuration: CLI flags, `EDGE_*` environment variables, and an
//! optional TOML file. Both binaries share one settings struct; each reads
//! the fields it cares about.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::breaker::BreakerConfig;
use crate::compress::Codec;
use crate::pool::PoolConfig;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("config file error: {0}")]
    FileError(#[from] std::io::Error),
    #[error("config parse error: {0}")]
    ParseError(#[from] toml::de::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Structured JSON lines, one event per line.
    #[default]
    Json,
    /// Human-readable text for local runs.
    Text,
}

#[derive(Parser, Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
#[command(author, version, about, long_about = None)]
pub struct Settings {
    /// Collector hostname or IP (agent side)
    #[arg(long, env = "EDGE_COLLECTOR_HOST", default_value = "127.0.0.1")]
    pub collector_host: String,

    /// Collector port (agent side)
    #[arg(long, env = "EDGE_COLLECTOR_PORT", default_value = "7000")]
    pub collector_port: u16,

    /// Maximum messages per batch before a flush is forced
    #[arg(long, env = "EDGE_BATCH_MAX", default_value = "100")]
    pub batch_max: usize,

    /// Maximum batch age in milliseconds before a flush is forced
    #[arg(long, env = "EDGE_BATCH_MS", default_value = "250")]
    pub batch_ms: u64,

    /// Compression codec
    #[arg(long, env = "EDGE_CODEC", default_value = "zstd")]
    pub codec: Codec,

    /// Zstandard compression level (1-22)
    #[arg(long, env = "EDGE_COMPRESSION_LEVEL", default_value = "7")]
    pub compression_level: i32,

    /// Directory holding dict_index.json and dictionary blobs
    #[arg(long, env = "EDGE_DICT_DIR", default_value = "./dicts")]
    pub dict_dir: PathBuf,

    /// Output directory for per-topic files (collector side)
    #[arg(long, env = "EDGE_OUT_DIR", default_value = "./out")]
    pub out_dir: PathBuf,

    /// Path of the per-flush CSV log (collector side)
    #[arg(long, env = "EDGE_METRICS_FILE", default_value = "./metrics.csv")]
    pub metrics_file: PathBuf,

    /// Bind address (collector side)
    #[arg(long, env = "EDGE_BIND_HOST", default_value = "0.0.0.0")]
    pub bind_host: String,

    /// Bind port (collector side)
    #[arg(long, env = "EDGE_BIND_PORT", default_value = "7000")]
    pub bind_port: u16,

    /// Maximum pooled collector connections
    #[arg(long, env = "EDGE_POOL_MAX", default_value = "10")]
    pub pool_max: usize,

    /// Socket connect timeout in seconds
    #[arg(long, env = "EDGE_CONNECT_TIMEOUT_SECS", default_value = "2")]
    pub connect_timeout_secs: u64,

    /// Idle pooled connections older than this are replaced (seconds)
    #[arg(long, env = "EDGE_POOL_IDLE_SECS", default_value = "300")]
    pub pool_idle_secs: u64,

    /// Consecutive send failures before the circuit opens
    #[arg(long, env = "EDGE_BREAKER_FAILURES", default_value = "5")]
    pub breaker_failure_threshold: u32,

    /// Circuit cooldown before the recovery probe (seconds)
    #[arg(long, env = "EDGE_BREAKER_TIMEOUT_SECS", default_value = "60")]
    pub breaker_timeout_secs: u64,

    /// Consecutive probe successes before the circuit closes
    #[arg(long, env = "EDGE_BREAKER_SUCCESSES", default_value = "2")]
    pub breaker_success_threshold: u32,

    /// Log level
    #[arg(long, env = "EDGE_LOG_LEVEL", default_value = "info")]
    pub log_level: LogLevel,

    /// Log format (json or text)
    #[arg(long, env = "EDGE_LOG_FORMAT", default_value = "json")]
    pub log_format: LogFormat,

    /// Optional TOML config file; its values replace the defaults, CLI
    /// flags and environment variables still win
    #[arg(long, env = "EDGE_CONFIG_FILE")]
    #[serde(skip)]
    pub config_file: Option<PathBuf>,

    /// Derived fields (not CLI arguments)
    #[serde(skip)]
    #[arg(skip)]
    pub batch_age: Duration,

    #[serde(skip)]
    #[arg(skip)]
    pub connect_timeout: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            collector_host: "127.0.0.1".to_string(),
            collector_port: 7000,
            batch_max: 100,
            batch_ms: 250,
            codec: Codec::Zstd,
            compression_level: 7,
            dict_dir: PathBuf::from("./dicts"),
            out_dir: PathBuf::from("./out"),
            metrics_file: PathBuf::from("./metrics.csv"),
            bind_host: "0.0.0.0".to_string(),
            bind_port: 7000,
            pool_max: 10,
            connect_timeout_secs: 2,
            pool_idle_secs: 300,
            breaker_failure_threshold: 5,
            breaker_timeout_secs: 60,
            breaker_success_threshold: 2,
            log_level: LogLevel::Info,
            log_format: LogFormat::Json,
            config_file: None,
            batch_age: Duration::from_millis(250),
            connect_timeout: Duration::from_secs(2),
        }
    }
}

impl Settings {
    /// Parse from the process environment: CLI flags plus `EDGE_*` env vars,
    /// with an optional TOML file underneath.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(std::env::args_os())
    }

    pub fn from_args<I, T>(args: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let mut settings = Settings::parse_from(args);
        if let Some(path) = settings.config_file.clone() {
            // The file supplies values only where the CLI/env left the
            // default in place.
            let base = Self::from_file(&path)?;
            settings.merge_defaults(base);
        }
        settings.post_process();
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let mut settings: Settings = toml::from_str(&content)?;
        settings.post_process();
        Ok(settings)
    }

    fn merge_defaults(&mut self, base: Settings) {
        let defaults = Settings::default();
        macro_rules! take_base {
            ($field:ident) => {
                if self.$field == defaults.$field && base.$field != defaults.$field {
                    self.$field = base.$field;
                }
            };
        }
        take_base!(collector_host);
        take_base!(collector_port);
        take_base!(batch_max);
        take_base!(batch_ms);
        take_base!(codec);
        take_base!(compression_level);
        take_base!(dict_dir);
        take_base!(out_dir);
        take_base!(metrics_file);
        take_base!(bind_host);
        take_base!(bind_port);
        take_base!(pool_max);
        take_base!(connect_timeout_secs);
        take_base!(pool_idle_secs);
        take_base!(breaker_failure_threshold);
        take_base!(breaker_timeout_secs);
        take_base!(breaker_success_threshold);
        take_base!(log_level);
        take_base!(log_format);
    }

    pub fn post_process(&mut self) {
        self.batch_age = Duration::from_millis(self.batch_ms);
        self.connect_timeout = Duration::from_secs(self.connect_timeout_secs);
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.collector_port == 0 || self.bind_port == 0 {
            return Err(ConfigError::InvalidConfig("port must be non-zero".to_string()));
        }
        if !(1..=10_000).contains(&self.batch_max) {
            return Err(ConfigError::InvalidConfig(format!(
                "batch_max must be 1..=10000, got {}",
                self.batch_max
            )));
        }
        if !(10..=60_000).contains(&self.batch_ms) {
            return Err(ConfigError::InvalidConfig(format!(
                "batch_ms must be 10..=60000, got {}",
                self.batch_ms
            )));
        }
        if !(1..=22).contains(&self.compression_level) {
            return Err(ConfigError::InvalidConfig(format!(
                "compression_level must be 1..=22, got {}",
                self.compression_level
            )));
        }
        if !(1..=128).contains(&self.pool_max) {
            return Err(ConfigError::InvalidConfig(format!(
                "pool_max must be 1..=128, got {}",
                self.pool_max
            )));
        }
        if self.breaker_failure_threshold == 0 || self.breaker_success_threshold == 0 {
            return Err(ConfigError::InvalidConfig(
                "breaker thresholds must be >= 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn collector_addr(&self) -> String {
        format!("{}:{}", self.collector_host, self.collector_port)
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.bind_host, self.bind_port)
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            addr: self.collector_addr(),
            max_size: self.pool_max,
            connect_timeout: self.connect_timeout,
            acquire_timeout: self.connect_timeout,
            max_idle: Duration::from_secs(self.pool_idle_secs),
        }
    }

    pub fn breaker_config(&self) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: self.breaker_failure_threshold,
            timeout: Duration::from_secs(self.breaker_timeout_secs),
            success_threshold: self.breaker_success_threshold,
        }
    }
}
