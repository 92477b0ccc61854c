//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/crashpost/config.toml`
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/crashpost/` (~/.config/crashpost/)
//! - Data: `$XDG_DATA_HOME/crashpost/` (~/.local/share/crashpost/)
//! - State/Logs: `$XDG_STATE_HOME/crashpost/` (~/.local/state/crashpost/)
//!
//! The pipeline never mutates a loaded [`Config`]; it is resolved once and
//! owned by the [`ErrorReporter`](crate::ErrorReporter).

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Returns a best-effort home directory path.
fn home_dir() -> PathBuf {
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

/// Returns XDG_DATA_HOME or ~/.local/share
fn xdg_data_home() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/share"))
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
    /// Host application identity and global switches
    #[serde(default)]
    pub reporter: ReporterConfig,

    /// Field collection settings
    #[serde(default)]
    pub collection: CollectionConfig,

    /// Rate limiting settings
    #[serde(default)]
    pub limiter: LimiterConfig,

    /// Delivery settings
    #[serde(default)]
    pub sending: SendingConfig,

    /// Startup reconciliation settings
    #[serde(default)]
    pub startup: StartupConfig,

    /// Built-in HTTP sender (optional)
    #[serde(default)]
    pub http: HttpSenderConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Host application identity and global switches
#[derive(Debug, Deserialize, Clone)]
pub struct ReporterConfig {
    /// Master switch; a disabled reporter hands failures straight to the fallback
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Application name recorded in every report
    #[serde(default = "default_app_name")]
    pub app_name: String,

    /// Application version recorded in every report and in the limiter ledger
    #[serde(default = "default_app_version")]
    pub app_version: String,

    /// Override for the report queue directory
    pub report_dir: Option<PathBuf>,

    /// Host is a development build
    #[serde(default)]
    pub dev_mode: bool,

    /// Send reports even when `dev_mode` is set
    #[serde(default)]
    pub send_in_dev_mode: bool,

    /// Upper bound for blocking failure handling (panic hook) in milliseconds
    #[serde(default = "default_handle_timeout")]
    pub handle_timeout_ms: u64,
}

impl Default for ReporterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            app_name: default_app_name(),
            app_version: default_app_version(),
            report_dir: None,
            dev_mode: false,
            send_in_dev_mode: false,
            handle_timeout_ms: default_handle_timeout(),
        }
    }
}

impl ReporterConfig {
    /// Whether the dev-mode escape hatch suppresses all sending
    pub fn sending_suppressed(&self) -> bool {
        self.dev_mode && !self.send_in_dev_mode
    }
}

fn default_true() -> bool {
    true
}

fn default_app_name() -> String {
    "crashpost".to_string()
}

fn default_app_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

fn default_handle_timeout() -> u64 {
    10_000
}

/// Field collection settings
#[derive(Debug, Deserialize, Clone)]
pub struct CollectionConfig {
    /// Run the collectors of one tier concurrently
    #[serde(default = "default_true")]
    pub parallel: bool,

    /// Worker pool size for concurrent collectors
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Per-collector timeout in milliseconds
    #[serde(default = "default_collector_timeout")]
    pub collector_timeout_ms: u64,

    /// Names of collectors that must not run
    #[serde(default)]
    pub disabled_collectors: Vec<String>,

    /// Application log file to attach (tail)
    pub log_file: Option<PathBuf>,

    /// Number of trailing log lines to attach
    #[serde(default = "default_log_lines")]
    pub log_lines: usize,

    /// Environment variables copied into the report
    #[serde(default)]
    pub environment_vars: Vec<String>,
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            parallel: true,
            max_workers: default_max_workers(),
            collector_timeout_ms: default_collector_timeout(),
            disabled_collectors: vec![],
            log_file: None,
            log_lines: default_log_lines(),
            environment_vars: vec![],
        }
    }
}

impl CollectionConfig {
    /// Per-collector timeout
    pub fn collector_timeout(&self) -> Duration {
        Duration::from_millis(self.collector_timeout_ms.max(1))
    }

    /// Whether a collector was switched off in configuration
    pub fn is_disabled(&self, name: &str) -> bool {
        self.disabled_collectors.iter().any(|n| n == name)
    }
}

fn default_max_workers() -> usize {
    4
}

fn default_collector_timeout() -> u64 {
    5_000
}

fn default_log_lines() -> usize {
    100
}

/// Rate limiting settings
#[derive(Debug, Deserialize, Clone)]
pub struct LimiterConfig {
    /// Enable rate limiting
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Rolling window length in seconds
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,

    /// Reports allowed within the window
    #[serde(default = "default_overall_limit")]
    pub overall_limit: usize,

    /// Reports allowed per stack trace within the window
    #[serde(default = "default_stacktrace_limit")]
    pub stacktrace_limit: usize,

    /// Reports allowed per exception class within the window
    #[serde(default = "default_exception_class_limit")]
    pub exception_class_limit: usize,

    /// Queued (pending + approved) reports tolerated before collection stops
    #[serde(default = "default_failed_report_limit")]
    pub failed_report_limit: usize,

    /// Clear the ledger when the application version changes
    #[serde(default = "default_true")]
    pub reset_on_app_update: bool,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            retention_secs: default_retention_secs(),
            overall_limit: default_overall_limit(),
            stacktrace_limit: default_stacktrace_limit(),
            exception_class_limit: default_exception_class_limit(),
            failed_report_limit: default_failed_report_limit(),
            reset_on_app_update: true,
        }
    }
}

impl LimiterConfig {
    /// Rolling window length
    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.retention_secs).unwrap_or(i64::MAX))
    }
}

fn default_retention_secs() -> u64 {
    7 * 24 * 60 * 60
}

fn default_overall_limit() -> usize {
    25
}

fn default_stacktrace_limit() -> usize {
    3
}

fn default_exception_class_limit() -> usize {
    10
}

fn default_failed_report_limit() -> usize {
    5
}

/// Built-in retry policies selectable from configuration
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RetryPolicyKind {
    /// Keep the report only when every sender failed
    #[default]
    RetryWhenAllFailed,
    /// Keep the report on partial failure, give up when every sender failed
    RetryUnlessAllFailed,
    /// Keep the report whenever any sender failed
    RetryOnAnyFailure,
    /// Keep the report while the failure ratio exceeds `max_failure_ratio`
    FailureRatio,
}

/// Delivery settings
#[derive(Debug, Deserialize, Clone)]
pub struct SendingConfig {
    /// Reports attempted per `send_all` invocation
    #[serde(default = "default_batch_limit")]
    pub batch_limit: usize,

    /// Retry policy used after a partially failed send
    #[serde(default)]
    pub retry_policy: RetryPolicyKind,

    /// Failure ratio tolerated by the `failure_ratio` policy
    #[serde(default = "default_max_failure_ratio")]
    pub max_failure_ratio: f64,

    /// How long approval collaborators may take, in milliseconds
    #[serde(default = "default_approval_timeout")]
    pub approval_timeout_ms: u64,
}

impl Default for SendingConfig {
    fn default() -> Self {
        Self {
            batch_limit: default_batch_limit(),
            retry_policy: RetryPolicyKind::default(),
            max_failure_ratio: default_max_failure_ratio(),
            approval_timeout_ms: default_approval_timeout(),
        }
    }
}

impl SendingConfig {
    /// Bounded wait for approval collaborators
    pub fn approval_timeout(&self) -> Duration {
        Duration::from_millis(self.approval_timeout_ms)
    }
}

fn default_batch_limit() -> usize {
    5
}

fn default_max_failure_ratio() -> f64 {
    0.5
}

fn default_approval_timeout() -> u64 {
    60_000
}

/// Startup reconciliation settings
#[derive(Debug, Deserialize, Clone)]
pub struct StartupConfig {
    /// Delete all pending reports except the most recently modified one
    #[serde(default = "default_true")]
    pub delete_unapproved_on_start: bool,

    /// Approve the pending report that survived pruning
    #[serde(default)]
    pub approve_remaining_on_start: bool,

    /// Delay before reconciliation starts, in milliseconds
    #[serde(default = "default_startup_delay")]
    pub delay_ms: u64,
}

impl Default for StartupConfig {
    fn default() -> Self {
        Self {
            delete_unapproved_on_start: true,
            approve_remaining_on_start: false,
            delay_ms: default_startup_delay(),
        }
    }
}

fn default_startup_delay() -> u64 {
    2_000
}

/// Built-in HTTP sender configuration
#[derive(Debug, Deserialize, Clone)]
pub struct HttpSenderConfig {
    /// Register the HTTP sender
    #[serde(default)]
    pub enabled: bool,

    /// Endpoint receiving the JSON report (POST)
    pub url: Option<String>,

    /// Bearer token (optional)
    pub token: Option<String>,

    /// HTTP request timeout in seconds
    #[serde(default = "default_http_timeout")]
    pub timeout_secs: u64,
}

impl Default for HttpSenderConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: None,
            token: None,
            timeout_secs: default_http_timeout(),
        }
    }
}

impl HttpSenderConfig {
    /// Check if the sender is enabled and has an endpoint
    pub fn is_ready(&self) -> bool {
        self.enabled && self.url.is_some()
    }
}

fn default_http_timeout() -> u64 {
    20
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
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            max_files: default_max_log_files(),
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

    /// Validate configuration, returning error message if invalid
    pub fn validate(&self) -> Result<()> {
        if self.sending.batch_limit == 0 {
            return Err(Error::Config(
                "sending.batch_limit must be at least 1".to_string(),
            ));
        }
        if self.collection.max_workers == 0 {
            return Err(Error::Config(
                "collection.max_workers must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.sending.max_failure_ratio) {
            return Err(Error::Config(
                "sending.max_failure_ratio must be between 0 and 1".to_string(),
            ));
        }
        if self.http.enabled && self.http.url.is_none() {
            return Err(Error::Config(
                "http.url is required when the http sender is enabled".to_string(),
            ));
        }
        Ok(())
    }

    /// Directory holding the `pending/` and `approved/` queues and the ledger
    pub fn report_dir(&self) -> PathBuf {
        self.reporter
            .report_dir
            .clone()
            .unwrap_or_else(|| Self::data_dir().join("reports"))
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/crashpost/config.toml` (~/.config/crashpost/config.toml)
    pub fn config_path() -> PathBuf {
        xdg_config_home().join("crashpost").join("config.toml")
    }

    /// Returns the data directory path (for the report queue)
    ///
    /// `$XDG_DATA_HOME/crashpost/` (~/.local/share/crashpost/)
    pub fn data_dir() -> PathBuf {
        xdg_data_home().join("crashpost")
    }

    /// Returns the state directory path (for logs)
    ///
    /// `$XDG_STATE_HOME/crashpost/` (~/.local/state/crashpost/)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("crashpost")
    }

    /// Returns the log file path
    ///
    /// `$XDG_STATE_HOME/crashpost/crashpost.log` (~/.local/state/crashpost/crashpost.log)
    pub fn log_path() -> PathBuf {
        Self::state_dir().join("crashpost.log")
    }
}
