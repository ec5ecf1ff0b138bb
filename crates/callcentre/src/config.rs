//! Run configuration
//!
//! Settings come from three layers: command-line flags (with environment
//! fallbacks), an optional TOML file, and the constants in [`defaults`].
//! [`RunSettings`] holds one partial layer; [`RunSettings::resolve`] applies
//! defaults and validation and produces the immutable [`RunParameters`].

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::retry::RetryPolicy;

/// Default configuration values
pub mod defaults {
    /// Port the instances phone home on
    pub const DEFAULT_CALLBACK_PORT: u16 = 8089;

    /// Boot-config template path
    pub const DEFAULT_TEMPLATE_PATH: &str = "phone-home.yaml";

    /// Seconds between progress reports
    pub const DEFAULT_PROGRESS_INTERVAL_SECS: u64 = 5;

    /// Address block for the run network
    pub const DEFAULT_NETBLOCK: &str = "10.0.0.0/24";

    /// Base image for the root disk
    pub const DEFAULT_DISK_BASE: &str = "ubuntu";

    /// Root disk size in GiB
    pub const DEFAULT_DISK_SIZE_GB: u32 = 8;

    /// Exponential backoff cap when a launch backoff is configured
    pub const DEFAULT_LAUNCH_BACKOFF_MAX_SECS: u64 = 30;
}

/// Configuration validation errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("count must be at least 1, got {0}")]
    InvalidCount(usize),

    #[error("cpus must be at least 1, got {0}")]
    InvalidCpus(u32),

    #[error("memory must be at least 1 MiB, got {0}")]
    InvalidMemory(u32),

    #[error("callback host cannot be empty (set --ip)")]
    EmptyCallbackHost,

    #[error("callback host contains forbidden character: {0:?}")]
    InvalidCallbackHost(char),

    #[error("callback port must be greater than 0")]
    InvalidCallbackPort,

    #[error("invalid listen address '{value}': {source}")]
    InvalidListenAddr {
        value: String,
        #[source]
        source: std::net::AddrParseError,
    },

    #[error("max_concurrent_launches must be at least 1")]
    InvalidMaxConcurrentLaunches,

    #[error("launch_max_attempts must be at least 1")]
    InvalidLaunchMaxAttempts,

    #[error("progress_interval must be greater than 0")]
    InvalidProgressInterval,

    #[error("disk_size must be at least 1 GiB")]
    InvalidDiskSize,

    #[error("{0} cannot be empty")]
    Empty(&'static str),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to read config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl ConfigError {
    /// Create an IO error with path context
    pub fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Immutable configuration for one load-test run
#[derive(Debug, Clone, PartialEq)]
pub struct RunParameters {
    /// Number of instances to launch
    pub count: usize,
    /// vCPUs per instance
    pub cpus: u32,
    /// Memory per instance in MiB
    pub memory_mb: u32,
    /// Host the instances call back to
    pub callback_host: String,
    /// Port the instances call back to
    pub callback_port: u16,
    /// Bind address of the callback listener
    pub listen_addr: SocketAddr,
    /// Boot-config template file
    pub template_path: PathBuf,
    /// Pause between starting consecutive launch workers
    pub launch_delay: Duration,
    /// Delete each instance as soon as it phones home
    pub delete_on_callback: bool,
    /// Bound on in-flight create calls (`None` = unbounded)
    pub max_concurrent_launches: Option<usize>,
    pub launch_retry: RetryPolicy,
    pub progress_interval: Duration,
    pub netblock: String,
    pub disk_base: String,
    pub disk_size_gb: u32,
    /// Unwind partially provisioned resources when setup fails
    pub rollback_on_failure: bool,
    /// Give up waiting for callbacks after this long (`None` = wait forever)
    pub timeout: Option<Duration>,
}

impl RunParameters {
    /// Parameters with defaults for everything but the required fields
    pub fn new(count: usize, cpus: u32, memory_mb: u32, callback_host: impl Into<String>) -> Self {
        Self {
            count,
            cpus,
            memory_mb,
            callback_host: callback_host.into(),
            callback_port: defaults::DEFAULT_CALLBACK_PORT,
            listen_addr: SocketAddr::from(([0, 0, 0, 0], defaults::DEFAULT_CALLBACK_PORT)),
            template_path: PathBuf::from(defaults::DEFAULT_TEMPLATE_PATH),
            launch_delay: Duration::ZERO,
            delete_on_callback: false,
            max_concurrent_launches: None,
            launch_retry: RetryPolicy::unbounded(),
            progress_interval: Duration::from_secs(defaults::DEFAULT_PROGRESS_INTERVAL_SECS),
            netblock: defaults::DEFAULT_NETBLOCK.to_string(),
            disk_base: defaults::DEFAULT_DISK_BASE.to_string(),
            disk_size_gb: defaults::DEFAULT_DISK_SIZE_GB,
            rollback_on_failure: true,
            timeout: None,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.count == 0 {
            return Err(ConfigError::InvalidCount(self.count));
        }
        if self.cpus == 0 {
            return Err(ConfigError::InvalidCpus(self.cpus));
        }
        if self.memory_mb == 0 {
            return Err(ConfigError::InvalidMemory(self.memory_mb));
        }
        validate_host(&self.callback_host)?;
        if self.callback_port == 0 {
            return Err(ConfigError::InvalidCallbackPort);
        }
        if self.max_concurrent_launches == Some(0) {
            return Err(ConfigError::InvalidMaxConcurrentLaunches);
        }
        if self.launch_retry.max_attempts == Some(0) {
            return Err(ConfigError::InvalidLaunchMaxAttempts);
        }
        if self.progress_interval.is_zero() {
            return Err(ConfigError::InvalidProgressInterval);
        }
        if self.netblock.trim().is_empty() {
            return Err(ConfigError::Empty("netblock"));
        }
        if self.disk_base.trim().is_empty() {
            return Err(ConfigError::Empty("disk_base"));
        }
        if self.disk_size_gb == 0 {
            return Err(ConfigError::InvalidDiskSize);
        }
        Ok(())
    }
}

/// Reject hosts that could break out of the boot-config document
fn validate_host(host: &str) -> Result<(), ConfigError> {
    const FORBIDDEN: &[char] = &['"', '\'', '\\', '`', '$', ' ', '/', '\n', '\r', '\t'];
    if host.is_empty() {
        return Err(ConfigError::EmptyCallbackHost);
    }
    if let Some(bad) = host.chars().find(|c| FORBIDDEN.contains(c)) {
        return Err(ConfigError::InvalidCallbackHost(bad));
    }
    Ok(())
}

/// One partial layer of run settings.
///
/// Deserialized from the TOML config file; the CLI builds one from its flags.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunSettings {
    pub count: Option<usize>,
    pub cpus: Option<u32>,
    pub memory: Option<u32>,
    pub callback_host: Option<String>,
    pub callback_port: Option<u16>,
    pub listen: Option<String>,
    pub template: Option<PathBuf>,
    /// Seconds between launches
    pub delay: Option<u64>,
    pub delete_on_callback: Option<bool>,
    pub max_concurrent_launches: Option<usize>,
    pub launch_max_attempts: Option<u32>,
    /// Initial launch retry backoff in milliseconds (0 = none)
    pub launch_backoff_ms: Option<u64>,
    /// Seconds between progress reports
    pub progress_interval: Option<u64>,
    /// Seconds to wait for callbacks (0 = forever)
    pub timeout: Option<u64>,
    pub rollback_on_failure: Option<bool>,
    pub netblock: Option<String>,
    pub disk_base: Option<String>,
    pub disk_size: Option<u32>,
}

impl RunSettings {
    /// Load a settings layer from a TOML file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::io(path.display().to_string(), e))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Fill unset fields from `fallback`; values already set here win
    pub fn or(self, fallback: RunSettings) -> RunSettings {
        RunSettings {
            count: self.count.or(fallback.count),
            cpus: self.cpus.or(fallback.cpus),
            memory: self.memory.or(fallback.memory),
            callback_host: self.callback_host.or(fallback.callback_host),
            callback_port: self.callback_port.or(fallback.callback_port),
            listen: self.listen.or(fallback.listen),
            template: self.template.or(fallback.template),
            delay: self.delay.or(fallback.delay),
            delete_on_callback: self.delete_on_callback.or(fallback.delete_on_callback),
            max_concurrent_launches: self
                .max_concurrent_launches
                .or(fallback.max_concurrent_launches),
            launch_max_attempts: self.launch_max_attempts.or(fallback.launch_max_attempts),
            launch_backoff_ms: self.launch_backoff_ms.or(fallback.launch_backoff_ms),
            progress_interval: self.progress_interval.or(fallback.progress_interval),
            timeout: self.timeout.or(fallback.timeout),
            rollback_on_failure: self.rollback_on_failure.or(fallback.rollback_on_failure),
            netblock: self.netblock.or(fallback.netblock),
            disk_base: self.disk_base.or(fallback.disk_base),
            disk_size: self.disk_size.or(fallback.disk_size),
        }
    }

    /// Apply defaults and validate
    pub fn resolve(self) -> Result<RunParameters, ConfigError> {
        let mut params = RunParameters::new(
            self.count.unwrap_or(0),
            self.cpus.unwrap_or(0),
            self.memory.unwrap_or(0),
            self.callback_host.unwrap_or_default(),
        );

        if let Some(port) = self.callback_port {
            params.callback_port = port;
        }
        params.listen_addr = match self.listen {
            Some(value) => value
                .parse()
                .map_err(|source| ConfigError::InvalidListenAddr { value, source })?,
            None => SocketAddr::from(([0, 0, 0, 0], params.callback_port)),
        };
        if let Some(template) = self.template {
            params.template_path = template;
        }
        if let Some(delay) = self.delay {
            params.launch_delay = Duration::from_secs(delay);
        }
        if let Some(delete) = self.delete_on_callback {
            params.delete_on_callback = delete;
        }
        params.max_concurrent_launches = self.max_concurrent_launches;

        let mut retry = RetryPolicy::unbounded();
        if let Some(attempts) = self.launch_max_attempts {
            retry = retry.with_max_attempts(attempts);
        }
        if let Some(ms) = self.launch_backoff_ms.filter(|ms| *ms > 0) {
            retry = retry.with_backoff(
                Duration::from_millis(ms),
                Duration::from_secs(defaults::DEFAULT_LAUNCH_BACKOFF_MAX_SECS),
            );
        }
        params.launch_retry = retry;

        if let Some(secs) = self.progress_interval {
            params.progress_interval = Duration::from_secs(secs);
        }
        params.timeout = self
            .timeout
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);
        if let Some(rollback) = self.rollback_on_failure {
            params.rollback_on_failure = rollback;
        }
        if let Some(netblock) = self.netblock {
            params.netblock = netblock;
        }
        if let Some(base) = self.disk_base {
            params.disk_base = base;
        }
        if let Some(size) = self.disk_size {
            params.disk_size_gb = size;
        }

        params.validate()?;
        Ok(params)
    }
}
