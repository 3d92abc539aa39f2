//! Configuration types for pivot-netstack

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Linux limits interface names to `IFNAMSIZ - 1` bytes
pub const MAX_INTERFACE_NAME_LEN: usize = 15;

/// Largest inflight cap; the cap is backed by a tokio semaphore
pub const MAX_INFLIGHT: usize = tokio::sync::Semaphore::MAX_PERMITS;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Network stack settings
    #[serde(default)]
    pub stack: StackSettings,

    /// Local relay settings
    #[serde(default)]
    pub relay: RelayConfig,

    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,
}

impl Config {
    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if validation fails.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.stack.validate()?;
        self.relay.validate()?;
        self.log.validate()?;
        Ok(())
    }
}

/// Settings used to construct a [`NetworkStack`](crate::netstack::NetworkStack)
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StackSettings {
    /// Name of the TUN interface to open (e.g. "pivot0")
    #[serde(default = "default_interface_name")]
    pub interface_name: String,

    /// Maximum TCP requests between SYN arrival and completion
    #[serde(default = "default_max_inflight")]
    pub max_inflight: usize,

    /// Interface MTU
    #[serde(default = "default_mtu")]
    pub mtu: usize,

    /// Receive and transmit buffer size of each accepted TCP socket
    #[serde(default = "default_tcp_buffer_size")]
    pub tcp_buffer_size: usize,

    /// Datagrams buffered per UDP flow before newer ones are dropped
    #[serde(default = "default_udp_queue_depth")]
    pub udp_queue_depth: usize,

    /// Seconds without traffic before an accepted UDP flow is forgotten
    #[serde(default = "default_stack_udp_idle_secs")]
    pub udp_idle_timeout_secs: u64,

    /// Maximum ICMP echo replies per second (unlimited when absent)
    #[serde(default)]
    pub echo_rate_limit: Option<u32>,
}

impl StackSettings {
    /// Settings with the given interface name and inflight cap, defaults elsewhere
    #[must_use]
    pub fn new(interface_name: impl Into<String>, max_inflight: usize) -> Self {
        Self {
            interface_name: interface_name.into(),
            max_inflight,
            ..Self::default()
        }
    }

    /// Validate stack settings
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interface_name.is_empty() {
            return Err(ConfigError::ValidationError(
                "interface_name cannot be empty".into(),
            ));
        }
        if self.interface_name.len() > MAX_INTERFACE_NAME_LEN {
            return Err(ConfigError::ValidationError(format!(
                "interface_name '{}' exceeds {MAX_INTERFACE_NAME_LEN} bytes",
                self.interface_name
            )));
        }
        if self.interface_name.contains(['/', ' ', '\0']) {
            return Err(ConfigError::ValidationError(format!(
                "interface_name '{}' contains invalid characters",
                self.interface_name
            )));
        }
        if self.max_inflight == 0 {
            return Err(ConfigError::ValidationError(
                "max_inflight must be greater than 0".into(),
            ));
        }
        if self.max_inflight > MAX_INFLIGHT {
            return Err(ConfigError::ValidationError(format!(
                "max_inflight must be at most {MAX_INFLIGHT}, got {}",
                self.max_inflight
            )));
        }
        if !(576..=65535).contains(&self.mtu) {
            return Err(ConfigError::ValidationError(format!(
                "mtu must be between 576 and 65535, got {}",
                self.mtu
            )));
        }
        if self.tcp_buffer_size < self.mtu {
            return Err(ConfigError::ValidationError(format!(
                "tcp_buffer_size ({}) must be at least the mtu ({})",
                self.tcp_buffer_size, self.mtu
            )));
        }
        if self.udp_queue_depth == 0 {
            return Err(ConfigError::ValidationError(
                "udp_queue_depth must be greater than 0".into(),
            ));
        }
        if self.udp_idle_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "udp_idle_timeout_secs must be greater than 0".into(),
            ));
        }
        if self.echo_rate_limit == Some(0) {
            return Err(ConfigError::ValidationError(
                "echo_rate_limit must be greater than 0 when set".into(),
            ));
        }
        Ok(())
    }

    /// Get the UDP idle timeout as Duration
    #[must_use]
    pub const fn udp_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.udp_idle_timeout_secs)
    }
}

impl Default for StackSettings {
    fn default() -> Self {
        Self {
            interface_name: default_interface_name(),
            max_inflight: default_max_inflight(),
            mtu: default_mtu(),
            tcp_buffer_size: default_tcp_buffer_size(),
            udp_queue_depth: default_udp_queue_depth(),
            udp_idle_timeout_secs: default_stack_udp_idle_secs(),
            echo_rate_limit: None,
        }
    }
}

/// Settings for the local [`DirectRelay`](crate::relay::DirectRelay)
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RelayConfig {
    /// TCP connect timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// UDP idle timeout in seconds
    #[serde(default = "default_relay_udp_idle_secs")]
    pub udp_idle_timeout_secs: u64,
}

impl RelayConfig {
    /// Validate relay settings
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.connect_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "connect_timeout_secs must be greater than 0".into(),
            ));
        }
        if self.udp_idle_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "relay udp_idle_timeout_secs must be greater than 0".into(),
            ));
        }
        Ok(())
    }

    /// Get connect timeout as Duration
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Get UDP idle timeout as Duration
    #[must_use]
    pub const fn udp_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.udp_idle_timeout_secs)
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout_secs(),
            udp_idle_timeout_secs: default_relay_udp_idle_secs(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format: "json" or "pretty"
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Include timestamps
    #[serde(default = "default_true")]
    pub timestamps: bool,

    /// Include target (module path)
    #[serde(default = "default_true")]
    pub target: bool,
}

impl LogConfig {
    /// Validate logging configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.level.to_ascii_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            other => {
                return Err(ConfigError::ValidationError(format!(
                    "Unknown log level: {other}"
                )))
            }
        }
        match self.format.as_str() {
            "json" | "pretty" => Ok(()),
            other => Err(ConfigError::ValidationError(format!(
                "Unknown log format: {other} (expected json or pretty)"
            ))),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            timestamps: true,
            target: true,
        }
    }
}

fn default_interface_name() -> String {
    "pivot0".into()
}

const fn default_max_inflight() -> usize {
    4096
}

const fn default_mtu() -> usize {
    1500
}

const fn default_tcp_buffer_size() -> usize {
    64 * 1024
}

const fn default_udp_queue_depth() -> usize {
    256
}

const fn default_stack_udp_idle_secs() -> u64 {
    60
}

const fn default_connect_timeout_secs() -> u64 {
    5
}

const fn default_relay_udp_idle_secs() -> u64 {
    30
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "pretty".into()
}

const fn default_true() -> bool {
    true
}
