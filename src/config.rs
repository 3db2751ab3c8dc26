//! Server configuration module
//!
//! Parses and manages server configuration from YAML files. Every field has a
//! default, so an empty document is a valid configuration.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use crate::network::acl::AccessList;
use crate::network::codec::{
    Protocol, DEFAULT_EXTENDED_COMMANDS, DEFAULT_HANDSHAKE_COMMAND, DEFAULT_MAX_PAYLOAD,
};

/// Highest tick rate accepted by `validate`.
pub const MAX_TICK_RATE: u32 = 1000;

/// Main server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    // ============================================
    // Listener
    // ============================================
    #[serde(default = "default_listen_ip")]
    pub listen_ip: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Session startup workers. 0 uses the machine's available parallelism.
    #[serde(default)]
    pub worker_threads: usize,

    /// Deny rules ("all", "a.b.c.d", "a.b.c.d/bits", "a.b.c.d/e.f.g.h").
    #[serde(default)]
    pub deny: Vec<String>,

    // ============================================
    // Admission & Session Lifetime
    // ============================================
    /// Live connections allowed per source IP. 0 disables the cap.
    #[serde(default = "default_max_per_address")]
    pub max_per_address: usize,

    /// Close sessions with no inbound frame for this long. 0 disables.
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,

    /// Pending outbound frames before a slow peer is disconnected.
    /// 0 leaves the queue unbounded.
    #[serde(default)]
    pub outbound_queue_limit: usize,

    /// How long the send task waits on an empty queue before looping.
    #[serde(default = "default_send_poll_ms")]
    pub send_poll_ms: u64,

    // ============================================
    // Protocol
    // ============================================
    #[serde(default = "default_handshake_command")]
    pub handshake_command: i8,

    /// Commands that carry a 4-byte length once encrypted (126 always does).
    #[serde(default = "default_extended_commands")]
    pub extended_commands: Vec<i8>,

    /// Delay between sending the key and switching encryption on.
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,

    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: usize,

    // ============================================
    // Simulation
    // ============================================
    /// Ticks per second
    #[serde(default = "default_tick_rate")]
    pub tick_rate: u32,

    #[serde(default = "default_autosave_interval_secs")]
    pub autosave_interval_secs: u64,

    // ============================================
    // Shutdown
    // ============================================
    /// Bounded wait applied to each shutdown step before forcing it.
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
}

// ============================================
// Default value functions
// These are called by serde when a field is missing
// ============================================

fn default_listen_ip() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    14445
}

fn default_max_per_address() -> usize {
    50
}

fn default_idle_timeout_ms() -> u64 {
    60_000
}

fn default_send_poll_ms() -> u64 {
    1_000
}

fn default_handshake_command() -> i8 {
    DEFAULT_HANDSHAKE_COMMAND
}

fn default_extended_commands() -> Vec<i8> {
    DEFAULT_EXTENDED_COMMANDS.to_vec()
}

fn default_settle_delay_ms() -> u64 {
    100
}

fn default_max_payload_bytes() -> usize {
    DEFAULT_MAX_PAYLOAD
}

fn default_tick_rate() -> u32 {
    20
}

fn default_autosave_interval_secs() -> u64 {
    5 * 60
}

fn default_shutdown_timeout_ms() -> u64 {
    5_000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_ip: default_listen_ip(),
            port: default_port(),
            worker_threads: 0,
            deny: Vec::new(),
            max_per_address: default_max_per_address(),
            idle_timeout_ms: default_idle_timeout_ms(),
            outbound_queue_limit: 0,
            send_poll_ms: default_send_poll_ms(),
            handshake_command: default_handshake_command(),
            extended_commands: default_extended_commands(),
            settle_delay_ms: default_settle_delay_ms(),
            max_payload_bytes: default_max_payload_bytes(),
            tick_rate: default_tick_rate(),
            autosave_interval_secs: default_autosave_interval_secs(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from a YAML file
    ///
    /// # Example
    /// ```no_run
    /// use hearth::config::ServerConfig;
    ///
    /// let config = ServerConfig::from_file("conf/server.yaml")
    ///     .expect("Failed to load config");
    /// println!("port: {}", config.port);
    /// ```
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: ServerConfig = serde_yaml::from_str(&contents)
            .with_context(|| format!("Failed to parse YAML in {}", path.display()))?;

        config.validate()?;

        Ok(config)
    }

    /// Parse configuration from a YAML string
    pub fn from_str(contents: &str) -> Result<Self> {
        let config: ServerConfig =
            serde_yaml::from_str(contents).context("Failed to parse YAML")?;

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        self.listen_ip
            .parse::<IpAddr>()
            .with_context(|| format!("listen_ip is not an IP address: {:?}", self.listen_ip))?;

        anyhow::ensure!(
            (1..=MAX_TICK_RATE).contains(&self.tick_rate),
            "tick_rate must be between 1 and {} (got {})",
            MAX_TICK_RATE,
            self.tick_rate
        );
        anyhow::ensure!(
            self.autosave_interval_secs > 0,
            "autosave_interval_secs must be positive"
        );
        anyhow::ensure!(self.send_poll_ms > 0, "send_poll_ms must be positive");
        anyhow::ensure!(
            self.max_payload_bytes > 0 && self.max_payload_bytes < i32::MAX as usize,
            "max_payload_bytes out of range: {}",
            self.max_payload_bytes
        );

        self.access_list()?;

        Ok(())
    }

    /// Save configuration to a YAML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let yaml = serde_yaml::to_string(&self).context("Failed to serialize config to YAML")?;

        fs::write(path.as_ref(), yaml)
            .with_context(|| format!("Failed to write config to {}", path.as_ref().display()))?;

        Ok(())
    }

    pub fn bind_addr(&self) -> Result<SocketAddr> {
        let ip: IpAddr = self
            .listen_ip
            .parse()
            .with_context(|| format!("listen_ip is not an IP address: {:?}", self.listen_ip))?;
        Ok(SocketAddr::new(ip, self.port))
    }

    pub fn protocol(&self) -> Protocol {
        Protocol::new(
            self.handshake_command,
            &self.extended_commands,
            self.max_payload_bytes,
        )
    }

    pub fn access_list(&self) -> Result<AccessList> {
        AccessList::from_rules(&self.deny)
    }

    pub fn autosave_interval(&self) -> Duration {
        Duration::from_secs(self.autosave_interval_secs)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_ms > 0).then(|| Duration::from_millis(self.idle_timeout_ms))
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn send_poll(&self) -> Duration {
        Duration::from_millis(self.send_poll_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn worker_count(&self) -> usize {
        if self.worker_threads > 0 {
            return self.worker_threads;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
    }
}
