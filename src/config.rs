use std::path::Path;
use std::time::Duration;

use anyhow::Context as _;
use serde::Deserialize;

use crate::connection::ConnectionSettings;
use crate::reactor::ControllerSettings;

/// Connector configuration.
///
/// Every key is optional in the YAML file; missing keys keep their
/// default. The `LISTEN` environment variable overrides `listen_addr`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub listen_addr: String,
    /// Longest the controller sleeps between two sweeps
    pub controller_sleep_time_ms: u64,
    /// Connections idle for this long are closed; 0 disables the timeout
    pub max_io_idle_time_ms: u64,
    pub inbound_buffer_size: usize,
    pub outbound_buffer_size: usize,
    /// -1 for no cap
    pub max_connections_per_host: i32,
    /// -1 for no cap
    pub max_total_connections: i32,
    pub persisting_connections: bool,
    pub pipelining_connections: bool,
    pub pooled_connections: bool,
    /// Closed connections kept for reuse
    pub initial_connections: usize,
    pub worker_threads: usize,
    pub socket_no_delay: bool,
    pub proxy_host: Option<String>,
    pub proxy_port: u16,
    pub user_agent: Option<String>,
    /// Log the header section of every message at info level
    pub trace_messages: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8080".to_string(),
            controller_sleep_time_ms: 60_000,
            max_io_idle_time_ms: 60_000,
            inbound_buffer_size: 16 * 1024,
            outbound_buffer_size: 32 * 1024,
            max_connections_per_host: -1,
            max_total_connections: -1,
            persisting_connections: true,
            pipelining_connections: false,
            pooled_connections: true,
            initial_connections: 100,
            worker_threads: 10,
            socket_no_delay: false,
            proxy_host: None,
            proxy_port: 3128,
            user_agent: None,
            trace_messages: false,
        }
    }
}

impl Config {
    /// Defaults, then the file named by `NIOWAY_CONFIG` if set, then `LISTEN`.
    pub fn load() -> anyhow::Result<Self> {
        let mut cfg = match std::env::var("NIOWAY_CONFIG") {
            Ok(path) => Self::from_file(&path)?,
            Err(_) => Self::default(),
        };
        if let Ok(listen_addr) = std::env::var("LISTEN") {
            cfg.listen_addr = listen_addr;
        }
        Ok(cfg)
    }

    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_yaml(text: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(text)
    }

    pub fn max_io_idle(&self) -> Duration {
        Duration::from_millis(self.max_io_idle_time_ms)
    }

    pub fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            inbound_buffer_size: self.inbound_buffer_size,
            outbound_buffer_size: self.outbound_buffer_size,
            max_io_idle: self.max_io_idle(),
            persistent: self.persisting_connections,
            pipelining: self.pipelining_connections,
            trace_messages: self.trace_messages,
        }
    }

    pub fn controller_settings(&self) -> ControllerSettings {
        ControllerSettings {
            sleep: Duration::from_millis(self.controller_sleep_time_ms),
            max_io_idle: self.max_io_idle(),
        }
    }

    /// Per-host connection cap, `None` when unbounded.
    pub fn host_cap(&self) -> Option<usize> {
        usize::try_from(self.max_connections_per_host).ok()
    }

    /// Global connection cap, `None` when unbounded.
    pub fn total_cap(&self) -> Option<usize> {
        usize::try_from(self.max_total_connections).ok()
    }
}
