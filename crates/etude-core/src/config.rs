use crate::error::{EtudeError, EtudeResult};
use serde::Deserialize;
use std::net::{SocketAddr, ToSocketAddrs};
use std::str::FromStr;
use std::time::Duration;

/// Server configuration, loaded from `ETUDE_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Listen host (default: 127.0.0.1)
    pub host: String,

    /// Listen port (default: 8000)
    pub port: u16,

    /// `listen(2)` backlog (default: 1024)
    pub backlog: i32,

    /// Connections plus spawned tasks alive at once (default: 10000)
    pub max_connections: usize,

    /// Stack size of each coroutine thread in bytes (default: 256 KiB)
    pub coroutine_stack_size: usize,

    /// Bytes read from a client per `recv` (default: 16 KiB)
    pub read_buffer_size: usize,

    /// Largest request head plus body accepted (default: 1 MiB)
    pub max_request_size: usize,

    /// Idle keep-alive timeout in seconds; 0 closes after every response
    /// (default: 30)
    pub keep_alive: u64,

    /// Interval at which the connection of an indefinitely suspended
    /// request is checked for a socket error (default: 30)
    pub liveness_probe_secs: u64,

    /// Upper bound on one idle reactor wait, which sets how often idle
    /// keep-alive connections are pruned (default: 1000)
    pub poll_interval_ms: u64,

    /// Stop on SIGINT/SIGTERM (default: false)
    pub handle_signals: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
            backlog: 1024,
            max_connections: 10_000,
            coroutine_stack_size: 256 * 1024,
            read_buffer_size: 16 * 1024,
            max_request_size: 1024 * 1024,
            keep_alive: 30,
            liveness_probe_secs: 30,
            poll_interval_ms: 1000,
            handle_signals: false,
        }
    }
}

fn env_or<T: FromStr>(name: &str, default: T) -> EtudeResult<T> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| EtudeError::Config(format!("{name}: invalid value {raw:?}"))),
        Err(_) => Ok(default),
    }
}

fn env_flag(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(raw) => matches!(raw.trim().to_lowercase().as_str(), "true" | "1" | "yes"),
        Err(_) => default,
    }
}

impl Config {
    /// Load configuration from environment variables (with .env support).
    ///
    /// Unset variables keep their defaults; set but unparsable ones are an
    /// error.
    pub fn from_env() -> EtudeResult<Self> {
        // Load .env file if present (ignore errors if missing)
        let _ = dotenvy::dotenv();
        let d = Config::default();

        Ok(Config {
            host: std::env::var("ETUDE_HOST").unwrap_or(d.host),
            port: env_or("ETUDE_PORT", d.port)?,
            backlog: env_or("ETUDE_BACKLOG", d.backlog)?,
            max_connections: env_or("ETUDE_MAX_CONNECTIONS", d.max_connections)?,
            coroutine_stack_size: env_or("ETUDE_COROUTINE_STACK_SIZE", d.coroutine_stack_size)?,
            read_buffer_size: env_or("ETUDE_READ_BUFFER_SIZE", d.read_buffer_size)?,
            max_request_size: env_or("ETUDE_MAX_REQUEST_SIZE", d.max_request_size)?,
            keep_alive: env_or("ETUDE_KEEP_ALIVE", d.keep_alive)?,
            liveness_probe_secs: env_or("ETUDE_LIVENESS_PROBE_SECS", d.liveness_probe_secs)?,
            poll_interval_ms: env_or("ETUDE_POLL_INTERVAL_MS", d.poll_interval_ms)?,
            handle_signals: env_flag("ETUDE_HANDLE_SIGNALS", d.handle_signals),
        })
    }

    /// Resolve `host:port` to a socket address.
    pub fn addr(&self) -> EtudeResult<SocketAddr> {
        (self.host.as_str(), self.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| EtudeError::Config(format!("cannot resolve {}", self.host)))
    }

    pub fn keep_alive_timeout(&self) -> Option<Duration> {
        (self.keep_alive > 0).then(|| Duration::from_secs(self.keep_alive))
    }

    pub fn liveness_probe(&self) -> Duration {
        Duration::from_secs(self.liveness_probe_secs.max(1))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}
