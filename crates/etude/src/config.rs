use crate::conn::DEFAULT_MAX_REQUEST_BYTES;
use crate::error::{EtudeError, EtudeResult};
use crate::syscalls::{EPOLLET, EPOLLONESHOT, EPOLLRDHUP};
use serde::Deserialize;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Server configuration, fixed at construction time.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// TCP port on all IPv4 interfaces. 0 lets the kernel choose.
    pub port: u16,

    /// Edge/level triggering for the listener and connection sockets:
    /// 0 = LT/LT, 1 = LT/ET, 2 = ET/LT, 3 = ET/ET. Anything else is ET/ET.
    pub trigger_mode: u8,

    /// Idle eviction window in milliseconds. Zero or negative disables it.
    pub idle_timeout_ms: i64,

    /// Linger up to one second on close instead of resetting.
    pub graceful_linger: bool,

    /// Number of pooled credential-store clients.
    pub credential_pool_size: usize,

    /// Worker pool size (default: all cores).
    pub worker_threads: usize,

    /// Pin worker threads to cores round-robin.
    pub pin_workers: bool,

    /// Live connections accepted before new ones are turned away.
    pub max_connections: usize,

    /// Bytes an unfinished request may buffer before it is answered with 400.
    pub max_request_bytes: usize,

    /// Directory static files are served from.
    pub static_root: PathBuf,

    pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub enabled: bool,
    /// Default filter directive when `RUST_LOG` is unset.
    pub level: String,
    /// JSON lines instead of human-readable text.
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            level: "info".to_string(),
            json: false,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 1316,
            trigger_mode: 3,
            idle_timeout_ms: 60_000,
            graceful_linger: false,
            credential_pool_size: 12,
            worker_threads: num_cpus::get(),
            pin_workers: false,
            max_connections: 65_536,
            max_request_bytes: DEFAULT_MAX_REQUEST_BYTES,
            static_root: PathBuf::from("./resources"),
            log: LogConfig::default(),
        }
    }
}

/// Which sockets use edge-triggered readiness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerMode {
    pub listen_edge: bool,
    pub conn_edge: bool,
}

impl TriggerMode {
    pub fn from_mode(mode: u8) -> Self {
        let (listen_edge, conn_edge) = match mode {
            0 => (false, false),
            1 => (false, true),
            2 => (true, false),
            _ => (true, true),
        };
        Self {
            listen_edge,
            conn_edge,
        }
    }

    /// Base interest for the listening socket (readable is added by the caller).
    pub fn listen_events(&self) -> u32 {
        let mut ev = EPOLLRDHUP;
        if self.listen_edge {
            ev |= EPOLLET;
        }
        ev
    }

    /// Base interest for connection sockets. Always one-shot, so a socket is
    /// handed to at most one worker between re-arms.
    pub fn conn_events(&self) -> u32 {
        let mut ev = EPOLLONESHOT | EPOLLRDHUP;
        if self.conn_edge {
            ev |= EPOLLET;
        }
        ev
    }

    fn label(edge: bool) -> &'static str {
        if edge { "ET" } else { "LT" }
    }

    pub fn listen_label(&self) -> &'static str {
        Self::label(self.listen_edge)
    }

    pub fn conn_label(&self) -> &'static str {
        Self::label(self.conn_edge)
    }
}

impl ServerConfig {
    /// Load configuration from `ETUDE_*` environment variables (with .env
    /// support), falling back to the defaults.
    pub fn from_env() -> EtudeResult<Self> {
        // Load .env file if present (ignore errors if missing)
        let _ = dotenvy::dotenv();
        let d = Self::default();

        Self {
            port: env_parse("ETUDE_PORT", d.port)?,
            trigger_mode: env_parse("ETUDE_TRIGGER_MODE", d.trigger_mode)?,
            idle_timeout_ms: env_parse("ETUDE_IDLE_TIMEOUT_MS", d.idle_timeout_ms)?,
            graceful_linger: env_flag("ETUDE_GRACEFUL_LINGER", d.graceful_linger),
            credential_pool_size: env_parse("ETUDE_CREDENTIAL_POOL_SIZE", d.credential_pool_size)?,
            worker_threads: env_parse("ETUDE_WORKERS", d.worker_threads)?,
            pin_workers: env_flag("ETUDE_PIN_WORKERS", d.pin_workers),
            max_connections: env_parse("ETUDE_MAX_CONNECTIONS", d.max_connections)?,
            max_request_bytes: env_parse("ETUDE_MAX_REQUEST_BYTES", d.max_request_bytes)?,
            static_root: std::env::var("ETUDE_STATIC_ROOT")
                .map(PathBuf::from)
                .unwrap_or(d.static_root),
            log: LogConfig {
                enabled: env_flag("ETUDE_LOG", d.log.enabled),
                level: std::env::var("ETUDE_LOG_LEVEL").unwrap_or(d.log.level),
                json: env_flag("ETUDE_LOG_JSON", d.log.json),
            },
        }
        .validated()
    }

    /// Parse a JSON document; missing fields take their defaults.
    pub fn from_json(json: &str) -> EtudeResult<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| EtudeError::Config(e.to_string()))?;
        config.validated()
    }

    pub fn validated(self) -> EtudeResult<Self> {
        if self.worker_threads == 0 {
            return Err(EtudeError::Config("worker_threads must be at least 1".into()));
        }
        if self.max_connections == 0 {
            return Err(EtudeError::Config("max_connections must be at least 1".into()));
        }
        if self.max_request_bytes == 0 {
            return Err(EtudeError::Config("max_request_bytes must be at least 1".into()));
        }
        if self.credential_pool_size == 0 {
            return Err(EtudeError::Config(
                "credential_pool_size must be at least 1".into(),
            ));
        }
        Ok(self)
    }

    pub fn trigger(&self) -> TriggerMode {
        TriggerMode::from_mode(self.trigger_mode)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_ms > 0).then(|| Duration::from_millis(self.idle_timeout_ms as u64))
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn trigger_mode(mut self, mode: u8) -> Self {
        self.trigger_mode = mode;
        self
    }

    pub fn idle_timeout_ms(mut self, ms: i64) -> Self {
        self.idle_timeout_ms = ms;
        self
    }

    pub fn graceful_linger(mut self, on: bool) -> Self {
        self.graceful_linger = on;
        self
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.worker_threads = workers;
        self
    }

    pub fn pin_workers(mut self, pin: bool) -> Self {
        self.pin_workers = pin;
        self
    }

    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    pub fn max_request_bytes(mut self, max: usize) -> Self {
        self.max_request_bytes = max;
        self
    }

    pub fn credential_pool_size(mut self, size: usize) -> Self {
        self.credential_pool_size = size;
        self
    }

    pub fn static_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.static_root = root.into();
        self
    }

    pub fn log(mut self, log: LogConfig) -> Self {
        self.log = log;
        self
    }
}

fn env_parse<T: FromStr>(key: &str, default: T) -> EtudeResult<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| EtudeError::Config(format!("{}={:?}: {}", key, raw, e))),
        Err(_) => Ok(default),
    }
}

fn env_flag(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => matches!(v.to_lowercase().as_str(), "true" | "1" | "yes"),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trigger_modes_map_to_interest_bits() {
        let lt = TriggerMode::from_mode(0);
        assert_eq!(lt.listen_events() & EPOLLET, 0);
        assert_eq!(lt.conn_events() & EPOLLET, 0);
        assert_ne!(lt.conn_events() & EPOLLONESHOT, 0);

        let mixed = TriggerMode::from_mode(1);
        assert!(!mixed.listen_edge && mixed.conn_edge);
        let mixed = TriggerMode::from_mode(2);
        assert!(mixed.listen_edge && !mixed.conn_edge);

        // Out-of-range modes fall back to edge-triggered everywhere.
        assert_eq!(TriggerMode::from_mode(9), TriggerMode::from_mode(3));
        assert_eq!(TriggerMode::from_mode(9).conn_label(), "ET");
    }

    #[test]
    fn idle_timeout_disabled_when_not_positive() {
        assert!(ServerConfig::default().idle_timeout_ms(0).idle_timeout().is_none());
        assert!(ServerConfig::default().idle_timeout_ms(-5).idle_timeout().is_none());
        assert_eq!(
            ServerConfig::default().idle_timeout_ms(250).idle_timeout(),
            Some(Duration::from_millis(250))
        );
    }

    #[test]
    fn json_config_fills_defaults() {
        let cfg = ServerConfig::from_json(
            r#"{"port": 8080, "trigger_mode": 1, "log": {"level": "debug"}}"#,
        )
        .unwrap();
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.trigger_mode, 1);
        assert_eq!(cfg.idle_timeout_ms, 60_000);
        assert_eq!(cfg.max_request_bytes, DEFAULT_MAX_REQUEST_BYTES);
        assert_eq!(cfg.log.level, "debug");
        assert!(cfg.log.enabled);

        assert!(matches!(
            ServerConfig::from_json(r#"{"worker_threads": 0}"#),
            Err(EtudeError::Config(_))
        ));
        assert!(matches!(
            ServerConfig::from_json(r#"{"max_request_bytes": 0}"#),
            Err(EtudeError::Config(_))
        ));
        assert!(ServerConfig::from_json("{not json").is_err());
    }
}
