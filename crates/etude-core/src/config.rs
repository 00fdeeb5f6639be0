use crate::error::{EtudeError, EtudeResult};
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Listen host (default: 0.0.0.0)
    pub host: String,

    /// Listen port (default: 8080). Port 0 picks a free port.
    pub port: u16,

    /// Worker threads running request processing (default: CPU count)
    pub workers: usize,

    /// Maximum jobs waiting for a worker before new work is refused (default: 60000)
    pub queue_capacity: usize,

    /// Maximum live connections; excess accepts are closed (default: 65534)
    pub max_connections: usize,

    /// Directory request paths are resolved against (default: ./resource)
    pub document_root: PathBuf,

    /// Seconds between metrics log lines; 0 disables the reporter (default: 5)
    pub metrics_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            workers: num_cpus::get(),
            queue_capacity: 60_000,
            max_connections: 65_534,
            document_root: default_document_root(),
            metrics_interval_secs: 5,
        }
    }
}

fn default_document_root() -> PathBuf {
    std::env::current_dir()
        .unwrap_or_else(|_| PathBuf::from("."))
        .join("resource")
}

fn parse_var<T: FromStr>(name: &str, raw: Option<String>, default: T) -> EtudeResult<T> {
    match raw {
        None => Ok(default),
        Some(v) => v
            .trim()
            .parse()
            .map_err(|_| EtudeError::Config(format!("{name}: cannot parse `{v}`"))),
    }
}

impl ServerConfig {
    /// Load configuration from environment variables (with .env support).
    pub fn from_env() -> EtudeResult<Self> {
        // Load .env file if present (ignore errors if missing)
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from any key/value source; unset keys keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> EtudeResult<Self> {
        let d = Self::default();
        Ok(Self {
            host: lookup("ETUDE_HOST").unwrap_or(d.host),
            port: parse_var("ETUDE_PORT", lookup("ETUDE_PORT"), d.port)?,
            workers: parse_var("ETUDE_WORKERS", lookup("ETUDE_WORKERS"), d.workers)?,
            queue_capacity: parse_var(
                "ETUDE_QUEUE_CAPACITY",
                lookup("ETUDE_QUEUE_CAPACITY"),
                d.queue_capacity,
            )?,
            max_connections: parse_var(
                "ETUDE_MAX_CONNECTIONS",
                lookup("ETUDE_MAX_CONNECTIONS"),
                d.max_connections,
            )?,
            document_root: lookup("ETUDE_DOCUMENT_ROOT")
                .map(PathBuf::from)
                .unwrap_or(d.document_root),
            metrics_interval_secs: parse_var(
                "ETUDE_METRICS_INTERVAL",
                lookup("ETUDE_METRICS_INTERVAL"),
                d.metrics_interval_secs,
            )?,
        })
    }

    /// Rejects settings the server cannot start with.
    pub fn validate(&self) -> EtudeResult<()> {
        if self.workers == 0 {
            return Err(EtudeError::Config("workers must be at least 1".into()));
        }
        if self.queue_capacity == 0 {
            return Err(EtudeError::Config("queue_capacity must be at least 1".into()));
        }
        if self.max_connections == 0 || self.max_connections >= u32::MAX as usize {
            return Err(EtudeError::Config(format!(
                "max_connections must be between 1 and {}",
                u32::MAX - 1
            )));
        }
        Ok(())
    }

    /// Get the full listen address.
    pub fn socket_addr(&self) -> EtudeResult<SocketAddr> {
        let ip: IpAddr = self
            .host
            .trim_matches(&['[', ']'][..])
            .parse()
            .map_err(|_| EtudeError::InvalidAddress(self.host.clone()))?;
        Ok(SocketAddr::new(ip, self.port))
    }
}
