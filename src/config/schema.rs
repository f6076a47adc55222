//! Configuration schema definitions.
//!
//! All types derive Serde traits for deserialization from config files and
//! default every field, so an empty file is a valid configuration.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Root configuration for the handoff daemon.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct HandoffConfig {
    /// Shutdown, restart and startup behavior.
    pub lifecycle: LifecycleSettings,

    /// How fresh listening sockets are created.
    pub listeners: ListenerSettings,

    /// Served endpoints, one managed server each.
    pub servers: Vec<ServerConfig>,

    /// Logging and metrics.
    pub observability: ObservabilityConfig,

    /// Control API.
    pub admin: AdminConfig,
}

impl HandoffConfig {
    /// Number of listeners the process will request during startup.
    ///
    /// An explicit `listener_slots` wins; otherwise every server plus the
    /// admin endpoint (when enabled) counts as one slot.
    pub fn listener_slots(&self) -> usize {
        self.lifecycle
            .listener_slots
            .unwrap_or_else(|| self.servers.len() + usize::from(self.admin.enabled))
    }
}

/// Lifecycle manager settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LifecycleSettings {
    /// Fork a successor on SIGHUP instead of shutting down.
    pub restartable: bool,

    /// Seconds between graceful shutdown and the hammer. Negative disables.
    pub hammer_grace_secs: i64,

    /// Pause between all servers draining and termination (milliseconds).
    pub terminate_delay_ms: u64,

    /// Give up on startup after this many seconds. Zero waits forever.
    pub startup_timeout_secs: u64,

    /// Override for the number of expected listeners.
    pub listener_slots: Option<usize>,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            restartable: true,
            hammer_grace_secs: 60,
            terminate_delay_ms: 0,
            startup_timeout_secs: 0,
            listener_slots: None,
        }
    }
}

/// Listening socket settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerSettings {
    /// Mode applied to freshly created unix socket files.
    pub unix_socket_permission: u32,

    /// Listen backlog for fresh sockets.
    pub backlog: i32,

    /// TCP keep-alive period for accepted connections. Zero disables.
    pub tcp_keepalive_secs: u64,
}

impl Default for ListenerSettings {
    fn default() -> Self {
        Self {
            unix_socket_permission: 0o666,
            backlog: 1024,
            tcp_keepalive_secs: 180,
        }
    }
}

/// One served endpoint.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Name used in logs, metrics and the admin API.
    pub name: String,

    /// `tcp`, `tcp4`, `tcp6`, `unix` or `unix-packet`.
    pub network: String,

    /// `host:port`, `:port` or a socket path.
    pub address: String,

    /// Serve HTTPS with this certificate.
    pub tls: Option<TlsConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            network: "tcp".to_string(),
            address: "127.0.0.1:8080".to_string(),
            tls: None,
        }
    }
}

/// TLS configuration for a server.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TlsConfig {
    /// Path to certificate file (PEM).
    pub cert_path: PathBuf,

    /// Path to private key file (PEM).
    pub key_path: PathBuf,
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Pretty for terminals, json for collectors.
    pub log_format: LogFormat,

    /// Write logs here instead of stderr. Reopened on SIGUSR1.
    pub log_file: Option<PathBuf>,

    /// Enable the Prometheus endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            log_file: None,
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}

/// Admin API configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Enable the admin API.
    pub enabled: bool,

    /// Network of the admin listener. Goes through the listener registry
    /// like any server, so it survives restarts too.
    pub network: String,

    /// Admin bind address.
    pub address: String,

    /// API key for authentication (Bearer token).
    pub api_key: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            network: "tcp".to_string(),
            address: "127.0.0.1:8081".to_string(),
            api_key: String::new(),
        }
    }
}
