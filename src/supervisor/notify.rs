//! systemd notify protocol client.
//!
//! Messages are single datagrams sent to `NOTIFY_SOCKET`. A path starting
//! with `@` names a socket in the abstract namespace. Sending is
//! fire-and-forget: failures are logged and never stop the process.

use std::fmt;
use std::io;
use std::os::unix::net::{SocketAddr, UnixDatagram};

use thiserror::Error;

use crate::process::env::EnvManifest;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("unable to create notify socket: {0}")]
    Socket(#[source] io::Error),

    #[error("invalid notify socket address {path:?}: {source}")]
    Address { path: String, source: io::Error },

    #[error("unable to send {message:?} to {path:?}: {source}")]
    Send {
        message: String,
        path: String,
        source: io::Error,
    },
}

/// A supervisor notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotifyMessage {
    Ready,
    Stopping,
    Reloading,
    Watchdog,
    Status(String),
    MainPid(u32),
}

impl fmt::Display for NotifyMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotifyMessage::Ready => f.write_str("READY=1"),
            NotifyMessage::Stopping => f.write_str("STOPPING=1"),
            NotifyMessage::Reloading => f.write_str("RELOADING=1"),
            NotifyMessage::Watchdog => f.write_str("WATCHDOG=1"),
            NotifyMessage::Status(status) => write!(f, "STATUS={status}"),
            NotifyMessage::MainPid(pid) => write!(f, "MAINPID={pid}"),
        }
    }
}

/// Sends notifications to the supervisor, if there is one.
#[derive(Debug, Clone, Default)]
pub struct SupervisorNotifier {
    socket_path: Option<String>,
}

impl SupervisorNotifier {
    pub fn new(socket_path: Option<String>) -> Self {
        Self {
            socket_path: socket_path.filter(|p| !p.is_empty()),
        }
    }

    pub fn from_manifest(manifest: &EnvManifest) -> Self {
        Self::new(manifest.notify_socket.clone())
    }

    /// A notifier that drops every message.
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn is_enabled(&self) -> bool {
        self.socket_path.is_some()
    }

    pub fn socket_path(&self) -> Option<&str> {
        self.socket_path.as_deref()
    }

    /// Send `message`. Returns `Ok(false)` when no supervisor is configured.
    pub fn try_notify(&self, message: &NotifyMessage) -> Result<bool, NotifyError> {
        let Some(path) = &self.socket_path else {
            return Ok(false);
        };
        let addr = notify_addr(path).map_err(|source| NotifyError::Address {
            path: path.clone(),
            source,
        })?;
        let socket = UnixDatagram::unbound().map_err(NotifyError::Socket)?;
        let payload = message.to_string();
        socket
            .send_to_addr(payload.as_bytes(), &addr)
            .map_err(|source| NotifyError::Send {
                message: payload,
                path: path.clone(),
                source,
            })?;
        Ok(true)
    }

    /// Send `message`, logging any failure.
    pub fn notify(&self, message: NotifyMessage) {
        match self.try_notify(&message) {
            Ok(true) => tracing::trace!(message = %message, "Supervisor notified"),
            Ok(false) => {}
            Err(e) => tracing::warn!(error = %e, "Unable to notify supervisor"),
        }
    }
}

#[cfg(target_os = "linux")]
fn notify_addr(path: &str) -> io::Result<SocketAddr> {
    use std::os::linux::net::SocketAddrExt;

    match path.strip_prefix('@') {
        Some(name) => SocketAddr::from_abstract_name(name.as_bytes()),
        None => SocketAddr::from_pathname(path),
    }
}

#[cfg(not(target_os = "linux"))]
fn notify_addr(path: &str) -> io::Result<SocketAddr> {
    if path.starts_with('@') {
        return Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "abstract sockets are only available on linux",
        ));
    }
    SocketAddr::from_pathname(path)
}
