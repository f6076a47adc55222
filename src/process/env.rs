//! Environment manifest exchanged between a process and its successor.
//!
//! # Variables
//! - `LISTEN_FDS`: number of inherited listening sockets, starting at fd 3
//! - `HANDOFF_UNLINK_FDS`: comma separated indices of filesystem sockets the
//!   child must unlink on close
//! - `NOTIFY_SOCKET`: supervisor notify socket
//! - `WATCHDOG_USEC`: supervisor watchdog interval in microseconds
//!
//! # Design Decisions
//! - Parsing works on any key/value iterator so tests never touch the real environment
//! - Malformed counts or intervals are fatal configuration errors
//! - Out-of-range or garbage unlink indices are ignored

use std::os::fd::RawFd;
use std::time::Duration;

use thiserror::Error;

pub const LISTEN_FDS_ENV: &str = "LISTEN_FDS";
pub const UNLINK_FDS_ENV: &str = "HANDOFF_UNLINK_FDS";
pub const NOTIFY_SOCKET_ENV: &str = "NOTIFY_SOCKET";
pub const WATCHDOG_USEC_ENV: &str = "WATCHDOG_USEC";

/// systemd-compatible first inherited descriptor.
pub const LISTEN_FDS_START: RawFd = 3;

/// Errors parsing the manifest. Cloneable so a cached failure can be reported repeatedly.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ManifestError {
    #[error("LISTEN_FDS is not a number: {value:?} ({reason})")]
    ListenFds { value: String, reason: String },

    #[error("unable to parse WATCHDOG_USEC={value:?} ({reason})")]
    Watchdog { value: String, reason: String },

    #[error("invalid WATCHDOG_USEC={0}: interval must be positive")]
    WatchdogNotPositive(i64),

    #[error("error adopting inherited socket fd {fd}: {reason}")]
    Adopt { fd: RawFd, reason: String },
}

/// One inherited descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InheritedFd {
    pub fd: RawFd,
    pub unlink_on_close: bool,
}

/// Parsed process-boundary data.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvManifest {
    /// Inherited listening sockets, in index order.
    pub inherited: Vec<InheritedFd>,
    /// Supervisor notify socket path.
    pub notify_socket: Option<String>,
    /// Supervisor watchdog interval.
    pub watchdog: Option<Duration>,
    /// Whether `LISTEN_FDS` was present at all.
    pub listen_fds_present: bool,
}

impl EnvManifest {
    /// Parse the current process environment.
    pub fn from_env() -> Result<Self, ManifestError> {
        Self::from_vars(std::env::vars())
    }

    /// Parse a set of environment variables.
    pub fn from_vars<I, K, V>(vars: I) -> Result<Self, ManifestError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let mut listen_fds = None;
        let mut unlink = None;
        let mut notify_socket = None;
        let mut watchdog = None;
        for (key, value) in vars {
            match key.as_ref() {
                LISTEN_FDS_ENV => listen_fds = Some(value.into()),
                UNLINK_FDS_ENV => unlink = Some(value.into()),
                NOTIFY_SOCKET_ENV => notify_socket = Some(value.into()),
                WATCHDOG_USEC_ENV => watchdog = Some(value.into()),
                _ => {}
            }
        }

        let notify_socket = notify_socket.filter(|s| !s.is_empty());
        match &notify_socket {
            Some(path) => tracing::debug!(path = %path, "Supervisor notify socket provided"),
            None => tracing::trace!("No supervisor notify socket provided"),
        }

        let watchdog = match watchdog.filter(|s| !s.is_empty()) {
            Some(raw) => {
                let usec: i64 = raw.trim().parse().map_err(|e: std::num::ParseIntError| {
                    ManifestError::Watchdog {
                        value: raw.clone(),
                        reason: e.to_string(),
                    }
                })?;
                if usec <= 0 {
                    return Err(ManifestError::WatchdogNotPositive(usec));
                }
                let interval = Duration::from_micros(usec as u64);
                tracing::debug!(interval = ?interval, "Supervisor watchdog interval provided");
                Some(interval)
            }
            None => None,
        };

        let mut manifest = EnvManifest {
            inherited: Vec::new(),
            notify_socket,
            watchdog,
            listen_fds_present: false,
        };

        let Some(raw) = listen_fds.filter(|s| !s.is_empty()) else {
            return Ok(manifest);
        };
        let count: usize = raw.trim().parse().map_err(|e: std::num::ParseIntError| {
            ManifestError::ListenFds {
                value: raw.clone(),
                reason: e.to_string(),
            }
        })?;

        let mut unlink_flags = vec![false; count];
        for part in unlink.as_deref().unwrap_or("").split(',') {
            if let Ok(index) = part.trim().parse::<usize>() {
                if let Some(flag) = unlink_flags.get_mut(index) {
                    *flag = true;
                }
            }
        }

        manifest.listen_fds_present = true;
        manifest.inherited = unlink_flags
            .into_iter()
            .enumerate()
            .map(|(i, unlink_on_close)| InheritedFd {
                fd: LISTEN_FDS_START + i as RawFd,
                unlink_on_close,
            })
            .collect();
        Ok(manifest)
    }

    /// Whether this process was started by a predecessor handing over sockets.
    pub fn is_handoff_child(&self) -> bool {
        self.listen_fds_present
    }

    /// Variables describing `listeners` for a successor process.
    ///
    /// `unlink` lists, per listener index, whether the child owns cleanup of a
    /// filesystem socket. Returns the variables to set; an empty unlink list
    /// yields no `HANDOFF_UNLINK_FDS` entry.
    pub fn child_vars(&self, unlink: &[bool]) -> Vec<(String, String)> {
        let mut vars = vec![(LISTEN_FDS_ENV.to_string(), unlink.len().to_string())];
        if let Some(path) = &self.notify_socket {
            vars.push((NOTIFY_SOCKET_ENV.to_string(), path.clone()));
        }
        if let Some(interval) = self.watchdog {
            vars.push((WATCHDOG_USEC_ENV.to_string(), interval.as_micros().to_string()));
        }
        let indices: Vec<String> = unlink
            .iter()
            .enumerate()
            .filter(|(_, unlink)| **unlink)
            .map(|(i, _)| i.to_string())
            .collect();
        if !indices.is_empty() {
            vars.push((UNLINK_FDS_ENV.to_string(), indices.join(",")));
        }
        vars
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_environment() {
        let manifest = EnvManifest::from_vars(Vec::<(String, String)>::new()).unwrap();
        assert!(manifest.inherited.is_empty());
        assert!(!manifest.is_handoff_child());
        assert_eq!(manifest.notify_socket, None);
        assert_eq!(manifest.watchdog, None);
    }

    #[test]
    fn parses_listen_fds_and_unlink() {
        let manifest = EnvManifest::from_vars([
            ("LISTEN_FDS", "3"),
            ("HANDOFF_UNLINK_FDS", "2,7,x,0"),
            ("NOTIFY_SOCKET", "/run/systemd/notify"),
            ("WATCHDOG_USEC", "30000000"),
        ])
        .unwrap();

        assert!(manifest.is_handoff_child());
        assert_eq!(
            manifest.inherited,
            vec![
                InheritedFd { fd: 3, unlink_on_close: true },
                InheritedFd { fd: 4, unlink_on_close: false },
                InheritedFd { fd: 5, unlink_on_close: true },
            ]
        );
        assert_eq!(manifest.notify_socket.as_deref(), Some("/run/systemd/notify"));
        assert_eq!(manifest.watchdog, Some(Duration::from_secs(30)));
    }

    #[test]
    fn malformed_values_are_fatal() {
        assert!(matches!(
            EnvManifest::from_vars([("LISTEN_FDS", "two")]),
            Err(ManifestError::ListenFds { .. })
        ));
        assert!(matches!(
            EnvManifest::from_vars([("WATCHDOG_USEC", "soon")]),
            Err(ManifestError::Watchdog { .. })
        ));
        assert_eq!(
            EnvManifest::from_vars([("WATCHDOG_USEC", "0")]),
            Err(ManifestError::WatchdogNotPositive(0))
        );
    }

    #[test]
    fn child_vars_forward_supervisor_settings() {
        let manifest = EnvManifest {
            notify_socket: Some("@notify".to_string()),
            watchdog: Some(Duration::from_millis(1500)),
            ..Default::default()
        };
        let vars = manifest.child_vars(&[false, true, true]);
        assert_eq!(
            vars,
            vec![
                ("LISTEN_FDS".to_string(), "3".to_string()),
                ("NOTIFY_SOCKET".to_string(), "@notify".to_string()),
                ("WATCHDOG_USEC".to_string(), "1500000".to_string()),
                ("HANDOFF_UNLINK_FDS".to_string(), "1,2".to_string()),
            ]
        );

        let vars = EnvManifest::default().child_vars(&[false]);
        assert_eq!(vars, vec![("LISTEN_FDS".to_string(), "1".to_string())]);
    }
}
