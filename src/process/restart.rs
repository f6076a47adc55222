//! Successor spawning and parent termination.
//!
//! # Restart Flow
//! ```text
//! snapshot active listeners
//!     → duplicate each descriptor (close-on-exec, above the target range)
//!     → child env: LISTEN_FDS, HANDOFF_UNLINK_FDS, supervisor vars
//!     → spawn argv[0] with the same args and working directory
//!     → child sees the sockets at fd 3, 4, ...
//!     → parent gives up unlink ownership of filesystem sockets
//! ```
//!
//! The child calls [`signal_parent`] once it has bound a replacement
//! listener, which starts the parent's graceful shutdown.

use std::ffi::{OsStr, OsString};
use std::fmt;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use nix::fcntl::{fcntl, FcntlArg};
use nix::sys::signal::{kill, Signal};
use nix::unistd::{getppid, Pid};
use thiserror::Error;

use super::env::{EnvManifest, ManifestError, LISTEN_FDS_START, UNLINK_FDS_ENV};
use crate::net::ListenerRecord;

#[derive(Debug, Error)]
pub enum RestartError {
    #[error("another process already forked, ignoring this one")]
    AlreadyForked,

    #[error("restart is not supported on this host")]
    Disabled,

    #[error("unable to find executable {program:?}: {reason}")]
    Resolve { program: PathBuf, reason: String },

    #[error("unable to duplicate listener fd {fd}: {source}")]
    Dup { fd: RawFd, source: io::Error },

    #[error("unable to spawn successor: {0}")]
    Spawn(#[source] io::Error),

    #[error("inherited environment is unusable: {0}")]
    Manifest(#[from] ManifestError),
}

/// Spawns a successor process that inherits the given listeners.
pub trait ProcessRestarter: Send + Sync + fmt::Debug {
    /// Start the successor and return its pid without waiting for it.
    fn spawn_successor(
        &self,
        listeners: &[Arc<ListenerRecord>],
        manifest: &EnvManifest,
    ) -> Result<u32, RestartError>;

    fn is_supported(&self) -> bool {
        true
    }
}

/// Restarter for hosts without fork/exec.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledRestarter;

impl ProcessRestarter for DisabledRestarter {
    fn spawn_successor(
        &self,
        _listeners: &[Arc<ListenerRecord>],
        _manifest: &EnvManifest,
    ) -> Result<u32, RestartError> {
        Err(RestartError::Disabled)
    }

    fn is_supported(&self) -> bool {
        false
    }
}

/// Re-executes the current program.
#[derive(Debug, Clone)]
pub struct ExecRestarter {
    program: PathBuf,
    args: Vec<OsString>,
    cwd: PathBuf,
}

impl ExecRestarter {
    /// Capture argv and the working directory of the running process.
    ///
    /// Call this early: a later `chdir` would change how a relative argv[0]
    /// resolves.
    pub fn from_process() -> io::Result<Self> {
        let mut args = std::env::args_os();
        let program = args
            .next()
            .map(PathBuf::from)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "empty argv"))?;
        Ok(Self {
            program,
            args: args.collect(),
            cwd: std::env::current_dir()?,
        })
    }

    pub fn new(
        program: impl Into<PathBuf>,
        args: impl IntoIterator<Item = impl Into<OsString>>,
        cwd: impl Into<PathBuf>,
    ) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            cwd: cwd.into(),
        }
    }
}

impl ProcessRestarter for ExecRestarter {
    fn spawn_successor(
        &self,
        listeners: &[Arc<ListenerRecord>],
        manifest: &EnvManifest,
    ) -> Result<u32, RestartError> {
        let path_var = std::env::var_os("PATH");
        let executable = resolve_executable(&self.program, &self.cwd, path_var.as_deref())?;

        // Duplicates live above the target range so the dup2 calls in the
        // child never overwrite a source that is still needed.
        let floor = LISTEN_FDS_START + listeners.len() as RawFd;
        let mut sources = Vec::with_capacity(listeners.len());
        for record in listeners {
            let fd = record.as_raw_fd();
            let dup = fcntl(fd, FcntlArg::F_DUPFD_CLOEXEC(floor)).map_err(|e| RestartError::Dup {
                fd,
                source: e.into(),
            })?;
            // SAFETY: `dup` was just returned by fcntl and is owned by nobody else.
            sources.push(unsafe { OwnedFd::from_raw_fd(dup) });
        }
        let unlink: Vec<bool> = listeners.iter().map(|r| r.unlink_on_close()).collect();

        let mut command = Command::new(&executable);
        command.args(&self.args).current_dir(&self.cwd);
        command.env_remove(UNLINK_FDS_ENV);
        for (key, value) in manifest.child_vars(&unlink) {
            command.env(key, value);
        }

        let raw_sources: Vec<RawFd> = sources.iter().map(AsRawFd::as_raw_fd).collect();
        // SAFETY: the closure only calls dup2, which is async-signal-safe.
        unsafe {
            command.pre_exec(move || {
                for (i, fd) in raw_sources.iter().enumerate() {
                    let target = LISTEN_FDS_START + i as RawFd;
                    if nix::libc::dup2(*fd, target) < 0 {
                        return Err(io::Error::last_os_error());
                    }
                }
                Ok(())
            });
        }

        let child = command.spawn().map_err(RestartError::Spawn)?;
        drop(sources);

        // The successor now owns cleanup of the filesystem sockets.
        for record in listeners {
            record.set_unlink_on_close(false);
        }

        tracing::info!(
            pid = child.id(),
            executable = %executable.display(),
            listeners = listeners.len(),
            "Spawned successor process"
        );
        Ok(child.id())
    }
}

/// Locate `program` the way a shell would, relative paths against `cwd`.
pub fn resolve_executable(
    program: &Path,
    cwd: &Path,
    path_var: Option<&OsStr>,
) -> Result<PathBuf, RestartError> {
    let resolve_err = |reason: &str| RestartError::Resolve {
        program: program.to_path_buf(),
        reason: reason.to_string(),
    };

    let bare = !program.to_string_lossy().contains('/');
    let candidate = if bare {
        let found = path_var
            .map(std::env::split_paths)
            .into_iter()
            .flatten()
            .map(|dir| absolute(&dir.join(program), cwd))
            .find(|candidate| is_executable(candidate));
        found.ok_or_else(|| resolve_err("not found in PATH"))?
    } else {
        absolute(program, cwd)
    };

    if !is_executable(&candidate) {
        return Err(resolve_err("not an executable file"));
    }
    Ok(candidate)
}

fn absolute(path: &Path, cwd: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        cwd.join(path)
    }
}

fn is_executable(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Ask the parent process to shut down gracefully.
///
/// Returns the parent pid, or `None` when the parent is init (the
/// predecessor already exited and the process was re-parented).
pub fn signal_parent() -> nix::Result<Option<Pid>> {
    let parent = getppid();
    if parent.as_raw() <= 1 {
        return Ok(None);
    }
    kill(parent, Signal::SIGTERM)?;
    Ok(Some(parent))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ListenerSettings;
    use crate::net::ListenerRegistry;

    fn make_executable(path: &Path) {
        std::fs::write(path, "#!/bin/sh\n").unwrap();
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[test]
    fn resolves_bare_name_through_path() {
        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("bin");
        std::fs::create_dir(&bin).unwrap();
        make_executable(&bin.join("svc"));

        let path_var = std::env::join_paths([Path::new("/nonexistent"), &bin]).unwrap();
        let found = resolve_executable(Path::new("svc"), Path::new("/"), Some(&path_var)).unwrap();
        assert_eq!(found, bin.join("svc"));

        assert!(matches!(
            resolve_executable(Path::new("missing"), Path::new("/"), Some(&path_var)),
            Err(RestartError::Resolve { .. })
        ));
    }

    #[test]
    fn resolves_relative_path_against_cwd() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("target")).unwrap();
        make_executable(&dir.path().join("target/svc"));

        let found = resolve_executable(Path::new("./target/svc"), dir.path(), None).unwrap();
        assert_eq!(found, dir.path().join("./target/svc"));

        std::fs::write(dir.path().join("plain"), "").unwrap();
        assert!(resolve_executable(Path::new("./plain"), dir.path(), None).is_err());
    }

    #[test]
    fn disabled_restarter_refuses() {
        let restarter = DisabledRestarter;
        assert!(!restarter.is_supported());
        assert!(matches!(
            restarter.spawn_successor(&[], &EnvManifest::default()),
            Err(RestartError::Disabled)
        ));
    }

    #[test]
    fn successor_inherits_listeners_at_fd_three() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        let sock = dir.path().join("app.sock");

        let registry = ListenerRegistry::with_manifest(ListenerSettings::default(), 2, EnvManifest::default());
        let tcp = registry.get_listener("tcp", "127.0.0.1:0").unwrap();
        let unix = registry.get_listener("unix", sock.to_str().unwrap()).unwrap();
        assert!(unix.unlink_on_close());

        let script = format!(
            "echo \"$LISTEN_FDS $HANDOFF_UNLINK_FDS\" > {out}; \
             [ -e /proc/$$/fd/3 ] && [ -e /proc/$$/fd/4 ] && echo inherited >> {out}",
            out = out.display()
        );
        let restarter = ExecRestarter::new("/bin/sh", ["-c", script.as_str()], dir.path());
        let pid = restarter
            .spawn_successor(&[tcp, unix.clone()], &EnvManifest::default())
            .unwrap();
        nix::sys::wait::waitpid(Pid::from_raw(pid as i32), None).unwrap();

        let written = std::fs::read_to_string(&out).unwrap();
        assert_eq!(written, "2 1\ninherited\n");
        assert!(!unix.unlink_on_close());
    }
}
