//! Listener registry.
//!
//! # Responsibilities
//! - Adopt listening sockets inherited from a predecessor process
//! - Match `(network, address)` requests against inherited sockets
//! - Bind fresh sockets when nothing matches
//! - Track which sockets are unclaimed (provided) and which are in use (active)
//! - Count startup slots so unclaimed inherited sockets can be closed
//!
//! # Design Decisions
//! - The manifest is parsed once; the result (or the error) is cached
//! - Provided and active live under one lock so a record moves exactly once
//! - Every `get_listener` call resolves one startup slot, success or not

use std::fs;
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, IntoRawFd, RawFd};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;
use serde::Serialize;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use thiserror::Error;

use super::addr::{is_same_addr, resolve, ListenAddr, Network, NetworkClass};
use crate::config::ListenerSettings;
use crate::lifecycle::counter::CompletionCounter;
use crate::process::env::{EnvManifest, InheritedFd, ManifestError};

/// Errors acquiring a listener.
#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("unknown network {0:?}")]
    UnknownNetwork(String),

    #[error("invalid address {address:?}: {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error("unable to remove stale socket {path}: {source}")]
    RemoveStale { path: PathBuf, source: io::Error },

    #[error("unable to set mode {mode:o} on {path}: {source}")]
    Permission {
        path: PathBuf,
        mode: u32,
        source: io::Error,
    },

    #[error("unable to bind {network} {address}: {source}")]
    Bind {
        network: Network,
        address: String,
        source: io::Error,
    },
}

/// Removes a filesystem socket path when the owning record goes away.
#[derive(Debug)]
struct SocketPath {
    path: Option<PathBuf>,
    unlink: AtomicBool,
}

impl Drop for SocketPath {
    fn drop(&mut self) {
        let Some(path) = &self.path else { return };
        if !self.unlink.load(Ordering::Acquire) {
            return;
        }
        match fs::remove_file(path) {
            Ok(()) => tracing::debug!(path = %path.display(), "Removed socket file"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "Unable to remove socket file"),
        }
    }
}

/// One listening socket known to the registry.
#[derive(Debug)]
pub struct ListenerRecord {
    id: u64,
    class: NetworkClass,
    address: ListenAddr,
    inherited: bool,
    socket: Socket,
    path: SocketPath,
}

impl ListenerRecord {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn class(&self) -> NetworkClass {
        self.class
    }

    pub fn address(&self) -> &ListenAddr {
        &self.address
    }

    /// Whether the socket came from a predecessor process.
    pub fn is_inherited(&self) -> bool {
        self.inherited
    }

    /// Whether the socket file is removed once the record is dropped.
    pub fn unlink_on_close(&self) -> bool {
        self.path.path.is_some() && self.path.unlink.load(Ordering::Acquire)
    }

    /// Change whether the socket file is removed on close. No-op for TCP.
    pub fn set_unlink_on_close(&self, unlink: bool) {
        self.path.unlink.store(unlink, Ordering::Release);
    }

    /// The underlying socket.
    pub fn socket(&self) -> &Socket {
        &self.socket
    }

    /// A new descriptor for the same socket, close-on-exec.
    pub fn try_clone_socket(&self) -> io::Result<Socket> {
        self.socket.try_clone()
    }

    pub fn info(&self) -> ListenerInfo {
        ListenerInfo {
            id: self.id,
            network: self.class,
            address: self.address.to_string(),
            inherited: self.inherited,
        }
    }

    /// Close the descriptor now and report the close error, if any.
    fn close(self) -> io::Result<()> {
        let ListenerRecord { socket, path, .. } = self;
        let fd = socket.into_raw_fd();
        let result = nix::unistd::close(fd).map_err(io::Error::from);
        drop(path);
        result
    }
}

impl AsRawFd for ListenerRecord {
    fn as_raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }
}

impl AsFd for ListenerRecord {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.socket.as_fd()
    }
}

/// Serializable summary of a listener.
#[derive(Debug, Clone, Serialize)]
pub struct ListenerInfo {
    pub id: u64,
    pub network: NetworkClass,
    pub address: String,
    pub inherited: bool,
}

#[derive(Debug)]
enum ManifestSource {
    Process,
    Fixed(EnvManifest),
}

#[derive(Debug, Default)]
struct Listeners {
    provided: Vec<Arc<ListenerRecord>>,
    active: Vec<Arc<ListenerRecord>>,
}

/// Registry of provided and active listeners for this process.
#[derive(Debug)]
pub struct ListenerRegistry {
    settings: ListenerSettings,
    source: ManifestSource,
    manifest: OnceLock<Result<Arc<EnvManifest>, ManifestError>>,
    listeners: RwLock<Listeners>,
    slots: CompletionCounter,
    next_id: AtomicU64,
}

impl ListenerRegistry {
    /// A registry reading the manifest from the process environment.
    ///
    /// `slots` is the number of `get_listener`/`decline_slot` calls expected
    /// before unclaimed inherited sockets are closed.
    pub fn new(settings: ListenerSettings, slots: usize) -> Self {
        Self::with_source(settings, slots, ManifestSource::Process)
    }

    /// A registry using an already parsed manifest.
    pub fn with_manifest(settings: ListenerSettings, slots: usize, manifest: EnvManifest) -> Self {
        Self::with_source(settings, slots, ManifestSource::Fixed(manifest))
    }

    fn with_source(settings: ListenerSettings, slots: usize, source: ManifestSource) -> Self {
        Self {
            settings,
            source,
            manifest: OnceLock::new(),
            listeners: RwLock::new(Listeners::default()),
            slots: CompletionCounter::with_count(slots),
            next_id: AtomicU64::new(1),
        }
    }

    /// The parsed manifest. Inherited sockets are adopted on first access.
    pub fn manifest(&self) -> Result<Arc<EnvManifest>, ManifestError> {
        self.manifest
            .get_or_init(|| {
                let manifest = match &self.source {
                    ManifestSource::Process => EnvManifest::from_env()?,
                    ManifestSource::Fixed(manifest) => manifest.clone(),
                };
                let mut adopted = Vec::with_capacity(manifest.inherited.len());
                for fd in &manifest.inherited {
                    let record = self.adopt(*fd)?;
                    tracing::debug!(
                        fd = fd.fd,
                        network = %record.class,
                        address = %record.address,
                        "Adopted inherited listener"
                    );
                    adopted.push(Arc::new(record));
                }
                self.listeners.write().provided.extend(adopted);
                Ok(Arc::new(manifest))
            })
            .clone()
    }

    fn adopt(&self, inherited: InheritedFd) -> Result<ListenerRecord, ManifestError> {
        let fd = inherited.fd;
        let adopt_err = |reason: String| ManifestError::Adopt { fd, reason };

        if fcntl_is_valid(fd).is_err() {
            return Err(adopt_err("descriptor is not open".to_string()));
        }
        // SAFETY: the descriptor was handed to this process by its predecessor
        // and nothing else in the process claims it.
        let socket = unsafe { Socket::from_raw_fd(fd) };
        socket
            .set_cloexec(true)
            .map_err(|e| adopt_err(e.to_string()))?;
        let local = socket.local_addr().map_err(|e| adopt_err(e.to_string()))?;
        let ty = socket.r#type().map_err(|e| adopt_err(e.to_string()))?;

        let (class, address, path) = if let Some(inet) = local.as_socket() {
            if ty != Type::STREAM {
                return Err(adopt_err("inet socket is not a stream socket".to_string()));
            }
            (NetworkClass::Tcp, ListenAddr::Inet(inet), None)
        } else if local.is_unix() {
            let class = match ty {
                Type::STREAM => NetworkClass::Unix,
                Type::SEQPACKET => NetworkClass::UnixPacket,
                _ => return Err(adopt_err("unsupported unix socket type".to_string())),
            };
            let path = local
                .as_pathname()
                .map(Path::to_path_buf)
                .ok_or_else(|| adopt_err("unix socket has no filesystem path".to_string()))?;
            (class, ListenAddr::Unix(path.clone()), Some(path))
        } else {
            return Err(adopt_err("unsupported address family".to_string()));
        };

        Ok(ListenerRecord {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            class,
            address,
            inherited: true,
            socket,
            path: SocketPath {
                path,
                unlink: AtomicBool::new(inherited.unlink_on_close),
            },
        })
    }

    /// Obtain a listener for `network` and `address`.
    ///
    /// An inherited socket with an equal address is claimed first; otherwise
    /// a fresh socket is bound. Either way one startup slot is resolved.
    pub fn get_listener(
        &self,
        network: &str,
        address: &str,
    ) -> Result<Arc<ListenerRecord>, ListenerError> {
        let _slot = SlotReport(&self.slots);

        let network: Network = network.parse()?;
        let wanted = resolve(network, address)?;
        self.manifest()?;

        {
            let mut listeners = self.listeners.write();
            let found = listeners
                .provided
                .iter()
                .position(|r| is_same_addr(r.class, &r.address, network.class(), &wanted));
            if let Some(index) = found {
                let record = listeners.provided.remove(index);
                listeners.active.push(Arc::clone(&record));
                tracing::info!(
                    network = %network,
                    address = %record.address,
                    fd = record.as_raw_fd(),
                    "Using inherited listener"
                );
                return Ok(record);
            }
        }

        let record = Arc::new(self.bind(network, &wanted, address)?);
        self.listeners.write().active.push(Arc::clone(&record));
        tracing::info!(
            network = %network,
            address = %record.address,
            "Bound new listener"
        );
        Ok(record)
    }

    fn bind(
        &self,
        network: Network,
        wanted: &ListenAddr,
        requested: &str,
    ) -> Result<ListenerRecord, ListenerError> {
        let bind_err = |source: io::Error| ListenerError::Bind {
            network,
            address: requested.to_string(),
            source,
        };
        let backlog = self.settings.backlog;

        let (socket, address, path) = match wanted {
            ListenAddr::Inet(addr) => {
                let socket = Socket::new(Domain::for_address(*addr), Type::STREAM, Some(Protocol::TCP))
                    .map_err(bind_err)?;
                socket.set_reuse_address(true).map_err(bind_err)?;
                if addr.is_ipv6() {
                    socket
                        .set_only_v6(network == Network::Tcp6)
                        .map_err(bind_err)?;
                }
                socket.bind(&(*addr).into()).map_err(bind_err)?;
                socket.listen(backlog).map_err(bind_err)?;
                // Report the real port when the caller asked for port 0.
                let bound = socket
                    .local_addr()
                    .ok()
                    .and_then(|a| a.as_socket())
                    .unwrap_or(*addr);
                (socket, ListenAddr::Inet(bound), None)
            }
            ListenAddr::Unix(path) => {
                match fs::remove_file(path) {
                    Ok(()) => tracing::debug!(path = %path.display(), "Removed stale socket file"),
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(source) => {
                        return Err(ListenerError::RemoveStale {
                            path: path.clone(),
                            source,
                        })
                    }
                }
                let ty = match network {
                    Network::UnixPacket => Type::SEQPACKET,
                    _ => Type::STREAM,
                };
                let socket = Socket::new(Domain::UNIX, ty, None).map_err(bind_err)?;
                let sock_addr = SockAddr::unix(path).map_err(bind_err)?;
                socket.bind(&sock_addr).map_err(bind_err)?;
                socket.listen(backlog).map_err(bind_err)?;

                let mode = self.settings.unix_socket_permission;
                if let Err(source) = fs::set_permissions(path, fs::Permissions::from_mode(mode)) {
                    let _ = fs::remove_file(path);
                    return Err(ListenerError::Permission {
                        path: path.clone(),
                        mode,
                        source,
                    });
                }
                (socket, wanted.clone(), Some(path.clone()))
            }
        };

        Ok(ListenerRecord {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            class: network.class(),
            address,
            inherited: false,
            socket,
            path: SocketPath {
                unlink: AtomicBool::new(path.is_some()),
                path,
            },
        })
    }

    /// Resolve one startup slot without requesting a listener.
    pub fn decline_slot(&self) {
        self.slots.complete();
    }

    /// Startup slots still outstanding.
    pub fn pending_slots(&self) -> usize {
        self.slots.count()
    }

    /// Wait until every startup slot has been resolved.
    pub async fn wait_for_slots(&self) {
        self.slots.wait_for_zero().await
    }

    /// Resolve every outstanding slot at once. Used on startup timeout and on
    /// shutdown during startup.
    pub fn drain_slots(&self) {
        while self.slots.force_complete() {}
    }

    /// Close every inherited socket nobody claimed. Errors are logged.
    pub fn close_unused_provided_listeners(&self) {
        let unused = std::mem::take(&mut self.listeners.write().provided);
        let mut failures = Vec::new();
        for record in unused {
            let address = record.address.to_string();
            let fd = record.as_raw_fd();
            match Arc::try_unwrap(record) {
                Ok(record) => {
                    tracing::debug!(fd, address = %address, "Closing unused inherited listener");
                    if let Err(e) = record.close() {
                        failures.push(format!("{address}: {e}"));
                    }
                }
                // Still referenced elsewhere; the last owner closes it.
                Err(_) => tracing::debug!(fd, address = %address, "Unused inherited listener still referenced"),
            }
        }
        if !failures.is_empty() {
            tracing::error!(errors = ?failures, "Unable to close unused inherited listeners");
        }
    }

    /// Forget an active listener. The socket closes once the last handle drops.
    pub fn release(&self, id: u64) -> Option<Arc<ListenerRecord>> {
        let mut listeners = self.listeners.write();
        let index = listeners.active.iter().position(|r| r.id == id)?;
        Some(listeners.active.remove(index))
    }

    /// Snapshot of the active listeners, in claim order.
    pub fn active(&self) -> Vec<Arc<ListenerRecord>> {
        self.listeners.read().active.clone()
    }

    pub fn has_active(&self) -> bool {
        !self.listeners.read().active.is_empty()
    }

    pub fn provided_count(&self) -> usize {
        self.listeners.read().provided.len()
    }

    pub fn active_info(&self) -> Vec<ListenerInfo> {
        self.listeners.read().active.iter().map(|r| r.info()).collect()
    }
}

fn fcntl_is_valid(fd: RawFd) -> nix::Result<nix::libc::c_int> {
    nix::fcntl::fcntl(fd, nix::fcntl::FcntlArg::F_GETFD)
}

/// Resolves a startup slot when dropped.
struct SlotReport<'a>(&'a CompletionCounter);

impl Drop for SlotReport<'_> {
    fn drop(&mut self) {
        if !self.0.complete() && !self.0.is_drained() {
            tracing::trace!("Listener requested after all startup slots resolved");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpStream;

    fn settings() -> ListenerSettings {
        ListenerSettings::default()
    }

    fn registry(slots: usize) -> ListenerRegistry {
        ListenerRegistry::with_manifest(settings(), slots, EnvManifest::default())
    }

    #[test]
    fn binds_fresh_tcp_listener() {
        let registry = registry(1);
        let record = registry.get_listener("tcp", "127.0.0.1:0").unwrap();

        assert!(!record.is_inherited());
        assert_eq!(record.class(), NetworkClass::Tcp);
        let ListenAddr::Inet(addr) = record.address() else {
            panic!("expected inet address");
        };
        assert_ne!(addr.port(), 0);
        TcpStream::connect(addr).unwrap();

        assert!(registry.has_active());
        assert_eq!(registry.pending_slots(), 0);
    }

    #[test]
    fn failures_still_resolve_slots() {
        let registry = registry(2);
        assert!(matches!(
            registry.get_listener("udp", ":0"),
            Err(ListenerError::UnknownNetwork(_))
        ));
        assert_eq!(registry.pending_slots(), 1);
        registry.decline_slot();
        assert_eq!(registry.pending_slots(), 0);
        assert!(!registry.has_active());
    }

    #[test]
    fn unix_listener_removes_stale_file_and_unlinks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.sock");
        fs::write(&path, b"stale").unwrap();

        let registry = registry(1);
        let record = registry
            .get_listener("unix", path.to_str().unwrap())
            .unwrap();
        assert!(record.unlink_on_close());
        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o666);
        std::os::unix::net::UnixStream::connect(&path).unwrap();

        let released = registry.release(record.id()).unwrap();
        drop(record);
        assert!(path.exists());
        drop(released);
        assert!(!path.exists());
    }

    #[test]
    fn unlink_can_be_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keep.sock");

        let registry = registry(1);
        let record = registry
            .get_listener("unix-packet", path.to_str().unwrap())
            .unwrap();
        assert_eq!(record.class(), NetworkClass::UnixPacket);
        record.set_unlink_on_close(false);
        registry.release(record.id());
        drop(record);
        assert!(path.exists());
    }

    #[test]
    fn bad_manifest_is_cached() {
        let manifest = EnvManifest {
            inherited: vec![InheritedFd {
                fd: 9999,
                unlink_on_close: false,
            }],
            listen_fds_present: true,
            ..Default::default()
        };
        let registry = ListenerRegistry::with_manifest(settings(), 2, manifest);
        for _ in 0..2 {
            assert!(matches!(
                registry.get_listener("tcp", "127.0.0.1:0"),
                Err(ListenerError::Manifest(ManifestError::Adopt { fd: 9999, .. }))
            ));
        }
        assert_eq!(registry.pending_slots(), 0);
    }
}
