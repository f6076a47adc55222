//! Inherited listener matching.

use std::net::SocketAddr;
use std::os::fd::{IntoRawFd, RawFd};
use std::path::Path;

use handoff::config::ListenerSettings;
use handoff::net::{ListenerError, ListenerRegistry, NetworkClass};
use handoff::process::{EnvManifest, InheritedFd};
use socket2::{Domain, SockAddr, Socket, Type};

mod common;

fn tcp_listener() -> (RawFd, SocketAddr) {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, None).unwrap();
    socket.set_reuse_address(true).unwrap();
    socket
        .bind(&"127.0.0.1:0".parse::<SocketAddr>().unwrap().into())
        .unwrap();
    socket.listen(16).unwrap();
    let addr = socket.local_addr().unwrap().as_socket().unwrap();
    (socket.into_raw_fd(), addr)
}

fn unix_listener(path: &Path) -> RawFd {
    let socket = Socket::new(Domain::UNIX, Type::STREAM, None).unwrap();
    socket.bind(&SockAddr::unix(path).unwrap()).unwrap();
    socket.listen(16).unwrap();
    socket.into_raw_fd()
}

fn manifest(fds: &[(RawFd, bool)]) -> EnvManifest {
    EnvManifest {
        inherited: fds
            .iter()
            .map(|&(fd, unlink_on_close)| InheritedFd { fd, unlink_on_close })
            .collect(),
        listen_fds_present: true,
        ..EnvManifest::default()
    }
}

#[test]
fn each_inherited_listener_is_claimed_exactly_once() {
    const K: usize = 4;
    let inherited: Vec<_> = (0..K).map(|_| tcp_listener()).collect();
    let fds: Vec<_> = inherited.iter().map(|&(fd, _)| (fd, false)).collect();
    let registry = ListenerRegistry::with_manifest(ListenerSettings::default(), K + 1, manifest(&fds));

    assert_eq!(registry.provided_count(), 0);
    registry.manifest().unwrap();
    assert_eq!(registry.provided_count(), K);

    // Claim in reverse order: matching is by address, not position.
    let mut ids = Vec::new();
    for (fd, addr) in inherited.iter().rev() {
        let record = registry.get_listener("tcp", &addr.to_string()).unwrap();
        assert!(record.is_inherited());
        assert_eq!(record.info().address, addr.to_string());
        assert_eq!(std::os::fd::AsRawFd::as_raw_fd(&*record), *fd);
        ids.push(record.id());
    }
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), K);
    assert_eq!(registry.provided_count(), 0);

    // A second claim of an inherited address cannot take the same socket.
    let (_, taken) = inherited[0];
    let err = registry.get_listener("tcp", &taken.to_string()).unwrap_err();
    assert!(matches!(err, ListenerError::Bind { .. }));
    assert_eq!(registry.pending_slots(), 0);
    assert_eq!(registry.active().len(), K);
}

#[test]
fn unclaimed_listeners_close_and_fresh_ones_bind() {
    let dir = tempfile::tempdir().unwrap();
    let kept = dir.path().join("kept.sock");
    let owned = dir.path().join("owned.sock");
    let (tcp_fd, tcp_addr) = tcp_listener();
    let fds = [
        (tcp_fd, false),
        (unix_listener(&kept), false),
        (unix_listener(&owned), true),
    ];
    let registry = ListenerRegistry::with_manifest(ListenerSettings::default(), 1, manifest(&fds));

    let fresh = registry.get_listener("tcp", "127.0.0.1:0").unwrap();
    assert!(!fresh.is_inherited());
    assert_eq!(fresh.class(), NetworkClass::Tcp);
    assert_eq!(registry.provided_count(), 3);

    registry.close_unused_provided_listeners();
    assert_eq!(registry.provided_count(), 0);
    assert!(kept.exists(), "socket file handed over without ownership must stay");
    assert!(!owned.exists(), "owned socket file must be unlinked");
    assert!(std::net::TcpStream::connect(tcp_addr).is_err());
}

#[test]
fn unix_path_matches_inherited_socket() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("web.sock");
    let fd = unix_listener(&path);
    let registry = ListenerRegistry::with_manifest(ListenerSettings::default(), 1, manifest(&[(fd, true)]));

    let record = registry
        .get_listener("unix", path.to_str().unwrap())
        .unwrap();
    assert!(record.is_inherited());
    assert!(record.unlink_on_close());
    assert_eq!(record.class(), NetworkClass::Unix);
}
