//! Counted listeners handed to accept loops.
//!
//! # Responsibilities
//! - Turn a registry record into an async listener of the right kind
//! - Register every accepted connection on the server's counter
//! - Wake a blocked `accept` with a listener-closed error once closed
//! - Apply TCP keep-alive to accepted connections

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use socket2::{SockRef, Socket, TcpKeepalive};
use thiserror::Error;
use tokio::io::unix::AsyncFd;
use tokio::net::{TcpListener, UnixListener};

use super::connection::{ConnectionGuard, ManagedStream, PacketConn, Transport};
use super::registry::ListenerRecord;
use super::NetworkClass;
use crate::lifecycle::cancel::CancelWatcher;
use crate::lifecycle::counter::CompletionCounter;

/// Returned by `accept` once the listener has been closed.
#[derive(Debug, Error)]
#[error("use of closed network listener")]
pub struct ListenerClosed;

/// Build the listener-closed error.
pub fn listener_closed() -> io::Error {
    io::Error::new(io::ErrorKind::Other, ListenerClosed)
}

/// Whether `err` is the normal end of an accept loop.
pub fn is_listener_closed(err: &io::Error) -> bool {
    err.get_ref().is_some_and(|inner| inner.is::<ListenerClosed>())
}

/// Remote end of an accepted connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerAddr {
    Inet(SocketAddr),
    Unix,
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerAddr::Inet(addr) => write!(f, "{addr}"),
            PeerAddr::Unix => f.write_str("unix"),
        }
    }
}

/// Async listener built from a registry record.
#[derive(Debug)]
pub enum ListenerKind {
    Tcp(TcpListener),
    Unix(UnixListener),
    Packet(AsyncFd<Socket>),
}

impl ListenerKind {
    /// Wrap a duplicate of the record's descriptor. Must run inside a runtime.
    pub fn from_record(record: &ListenerRecord) -> io::Result<Self> {
        let socket = record.try_clone_socket()?;
        socket.set_nonblocking(true)?;
        Ok(match record.class() {
            NetworkClass::Tcp => ListenerKind::Tcp(TcpListener::from_std(socket.into())?),
            NetworkClass::Unix => ListenerKind::Unix(UnixListener::from_std(socket.into())?),
            NetworkClass::UnixPacket => ListenerKind::Packet(AsyncFd::new(socket)?),
        })
    }

    async fn accept(&self) -> io::Result<(Transport, PeerAddr)> {
        match self {
            ListenerKind::Tcp(listener) => {
                let (stream, addr) = listener.accept().await?;
                Ok((Transport::Tcp(stream), PeerAddr::Inet(addr)))
            }
            ListenerKind::Unix(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok((Transport::Unix(stream), PeerAddr::Unix))
            }
            ListenerKind::Packet(listener) => loop {
                let mut guard = listener.readable().await?;
                match guard.try_io(|inner| inner.get_ref().accept()) {
                    Ok(result) => {
                        let (socket, _) = result?;
                        return Ok((Transport::Packet(PacketConn::new(socket)?), PeerAddr::Unix));
                    }
                    Err(_would_block) => continue,
                }
            },
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            ListenerKind::Tcp(listener) => listener.local_addr().ok(),
            _ => None,
        }
    }
}

/// A listener whose connections are counted on a server.
#[derive(Debug)]
pub struct ManagedListener {
    kind: ListenerKind,
    server: Arc<str>,
    connections: Arc<CompletionCounter>,
    closed: CancelWatcher,
    keepalive: Option<Duration>,
}

impl ManagedListener {
    pub fn new(
        kind: ListenerKind,
        server: Arc<str>,
        connections: Arc<CompletionCounter>,
        closed: CancelWatcher,
        keepalive: Option<Duration>,
    ) -> Self {
        Self {
            kind,
            server,
            connections,
            closed,
            keepalive,
        }
    }

    /// Accept the next connection.
    ///
    /// Fails with [`ListenerClosed`] (see [`is_listener_closed`]) once the
    /// listener was closed or the server stopped accepting connections.
    pub async fn accept(&self) -> io::Result<(ManagedStream, PeerAddr)> {
        let mut closed = self.closed.clone();
        if closed.is_closed() {
            return Err(listener_closed());
        }
        let (transport, peer) = tokio::select! {
            biased;
            _ = closed.closed() => return Err(listener_closed()),
            accepted = self.kind.accept() => accepted?,
        };

        let Some(completion) = self.connections.guard() else {
            tracing::debug!(server = %self.server, peer = %peer, "Rejecting connection, server is shutting down");
            return Err(listener_closed());
        };

        if let (Transport::Tcp(stream), Some(period)) = (&transport, self.keepalive) {
            let keepalive = TcpKeepalive::new().with_time(period).with_interval(period);
            if let Err(e) = SockRef::from(stream).set_tcp_keepalive(&keepalive) {
                tracing::debug!(server = %self.server, error = %e, "Unable to set keep-alive");
            }
        }

        let guard = ConnectionGuard::new(Arc::clone(&self.server), completion);
        tracing::debug!(
            server = %self.server,
            peer = %peer,
            connection_id = %guard.id(),
            active = self.connections.count(),
            "Connection accepted"
        );
        Ok((ManagedStream::new(transport, guard), peer))
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.kind.local_addr()
    }

    pub fn server(&self) -> &str {
        &self.server
    }
}
