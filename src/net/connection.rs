//! Accepted connections and their completion tracking.
//!
//! # Responsibilities
//! - Generate unique connection IDs for tracing
//! - Complete the server's connection counter exactly once per connection
//! - Expose every supported socket kind as one `AsyncRead + AsyncWrite` stream
//!
//! # Design Decisions
//! - The counter is completed on drop, so a panicking handler still drains
//! - `unix-packet` sockets are read and written through `AsyncFd`

use std::io::{self, Read, Write};
use std::net::Shutdown;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use socket2::Socket;
use tokio::io::unix::AsyncFd;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpStream, UnixStream};

use crate::lifecycle::counter::CompletionGuard;
use crate::observability::metrics;

/// Relaxed ordering is enough: IDs only need to be unique.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Holds one registration on a server's connection counter.
#[derive(Debug)]
pub struct ConnectionGuard {
    id: ConnectionId,
    server: Arc<str>,
    completion: Option<CompletionGuard>,
}

impl ConnectionGuard {
    pub(crate) fn new(server: Arc<str>, completion: CompletionGuard) -> Self {
        let id = ConnectionId::new();
        metrics::record_connection_opened(&server);
        tracing::trace!(connection_id = %id, server = %server, "Connection opened");
        Self {
            id,
            server,
            completion: Some(completion),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Complete the registration now. Later calls and the drop are no-ops.
    pub fn close(&mut self) {
        if let Some(completion) = self.completion.take() {
            completion.done();
            metrics::record_connection_closed(&self.server);
            tracing::trace!(connection_id = %self.id, server = %self.server, "Connection closed");
        }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.close();
    }
}

/// A connected `unix-packet` socket.
#[derive(Debug)]
pub struct PacketConn {
    inner: AsyncFd<Socket>,
}

impl PacketConn {
    pub(crate) fn new(socket: Socket) -> io::Result<Self> {
        socket.set_nonblocking(true)?;
        Ok(Self {
            inner: AsyncFd::new(socket)?,
        })
    }
}

impl AsyncRead for PacketConn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            let mut guard = ready!(self.inner.poll_read_ready(cx))?;
            let unfilled = buf.initialize_unfilled();
            match guard.try_io(|inner| {
                let mut socket: &Socket = inner.get_ref();
                socket.read(unfilled)
            }) {
                Ok(Ok(n)) => {
                    buf.advance(n);
                    return Poll::Ready(Ok(()));
                }
                Ok(Err(e)) => return Poll::Ready(Err(e)),
                Err(_would_block) => continue,
            }
        }
    }
}

impl AsyncWrite for PacketConn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        loop {
            let mut guard = ready!(self.inner.poll_write_ready(cx))?;
            match guard.try_io(|inner| {
                let mut socket: &Socket = inner.get_ref();
                socket.write(buf)
            }) {
                Ok(result) => return Poll::Ready(result),
                Err(_would_block) => continue,
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(self.inner.get_ref().shutdown(Shutdown::Write))
    }
}

/// The transport under a [`ManagedStream`].
#[derive(Debug)]
pub enum Transport {
    Tcp(TcpStream),
    Unix(UnixStream),
    Packet(PacketConn),
}

/// An accepted connection counted on its server.
///
/// Dropping (or [`close`](ManagedStream::close)-ing) the stream completes the
/// registration.
#[derive(Debug)]
pub struct ManagedStream {
    transport: Transport,
    guard: ConnectionGuard,
}

impl ManagedStream {
    pub(crate) fn new(transport: Transport, guard: ConnectionGuard) -> Self {
        Self { transport, guard }
    }

    pub fn id(&self) -> ConnectionId {
        self.guard.id()
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    /// Complete the registration without waiting for the drop.
    pub fn close(&mut self) {
        self.guard.close();
    }
}

impl AsyncRead for ManagedStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match &mut self.get_mut().transport {
            Transport::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            Transport::Unix(s) => Pin::new(s).poll_read(cx, buf),
            Transport::Packet(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ManagedStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match &mut self.get_mut().transport {
            Transport::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            Transport::Unix(s) => Pin::new(s).poll_write(cx, buf),
            Transport::Packet(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.get_mut().transport {
            Transport::Tcp(s) => Pin::new(s).poll_flush(cx),
            Transport::Unix(s) => Pin::new(s).poll_flush(cx),
            Transport::Packet(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.get_mut().transport {
            Transport::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            Transport::Unix(s) => Pin::new(s).poll_shutdown(cx),
            Transport::Packet(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::counter::CompletionCounter;

    #[test]
    fn connection_id_unique() {
        let id1 = ConnectionId::new();
        let id2 = ConnectionId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn guard_completes_counter_once() {
        let counter = Arc::new(CompletionCounter::new());
        let mut guard = ConnectionGuard::new(Arc::from("test"), counter.guard().unwrap());
        let _other = ConnectionGuard::new(Arc::from("test"), counter.guard().unwrap());
        assert_eq!(counter.count(), 2);

        guard.close();
        assert_eq!(counter.count(), 1);
        drop(guard);
        assert_eq!(counter.count(), 1);
    }

    #[tokio::test]
    async fn packet_conn_round_trip() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let (a, b) = Socket::pair(socket2::Domain::UNIX, socket2::Type::SEQPACKET, None).unwrap();
        let mut a = PacketConn::new(a).unwrap();
        let mut b = PacketConn::new(b).unwrap();

        a.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 16];
        let n = b.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping");
    }
}
