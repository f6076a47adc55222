//! TLS configuration, certificate loading and per-connection handshakes.

use std::fs::File;
use std::io::{self, BufReader};
use std::path::Path;

use axum_server::accept::{Accept, DefaultAcceptor};
use axum_server::tls_rustls::{RustlsAcceptor, RustlsConfig};

use super::connection::ManagedStream;
use super::listener::{ManagedListener, PeerAddr};

/// A handshaken TLS connection over a counted stream.
pub type TlsStream = <RustlsAcceptor<DefaultAcceptor> as Accept<ManagedStream, ()>>::Stream;

/// Load TLS configuration from PEM certificate and key files.
///
/// Both files are parsed up front so a bad path or an empty file fails
/// before the listener is claimed.
pub async fn load_tls_config(cert_path: &Path, key_path: &Path) -> io::Result<RustlsConfig> {
    let certs = rustls_pemfile::certs(&mut BufReader::new(File::open(cert_path)?))
        .collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("no certificates found in {}", cert_path.display()),
        ));
    }
    if rustls_pemfile::private_key(&mut BufReader::new(File::open(key_path)?))?.is_none() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("no private key found in {}", key_path.display()),
        ));
    }

    RustlsConfig::from_pem_file(cert_path, key_path).await
}

/// A [`ManagedListener`] whose connections speak TLS.
///
/// `accept` stays cheap; run [`TlsListener::handshake`] in the connection task.
pub struct TlsListener {
    inner: ManagedListener,
    acceptor: RustlsAcceptor<DefaultAcceptor>,
}

impl TlsListener {
    pub fn new(inner: ManagedListener, config: RustlsConfig) -> Self {
        Self {
            inner,
            acceptor: RustlsAcceptor::new(config),
        }
    }

    pub async fn accept(&self) -> io::Result<(ManagedStream, PeerAddr)> {
        self.inner.accept().await
    }

    /// Handshake a connection returned by [`accept`](Self::accept).
    pub async fn handshake(&self, stream: ManagedStream) -> io::Result<TlsStream> {
        let (stream, ()) = self.acceptor.clone().accept(stream, ()).await?;
        Ok(stream)
    }

    pub fn listener(&self) -> &ManagedListener {
        &self.inner
    }
}
