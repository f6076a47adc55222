//! HTTP serving on managed listeners.
//!
//! # Responsibilities
//! - Build the demo application router
//! - Accept connections from a [`ManagedListener`] or [`TlsListener`]
//! - Drive each connection with hyper-util (HTTP/1.1 and HTTP/2)
//! - Finish in-flight requests on shutdown, drop connections on hammer
//!
//! # Design Decisions
//! - One task per connection; the connection guard lives in the stream, so
//!   the server's counter drops when the task ends
//! - Transient accept errors are logged and retried after a short pause

use std::io;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder;
use hyper_util::service::TowerToHyperService;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::http::request::{request_id, with_request_id};
use crate::lifecycle::CancelWatcher;
use crate::net::{is_listener_closed, ManagedListener, PeerAddr, TlsListener};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_BODY_BYTES: usize = 64 * 1024;
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);
const MAX_DELAY_MS: u64 = 60_000;

#[derive(Clone)]
struct AppState {
    server: Arc<str>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Greeting {
    pub server: String,
    pub pid: u32,
    pub request_id: String,
}

#[derive(Debug, Deserialize)]
struct DelayQuery {
    ms: Option<u64>,
}

/// Build the demo application for the server called `server`.
///
/// Routes: `/` greets with the serving pid, `/health` answers `ok`, and
/// `/slow?ms=N` answers after a delay (useful to watch a drain).
#[allow(deprecated)]
pub fn app_router(server: &str) -> Router {
    let state = AppState {
        server: Arc::from(server),
    };
    let router = Router::new()
        .route("/", get(greet))
        .route("/health", get(health))
        .route("/slow", get(slow))
        .with_state(state)
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http());
    with_request_id(router)
}

async fn greet(State(state): State<AppState>, headers: HeaderMap) -> Json<Greeting> {
    Json(Greeting {
        server: state.server.to_string(),
        pid: std::process::id(),
        request_id: request_id(&headers).to_string(),
    })
}

async fn health() -> &'static str {
    "ok"
}

async fn slow(
    State(state): State<AppState>,
    Query(query): Query<DelayQuery>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let ms = query.ms.unwrap_or(1_000);
    if ms > MAX_DELAY_MS {
        return (StatusCode::BAD_REQUEST, "delay too long").into_response();
    }
    tokio::time::sleep(Duration::from_millis(ms)).await;
    greet(State(state), headers).await.into_response()
}

/// Serve `router` on `listener` until the listener closes.
///
/// Open connections finish their current request after `shutdown` closes
/// and are dropped outright once `hammer` closes.
pub async fn serve_http(
    listener: ManagedListener,
    router: Router,
    shutdown: CancelWatcher,
    hammer: CancelWatcher,
) -> io::Result<()> {
    let server: Arc<str> = Arc::from(listener.server());
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) if is_listener_closed(&e) => return Err(e),
            Err(e) => {
                tracing::warn!(server = %server, error = %e, "Accept failed");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
                continue;
            }
        };
        let id = stream.id();
        tracing::debug!(server = %server, connection = %id, peer = %peer, "Connection accepted");
        tokio::spawn(serve_connection(
            stream,
            peer,
            router.clone(),
            shutdown.clone(),
            hammer.clone(),
        ));
    }
}

/// Like [`serve_http`], completing a TLS handshake per connection.
pub async fn serve_https(
    listener: TlsListener,
    router: Router,
    shutdown: CancelWatcher,
    hammer: CancelWatcher,
) -> io::Result<()> {
    let listener = Arc::new(listener);
    let server: Arc<str> = Arc::from(listener.listener().server());
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) if is_listener_closed(&e) => return Err(e),
            Err(e) => {
                tracing::warn!(server = %server, error = %e, "Accept failed");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
                continue;
            }
        };
        let listener = Arc::clone(&listener);
        let server = Arc::clone(&server);
        let router = router.clone();
        let shutdown = shutdown.clone();
        let mut hammer = hammer.clone();
        tokio::spawn(async move {
            let handshake = tokio::select! {
                result = listener.handshake(stream) => result,
                _ = hammer.closed() => return,
            };
            match handshake {
                Ok(stream) => serve_connection(stream, peer, router, shutdown, hammer).await,
                Err(e) => {
                    tracing::debug!(server = %server, peer = %peer, error = %e, "TLS handshake failed")
                }
            }
        });
    }
}

async fn serve_connection<I>(
    io: I,
    peer: PeerAddr,
    router: Router,
    mut shutdown: CancelWatcher,
    mut hammer: CancelWatcher,
) where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let builder = Builder::new(TokioExecutor::new());
    let conn = builder.serve_connection(TokioIo::new(io), TowerToHyperService::new(router));
    tokio::pin!(conn);

    let mut draining = false;
    loop {
        tokio::select! {
            result = conn.as_mut() => {
                if let Err(e) = result {
                    tracing::debug!(peer = %peer, error = %e, "Connection ended with error");
                }
                return;
            }
            _ = shutdown.closed(), if !draining => {
                draining = true;
                conn.as_mut().graceful_shutdown();
            }
            _ = hammer.closed() => {
                tracing::debug!(peer = %peer, "Dropping connection");
                return;
            }
        }
    }
}
