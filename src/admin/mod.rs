//! Admin control API.
//!
//! Bearer-authenticated routes to inspect the process and drive the
//! lifecycle manager without sending signals by hand.

pub mod auth;
pub mod handlers;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::{middleware, Router};
use parking_lot::RwLock;

use self::auth::admin_auth_middleware;
use self::handlers::*;
use crate::lifecycle::Manager;
use crate::server::ManagedServer;

/// State shared by the admin handlers.
#[derive(Clone)]
pub struct AdminState {
    pub manager: Arc<Manager>,
    pub servers: Arc<RwLock<Vec<Arc<ManagedServer>>>>,
    pub api_key: Arc<str>,
}

impl AdminState {
    pub fn new(manager: Arc<Manager>, api_key: &str) -> Self {
        Self {
            manager,
            servers: Arc::default(),
            api_key: Arc::from(api_key),
        }
    }

    /// Include `server` in status reports.
    pub fn track(&self, server: Arc<ManagedServer>) {
        self.servers.write().push(server);
    }
}

pub fn setup_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/admin/status", get(get_status))
        .route("/admin/restart", post(post_restart))
        .route("/admin/shutdown", post(post_shutdown))
        .route("/admin/hammer", post(post_hammer))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            admin_auth_middleware,
        ))
        .with_state(state)
}
