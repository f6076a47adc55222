use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;

use crate::admin::AdminState;
use crate::lifecycle::ManagerStatus;
use crate::process::RestartError;
use crate::server::ServerStatus;

#[derive(Serialize)]
pub struct SystemStatus {
    pub version: &'static str,
    #[serde(flatten)]
    pub manager: ManagerStatus,
    pub servers: Vec<ServerStatus>,
}

#[derive(Serialize)]
pub struct ActionResponse {
    pub accepted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub child_pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ActionResponse {
    fn accepted() -> Self {
        Self {
            accepted: true,
            child_pid: None,
            error: None,
        }
    }

    fn rejected(error: impl ToString) -> Self {
        Self {
            accepted: false,
            child_pid: None,
            error: Some(error.to_string()),
        }
    }
}

pub async fn get_status(State(state): State<AdminState>) -> Json<SystemStatus> {
    let servers = state.servers.read().iter().map(|s| s.status()).collect();
    Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION"),
        manager: state.manager.status(),
        servers,
    })
}

pub async fn post_restart(
    State(state): State<AdminState>,
) -> (StatusCode, Json<ActionResponse>) {
    match state.manager.request_restart() {
        Ok(child) => (
            StatusCode::ACCEPTED,
            Json(ActionResponse {
                child_pid: Some(child),
                ..ActionResponse::accepted()
            }),
        ),
        Err(e) => {
            let status = match e {
                RestartError::AlreadyForked => StatusCode::CONFLICT,
                RestartError::Disabled => StatusCode::SERVICE_UNAVAILABLE,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            tracing::warn!(error = %e, "Admin restart failed");
            (status, Json(ActionResponse::rejected(e)))
        }
    }
}

pub async fn post_shutdown(State(state): State<AdminState>) -> (StatusCode, Json<ActionResponse>) {
    tracing::info!(pid = std::process::id(), "Shutdown requested via admin API");
    state.manager.request_graceful_shutdown();
    (StatusCode::ACCEPTED, Json(ActionResponse::accepted()))
}

pub async fn post_hammer(State(state): State<AdminState>) -> (StatusCode, Json<ActionResponse>) {
    tracing::warn!(pid = std::process::id(), "Hammer requested via admin API");
    state.manager.request_immediate_hammer();
    (StatusCode::ACCEPTED, Json(ActionResponse::accepted()))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::Request;
    use axum::Router;
    use tower::ServiceExt;

    use crate::admin::{setup_admin_router, AdminState};
    use crate::config::ListenerSettings;
    use crate::lifecycle::{LifecycleState, Manager, ManagerOptions};
    use crate::net::ListenerRegistry;
    use crate::process::{DisabledRestarter, EnvManifest};
    use crate::server::ManagedServer;
    use crate::supervisor::SupervisorNotifier;

    use super::*;

    fn state() -> AdminState {
        let registry = Arc::new(ListenerRegistry::with_manifest(
            ListenerSettings::default(),
            0,
            EnvManifest::default(),
        ));
        let manager = Manager::new(
            ManagerOptions {
                restartable: true,
                hammer_grace: None,
                terminate_delay: Duration::ZERO,
                startup_timeout: None,
            },
            registry,
            Arc::new(DisabledRestarter),
            SupervisorNotifier::disabled(),
        );
        manager.start();
        AdminState::new(manager, "secret")
    }

    async fn call(router: Router, method: &str, path: &str, key: Option<&str>) -> (StatusCode, serde_json::Value) {
        let mut request = Request::builder().method(method).uri(path);
        if let Some(key) = key {
            request = request.header("authorization", format!("Bearer {key}"));
        }
        let response = router
            .oneshot(request.body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), 64 * 1024).await.unwrap();
        let json = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    #[tokio::test]
    async fn rejects_missing_or_wrong_key() {
        let router = setup_admin_router(state());
        let (status, _) = call(router.clone(), "GET", "/admin/status", None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        let (status, _) = call(router, "GET", "/admin/status", Some("nope")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn status_lists_servers() {
        let state = state();
        let server = ManagedServer::new(state.manager.clone(), "web", "tcp", "127.0.0.1:0");
        state.track(server);

        let (status, json) = call(setup_admin_router(state), "GET", "/admin/status", Some("secret")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["state"], "running");
        assert_eq!(json["pid"], std::process::id());
        assert_eq!(json["servers"][0]["name"], "web");
        assert_eq!(json["servers"][0]["connections"], 0);
    }

    #[tokio::test]
    async fn restart_without_support_is_unavailable() {
        let (status, json) = call(setup_admin_router(state()), "POST", "/admin/restart", Some("secret")).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json["accepted"], false);
    }

    #[tokio::test]
    async fn shutdown_and_hammer_drive_the_manager() {
        let state = state();
        let manager = state.manager.clone();
        let router = setup_admin_router(state);

        let (status, _) = call(router.clone(), "POST", "/admin/shutdown", Some("secret")).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert!(manager.state() >= LifecycleState::ShuttingDown);

        let (status, _) = call(router, "POST", "/admin/hammer", Some("secret")).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        tokio::time::timeout(Duration::from_secs(1), manager.done())
            .await
            .unwrap();
    }
}
