//! Thin HTTP control surface over the supervisor.
//!
//! Three routes, no state of their own: start/stop mutate the supervisor,
//! status reads it. The response carries the machine-readable state; the
//! human message keeps the `"running"` / `"not running"` wording older
//! substring-matching clients key on.

use crate::supervisor::Supervisor;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use gsc_core::{GscError, ServerState};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

#[derive(Debug, Deserialize, Default)]
pub struct StartRequest {
    #[serde(default)]
    pub path: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub state: ServerState,
    pub message: String,
}

pub fn router(supervisor: Arc<Supervisor>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/start", post(start_handler))
        .route("/stop", post(stop_handler))
        .route("/status", get(status_handler))
        .layer(cors)
        .with_state(supervisor)
}

async fn start_handler(
    State(supervisor): State<Arc<Supervisor>>,
    body: Option<Json<StartRequest>>,
) -> (StatusCode, String) {
    let path = body.and_then(|Json(req)| req.path);
    match supervisor.start(path.as_deref()).await {
        Ok(()) => (StatusCode::OK, "game server started".to_string()),
        Err(e @ GscError::AlreadyRunning) => (StatusCode::CONFLICT, e.to_string()),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("error starting server: {e}"),
        ),
    }
}

async fn stop_handler(State(supervisor): State<Arc<Supervisor>>) -> (StatusCode, String) {
    match supervisor.stop().await {
        Ok(()) => (StatusCode::OK, "game server stopped".to_string()),
        Err(e @ GscError::NotRunning) => (StatusCode::CONFLICT, e.to_string()),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("error stopping server: {e}"),
        ),
    }
}

async fn status_handler(State(supervisor): State<Arc<Supervisor>>) -> Json<StatusResponse> {
    let state = supervisor.state();
    Json(StatusResponse {
        state,
        message: format!("game server is {state}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::LogBroadcaster;
    use crate::supervisor::SupervisorConfig;
    use std::time::Duration;

    fn test_supervisor() -> Arc<Supervisor> {
        let broadcaster = LogBroadcaster::new(100, 256);
        Supervisor::new(
            SupervisorConfig {
                launch_path: None,
                working_dir: None,
                shutdown_command: "stop".to_string(),
                grace_period: Duration::from_millis(200),
            },
            broadcaster,
        )
    }

    #[tokio::test]
    async fn status_message_keeps_the_substring_contract() {
        let supervisor = test_supervisor();

        let Json(status) = status_handler(State(supervisor.clone())).await;
        assert_eq!(status.state, ServerState::Stopped);
        assert!(status.message.contains("not running"));

        supervisor.start(Some("/bin/cat")).await.unwrap();
        let Json(status) = status_handler(State(supervisor.clone())).await;
        assert_eq!(status.state, ServerState::Running);
        assert!(status.message.contains("running"));
        assert!(!status.message.contains("not running"));

        supervisor.stop().await.unwrap();
    }

    #[tokio::test]
    async fn stop_while_stopped_is_a_conflict() {
        let supervisor = test_supervisor();
        let (code, body) = stop_handler(State(supervisor)).await;
        assert_eq!(code, StatusCode::CONFLICT);
        assert!(body.contains("not running"));
    }

    #[tokio::test]
    async fn start_without_any_path_is_an_error() {
        let supervisor = test_supervisor();
        let (code, _body) = start_handler(State(supervisor), None).await;
        assert_eq!(code, StatusCode::INTERNAL_SERVER_ERROR);
    }
}
