use crate::registry::ServerEndpoint;
use crate::session::{PresenceService, SessionError};
use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::Serialize;
use std::{collections::HashMap, net::SocketAddr, sync::Arc};
use tokio::net::TcpListener;
use tokio::sync::watch;

#[derive(Clone)]
struct ApiState {
    token: String,
    service: Arc<PresenceService>,
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorBody {
            error: message.into(),
        }),
    )
        .into_response()
}

fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/endpoints", get(list_endpoints))
        .route("/endpoints", post(register_endpoint))
        .route("/endpoints/:address/:port", delete(unregister_endpoint))
        .route("/session/start", post(start_session))
        .route("/session/stop", post(stop_session))
        .route("/session/roster", get(roster_snapshot))
        .with_state(state)
}

pub async fn start(
    addr: SocketAddr,
    token: String,
    service: Arc<PresenceService>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error>> {
    let app = router(Arc::new(ApiState { token, service }));

    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "control api listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.changed().await;
        })
        .await?;

    Ok(())
}

fn is_token_valid(headers: &HeaderMap, query: &HashMap<String, String>, token: &str) -> bool {
    if let Some(auth_header) = headers.get("Authorization") {
        if let Ok(auth_str) = auth_header.to_str() {
            if let Some(provided_token) = auth_str.strip_prefix("Bearer ") {
                return provided_token == token;
            }
        }
    }
    query.get("token").map(|t| t == token).unwrap_or(false)
}

async fn health_check(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "session_active": state.service.is_active().await,
    }))
}

async fn list_endpoints(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    query: Query<HashMap<String, String>>,
) -> Response {
    if !is_token_valid(&headers, &query.0, &state.token) {
        return error_response(StatusCode::UNAUTHORIZED, "Unauthorized");
    }
    Json(state.service.list_endpoints()).into_response()
}

async fn register_endpoint(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    query: Query<HashMap<String, String>>,
    Json(endpoint): Json<ServerEndpoint>,
) -> Response {
    if !is_token_valid(&headers, &query.0, &state.token) {
        return error_response(StatusCode::UNAUTHORIZED, "Unauthorized");
    }
    if endpoint.address.trim().is_empty() || endpoint.port == 0 {
        return error_response(StatusCode::BAD_REQUEST, "address and port are required");
    }
    match state.service.register_endpoint(endpoint).await {
        Ok(replaced) => Json(serde_json::json!({ "replaced": replaced })).into_response(),
        Err(err) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to save endpoints: {err}"),
        ),
    }
}

async fn unregister_endpoint(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    query: Query<HashMap<String, String>>,
    Path((address, port)): Path<(String, u16)>,
) -> Response {
    if !is_token_valid(&headers, &query.0, &state.token) {
        return error_response(StatusCode::UNAUTHORIZED, "Unauthorized");
    }
    match state.service.unregister_endpoint(&address, port).await {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => error_response(StatusCode::NOT_FOUND, "no such endpoint"),
        Err(err) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to save endpoints: {err}"),
        ),
    }
}

async fn start_session(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    query: Query<HashMap<String, String>>,
) -> Response {
    if !is_token_valid(&headers, &query.0, &state.token) {
        return error_response(StatusCode::UNAUTHORIZED, "Unauthorized");
    }
    match state.service.start_session().await {
        Ok(id) => Json(serde_json::json!({ "session_id": id })).into_response(),
        Err(err @ SessionError::AlreadyActive) => {
            error_response(StatusCode::CONFLICT, err.to_string())
        }
        Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

async fn stop_session(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    query: Query<HashMap<String, String>>,
) -> Response {
    if !is_token_valid(&headers, &query.0, &state.token) {
        return error_response(StatusCode::UNAUTHORIZED, "Unauthorized");
    }
    match state.service.stop_session().await {
        Ok(attendance) => Json(attendance).into_response(),
        Err(err @ SessionError::NotActive) => error_response(StatusCode::CONFLICT, err.to_string()),
        Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

async fn roster_snapshot(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    query: Query<HashMap<String, String>>,
) -> Response {
    if !is_token_valid(&headers, &query.0, &state.token) {
        return error_response(StatusCode::UNAUTHORIZED, "Unauthorized");
    }
    Json(state.service.current_roster_snapshot()).into_response()
}
