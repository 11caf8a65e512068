//! HTTP surface
//!
//! Two routes: the real-time upgrade endpoint (`GET /room`) feeding the
//! gateway, and the session-provisioning endpoint (`POST /scripts/stream`)
//! that fronts the assignment service for other gateway instances.

use std::sync::Arc;

use axum::extract::{State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

use crate::gateway::Gateway;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<Gateway>,
}

/// Build the router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/room", get(join_room))
        .route("/scripts/stream", post(new_script_room))
        .with_state(state)
}

/// Serve until the listener fails
pub async fn serve(listener: tokio::net::TcpListener, state: AppState) -> anyhow::Result<()> {
    axum::serve(listener, router(state)).await?;
    Ok(())
}

/// Upgrade to the text-frame protocol and hand the socket to the gateway
async fn join_room(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| state.gateway.handle(socket))
}

#[derive(Debug, Deserialize)]
struct NewScriptRoom {
    script_id: i64,
    user_id: i64,
}

/// Resolve (or create) the session's node assignment and track membership
async fn new_script_room(
    State(state): State<AppState>,
    Json(body): Json<NewScriptRoom>,
) -> Response {
    if body.script_id < 1 || body.user_id < 1 {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "script_id and user_id must be >= 1" })),
        )
            .into_response();
    }

    match state.gateway.assignment.assign_if_absent(body.script_id).await {
        Ok(node) => {
            state.gateway.presence.join(body.script_id, body.user_id);
            (StatusCode::OK, Json(json!({ "node": node.host }))).into_response()
        }
        Err(e) => {
            warn!(script = body.script_id, error = %e, "assignment request failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    }
}
