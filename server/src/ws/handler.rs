use axum::{
    extract::{Path, State, WebSocketUpgrade},
    http::StatusCode,
    response::{IntoResponse, Response},
};

use crate::state::AppState;
use crate::ws::actor;

/// GET /chat/{username}
/// WebSocket upgrade endpoint. The path segment is the requested username;
/// admission happens after the upgrade so refusals reach the client as text.
pub async fn ws_upgrade(
    State(state): State<AppState>,
    Path(username): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    if state.shutdown.is_cancelled() {
        return (StatusCode::SERVICE_UNAVAILABLE, "shutting down").into_response();
    }

    tracing::info!(username = %username, "WebSocket connection requested");

    ws.on_upgrade(move |socket| actor::run_connection(socket, state, username))
}
