use axum::Router;

use crate::state::AppState;
use crate::ws::handler as ws_handler;

/// Build the full axum Router.
pub fn build_router(state: AppState) -> Router {
    // WebSocket endpoint: the path segment is the requested username
    let ws_routes = Router::new().route(
        "/chat/{username}",
        axum::routing::get(ws_handler::ws_upgrade),
    );

    let public_routes = Router::new()
        .route("/", axum::routing::get(root))
        .route("/health", axum::routing::get(health_check));

    Router::new()
        .merge(public_routes)
        .merge(ws_routes)
        .with_state(state)
}

async fn root() -> &'static str {
    "you are good to go!"
}

/// Basic health check endpoint
async fn health_check() -> &'static str {
    "ok"
}
