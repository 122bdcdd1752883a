//! HTTP and WebSocket route definitions.

use axum::Router;
use axum::routing::{get, post};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::handlers;
use crate::state::AppState;

/// Build the application router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(handlers::calls::root))
        .route("/health", get(handlers::calls::health))
        .route("/ws", get(handlers::media::media_ws))
        .route("/api/incomingCall", post(handlers::calls::incoming_call))
        .route(
            "/api/callbacks/{context_id}",
            post(handlers::calls::callbacks),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
