//! Media streaming WebSocket handler: one connection, one bridged call.

use std::sync::Arc;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use tracing::{error, info};

use crate::bridge::Bridge;
use crate::realtime::RealtimeClient;
use crate::state::AppState;

/// Upgrade handler for `/ws`. The call platform connects here once the call
/// is answered with media streaming enabled.
pub async fn media_ws(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_media(state, socket))
}

async fn handle_media(state: AppState, socket: WebSocket) {
    info!("Telephony media stream connected");

    let ai = Arc::new(RealtimeClient::new(
        state.config.endpoint_config(),
        state.credentials.clone(),
    ));
    let bridge = Bridge::new(ai, state.config.bridge_config());

    if let Err(e) = bridge.run(socket).await {
        error!("Bridged call ended with error: {}", e);
    }
    info!("Telephony media stream ended");
}
