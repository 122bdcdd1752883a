//! Call lifecycle HTTP handlers: health probes, inbound-call webhooks, and
//! call-automation callbacks.

use std::collections::HashMap;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::calls::{GridEvent, callback_url, websocket_url};
use crate::state::AppState;

pub async fn root() -> Json<Value> {
    Json(json!({
        "service": "voicebridge",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

pub async fn health() -> Json<Value> {
    Json(json!({ "status": "healthy" }))
}

/// Webhook for inbound-call events.
///
/// Subscription-validation handshakes are answered inline with the echoed
/// validation code. Real inbound calls are answered through the call-control
/// client with media streaming pointed back at this server.
pub async fn incoming_call(
    State(state): State<AppState>,
    Json(events): Json<Vec<GridEvent>>,
) -> Result<Json<Value>, (StatusCode, String)> {
    for event in &events {
        if let Some(code) = event.validation_code() {
            info!("Answering webhook subscription validation");
            return Ok(Json(json!({ "validationResponse": code })));
        }

        let Some(context) = event.incoming_call_context() else {
            warn!("Ignoring event without call context: {}", event.event_type);
            continue;
        };

        let Some(client) = &state.call_client else {
            return Err((
                StatusCode::SERVICE_UNAVAILABLE,
                "call control is not configured".to_string(),
            ));
        };

        let caller = event.caller_id();
        let context_id = uuid::Uuid::new_v4().to_string();
        let callback = callback_url(&state.config.base_url, &context_id, caller)
            .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
        let transport = websocket_url(&state.config.base_url);

        info!("Answering inbound call from {}", caller);
        let answer = client
            .answer_call(context, &callback, &transport)
            .await
            .map_err(|e| (StatusCode::BAD_GATEWAY, e.to_string()))?;
        info!("Call answered, connection {}", answer.call_connection_id);

        return Ok(Json(json!({
            "callConnectionId": answer.call_connection_id,
        })));
    }

    Ok(Json(json!({})))
}

/// Call-automation event callback. Events are logged for observability; the
/// bridge itself reacts to the media stream, not to these.
pub async fn callbacks(
    Path(context_id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    Json(events): Json<Vec<Value>>,
) -> StatusCode {
    let caller = params.get("callerId").map(String::as_str).unwrap_or("unknown");
    for event in &events {
        let event_type = event
            .get("type")
            .and_then(|t| t.as_str())
            .unwrap_or("unknown");
        info!(
            "Call automation event {} for context {} (caller {})",
            event_type, context_id, caller
        );
    }
    StatusCode::OK
}
