//! Call-control integration: answering inbound calls and deriving the URLs
//! the media platform needs.
//!
//! The REST client is deliberately thin. The bridge only ever answers a call
//! with bidirectional 16 kHz media streaming enabled; everything else about
//! call automation stays on the platform side.

use serde::{Deserialize, Serialize};
use url::Url;

use crate::errors::{BridgeError, BridgeResult};

/// Event-grid event type announcing a webhook subscription handshake.
pub const SUBSCRIPTION_VALIDATION_EVENT: &str = "Microsoft.EventGrid.SubscriptionValidationEvent";

// =============================================================================
// URL helpers
// =============================================================================

/// Prepend `https://` when the configured base URL has no scheme.
pub fn ensure_https(base: &str) -> String {
    let trimmed = base.trim().trim_end_matches('/');
    if trimmed.starts_with("https://") || trimmed.starts_with("http://") {
        trimmed.to_string()
    } else {
        format!("https://{trimmed}")
    }
}

/// Callback URL for call-automation events of one call.
pub fn callback_url(base: &str, context_id: &str, caller_id: &str) -> BridgeResult<String> {
    let base = ensure_https(base);
    let mut url = Url::parse(&format!("{base}/api/callbacks/{context_id}"))
        .map_err(|e| BridgeError::InvalidConfiguration(format!("bad base URL: {e}")))?;
    url.query_pairs_mut().append_pair("callerId", caller_id);
    Ok(url.to_string())
}

/// Media streaming WebSocket URL derived from the public base URL.
pub fn websocket_url(base: &str) -> String {
    let base = ensure_https(base)
        .replacen("https://", "wss://", 1)
        .replacen("http://", "ws://", 1);
    format!("{base}/ws")
}

// =============================================================================
// Event-grid payload helpers
// =============================================================================

/// One event from an event-grid webhook batch. Only the discriminator and
/// the payload are interesting; everything else passes through untouched.
#[derive(Debug, Clone, Deserialize)]
pub struct GridEvent {
    #[serde(rename = "eventType", default)]
    pub event_type: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl GridEvent {
    /// The validation code, when this is a subscription handshake event.
    pub fn validation_code(&self) -> Option<&str> {
        if self.event_type == SUBSCRIPTION_VALIDATION_EVENT {
            self.data.get("validationCode").and_then(|v| v.as_str())
        } else {
            None
        }
    }

    /// Raw identifier of the calling party, `"unknown"` when absent.
    pub fn caller_id(&self) -> &str {
        self.data
            .get("from")
            .and_then(|f| f.get("rawId"))
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
    }

    /// Opaque context blob required to answer the call.
    pub fn incoming_call_context(&self) -> Option<&str> {
        self.data.get("incomingCallContext").and_then(|v| v.as_str())
    }
}

// =============================================================================
// Call-control REST client
// =============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AnswerCallRequest<'a> {
    incoming_call_context: &'a str,
    callback_uri: &'a str,
    media_streaming_options: MediaStreamingOptions<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MediaStreamingOptions<'a> {
    transport_url: &'a str,
    transport_type: &'a str,
    content_type: &'a str,
    audio_channel_type: &'a str,
    start_media_streaming: bool,
    enable_bidirectional: bool,
    audio_format: &'a str,
}

impl<'a> MediaStreamingOptions<'a> {
    /// The only streaming mode the bridge supports: bidirectional mixed-mono
    /// PCM16 at 16 kHz over WebSocket, started as soon as the call connects.
    fn bidirectional_pcm16k(transport_url: &'a str) -> Self {
        Self {
            transport_url,
            transport_type: "websocket",
            content_type: "audio",
            audio_channel_type: "mixed",
            start_media_streaming: true,
            enable_bidirectional: true,
            audio_format: "Pcm16KMono",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AnswerCallResponse {
    #[serde(rename = "callConnectionId", default)]
    pub call_connection_id: String,
}

/// Thin client for the call-control REST surface.
pub struct CallControlClient {
    endpoint: String,
    access_token: String,
    api_version: String,
    client: reqwest::Client,
}

impl CallControlClient {
    pub fn new(
        endpoint: impl Into<String>,
        access_token: impl Into<String>,
        api_version: impl Into<String>,
    ) -> Self {
        Self {
            endpoint: ensure_https(&endpoint.into()),
            access_token: access_token.into(),
            api_version: api_version.into(),
            client: reqwest::Client::new(),
        }
    }

    /// Answer an inbound call with bidirectional media streaming toward
    /// `transport_url`.
    pub async fn answer_call(
        &self,
        incoming_call_context: &str,
        callback_uri: &str,
        transport_url: &str,
    ) -> BridgeResult<AnswerCallResponse> {
        let url = format!(
            "{}/calling/callConnections:answer?api-version={}",
            self.endpoint, self.api_version
        );
        let body = AnswerCallRequest {
            incoming_call_context,
            callback_uri,
            media_streaming_options: MediaStreamingOptions::bidirectional_pcm16k(transport_url),
        };

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.access_token)
            .json(&body)
            .send()
            .await
            .map_err(|e| BridgeError::CallControl(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(BridgeError::CallControl(format!(
                "answer call failed with {status}: {detail}"
            )));
        }

        response
            .json::<AnswerCallResponse>()
            .await
            .map_err(|e| BridgeError::CallControl(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ensure_https() {
        assert_eq!(ensure_https("example.com"), "https://example.com");
        assert_eq!(ensure_https("https://example.com/"), "https://example.com");
        assert_eq!(ensure_https("http://example.com"), "http://example.com");
    }

    #[test]
    fn test_callback_url_encodes_caller() {
        let url = callback_url("example.com", "ctx-1", "4:+15551234567").unwrap();
        assert!(url.starts_with("https://example.com/api/callbacks/ctx-1?callerId="));
        assert!(url.contains("%2B15551234567"));
    }

    #[test]
    fn test_websocket_url_rewrites_scheme() {
        assert_eq!(websocket_url("https://example.com"), "wss://example.com/ws");
        assert_eq!(websocket_url("example.com"), "wss://example.com/ws");
    }

    #[test]
    fn test_validation_event() {
        let event: GridEvent = serde_json::from_str(
            r#"{"eventType":"Microsoft.EventGrid.SubscriptionValidationEvent","data":{"validationCode":"abc-123"}}"#,
        )
        .unwrap();
        assert_eq!(event.validation_code(), Some("abc-123"));

        let other: GridEvent = serde_json::from_str(
            r#"{"eventType":"Microsoft.Communication.IncomingCall","data":{"validationCode":"x"}}"#,
        )
        .unwrap();
        assert_eq!(other.validation_code(), None);
    }

    #[test]
    fn test_incoming_call_fields() {
        let event: GridEvent = serde_json::from_str(
            r#"{"eventType":"Microsoft.Communication.IncomingCall","data":{"incomingCallContext":"opaque","from":{"rawId":"4:+15550001111"}}}"#,
        )
        .unwrap();
        assert_eq!(event.incoming_call_context(), Some("opaque"));
        assert_eq!(event.caller_id(), "4:+15550001111");

        let bare: GridEvent = serde_json::from_str(r#"{"eventType":"x","data":{}}"#).unwrap();
        assert_eq!(bare.caller_id(), "unknown");
        assert_eq!(bare.incoming_call_context(), None);
    }

    #[test]
    fn test_answer_request_wire_shape() {
        let body = AnswerCallRequest {
            incoming_call_context: "ctx",
            callback_uri: "https://example.com/api/callbacks/1",
            media_streaming_options: MediaStreamingOptions::bidirectional_pcm16k(
                "wss://example.com/ws",
            ),
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["incomingCallContext"], "ctx");
        let opts = &json["mediaStreamingOptions"];
        assert_eq!(opts["transportType"], "websocket");
        assert_eq!(opts["audioChannelType"], "mixed");
        assert_eq!(opts["audioFormat"], "Pcm16KMono");
        assert_eq!(opts["enableBidirectional"], true);
        assert_eq!(opts["startMediaStreaming"], true);
    }
}
