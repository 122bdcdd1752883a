//! Voice endpoint WebSocket message types.
//!
//! All events are JSON objects discriminated by a `type` field.
//!
//! Client events (sent to the service):
//! - session.update - configure turn detection, sample rate, voice
//! - input_audio_buffer.append - append base64 PCM to the input buffer
//! - response.create - start response generation
//!
//! Server events (received from the service):
//! - session.created / session.updated - negotiation progress
//! - response.audio.delta - base64 PCM at 24 kHz
//! - input_audio_buffer.speech_started - caller speech detected (barge-in)
//! - response.created / response.done - informational
//! - error - service-side error, does not close the socket
//!
//! Message types outside this set deserialize to [`ServerEvent::Ignored`] so
//! dispatch over the enum stays exhaustive.

use base64::prelude::*;
use serde::{Deserialize, Serialize};

use super::config::SessionConfig;

/// Client events sent to the voice endpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    /// Configure the session. Mandatory first message on every connection.
    #[serde(rename = "session.update")]
    SessionUpdate { session: SessionConfig },

    /// Append audio to the input buffer.
    #[serde(rename = "input_audio_buffer.append")]
    InputAudioBufferAppend {
        /// Base64-encoded PCM16 at 24 kHz.
        audio: String,
    },

    /// Start response generation.
    #[serde(rename = "response.create")]
    ResponseCreate,
}

impl ClientEvent {
    /// Build an append event from raw PCM bytes.
    pub fn audio_append(pcm: &[u8]) -> Self {
        ClientEvent::InputAudioBufferAppend {
            audio: BASE64_STANDARD.encode(pcm),
        }
    }
}

/// Server events received from the voice endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "session.created")]
    SessionCreated {},

    #[serde(rename = "session.updated")]
    SessionUpdated {},

    /// One chunk of response audio, base64 PCM16 at 24 kHz.
    #[serde(rename = "response.audio.delta")]
    AudioDelta { delta: String },

    /// Voice activity detected in the input buffer.
    #[serde(rename = "input_audio_buffer.speech_started")]
    SpeechStarted {},

    #[serde(rename = "response.created")]
    ResponseCreated {},

    #[serde(rename = "response.done")]
    ResponseDone {},

    #[serde(rename = "error")]
    Error { error: ApiError },

    /// Any other message type. Informational, never an error.
    #[serde(other)]
    Ignored,
}

/// Error details from the voice endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiError {
    #[serde(rename = "type", default)]
    pub error_type: String,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audio_append_serialization() {
        let event = ClientEvent::audio_append(&[0u8, 1, 2, 3]);
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("input_audio_buffer.append"));

        match event {
            ClientEvent::InputAudioBufferAppend { audio } => {
                assert_eq!(BASE64_STANDARD.decode(&audio).unwrap(), vec![0, 1, 2, 3]);
            }
            other => panic!("wrong event: {other:?}"),
        }
    }

    #[test]
    fn test_response_create_serialization() {
        let json = serde_json::to_string(&ClientEvent::ResponseCreate).unwrap();
        assert_eq!(json, r#"{"type":"response.create"}"#);
    }

    #[test]
    fn test_audio_delta_deserialization() {
        let json = r#"{"type":"response.audio.delta","response_id":"r1","delta":"AAAA"}"#;
        match serde_json::from_str::<ServerEvent>(json).unwrap() {
            ServerEvent::AudioDelta { delta } => assert_eq!(delta, "AAAA"),
            other => panic!("wrong event: {other:?}"),
        }
    }

    #[test]
    fn test_session_events_deserialize_with_extra_fields() {
        let created = r#"{"type":"session.created","session":{"id":"s1","model":"m"}}"#;
        assert!(matches!(
            serde_json::from_str::<ServerEvent>(created).unwrap(),
            ServerEvent::SessionCreated {}
        ));
        let updated = r#"{"type":"session.updated","session":{"id":"s1"}}"#;
        assert!(matches!(
            serde_json::from_str::<ServerEvent>(updated).unwrap(),
            ServerEvent::SessionUpdated {}
        ));
    }

    #[test]
    fn test_error_deserialization() {
        let json = r#"{"type":"error","error":{"type":"invalid_request_error","message":"bad"}}"#;
        match serde_json::from_str::<ServerEvent>(json).unwrap() {
            ServerEvent::Error { error } => {
                assert_eq!(error.error_type, "invalid_request_error");
                assert_eq!(error.message, "bad");
            }
            other => panic!("wrong event: {other:?}"),
        }
    }

    #[test]
    fn test_unknown_type_is_ignored() {
        let json = r#"{"type":"rate_limits.updated","rate_limits":[]}"#;
        assert!(matches!(
            serde_json::from_str::<ServerEvent>(json).unwrap(),
            ServerEvent::Ignored
        ));
    }
}
