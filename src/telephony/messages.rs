//! Telephony media streaming wire format.
//!
//! The telephony side speaks JSON envelopes discriminated by a `kind` field.
//! Inbound envelopes carry base64 PCM (`AudioData`) or stream metadata
//! (`AudioMetadata`); outbound envelopes carry AI audio back to the caller,
//! the `StopAudio` barge-in signal, and `connectivityCheck` liveness probes.
//!
//! Inbound payloads are deliberately forgiving: unknown `kind` values map to
//! [`TelephonyMessage::Unrecognized`], missing fields take defaults, and
//! malformed base64 decodes to an empty payload instead of failing the frame.

use std::sync::atomic::{AtomicBool, Ordering};

use base64::prelude::*;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;

static DECODE_ERROR_WARNED: AtomicBool = AtomicBool::new(false);

// =============================================================================
// Inbound messages
// =============================================================================

/// A decoded inbound telephony envelope.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind")]
pub enum TelephonyMessage {
    /// A media frame: base64 PCM plus timing and silence metadata.
    AudioData {
        #[serde(rename = "audioData")]
        audio_data: AudioDataPayload,
    },

    /// Stream format announcement, sent once when media starts. Informational.
    AudioMetadata {
        #[serde(rename = "audioMetadata")]
        audio_metadata: AudioMetadataPayload,
    },

    /// Any envelope whose `kind` we do not handle.
    #[serde(other)]
    Unrecognized,
}

impl TelephonyMessage {
    /// Parse a text frame. Anything that is not valid JSON or does not carry
    /// a `kind` discriminator becomes `Unrecognized` rather than an error.
    pub fn parse(text: &str) -> Self {
        serde_json::from_str(text).unwrap_or(TelephonyMessage::Unrecognized)
    }
}

/// Inner payload of an inbound `AudioData` envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct AudioDataPayload {
    /// Base64-encoded PCM16 at 16 kHz.
    #[serde(default)]
    pub data: String,

    /// Either milliseconds since epoch or an ISO-8601 string, depending on
    /// the emitting component.
    #[serde(default)]
    pub timestamp: Timestamp,

    #[serde(rename = "participantRawID", default)]
    pub participant_raw_id: String,

    /// Silence flag as computed by the sender.
    #[serde(default)]
    pub silent: bool,
}

impl AudioDataPayload {
    /// Decode the base64 payload, padding to a multiple of four first.
    ///
    /// Malformed base64 yields an empty buffer; the caller treats an empty
    /// payload as a silent frame.
    pub fn decode(&self) -> Vec<u8> {
        if self.data.is_empty() {
            return Vec::new();
        }
        let mut data = self.data.clone();
        let rem = data.len() % 4;
        if rem != 0 {
            data.push_str(&"=".repeat(4 - rem));
        }
        match BASE64_STANDARD.decode(&data) {
            Ok(bytes) => bytes,
            Err(e) => {
                if !DECODE_ERROR_WARNED.swap(true, Ordering::Relaxed) {
                    tracing::warn!(
                        "Base64 decode error in media frame (further warnings suppressed): {}",
                        e
                    );
                }
                Vec::new()
            }
        }
    }
}

/// Inner payload of an inbound `AudioMetadata` envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct AudioMetadataPayload {
    #[serde(rename = "subscriptionId", default)]
    pub subscription_id: String,
    #[serde(default)]
    pub encoding: String,
    #[serde(rename = "sampleRate", default)]
    pub sample_rate: u32,
    #[serde(default)]
    pub channels: u16,
    #[serde(default)]
    pub length: u64,
}

/// Media frame timestamps arrive either as integer milliseconds or as an
/// ISO-8601 string.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Timestamp {
    Millis(i64),
    Text(String),
}

impl Default for Timestamp {
    fn default() -> Self {
        Timestamp::Millis(0)
    }
}

impl Timestamp {
    /// Milliseconds since epoch; unparseable strings yield 0.
    pub fn to_millis(&self) -> i64 {
        match self {
            Timestamp::Millis(ms) => *ms,
            Timestamp::Text(s) => OffsetDateTime::parse(s, &Rfc3339)
                .map(|dt| (dt.unix_timestamp_nanos() / 1_000_000) as i64)
                .unwrap_or(0),
        }
    }
}

// =============================================================================
// Outbound messages
// =============================================================================

/// An outbound telephony envelope, serialized with the `kind` discriminator.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind")]
pub enum OutboundMessage {
    AudioData {
        #[serde(rename = "audioData")]
        audio_data: OutboundAudio,
    },

    StopAudio {
        #[serde(rename = "stopAudio")]
        stop_audio: StopAudioPayload,
    },

    #[serde(rename = "connectivityCheck")]
    ConnectivityCheck {
        #[serde(rename = "sequenceNumber")]
        sequence_number: i64,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct OutboundAudio {
    pub data: String,
    pub timestamp: String,
    #[serde(rename = "participantRawID")]
    pub participant_raw_id: String,
    pub silent: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct StopAudioPayload {
    pub timestamp: String,
}

impl OutboundMessage {
    /// Build an outbound media frame from raw 16 kHz PCM.
    ///
    /// The silence flag is computed as "empty or all-zero payload", matching
    /// what the receiver expects rather than an RMS measurement.
    pub fn audio(pcm: &[u8], participant: &str) -> Self {
        OutboundMessage::AudioData {
            audio_data: OutboundAudio {
                data: BASE64_STANDARD.encode(pcm),
                timestamp: now_iso8601_millis(),
                participant_raw_id: participant.to_string(),
                silent: pcm.is_empty() || pcm.iter().all(|&b| b == 0),
            },
        }
    }

    /// Build the barge-in signal that flushes queued playback at the far end.
    pub fn stop_audio() -> Self {
        OutboundMessage::StopAudio {
            stop_audio: StopAudioPayload {
                timestamp: now_iso8601_millis(),
            },
        }
    }

    /// Build a liveness probe.
    pub fn connectivity_check(sequence_number: i64) -> Self {
        OutboundMessage::ConnectivityCheck { sequence_number }
    }

    pub fn to_json(&self) -> String {
        // Serialization of these envelopes cannot fail: all fields are plain
        // strings, numbers, and booleans.
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Current UTC time as an ISO-8601 string with millisecond precision,
/// e.g. `2025-07-23T10:35:30.363Z`.
pub fn now_iso8601_millis() -> String {
    let format = format_description!(
        "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:3]Z"
    );
    OffsetDateTime::now_utc()
        .format(&format)
        .unwrap_or_default()
}
