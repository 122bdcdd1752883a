//! Session configuration for the voice endpoint.
//!
//! The wire shape of `session.update` is fixed by the service; the tunable
//! parts (voice, VAD thresholds, response trigger policy) come from
//! [`VoiceSessionSettings`], which the server config deserializes directly.

use serde::{Deserialize, Serialize};

use crate::audio::AI_SAMPLE_RATE;

/// When to fire `response.create` during session negotiation.
///
/// The service variants observed in the wild disagree on whether the first
/// response should be requested on `session.created` or only after
/// `session.updated`, so this is policy rather than a constant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseTrigger {
    /// Request the first response as soon as the session exists (default;
    /// matches agent-mode deployments where instructions are pre-configured).
    #[default]
    OnSessionCreated,
    /// Wait until the session configuration has been acknowledged.
    OnSessionUpdated,
    /// Never request a response; the service decides on its own.
    Never,
}

/// Tunable session parameters, with defaults suited to telephone audio.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceSessionSettings {
    pub voice_name: String,
    pub voice_type: String,
    pub voice_temperature: f32,
    pub vad_threshold: f32,
    /// Slightly more padding than the service default, for phone quality.
    pub vad_prefix_padding_ms: u32,
    /// Longer silence before ending a turn than the service default.
    pub vad_silence_duration_ms: u32,
    pub max_response_output_tokens: u32,
    pub response_trigger: ResponseTrigger,
}

impl Default for VoiceSessionSettings {
    fn default() -> Self {
        Self {
            voice_name: "en-US-Aria:DragonHDLatestNeural".to_string(),
            voice_type: "azure-standard".to_string(),
            voice_temperature: 0.7,
            vad_threshold: 0.3,
            vad_prefix_padding_ms: 300,
            vad_silence_duration_ms: 500,
            max_response_output_tokens: 200,
            response_trigger: ResponseTrigger::default(),
        }
    }
}

/// The `session` object of a `session.update` event.
#[derive(Debug, Clone, Serialize)]
pub struct SessionConfig {
    pub turn_detection: TurnDetection,
    pub input_audio_sampling_rate: u32,
    pub input_audio_noise_reduction: AudioProcessor,
    pub input_audio_echo_cancellation: AudioProcessor,
    pub voice: VoiceConfig,
    pub max_response_output_tokens: u32,
    pub modalities: Vec<String>,
}

impl SessionConfig {
    /// Build the session configuration sent on every connection, including
    /// reconnects. Audio toward the service is always 24 kHz.
    pub fn from_settings(settings: &VoiceSessionSettings) -> Self {
        Self {
            turn_detection: TurnDetection {
                detection_type: "azure_semantic_vad".to_string(),
                threshold: settings.vad_threshold,
                prefix_padding_ms: settings.vad_prefix_padding_ms,
                silence_duration_ms: settings.vad_silence_duration_ms,
                remove_filler_words: false,
            },
            input_audio_sampling_rate: AI_SAMPLE_RATE,
            input_audio_noise_reduction: AudioProcessor {
                processor_type: "azure_deep_noise_suppression".to_string(),
            },
            input_audio_echo_cancellation: AudioProcessor {
                processor_type: "server_echo_cancellation".to_string(),
            },
            voice: VoiceConfig {
                name: settings.voice_name.clone(),
                voice_type: settings.voice_type.clone(),
                temperature: settings.voice_temperature,
            },
            max_response_output_tokens: settings.max_response_output_tokens,
            modalities: vec!["text".to_string(), "audio".to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TurnDetection {
    #[serde(rename = "type")]
    pub detection_type: String,
    pub threshold: f32,
    pub prefix_padding_ms: u32,
    pub silence_duration_ms: u32,
    pub remove_filler_words: bool,
}

/// Server-side audio processing stage, selected by name.
#[derive(Debug, Clone, Serialize)]
pub struct AudioProcessor {
    #[serde(rename = "type")]
    pub processor_type: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct VoiceConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub voice_type: String,
    pub temperature: f32,
}
