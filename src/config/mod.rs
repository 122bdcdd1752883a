//! Configuration for the voicebridge server.
//!
//! Configuration comes from a YAML file or from environment variables (with
//! .env support through dotenvy). A YAML file, when given with `--config`, is
//! authoritative; otherwise environment variables over built-in defaults.
//! Validation happens on load so a misconfigured server fails at startup
//! rather than on the first call.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::bridge::BridgeConfig;
use crate::errors::{BridgeError, BridgeResult};
use crate::realtime::{
    CachedBearer, CredentialProvider, EndpointConfig, StaticApiKey, VoiceSessionSettings,
};

/// Connection parameters for the voice endpoint leg.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VoiceEndpointSettings {
    /// HTTPS endpoint of the voice service.
    pub endpoint: String,
    pub model: String,
    pub api_version: String,
    pub agent_id: Option<String>,
    pub agent_project: Option<String>,
    /// API-key auth mode. Takes precedence over `token_url` when both are set.
    pub api_key: Option<String>,
    /// Bearer auth mode: token endpoint to POST for an access token.
    pub token_url: Option<String>,
}

impl Default for VoiceEndpointSettings {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            model: "gpt-4o-realtime-preview".to_string(),
            api_version: "2025-05-01-preview".to_string(),
            agent_id: None,
            agent_project: None,
            api_key: None,
            token_url: None,
        }
    }
}

/// Call-control REST settings. Optional: without them the server still
/// bridges media but cannot answer calls itself.
#[derive(Debug, Clone, Deserialize)]
pub struct CallControlSettings {
    pub endpoint: String,
    pub access_token: String,
    #[serde(default = "default_call_api_version")]
    pub api_version: String,
}

fn default_call_api_version() -> String {
    "2024-09-15".to_string()
}

/// Per-call bridge tunables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BridgeTunables {
    /// Normalized-RMS threshold below which caller frames are dropped.
    pub silence_threshold: f64,
    pub heartbeat_interval_secs: u64,
    /// Idle time on the telephony leg before a connectivity probe.
    pub idle_window_secs: u64,
    /// How long to wait for the voice session to become ready.
    pub ready_timeout_secs: u64,
    pub ai_participant_id: String,
}

impl Default for BridgeTunables {
    fn default() -> Self {
        Self {
            silence_threshold: crate::audio::DEFAULT_SILENCE_THRESHOLD,
            heartbeat_interval_secs: 5,
            idle_window_secs: 10,
            ready_timeout_secs: 10,
            ai_participant_id: "voice-assistant".to_string(),
        }
    }
}

/// Server configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Public base URL of this server, used to derive callback and media
    /// streaming URLs handed to the call platform.
    pub base_url: String,
    pub voice: VoiceEndpointSettings,
    pub call_control: Option<CallControlSettings>,
    pub bridge: BridgeTunables,
    pub session: VoiceSessionSettings,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            base_url: String::new(),
            voice: VoiceEndpointSettings::default(),
            call_control: None,
            bridge: BridgeTunables::default(),
            session: VoiceSessionSettings::default(),
        }
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

impl ServerConfig {
    /// Load from environment variables over built-in defaults.
    pub fn from_env() -> BridgeResult<Self> {
        let mut config = Self::default();

        if let Some(host) = env_var("HOST") {
            config.host = host;
        }
        if let Some(port) = env_var("PORT") {
            config.port = port.parse().map_err(|_| {
                BridgeError::InvalidConfiguration(format!("PORT is not a number: {port}"))
            })?;
        }
        if let Some(base_url) = env_var("BASE_URL") {
            config.base_url = base_url;
        }

        if let Some(endpoint) = env_var("VOICE_ENDPOINT") {
            config.voice.endpoint = endpoint;
        }
        if let Some(model) = env_var("VOICE_MODEL") {
            config.voice.model = model;
        }
        if let Some(version) = env_var("VOICE_API_VERSION") {
            config.voice.api_version = version;
        }
        config.voice.agent_id = env_var("VOICE_AGENT_ID").or(config.voice.agent_id);
        config.voice.agent_project = env_var("VOICE_AGENT_PROJECT").or(config.voice.agent_project);
        config.voice.api_key = env_var("VOICE_API_KEY").or(config.voice.api_key);
        config.voice.token_url = env_var("VOICE_TOKEN_URL").or(config.voice.token_url);

        if let (Some(endpoint), Some(access_token)) = (
            env_var("CALL_CONTROL_ENDPOINT"),
            env_var("CALL_CONTROL_ACCESS_TOKEN"),
        ) {
            config.call_control = Some(CallControlSettings {
                endpoint,
                access_token,
                api_version: env_var("CALL_CONTROL_API_VERSION")
                    .unwrap_or_else(default_call_api_version),
            });
        }

        if let Some(threshold) = env_var("SILENCE_THRESHOLD") {
            config.bridge.silence_threshold = threshold.parse().map_err(|_| {
                BridgeError::InvalidConfiguration(format!(
                    "SILENCE_THRESHOLD is not a number: {threshold}"
                ))
            })?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Load from a YAML file.
    pub fn from_file(path: &Path) -> BridgeResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            BridgeError::InvalidConfiguration(format!("cannot read {}: {e}", path.display()))
        })?;
        let config: Self = serde_yaml::from_str(&text).map_err(|e| {
            BridgeError::InvalidConfiguration(format!("cannot parse {}: {e}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> BridgeResult<()> {
        if self.voice.endpoint.is_empty() {
            return Err(BridgeError::InvalidConfiguration(
                "voice endpoint is required".to_string(),
            ));
        }
        if self.voice.api_key.is_none() && self.voice.token_url.is_none() {
            return Err(BridgeError::InvalidConfiguration(
                "either an API key or a token URL is required for the voice endpoint".to_string(),
            ));
        }
        if self.call_control.is_some() && self.base_url.is_empty() {
            return Err(BridgeError::InvalidConfiguration(
                "base_url is required when call control is configured".to_string(),
            ));
        }
        if self.bridge.silence_threshold < 0.0 || self.bridge.silence_threshold > 1.0 {
            return Err(BridgeError::InvalidConfiguration(format!(
                "silence threshold must be within [0, 1], got {}",
                self.bridge.silence_threshold
            )));
        }
        Ok(())
    }

    /// Listen address.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Credential provider matching the configured auth mode.
    pub fn credential_provider(&self) -> BridgeResult<Arc<dyn CredentialProvider>> {
        if let Some(key) = &self.voice.api_key {
            Ok(Arc::new(StaticApiKey::new(key.clone())))
        } else if let Some(token_url) = &self.voice.token_url {
            Ok(Arc::new(CachedBearer::new(token_url.clone())))
        } else {
            Err(BridgeError::InvalidConfiguration(
                "no voice endpoint credentials configured".to_string(),
            ))
        }
    }

    /// Voice endpoint connection parameters for one call.
    pub fn endpoint_config(&self) -> EndpointConfig {
        EndpointConfig {
            endpoint: self.voice.endpoint.clone(),
            model: self.voice.model.clone(),
            api_version: self.voice.api_version.clone(),
            agent_id: self.voice.agent_id.clone(),
            agent_project: self.voice.agent_project.clone(),
            silence_threshold: self.bridge.silence_threshold,
            settings: self.session.clone(),
        }
    }

    /// Per-call bridge tunables.
    pub fn bridge_config(&self) -> BridgeConfig {
        BridgeConfig {
            heartbeat_interval: Duration::from_secs(self.bridge.heartbeat_interval_secs),
            idle_window: Duration::from_secs(self.bridge.idle_window_secs),
            ready_timeout: Duration::from_secs(self.bridge.ready_timeout_secs),
            ai_participant_id: self.bridge.ai_participant_id.clone(),
            silence_threshold: self.bridge.silence_threshold,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::realtime::ResponseTrigger;

    fn valid_yaml() -> &'static str {
        r#"
host: 127.0.0.1
port: 9090
base_url: https://bridge.example.com
voice:
  endpoint: https://voice.example.com
  api_key: k-123
  agent_id: agent-1
bridge:
  silence_threshold: 0.02
session:
  vad_threshold: 0.5
  response_trigger: on_session_updated
"#
    }

    #[test]
    fn test_yaml_parse_and_defaults() {
        let config: ServerConfig = serde_yaml::from_str(valid_yaml()).unwrap();
        config.validate().unwrap();

        assert_eq!(config.address(), "127.0.0.1:9090");
        assert_eq!(config.voice.agent_id.as_deref(), Some("agent-1"));
        // Unspecified fields keep their defaults.
        assert_eq!(config.voice.api_version, "2025-05-01-preview");
        assert_eq!(config.bridge.heartbeat_interval_secs, 5);
        assert_eq!(config.bridge.silence_threshold, 0.02);
        assert_eq!(config.session.vad_threshold, 0.5);
        assert_eq!(config.session.response_trigger, ResponseTrigger::OnSessionUpdated);
        assert_eq!(config.session.voice_temperature, 0.7);
    }

    #[test]
    fn test_validation_requires_credentials() {
        let mut config: ServerConfig = serde_yaml::from_str(valid_yaml()).unwrap();
        config.voice.api_key = None;
        assert!(matches!(
            config.validate(),
            Err(BridgeError::InvalidConfiguration(_))
        ));

        config.voice.token_url = Some("https://token.example.com".to_string());
        config.validate().unwrap();
    }

    #[test]
    fn test_validation_rejects_bad_threshold() {
        let mut config: ServerConfig = serde_yaml::from_str(valid_yaml()).unwrap();
        config.bridge.silence_threshold = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_requires_endpoint() {
        let config = ServerConfig::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bridge_config_durations() {
        let config: ServerConfig = serde_yaml::from_str(valid_yaml()).unwrap();
        let bridge = config.bridge_config();
        assert_eq!(bridge.heartbeat_interval, Duration::from_secs(5));
        assert_eq!(bridge.idle_window, Duration::from_secs(10));
    }
}
