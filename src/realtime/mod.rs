//! Conversational voice endpoint leg: protocol, credentials, and client.

pub mod client;
pub mod config;
pub mod credentials;
pub mod messages;

pub use client::{AudioCallback, ControlCallback, EndpointConfig, ReadyState, RealtimeClient};
pub use config::{ResponseTrigger, SessionConfig, VoiceSessionSettings};
pub use credentials::{CachedBearer, Credential, CredentialProvider, StaticApiKey};
pub use messages::{ClientEvent, ServerEvent};
