//! Shared application state.

use std::sync::Arc;

use crate::calls::CallControlClient;
use crate::config::ServerConfig;
use crate::errors::BridgeResult;
use crate::realtime::CredentialProvider;

/// State shared across all request handlers. Cloning is cheap; everything
/// inside is reference counted.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    /// Credential source shared by every call so bearer tokens are fetched
    /// once, not per call.
    pub credentials: Arc<dyn CredentialProvider>,
    /// Present only when call control is configured.
    pub call_client: Option<Arc<CallControlClient>>,
}

impl AppState {
    pub fn new(config: ServerConfig) -> BridgeResult<Self> {
        let credentials = config.credential_provider()?;
        let call_client = config.call_control.as_ref().map(|cc| {
            Arc::new(CallControlClient::new(
                cc.endpoint.clone(),
                cc.access_token.clone(),
                cc.api_version.clone(),
            ))
        });
        Ok(Self {
            config: Arc::new(config),
            credentials,
            call_client,
        })
    }
}
