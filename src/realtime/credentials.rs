//! Credential acquisition for the voice endpoint.
//!
//! The endpoint accepts two authentication modes with otherwise identical
//! control flow: a static API key passed as a query parameter, and a bearer
//! token passed as an `Authorization` header. Both are modeled behind one
//! [`CredentialProvider`] strategy so the connection state machine has a
//! single code path, and a rejected credential can be refreshed explicitly.

use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use time::OffsetDateTime;

use crate::errors::{BridgeError, BridgeResult};

/// Tokens are considered expired this long before their advertised expiry so
/// a connection never starts with a token about to lapse mid-handshake.
const EXPIRY_SAFETY_MARGIN: Duration = Duration::from_secs(120);

/// Credential material for one connection attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    /// Sent as an `api-key` query parameter.
    ApiKey(String),
    /// Sent as `Authorization: Bearer <token>`.
    Bearer(String),
}

/// Source of credential material, with explicit refresh for the
/// one-retry-on-auth-rejection path.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Current credential, served from cache when still valid.
    async fn credential(&self) -> BridgeResult<Credential>;

    /// Discard any cached credential and fetch fresh material. Called after
    /// an authentication rejection.
    async fn force_refresh(&self) -> BridgeResult<Credential>;
}

/// Fixed API key. Refreshing returns the same key; if the service rejects
/// it, the failure is systemic and surfaces after the single retry.
pub struct StaticApiKey {
    key: String,
}

impl StaticApiKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }
}

#[async_trait]
impl CredentialProvider for StaticApiKey {
    async fn credential(&self) -> BridgeResult<Credential> {
        if self.key.is_empty() {
            return Err(BridgeError::InvalidConfiguration(
                "API key is empty".to_string(),
            ));
        }
        Ok(Credential::ApiKey(self.key.clone()))
    }

    async fn force_refresh(&self) -> BridgeResult<Credential> {
        self.credential().await
    }
}

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    expires_at: OffsetDateTime,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

/// Bearer tokens fetched from a token endpoint and cached until a
/// safety-margin expiry.
pub struct CachedBearer {
    token_url: String,
    client: reqwest::Client,
    cache: Mutex<Option<CachedToken>>,
}

impl CachedBearer {
    pub fn new(token_url: impl Into<String>) -> Self {
        Self {
            token_url: token_url.into(),
            client: reqwest::Client::new(),
            cache: Mutex::new(None),
        }
    }

    fn cached(&self) -> Option<String> {
        let guard = self.cache.lock();
        guard.as_ref().and_then(|t| {
            let margin = time::Duration::try_from(EXPIRY_SAFETY_MARGIN).ok()?;
            if t.expires_at - margin > OffsetDateTime::now_utc() {
                Some(t.token.clone())
            } else {
                None
            }
        })
    }

    async fn fetch(&self) -> BridgeResult<Credential> {
        let response = self
            .client
            .post(&self.token_url)
            .send()
            .await
            .map_err(|e| BridgeError::AuthenticationFailed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(BridgeError::AuthenticationFailed(format!(
                "token endpoint returned {}",
                response.status()
            )));
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| BridgeError::AuthenticationFailed(e.to_string()))?;

        let expires_at = OffsetDateTime::now_utc()
            + time::Duration::seconds(body.expires_in.unwrap_or(3600));
        *self.cache.lock() = Some(CachedToken {
            token: body.access_token.clone(),
            expires_at,
        });

        tracing::debug!("Fetched fresh bearer token, expires at {}", expires_at);
        Ok(Credential::Bearer(body.access_token))
    }
}

#[async_trait]
impl CredentialProvider for CachedBearer {
    async fn credential(&self) -> BridgeResult<Credential> {
        if let Some(token) = self.cached() {
            return Ok(Credential::Bearer(token));
        }
        self.fetch().await
    }

    async fn force_refresh(&self) -> BridgeResult<Credential> {
        *self.cache.lock() = None;
        self.fetch().await
    }
}
