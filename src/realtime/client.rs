//! Voice endpoint WebSocket client.
//!
//! Owns the outbound socket, the session-negotiation state machine, and the
//! receive loop. The connection sequence is linear with one conditional
//! retry edge: an authentication rejection during the handshake forces a
//! credential refresh and exactly one reconnect attempt before surfacing a
//! hard failure. On every successful open, including the retry, the first
//! message out is the mandatory `session.update`.
//!
//! # Thread safety
//!
//! Mutable state lives behind `Arc` wrappers shared with the spawned
//! connection task; the `connected` flag is an `AtomicBool` for lock-free
//! checks, and readiness is a `watch` channel so any number of waiters can
//! observe `session.updated` (or the connection dying first).

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, Message};
use url::Url;

use crate::audio::{AI_SAMPLE_RATE, is_silent};
use crate::bridge::events::{AudioFrame, ControlEvent};
use crate::errors::{BridgeError, BridgeResult};

use super::config::{ResponseTrigger, SessionConfig, VoiceSessionSettings};
use super::credentials::{Credential, CredentialProvider};
use super::messages::{ClientEvent, ServerEvent};

/// Channel capacity for outgoing client events.
const WS_CHANNEL_CAPACITY: usize = 256;

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Callback invoked with each decoded response audio delta (24 kHz PCM).
pub type AudioCallback =
    Arc<dyn Fn(AudioFrame) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Callback invoked with each non-audio control event.
pub type ControlCallback =
    Arc<dyn Fn(ControlEvent) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Negotiation progress as observed by `wait_until_ready` callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    /// Connected (or connecting), `session.updated` not yet seen.
    Pending,
    /// The service acknowledged the session configuration; audio may flow.
    Ready,
    /// The connection ended, normally or otherwise.
    Closed,
}

/// Connection parameters for the voice endpoint.
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    /// HTTPS endpoint of the service; rewritten to wss for the socket.
    pub endpoint: String,
    pub model: String,
    pub api_version: String,
    /// Agent-mode parameters, present only in agent deployments.
    pub agent_id: Option<String>,
    pub agent_project: Option<String>,
    /// Normalized-RMS threshold below which outbound frames are dropped.
    pub silence_threshold: f64,
    pub settings: VoiceSessionSettings,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            model: "gpt-4o-realtime-preview".to_string(),
            api_version: "2025-05-01-preview".to_string(),
            agent_id: None,
            agent_project: None,
            silence_threshold: crate::audio::DEFAULT_SILENCE_THRESHOLD,
            settings: VoiceSessionSettings::default(),
        }
    }
}

/// Open a connection with the bounded auth-retry policy: on an
/// authentication rejection, refresh the credential and dial exactly once
/// more. Any other failure class surfaces immediately.
pub(crate) async fn establish_with_retry<T, D, Fut>(
    credentials: &dyn CredentialProvider,
    mut dial: D,
) -> BridgeResult<T>
where
    D: FnMut(Credential) -> Fut,
    Fut: Future<Output = BridgeResult<T>>,
{
    let credential = credentials.credential().await?;
    match dial(credential).await {
        Ok(conn) => Ok(conn),
        Err(BridgeError::AuthenticationFailed(reason)) => {
            tracing::warn!(
                "Voice endpoint rejected credential ({}), refreshing and retrying once",
                reason
            );
            let credential = credentials.force_refresh().await?;
            dial(credential).await
        }
        Err(e) => Err(e),
    }
}

/// Shared pieces the receive loop needs to dispatch one server event.
pub(crate) struct EventContext {
    pub audio_callback: Arc<Mutex<Option<AudioCallback>>>,
    pub control_callback: Arc<Mutex<Option<ControlCallback>>>,
    pub ready: watch::Sender<ReadyState>,
    pub sender: mpsc::Sender<ClientEvent>,
    pub response_trigger: ResponseTrigger,
}

impl EventContext {
    async fn emit_control(&self, event: ControlEvent) {
        if let Some(cb) = self.control_callback.lock().await.as_ref() {
            cb(event).await;
        }
    }

    async fn request_response(&self) {
        if let Err(e) = self.sender.send(ClientEvent::ResponseCreate).await {
            tracing::warn!("Failed to queue response.create: {}", e);
        }
    }
}

/// Dispatch one inbound server event.
pub(crate) async fn handle_server_event(event: ServerEvent, ctx: &EventContext) {
    match event {
        ServerEvent::SessionCreated {} => {
            tracing::info!("Voice endpoint session created");
            if ctx.response_trigger == ResponseTrigger::OnSessionCreated {
                ctx.request_response().await;
            }
        }

        ServerEvent::SessionUpdated {} => {
            tracing::info!("Voice endpoint session configuration acknowledged");
            ctx.ready.send_replace(ReadyState::Ready);
            if ctx.response_trigger == ResponseTrigger::OnSessionUpdated {
                ctx.request_response().await;
            }
            ctx.emit_control(ControlEvent::SessionReady).await;
        }

        ServerEvent::AudioDelta { delta } => {
            // The whole delta is forwarded as one frame; chunking it with
            // artificial delays destabilizes downstream playback timing.
            match ServerEvent::decode_delta(&delta) {
                Ok(pcm) => {
                    if let Some(cb) = ctx.audio_callback.lock().await.as_ref() {
                        cb(AudioFrame::new(Bytes::from(pcm), AI_SAMPLE_RATE, 0, false)).await;
                    }
                }
                Err(e) => {
                    tracing::warn!("Failed to decode audio delta: {}", e);
                }
            }
        }

        ServerEvent::SpeechStarted {} => {
            tracing::info!("Voice activity detected, triggering barge-in");
            ctx.emit_control(ControlEvent::SpeechStarted).await;
        }

        ServerEvent::ResponseCreated {} => {
            tracing::debug!("Response generation started");
            ctx.emit_control(ControlEvent::ResponseStarted).await;
        }

        ServerEvent::ResponseDone {} => {
            tracing::debug!("Response generation completed");
            ctx.emit_control(ControlEvent::ResponseDone).await;
        }

        ServerEvent::Error { error } => {
            // Service-side errors degrade the session, they do not end it;
            // only loss of the transport itself closes the leg.
            tracing::error!(
                "Voice endpoint error: {} - {}",
                error.error_type,
                error.message
            );
            ctx.emit_control(ControlEvent::Error {
                code: error.code,
                message: error.message,
            })
            .await;
        }

        ServerEvent::Ignored => {
            ctx.emit_control(ControlEvent::Ignored).await;
        }
    }
}

impl ServerEvent {
    fn decode_delta(delta: &str) -> Result<Vec<u8>, base64::DecodeError> {
        use base64::prelude::*;
        BASE64_STANDARD.decode(delta)
    }
}

/// Client for the conversational voice endpoint.
pub struct RealtimeClient {
    config: EndpointConfig,
    credentials: Arc<dyn CredentialProvider>,
    connected: Arc<AtomicBool>,
    ready_tx: watch::Sender<ReadyState>,
    ready_rx: watch::Receiver<ReadyState>,
    ws_sender: Arc<Mutex<Option<mpsc::Sender<ClientEvent>>>>,
    audio_callback: Arc<Mutex<Option<AudioCallback>>>,
    control_callback: Arc<Mutex<Option<ControlCallback>>>,
    connection_handle: Arc<Mutex<Option<JoinHandle<()>>>>,
    client_request_id: String,
}

impl RealtimeClient {
    pub fn new(config: EndpointConfig, credentials: Arc<dyn CredentialProvider>) -> Self {
        let (ready_tx, ready_rx) = watch::channel(ReadyState::Pending);
        Self {
            config,
            credentials,
            connected: Arc::new(AtomicBool::new(false)),
            ready_tx,
            ready_rx,
            ws_sender: Arc::new(Mutex::new(None)),
            audio_callback: Arc::new(Mutex::new(None)),
            control_callback: Arc::new(Mutex::new(None)),
            connection_handle: Arc::new(Mutex::new(None)),
            client_request_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    /// Register the callback for decoded response audio. Set before
    /// `connect` so no early delta is missed.
    pub fn on_audio(&self, callback: AudioCallback) {
        if let Ok(mut guard) = self.audio_callback.try_lock() {
            *guard = Some(callback);
        } else {
            let cb = self.audio_callback.clone();
            tokio::spawn(async move {
                *cb.lock().await = Some(callback);
            });
        }
    }

    /// Register the callback for control events.
    pub fn on_control(&self, callback: ControlCallback) {
        if let Ok(mut guard) = self.control_callback.try_lock() {
            *guard = Some(callback);
        } else {
            let cb = self.control_callback.clone();
            tokio::spawn(async move {
                *cb.lock().await = Some(callback);
            });
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Open the socket, spawn the connection task, and send the mandatory
    /// session configuration. Idempotent while connected.
    pub async fn connect(&self) -> BridgeResult<()> {
        if self.connected.load(Ordering::SeqCst) {
            return Ok(());
        }

        let config = self.config.clone();
        let request_id = self.client_request_id.clone();
        let ws_stream = establish_with_retry(self.credentials.as_ref(), move |credential| {
            let config = config.clone();
            let request_id = request_id.clone();
            async move { open_socket(&config, credential, &request_id).await }
        })
        .await?;

        tracing::info!("Connected to voice endpoint");

        let (mut ws_sink, mut ws_stream) = ws_stream.split();
        let (tx, mut rx) = mpsc::channel::<ClientEvent>(WS_CHANNEL_CAPACITY);
        *self.ws_sender.lock().await = Some(tx.clone());

        let ctx = EventContext {
            audio_callback: self.audio_callback.clone(),
            control_callback: self.control_callback.clone(),
            ready: self.ready_tx.clone(),
            sender: tx,
            response_trigger: self.config.settings.response_trigger,
        };

        let connected = self.connected.clone();
        let ws_sender = self.ws_sender.clone();
        let ready = self.ready_tx.clone();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    Some(event) = rx.recv() => {
                        let json = match serde_json::to_string(&event) {
                            Ok(j) => j,
                            Err(e) => {
                                tracing::error!("Failed to serialize client event: {}", e);
                                continue;
                            }
                        };
                        if let Err(e) = ws_sink.send(Message::Text(json.into())).await {
                            tracing::error!("Failed to send to voice endpoint: {}", e);
                            break;
                        }
                    }

                    Some(msg) = ws_stream.next() => {
                        match msg {
                            Ok(Message::Text(text)) => {
                                match serde_json::from_str::<ServerEvent>(&text) {
                                    Ok(event) => handle_server_event(event, &ctx).await,
                                    Err(e) => {
                                        tracing::warn!("Failed to parse server event: {}", e);
                                    }
                                }
                            }
                            Ok(Message::Close(_)) => {
                                tracing::info!("Voice endpoint closed the connection");
                                break;
                            }
                            Ok(Message::Ping(data)) => {
                                if let Err(e) = ws_sink.send(Message::Pong(data)).await {
                                    tracing::error!("Failed to send pong: {}", e);
                                }
                            }
                            Err(e) => {
                                tracing::error!("Voice endpoint socket error: {}", e);
                                break;
                            }
                            _ => {}
                        }
                    }

                    else => break,
                }
            }

            connected.store(false, Ordering::SeqCst);
            ready.send_replace(ReadyState::Closed);
            *ws_sender.lock().await = None;
            tracing::info!("Voice endpoint connection task ended");
        });

        *self.connection_handle.lock().await = Some(handle);

        // Session configuration is mandatory on every connection, including
        // the auth-retry path, before any audio is accepted.
        let session = SessionConfig::from_settings(&self.config.settings);
        self.send_event(ClientEvent::SessionUpdate { session })
            .await?;

        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Wait until the service acknowledges the session, the connection dies,
    /// or the timeout elapses. This is the synchronization point after which
    /// audio flows without being dropped.
    pub async fn wait_until_ready(&self, timeout: Duration) -> BridgeResult<()> {
        let mut rx = self.ready_rx.clone();
        let outcome = tokio::time::timeout(timeout, async {
            rx.wait_for(|state| *state != ReadyState::Pending)
                .await
                .map(|state| *state)
        })
        .await;

        match outcome {
            Ok(Ok(ReadyState::Ready)) => Ok(()),
            Ok(Ok(_)) => Err(BridgeError::ConnectionFailed(
                "connection closed before session became ready".to_string(),
            )),
            Ok(Err(_)) => Err(BridgeError::NotConnected),
            Err(_) => Err(BridgeError::Timeout(format!(
                "session not ready within {:?}",
                timeout
            ))),
        }
    }

    /// Resolves when the connection task ends, however it ends.
    pub async fn closed(&self) {
        let mut rx = self.ready_rx.clone();
        let _ = rx.wait_for(|state| *state == ReadyState::Closed).await;
    }

    /// Forward caller audio (24 kHz PCM). No-op before the session is ready;
    /// silent frames are dropped to save bandwidth and to avoid triggering
    /// spurious voice-activity detection.
    pub async fn send_audio(&self, pcm: &[u8]) -> BridgeResult<()> {
        if !self.is_connected() || *self.ready_rx.borrow() != ReadyState::Ready {
            return Ok(());
        }
        if is_silent(pcm, self.config.silence_threshold) {
            return Ok(());
        }
        self.send_event(ClientEvent::audio_append(pcm)).await
    }

    /// Close the connection. Idempotent and safe to call concurrently from
    /// failure paths and normal shutdown.
    pub async fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.ready_tx.send_replace(ReadyState::Closed);
        *self.ws_sender.lock().await = None;
        if let Some(handle) = self.connection_handle.lock().await.take() {
            handle.abort();
            let _ = handle.await;
        }
        tracing::info!("Voice endpoint connection closed");
    }

    /// Mark the session connected and ready without a live socket, handing
    /// back the receiving end of the outgoing event channel so callers can
    /// observe what would have gone over the wire.
    #[cfg(test)]
    pub(crate) fn force_session_ready(&self) -> mpsc::Receiver<ClientEvent> {
        let (tx, rx) = mpsc::channel(WS_CHANNEL_CAPACITY);
        if let Ok(mut guard) = self.ws_sender.try_lock() {
            *guard = Some(tx);
        }
        self.connected.store(true, Ordering::SeqCst);
        self.ready_tx.send_replace(ReadyState::Ready);
        rx
    }

    async fn send_event(&self, event: ClientEvent) -> BridgeResult<()> {
        if let Some(sender) = self.ws_sender.lock().await.as_ref() {
            sender
                .send(event)
                .await
                .map_err(|e| BridgeError::WebSocketError(e.to_string()))
        } else {
            Err(BridgeError::NotConnected)
        }
    }
}

/// Build the wss URL for a connection attempt. API-key credentials travel as
/// a query parameter; bearer credentials as an `Authorization` header.
fn build_ws_url(config: &EndpointConfig, credential: &Credential) -> BridgeResult<Url> {
    let endpoint = config
        .endpoint
        .trim_end_matches('/')
        .replacen("https://", "wss://", 1)
        .replacen("http://", "ws://", 1);

    let mut url = Url::parse(&format!("{endpoint}/voice-agent/realtime"))
        .map_err(|e| BridgeError::InvalidConfiguration(format!("bad endpoint URL: {e}")))?;

    {
        let mut query = url.query_pairs_mut();
        query.append_pair("api-version", &config.api_version);
        query.append_pair("model", &config.model);
        if let Some(agent_id) = &config.agent_id {
            query.append_pair("agent_id", agent_id);
        }
        if let Some(project) = &config.agent_project {
            query.append_pair("agent-project-name", project);
        }
        if let Credential::ApiKey(key) = credential {
            query.append_pair("api-key", key);
        }
    }

    Ok(url)
}

async fn open_socket(
    config: &EndpointConfig,
    credential: Credential,
    request_id: &str,
) -> BridgeResult<WsStream> {
    let url = build_ws_url(config, &credential)?;
    let host = url
        .host_str()
        .ok_or_else(|| BridgeError::InvalidConfiguration("endpoint URL has no host".to_string()))?
        .to_string();

    let mut builder = http::Request::builder()
        .uri(url.as_str())
        .header("Host", host)
        .header("Connection", "Upgrade")
        .header("Upgrade", "websocket")
        .header("Sec-WebSocket-Version", "13")
        .header(
            "Sec-WebSocket-Key",
            tungstenite::handshake::client::generate_key(),
        )
        .header("x-ms-client-request-id", request_id);

    if let Credential::Bearer(token) = &credential {
        builder = builder.header("Authorization", format!("Bearer {token}"));
    }

    let request = builder
        .body(())
        .map_err(|e| BridgeError::ConnectionFailed(e.to_string()))?;

    match tokio_tungstenite::connect_async(request).await {
        Ok((stream, _response)) => Ok(stream),
        Err(tungstenite::Error::Http(response))
            if matches!(response.status().as_u16(), 401 | 403) =>
        {
            Err(BridgeError::AuthenticationFailed(format!(
                "handshake rejected with status {}",
                response.status()
            )))
        }
        Err(e) => Err(BridgeError::ConnectionFailed(e.to_string())),
    }
}
