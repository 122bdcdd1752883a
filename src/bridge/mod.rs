//! Call orchestrator: owns one telephony socket and one voice endpoint
//! connection and moves audio between them.
//!
//! One [`Bridge`] exists per telephone call. Startup overlaps the two legs:
//! the voice endpoint connection is established concurrently with the
//! telephony receive loop so early caller audio is not stalled behind the
//! handshake (the endpoint client drops frames until its session is ready,
//! which is the correct behavior for pre-roll).
//!
//! Teardown is funneled through [`Bridge::cleanup`], which is one-shot: the
//! first caller wins, every later call returns immediately. Order matters -
//! heartbeat first so no probe races the closing sockets, then the voice
//! endpoint, then the telephony writer.

pub mod events;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use axum::extract::ws::Message;
use futures_util::{Sink, Stream, StreamExt};
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::audio::{AI_SAMPLE_RATE, TELEPHONY_SAMPLE_RATE, is_silent, resample_pcm};
use crate::errors::{BridgeError, BridgeResult};
use crate::realtime::RealtimeClient;
use crate::telephony::messages::OutboundMessage;
use crate::telephony::transport::{SinkCommand, TelephonySink, run_heartbeat, run_writer};
use crate::telephony::TelephonyMessage;

use events::{AudioFrame, ControlEvent, SessionState};

/// Incoming frame count between progress log lines.
const FRAME_LOG_INTERVAL: u64 = 100;

/// Tunables for one bridged call.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// How often the heartbeat loop wakes up.
    pub heartbeat_interval: Duration,
    /// Idle time on the telephony leg before a probe is sent.
    pub idle_window: Duration,
    /// How long to wait for the voice session to become ready.
    pub ready_timeout: Duration,
    /// Participant identifier stamped on audio sent toward the caller.
    pub ai_participant_id: String,
    /// Normalized-RMS threshold below which caller frames are dropped
    /// before the resample step.
    pub silence_threshold: f64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(5),
            idle_window: Duration::from_secs(10),
            ready_timeout: Duration::from_secs(10),
            ai_participant_id: "voice-assistant".to_string(),
            silence_threshold: crate::audio::DEFAULT_SILENCE_THRESHOLD,
        }
    }
}

/// Build the envelope for one frame of response audio heading to the caller.
/// The frame arrives at 24 kHz and leaves at 16 kHz.
fn outbound_audio(frame: &AudioFrame, participant: &str) -> OutboundMessage {
    let pcm = resample_pcm(&frame.pcm, frame.sample_rate, TELEPHONY_SAMPLE_RATE);
    OutboundMessage::audio(&pcm, participant)
}

pub struct Bridge {
    config: BridgeConfig,
    ai: Arc<RealtimeClient>,
    sink: TelephonySink,
    writer_rx: AsyncMutex<Option<mpsc::Receiver<SinkCommand>>>,
    cleanup_started: Arc<AtomicBool>,
    state: parking_lot::Mutex<SessionState>,
    frames_received: AtomicU64,
    heartbeat: AsyncMutex<Option<JoinHandle<()>>>,
}

impl Bridge {
    pub fn new(ai: Arc<RealtimeClient>, config: BridgeConfig) -> Arc<Self> {
        let cleanup_started = Arc::new(AtomicBool::new(false));
        let (sink, writer_rx) = TelephonySink::channel(cleanup_started.clone());
        Arc::new(Self {
            config,
            ai,
            sink,
            writer_rx: AsyncMutex::new(Some(writer_rx)),
            cleanup_started,
            state: parking_lot::Mutex::new(SessionState::Idle),
            frames_received: AtomicU64::new(0),
            heartbeat: AsyncMutex::new(None),
        })
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    fn set_state(&self, next: SessionState) {
        let mut state = self.state.lock();
        debug!("Bridge state {:?} -> {:?}", *state, next);
        *state = next;
    }

    /// Drive one call to completion. Returns when either leg ends; all
    /// teardown has happened by the time this returns.
    ///
    /// Generic over the socket so the call flow can be driven end to end
    /// without a live upgrade.
    pub async fn run<S>(self: Arc<Self>, socket: S) -> BridgeResult<()>
    where
        S: Stream<Item = Result<Message, axum::Error>> + Sink<Message> + Send + Unpin + 'static,
        S::Error: std::fmt::Display + Send,
    {
        let writer_rx = self
            .writer_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| BridgeError::Internal("bridge already consumed".to_string()))?;

        self.set_state(SessionState::TelephonyConnected);
        let (ws_sink, mut ws_stream) = socket.split();

        let writer = tokio::spawn(run_writer(
            ws_sink,
            writer_rx,
            self.sink.stop_pending_flag(),
            self.sink.running_flag(),
            self.sink.health(),
        ));

        self.wire_callbacks();

        *self.heartbeat.lock().await = Some(tokio::spawn(run_heartbeat(
            self.sink.clone(),
            self.config.heartbeat_interval,
            self.config.idle_window,
            self.cleanup_started.clone(),
        )));

        // Establish the voice endpoint leg concurrently with the telephony
        // receive loop below.
        self.set_state(SessionState::AiConnecting);
        let mut ai_task = tokio::spawn({
            let bridge = self.clone();
            async move {
                bridge.ai.connect().await?;
                bridge.set_state(SessionState::AiNegotiating);
                bridge.ai.wait_until_ready(bridge.config.ready_timeout).await
            }
        });
        let mut ai_pending = true;

        loop {
            tokio::select! {
                result = &mut ai_task, if ai_pending => {
                    ai_pending = false;
                    match result {
                        Ok(Ok(())) => {
                            self.set_state(SessionState::AiReady);
                            info!("Voice session ready, audio flowing both ways");
                        }
                        Ok(Err(e)) => {
                            error!("Voice endpoint leg failed to start: {}", e);
                            break;
                        }
                        Err(e) => {
                            error!("Voice endpoint startup task panicked: {}", e);
                            break;
                        }
                    }
                }

                _ = self.ai.closed(), if !ai_pending => {
                    warn!("Voice endpoint connection ended, draining call");
                    break;
                }

                // Fatal send errors and failed probes flip the sink's running
                // state; without this arm the receive loop would keep
                // forwarding caller audio into a call nobody can hear.
                _ = self.sink.stopped() => {
                    warn!("Telephony leg stopped, draining call");
                    break;
                }

                msg = ws_stream.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            self.handle_telephony_text(&text).await;
                        }
                        Some(Ok(Message::Binary(data))) => {
                            // Bare PCM without an envelope, already 16 kHz.
                            self.sink.health().touch();
                            self.forward_caller_audio(&data).await;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            info!("Telephony socket closed");
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!("Telephony socket error: {}", e);
                            break;
                        }
                    }
                }
            }
        }

        if ai_pending {
            ai_task.abort();
        }
        self.cleanup().await;
        let _ = writer.await;
        Ok(())
    }

    /// Connect the voice endpoint callbacks to the telephony sink.
    fn wire_callbacks(self: &Arc<Self>) {
        let sink = self.sink.clone();
        let participant = self.config.ai_participant_id.clone();
        self.ai.on_audio(Arc::new(move |frame| {
            let sink = sink.clone();
            let participant = participant.clone();
            Box::pin(async move {
                let message = outbound_audio(&frame, &participant);
                if let Err(e) = sink.send_audio(message).await {
                    debug!("Dropping response audio: {}", e);
                }
            })
        }));

        let sink = self.sink.clone();
        self.ai.on_control(Arc::new(move |event| {
            let sink = sink.clone();
            Box::pin(async move {
                match event {
                    ControlEvent::SpeechStarted => {
                        // Barge-in: stop playback before any queued audio.
                        if let Err(e) = sink.send_stop().await {
                            debug!("Failed to send stop-playback: {}", e);
                        }
                    }
                    ControlEvent::Error { code, message } => {
                        warn!(
                            "Voice endpoint reported error (code {:?}): {}",
                            code, message
                        );
                    }
                    _ => {}
                }
            })
        }));
    }

    /// Decode one telephony envelope and act on it.
    async fn handle_telephony_text(&self, text: &str) {
        // Any inbound traffic is connection activity, decodable or not;
        // only real silence on the wire should age the heartbeat window.
        self.sink.health().touch();
        match TelephonyMessage::parse(text) {
            TelephonyMessage::AudioData { audio_data } => {
                let count = self.frames_received.fetch_add(1, Ordering::Relaxed) + 1;
                if count % FRAME_LOG_INTERVAL == 0 {
                    debug!(
                        "Received {} caller audio frames, latest timestamp {}",
                        count,
                        audio_data.timestamp.to_millis()
                    );
                }
                // Frames the media platform already marked silent carry no
                // speech; skip the resample and the network round trip.
                if audio_data.silent {
                    return;
                }
                let pcm = audio_data.decode();
                self.forward_caller_audio(&pcm).await;
            }
            TelephonyMessage::AudioMetadata { audio_metadata } => {
                info!(
                    "Media stream metadata: subscription {}, {} {} Hz x{}",
                    audio_metadata.subscription_id,
                    audio_metadata.encoding,
                    audio_metadata.sample_rate,
                    audio_metadata.channels
                );
            }
            TelephonyMessage::Unrecognized => {
                debug!("Ignoring unrecognized telephony message");
            }
        }
    }

    /// Upsample caller audio to the endpoint rate and forward it. Silent
    /// frames are dropped ahead of the resample step; the endpoint client
    /// drops whatever arrives before its session is ready.
    async fn forward_caller_audio(&self, pcm: &[u8]) {
        if is_silent(pcm, self.config.silence_threshold) {
            return;
        }
        let upsampled = resample_pcm(pcm, TELEPHONY_SAMPLE_RATE, AI_SAMPLE_RATE);
        if let Err(e) = self.ai.send_audio(&upsampled).await {
            warn!("Failed to forward caller audio: {}", e);
        }
    }

    /// Tear down both legs. One-shot: only the first caller does work, and
    /// the ordering is fixed - heartbeat, voice endpoint, telephony writer.
    pub async fn cleanup(&self) {
        if self.cleanup_started.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Cleaning up bridged call");
        self.set_state(SessionState::Draining);

        if let Some(handle) = self.heartbeat.lock().await.take() {
            handle.abort();
            let _ = handle.await;
        }

        self.ai.close().await;
        self.sink.close().await;

        self.set_state(SessionState::Closed);
        info!(
            "Call closed after {} caller audio frames",
            self.frames_received.load(Ordering::Relaxed)
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::realtime::{ClientEvent, EndpointConfig, StaticApiKey};
    use base64::prelude::*;
    use bytes::Bytes;
    use futures::channel::mpsc as futures_mpsc;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    fn test_bridge() -> Arc<Bridge> {
        let ai = Arc::new(RealtimeClient::new(
            EndpointConfig::default(),
            Arc::new(StaticApiKey::new("test-key")),
        ));
        Bridge::new(ai, BridgeConfig::default())
    }

    /// In-memory stand-in for the upgraded telephony socket.
    struct TestSocket {
        incoming: futures_mpsc::UnboundedReceiver<Result<Message, axum::Error>>,
        outgoing: futures_mpsc::UnboundedSender<Message>,
    }

    impl Stream for TestSocket {
        type Item = Result<Message, axum::Error>;

        fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
            Pin::new(&mut self.incoming).poll_next(cx)
        }
    }

    impl Sink<Message> for TestSocket {
        type Error = futures_mpsc::SendError;

        fn poll_ready(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Pin::new(&mut self.outgoing).poll_ready(cx)
        }

        fn start_send(mut self: Pin<&mut Self>, item: Message) -> Result<(), Self::Error> {
            Pin::new(&mut self.outgoing).start_send(item)
        }

        fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Pin::new(&mut self.outgoing).poll_flush(cx)
        }

        fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Pin::new(&mut self.outgoing).poll_close(cx)
        }
    }

    async fn wait_for_state(bridge: &Arc<Bridge>, wanted: SessionState) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while bridge.state() != wanted {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| {
            panic!("bridge never reached {wanted:?}, stuck at {:?}", bridge.state())
        });
    }

    #[tokio::test]
    async fn test_cleanup_runs_once_under_concurrency() {
        let bridge = test_bridge();
        let mut rx = bridge.writer_rx.lock().await.take().unwrap();

        let calls: Vec<_> = (0..8)
            .map(|_| {
                let bridge = bridge.clone();
                tokio::spawn(async move { bridge.cleanup().await })
            })
            .collect();
        for call in calls {
            call.await.unwrap();
        }

        assert_eq!(bridge.state(), SessionState::Closed);

        // Exactly one close command reached the writer channel.
        let mut closes = 0;
        while let Ok(cmd) = rx.try_recv() {
            if matches!(cmd, SinkCommand::Close) {
                closes += 1;
            }
        }
        assert_eq!(closes, 1);
    }

    #[tokio::test]
    async fn test_sends_refused_after_cleanup() {
        let bridge = test_bridge();
        bridge.cleanup().await;

        // The sink accepts the call but drops the frame.
        let mut rx = bridge.writer_rx.lock().await.take().unwrap();
        bridge
            .sink
            .send_audio(OutboundMessage::audio(&[1, 2, 3, 4], "ai"))
            .await
            .unwrap();
        // Only the close command from cleanup is in the channel.
        assert!(matches!(rx.try_recv().unwrap(), SinkCommand::Close));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_caller_audio_counted_and_silent_frames_skipped() {
        let bridge = test_bridge();

        let pcm = vec![5u8; 320];
        let frame = serde_json::json!({
            "kind": "AudioData",
            "audioData": {
                "data": BASE64_STANDARD.encode(&pcm),
                "timestamp": 1_700_000_000_000i64,
                "participantRawID": "caller-1",
                "silent": false,
            }
        });
        bridge.handle_telephony_text(&frame.to_string()).await;

        let silent = serde_json::json!({
            "kind": "AudioData",
            "audioData": {
                "data": BASE64_STANDARD.encode(&pcm),
                "timestamp": 1_700_000_000_020i64,
                "participantRawID": "caller-1",
                "silent": true,
            }
        });
        bridge.handle_telephony_text(&silent.to_string()).await;

        // Both frames count as received activity, silent or not.
        assert_eq!(bridge.frames_received.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_outbound_audio_downsamples_to_telephony_rate() {
        // 10 ms at 24 kHz: 240 samples, 480 bytes -> 160 samples, 320 bytes.
        let frame = AudioFrame::new(Bytes::from(vec![3u8; 480]), AI_SAMPLE_RATE, 0, false);
        let message = outbound_audio(&frame, "ai");
        let json = serde_json::to_value(&message).unwrap();
        let data = json["audioData"]["data"].as_str().unwrap();
        assert_eq!(BASE64_STANDARD.decode(data).unwrap().len(), 320);
    }

    #[tokio::test]
    async fn test_normal_call_flow_reaches_ready_and_forwards_audio() {
        let ai = Arc::new(RealtimeClient::new(
            EndpointConfig::default(),
            Arc::new(StaticApiKey::new("test-key")),
        ));
        let mut ai_rx = ai.force_session_ready();
        let bridge = Bridge::new(ai, BridgeConfig::default());

        let (in_tx, incoming) = futures_mpsc::unbounded();
        let (outgoing, _out_rx) = futures_mpsc::unbounded();
        let call = tokio::spawn(bridge.clone().run(TestSocket { incoming, outgoing }));

        // Metadata arrives first, while the voice leg finishes negotiating.
        let metadata = serde_json::json!({
            "kind": "AudioMetadata",
            "audioMetadata": {
                "subscriptionId": "sub-1",
                "encoding": "PCM",
                "sampleRate": 16_000,
                "channels": 1,
                "length": 640,
            }
        });
        in_tx
            .unbounded_send(Ok(Message::Text(metadata.to_string().into())))
            .unwrap();

        wait_for_state(&bridge, SessionState::AiReady).await;

        // 20 ms of clearly audible 16 kHz audio: 320 bytes in.
        let pcm = crate::audio::samples_to_pcm(&vec![5000i16; 160]);
        let frame = serde_json::json!({
            "kind": "AudioData",
            "audioData": {
                "data": BASE64_STANDARD.encode(&pcm),
                "timestamp": 1_700_000_000_000i64,
                "participantRawID": "caller-1",
                "silent": false,
            }
        });
        in_tx
            .unbounded_send(Ok(Message::Text(frame.to_string().into())))
            .unwrap();

        // It comes out the voice leg upsampled to 24 kHz: 480 bytes.
        let event = tokio::time::timeout(Duration::from_secs(2), ai_rx.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            ClientEvent::InputAudioBufferAppend { audio } => {
                assert_eq!(BASE64_STANDARD.decode(&audio).unwrap().len(), 480);
            }
            other => panic!("wrong event: {other:?}"),
        }

        // Caller hangs up; the bridge drains and closes both legs.
        in_tx.unbounded_send(Ok(Message::Close(None))).unwrap();
        call.await.unwrap().unwrap();
        assert_eq!(bridge.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_any_inbound_message_counts_as_activity() {
        let bridge = test_bridge();
        let health = bridge.sink.health();

        health.record_send_failure();
        bridge.handle_telephony_text(r#"{"kind":"DtmfData"}"#).await;
        assert_eq!(health.send_failures(), 0, "unrecognized envelope");

        health.record_send_failure();
        bridge
            .handle_telephony_text(
                r#"{"kind":"AudioMetadata","audioMetadata":{"subscriptionId":"s1","encoding":"PCM","sampleRate":16000,"channels":1,"length":640}}"#,
            )
            .await;
        assert_eq!(health.send_failures(), 0, "metadata envelope");
    }

    #[tokio::test]
    async fn test_unrecognized_and_metadata_messages_are_harmless() {
        let bridge = test_bridge();
        bridge.handle_telephony_text(r#"{"kind":"DtmfData"}"#).await;
        bridge.handle_telephony_text("not json at all").await;
        bridge
            .handle_telephony_text(
                r#"{"kind":"AudioMetadata","audioMetadata":{"subscriptionId":"s1","encoding":"PCM","sampleRate":16000,"channels":1,"length":640}}"#,
            )
            .await;
        assert_eq!(bridge.frames_received.load(Ordering::Relaxed), 0);
    }
}
