//! Outbound half of the telephony leg.
//!
//! The WebSocket is owned by a single writer task; everything else talks to
//! it through [`TelephonySink`], which is cheap to clone and enforces the
//! send-gating rules (no sends once cleanup has started, stale audio dropped
//! after a barge-in). Keeping one writer per socket means there is never more
//! than one task doing raw I/O on the connection.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::Message;
use futures::{Sink, SinkExt};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::bridge::events::ConnectionHealth;
use crate::errors::{BridgeError, BridgeResult};
use crate::telephony::messages::OutboundMessage;

/// Channel capacity between the bridge and the writer task.
const SINK_CHANNEL_CAPACITY: usize = 256;

/// Commands accepted by the writer task.
#[derive(Debug)]
pub enum SinkCommand {
    /// A media frame. Dropped while a stop-playback is pending.
    Audio(String),
    /// A non-audio envelope (probe, metadata ack).
    Control(String),
    /// Barge-in: clears the pending flag and goes out ahead of stale audio.
    StopPlayback(String),
    /// Send a close frame and end the writer.
    Close,
}

/// Classification of a failed socket send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendErrorClass {
    /// Broken pipe or connection reset: the transport is unusable.
    Fatal,
    /// The peer closed; the receive loop will observe it and exit normally.
    Closed,
    /// Anything else: logged, the connection keeps going.
    Other,
}

/// Classify a send error by its message text, the only signal the transport
/// layer exposes uniformly.
pub fn classify_send_error(message: &str) -> SendErrorClass {
    let lower = message.to_lowercase();
    if lower.contains("broken pipe") || lower.contains("connection reset") {
        SendErrorClass::Fatal
    } else if lower.contains("closed") {
        SendErrorClass::Closed
    } else {
        SendErrorClass::Other
    }
}

/// Handle for sending frames to the telephony socket.
#[derive(Clone)]
pub struct TelephonySink {
    tx: mpsc::Sender<SinkCommand>,
    running: watch::Sender<bool>,
    cleanup_started: Arc<AtomicBool>,
    stop_pending: Arc<AtomicBool>,
    health: Arc<ConnectionHealth>,
}

impl TelephonySink {
    /// Create a sink and the command receiver for its writer task.
    pub fn channel(
        cleanup_started: Arc<AtomicBool>,
    ) -> (Self, mpsc::Receiver<SinkCommand>) {
        let (tx, rx) = mpsc::channel(SINK_CHANNEL_CAPACITY);
        let (running, _) = watch::channel(true);
        let sink = Self {
            tx,
            running,
            cleanup_started,
            stop_pending: Arc::new(AtomicBool::new(false)),
            health: ConnectionHealth::new(),
        };
        (sink, rx)
    }

    pub fn health(&self) -> Arc<ConnectionHealth> {
        self.health.clone()
    }

    pub fn is_running(&self) -> bool {
        *self.running.borrow()
    }

    pub fn mark_stopped(&self) {
        self.running.send_replace(false);
    }

    /// Resolves once the telephony leg is unusable, whether from a fatal
    /// send error in the writer, a failed connectivity probe, or an
    /// explicit close. The bridge awaits this to start teardown.
    pub async fn stopped(&self) {
        let mut rx = self.running.subscribe();
        let _ = rx.wait_for(|running| !running).await;
    }

    pub(crate) fn running_flag(&self) -> watch::Sender<bool> {
        self.running.clone()
    }

    pub(crate) fn stop_pending_flag(&self) -> Arc<AtomicBool> {
        self.stop_pending.clone()
    }

    /// Queue a media frame toward the caller.
    ///
    /// Sends are allowed before the AI session is ready (pre-roll and holding
    /// audio are legitimate during negotiation); the only gates are the
    /// cleanup flag and the socket still being writable.
    pub async fn send_audio(&self, message: OutboundMessage) -> BridgeResult<()> {
        if self.cleanup_started.load(Ordering::SeqCst) {
            debug!("Dropping outbound audio, cleanup in progress");
            return Ok(());
        }
        self.tx
            .send(SinkCommand::Audio(message.to_json()))
            .await
            .map_err(|_| BridgeError::NotConnected)
    }

    /// Send the stop-playback signal ahead of any queued audio. Audio frames
    /// already queued are stale the moment barge-in fires and are discarded
    /// by the writer.
    pub async fn send_stop(&self) -> BridgeResult<()> {
        if self.cleanup_started.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.stop_pending.store(true, Ordering::SeqCst);
        self.tx
            .send(SinkCommand::StopPlayback(
                OutboundMessage::stop_audio().to_json(),
            ))
            .await
            .map_err(|_| BridgeError::NotConnected)
    }

    /// Send a connectivity probe. A failure here means the writer task is
    /// gone, which the heartbeat loop treats as fatal.
    pub async fn send_probe(&self, sequence_number: i64) -> BridgeResult<()> {
        if !self.is_running() {
            return Err(BridgeError::NotConnected);
        }
        self.tx
            .send(SinkCommand::Control(
                OutboundMessage::connectivity_check(sequence_number).to_json(),
            ))
            .await
            .map_err(|_| BridgeError::NotConnected)
    }

    /// Ask the writer to emit a close frame and stop. Safe to call when the
    /// writer is already gone.
    pub async fn close(&self) {
        self.running.send_replace(false);
        let _ = self.tx.send(SinkCommand::Close).await;
    }
}

/// Writer task: drains sink commands into the socket.
///
/// Generic over the sink so the routing and error-classification rules can be
/// exercised without a live socket.
pub async fn run_writer<S>(
    mut ws: S,
    mut rx: mpsc::Receiver<SinkCommand>,
    stop_pending: Arc<AtomicBool>,
    running: watch::Sender<bool>,
    health: Arc<ConnectionHealth>,
) where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    while let Some(cmd) = rx.recv().await {
        let (payload, is_close) = match cmd {
            SinkCommand::Audio(json) => {
                if stop_pending.load(Ordering::SeqCst) {
                    debug!("Dropping queued audio frame behind a pending stop");
                    continue;
                }
                (Some(json), false)
            }
            SinkCommand::StopPlayback(json) => {
                stop_pending.store(false, Ordering::SeqCst);
                (Some(json), false)
            }
            SinkCommand::Control(json) => (Some(json), false),
            SinkCommand::Close => (None, true),
        };

        let result = match payload {
            Some(json) => ws.send(Message::Text(json.into())).await,
            None => ws.send(Message::Close(None)).await,
        };

        match result {
            Ok(()) => health.touch(),
            Err(e) => {
                let failures = health.record_send_failure();
                match classify_send_error(&e.to_string()) {
                    SendErrorClass::Fatal => {
                        warn!(
                            "Fatal telephony send error after {} consecutive failures: {}",
                            failures, e
                        );
                        running.send_replace(false);
                        break;
                    }
                    SendErrorClass::Closed => {
                        // Receive loop observes the close and exits normally.
                        debug!("Telephony socket closed during send: {}", e);
                    }
                    SendErrorClass::Other => {
                        error!("Error sending to telephony socket: {}", e);
                    }
                }
            }
        }

        if is_close {
            break;
        }
    }
    info!("Telephony writer task ended");
}

/// Heartbeat loop: when the connection has been idle past the window, send a
/// connectivity probe. Probe failure means the transport is unusable, not
/// transient, so the loop flips the running flag and exits.
pub async fn run_heartbeat(
    sink: TelephonySink,
    interval: Duration,
    idle_window: Duration,
    cleanup_started: Arc<AtomicBool>,
) {
    let health = sink.health();
    loop {
        tokio::time::sleep(interval).await;

        if cleanup_started.load(Ordering::SeqCst) || !sink.is_running() {
            break;
        }

        let idle = health.idle_for();
        if idle > idle_window {
            warn!(
                "No telephony activity for {:.1}s, sending connectivity probe",
                idle.as_secs_f64()
            );
            let sequence = (time::OffsetDateTime::now_utc().unix_timestamp_nanos()
                / 1_000_000) as i64;
            if sink.send_probe(sequence).await.is_err() {
                error!("Failed to send connectivity probe, stopping telephony leg");
                sink.mark_stopped();
                break;
            }
            health.touch();
        }
    }
    debug!("Heartbeat loop ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use futures::channel::mpsc as futures_mpsc;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    /// Sink whose every send fails like a dead TCP connection.
    struct BrokenPipeSink;

    impl Sink<Message> for BrokenPipeSink {
        type Error = String;

        fn poll_ready(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<(), String>> {
            Poll::Ready(Ok(()))
        }

        fn start_send(self: Pin<&mut Self>, _: Message) -> Result<(), String> {
            Err("Broken pipe (os error 32)".to_string())
        }

        fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<(), String>> {
            Poll::Ready(Ok(()))
        }

        fn poll_close(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<(), String>> {
            Poll::Ready(Ok(()))
        }
    }

    fn message_text(msg: &Message) -> String {
        match msg {
            Message::Text(t) => t.to_string(),
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    #[test]
    fn test_send_error_classification() {
        assert_eq!(classify_send_error("Broken pipe (os error 32)"), SendErrorClass::Fatal);
        assert_eq!(classify_send_error("Connection reset by peer"), SendErrorClass::Fatal);
        assert_eq!(
            classify_send_error("Trying to work with closed connection"),
            SendErrorClass::Closed
        );
        assert_eq!(classify_send_error("timed out"), SendErrorClass::Other);
    }

    #[tokio::test]
    async fn test_writer_forwards_frames_in_order() {
        let cleanup = Arc::new(AtomicBool::new(false));
        let (sink, rx) = TelephonySink::channel(cleanup);
        let (ws_tx, ws_rx) = futures_mpsc::unbounded::<Message>();

        sink.send_audio(OutboundMessage::audio(&[1, 2, 3, 4], "ai")).await.unwrap();
        sink.send_probe(7).await.unwrap();

        let writer = tokio::spawn(run_writer(
            ws_tx,
            rx,
            sink.stop_pending_flag(),
            sink.running_flag(),
            sink.health(),
        ));
        drop(sink);
        writer.await.unwrap();

        let frames: Vec<Message> = ws_rx.collect().await;
        assert_eq!(frames.len(), 2);
        assert!(message_text(&frames[0]).contains(r#""kind":"AudioData""#));
        assert!(message_text(&frames[1]).contains(r#""sequenceNumber":7"#));
    }

    #[tokio::test]
    async fn test_stop_playback_preempts_queued_audio() {
        let cleanup = Arc::new(AtomicBool::new(false));
        let (sink, rx) = TelephonySink::channel(cleanup);
        let (ws_tx, ws_rx) = futures_mpsc::unbounded::<Message>();

        // Two audio frames are queued before barge-in fires, one after.
        sink.send_audio(OutboundMessage::audio(&[1, 1, 1, 1], "ai")).await.unwrap();
        sink.send_audio(OutboundMessage::audio(&[2, 2, 2, 2], "ai")).await.unwrap();
        sink.send_stop().await.unwrap();
        sink.send_audio(OutboundMessage::audio(&[3, 3, 3, 3], "ai")).await.unwrap();

        let writer = tokio::spawn(run_writer(
            ws_tx,
            rx,
            sink.stop_pending_flag(),
            sink.running_flag(),
            sink.health(),
        ));
        drop(sink);
        writer.await.unwrap();

        let frames: Vec<Message> = ws_rx.collect().await;
        assert_eq!(frames.len(), 2);
        // The stop frame goes out first; the stale audio queued before it is
        // discarded, and audio after the stop flows again.
        assert!(message_text(&frames[0]).contains(r#""kind":"StopAudio""#));
        assert!(message_text(&frames[1]).contains(r#""kind":"AudioData""#));
    }

    #[tokio::test]
    async fn test_cleanup_gates_sends() {
        let cleanup = Arc::new(AtomicBool::new(true));
        let (sink, mut rx) = TelephonySink::channel(cleanup);

        sink.send_audio(OutboundMessage::audio(&[1, 2], "ai")).await.unwrap();
        sink.send_stop().await.unwrap();

        // Nothing was queued.
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_close_ends_writer_with_close_frame() {
        let cleanup = Arc::new(AtomicBool::new(false));
        let (sink, rx) = TelephonySink::channel(cleanup);
        let (ws_tx, ws_rx) = futures_mpsc::unbounded::<Message>();

        sink.close().await;
        assert!(!sink.is_running());

        let writer = tokio::spawn(run_writer(
            ws_tx,
            rx,
            sink.stop_pending_flag(),
            sink.running_flag(),
            sink.health(),
        ));
        drop(sink);
        writer.await.unwrap();

        let frames: Vec<Message> = ws_rx.collect().await;
        assert_eq!(frames.len(), 1);
        assert!(matches!(frames[0], Message::Close(None)));
    }

    #[tokio::test]
    async fn test_fatal_send_error_resolves_stopped() {
        let cleanup = Arc::new(AtomicBool::new(false));
        let (sink, rx) = TelephonySink::channel(cleanup);

        sink.send_audio(OutboundMessage::audio(&[1, 2, 3, 4], "ai"))
            .await
            .unwrap();

        let writer = tokio::spawn(run_writer(
            BrokenPipeSink,
            rx,
            sink.stop_pending_flag(),
            sink.running_flag(),
            sink.health(),
        ));

        // A waiter on the sink observes the fatal send without polling.
        tokio::time::timeout(Duration::from_secs(1), sink.stopped())
            .await
            .expect("stopped() never resolved after a fatal send error");
        assert!(!sink.is_running());
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_probe_fails_when_writer_gone() {
        let cleanup = Arc::new(AtomicBool::new(false));
        let (sink, rx) = TelephonySink::channel(cleanup);
        drop(rx);
        assert!(sink.send_probe(1).await.is_err());
    }
}
