//! Internal representation of what flows between the two transport adapters.
//!
//! Both adapters decode their wire formats into [`AudioFrame`] and
//! [`ControlEvent`] values; the orchestrator only ever sees these types and
//! never touches raw JSON.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;

/// One unit of PCM audio moving through the bridge.
///
/// Ownership transfers to the orchestrator for the duration of one forwarding
/// call; frames are never buffered across calls.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// Signed 16-bit little-endian PCM.
    pub pcm: Bytes,
    /// Sample rate of `pcm` in Hz.
    pub sample_rate: u32,
    /// Channel count, always 1 for both legs.
    pub channels: u16,
    /// Source timestamp in milliseconds since epoch, 0 when unknown.
    pub source_timestamp_ms: i64,
    /// Whether the producer marked (or measured) this frame as silence.
    pub is_silence: bool,
}

impl AudioFrame {
    pub fn new(pcm: Bytes, sample_rate: u32, source_timestamp_ms: i64, is_silence: bool) -> Self {
        Self {
            pcm,
            sample_rate,
            channels: 1,
            source_timestamp_ms,
            is_silence,
        }
    }
}

/// Non-audio signals exchanged between the adapters and the orchestrator.
///
/// The set is closed: messages with an unrecognized discriminator map to
/// [`ControlEvent::Ignored`] instead of being dropped silently, so dispatch
/// stays exhaustive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlEvent {
    /// The AI session finished negotiation and accepts audio.
    SessionReady,
    /// Caller speech detected while AI audio may be playing (barge-in).
    SpeechStarted,
    /// AI response generation started.
    ResponseStarted,
    /// AI response generation completed.
    ResponseDone,
    /// Instruct the far end to flush queued playback immediately.
    StopPlayback,
    /// Liveness probe on the telephony leg.
    ConnectivityProbe,
    /// An error event surfaced by a remote endpoint. Does not by itself
    /// terminate the session.
    Error {
        code: Option<String>,
        message: String,
    },
    /// Recognized but informational message with no bridge-side effect.
    Ignored,
}

/// Lifecycle of one bridged call. Exactly one bridge instance exists per
/// telephone call and walks these states forward only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    TelephonyConnected,
    AiConnecting,
    AiNegotiating,
    AiReady,
    Draining,
    Closed,
}

/// Per-adapter liveness bookkeeping, updated on every successful send and
/// receive, inspected by the heartbeat loop.
#[derive(Debug)]
pub struct ConnectionHealth {
    last_activity: Mutex<Instant>,
    consecutive_send_failures: AtomicU32,
}

impl ConnectionHealth {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            last_activity: Mutex::new(Instant::now()),
            consecutive_send_failures: AtomicU32::new(0),
        })
    }

    /// Record activity on the connection.
    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
        self.consecutive_send_failures.store(0, Ordering::Relaxed);
    }

    /// Time since the last recorded activity.
    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    /// Record a failed send, returning the new consecutive failure count.
    pub fn record_send_failure(&self) -> u32 {
        self.consecutive_send_failures.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn send_failures(&self) -> u32 {
        self.consecutive_send_failures.load(Ordering::Relaxed)
    }
}
