//! Streaming speech synthesis session
//!
//! Owns a persistent WebSocket connection to the TTS backend and exposes
//! a small command surface (`connect`, `speak`, `pause`, `resume`,
//! `end_turn`, `disconnect`) plus two outbound streams: decoded audio
//! frames and protocol/lifecycle events. Both streams are bounded with a
//! drop-oldest policy so a slow consumer can never block the socket's
//! receive path.
//!
//! ## Session lifecycle
//!
//! ```text
//! Disconnected --connect()--> Connecting --(open + arming)--> Connected
//! Connected --speak/pause/resume--> Connected
//! Connected|Connecting --(close)--> Disconnected
//! Connected|Connecting --(failure)--> Failed
//! ```
//!
//! `Failed` is terminal until `connect()` is called again; there is no
//! automatic reconnection.

pub mod protocol;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::bounded::{bounded, BoundedReceiver, BoundedSender, OverflowPolicy};
use crate::config::SynthesisConfig;
use protocol::{
    build_arming_message, build_end_of_turn_message, build_pause_message, build_resume_message,
    build_synthesis_request, parse_text_frame, Inbound,
};

/// Event queue capacity (sized for short bursts)
const EVENT_QUEUE_CAPACITY: usize = 8;

/// Audio frame queue capacity
const FRAME_QUEUE_CAPACITY: usize = 32;

/// Maximum response-body bytes included in failure diagnostics
const BODY_PREVIEW_LEN: usize = 160;

/// One decoded PCM16 mono audio chunk, arrival-ordered
pub type AudioFrame = Vec<u8>;

/// Connection state of the synthesis session
///
/// Owned exclusively by the session; observed read-only through
/// [`LiveSynthesisSession::state`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// No connection
    Disconnected,
    /// Handshake in flight
    Connecting,
    /// Socket open and armed
    Connected {
        /// Backend session identifier, when one was supplied
        session_id: Option<String>,
    },
    /// Connection failed; terminal until the next `connect()`
    Failed {
        /// Human-readable failure reason
        reason: String,
    },
}

impl SessionState {
    /// Whether the session is currently connected
    #[must_use]
    pub const fn is_connected(&self) -> bool {
        matches!(self, Self::Connected { .. })
    }
}

/// Protocol and lifecycle events, delivered at-most-once per occurrence
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    /// The socket opened
    SocketOpen,
    /// Handshake completed
    Connected {
        /// Backend session identifier, when one was supplied
        session_id: Option<String>,
    },
    /// Backend-reported business-level error (non-fatal to the socket)
    RemoteError {
        code: Option<i64>,
        message: String,
    },
    /// Malformed or undecodable inbound message (non-fatal)
    ProtocolError {
        message: String,
    },
    /// The socket closed
    SocketClosed {
        code: u16,
        reason: String,
    },
    /// Transport failure; the session is `Failed`
    SocketFailure {
        error: String,
    },
    /// First audio chunk of the current turn arrived
    FirstAudio {
        /// Time-to-first-byte since the `speak()` call, in milliseconds
        ttfb_ms: u64,
        /// Size of the first chunk
        bytes: usize,
    },
    /// The backend finished transmitting the current turn
    EndOfTransmission,
    /// Unknown message shape, surfaced for observability
    Unhandled {
        raw: String,
    },
}

type WsSink = futures::stream::SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;

/// Per-turn TTFB bookkeeping; restamped only by `speak()`
#[derive(Debug, Default)]
struct TurnTiming {
    started_at: Option<Instant>,
    first_audio_seen: bool,
}

/// Inbound dispatch shared between the receive loop and the session
///
/// Factored out of the socket loop so inbound handling is testable
/// without a live connection.
struct InboundRouter {
    events: BoundedSender<ServerEvent>,
    frames: BoundedSender<AudioFrame>,
    state_tx: watch::Sender<SessionState>,
    connect_in_flight: Arc<AtomicBool>,
    timing: std::sync::Mutex<TurnTiming>,
}

impl InboundRouter {
    fn emit(&self, event: ServerEvent) {
        if let Some(dropped) = self.events.push(event) {
            tracing::debug!(?dropped, "event queue full, dropped oldest event");
        }
    }

    /// Restamp the turn-start timestamp and clear the first-audio flag
    fn begin_turn(&self) {
        if let Ok(mut timing) = self.timing.lock() {
            timing.started_at = Some(Instant::now());
            timing.first_audio_seen = false;
        }
    }

    /// Socket opened and armed: `Connecting` -> `Connected`
    fn on_open(&self, session_id: Option<String>) {
        self.state_tx.send_replace(SessionState::Connected {
            session_id: session_id.clone(),
        });
        self.connect_in_flight.store(false, Ordering::SeqCst);
        self.emit(ServerEvent::SocketOpen);
        self.emit(ServerEvent::Connected { session_id });
    }

    /// Dispatch one inbound text frame
    fn on_text(&self, text: &str) {
        match parse_text_frame(text) {
            Ok(Inbound::Audio { bytes, is_final }) => self.deliver_audio(bytes, is_final),
            Ok(Inbound::EndOfTransmission) => self.emit(ServerEvent::EndOfTransmission),
            Ok(Inbound::RemoteError { code, message }) => {
                tracing::warn!(?code, message, "backend reported error");
                self.emit(ServerEvent::RemoteError { code, message });
            }
            Ok(Inbound::Unhandled { raw }) => {
                tracing::trace!(raw, "unhandled server message shape");
                self.emit(ServerEvent::Unhandled { raw });
            }
            Err(message) => {
                tracing::warn!(message, "protocol error on inbound message");
                self.emit(ServerEvent::ProtocolError { message });
            }
        }
    }

    /// Dispatch one binary frame: raw PCM without a JSON envelope
    fn on_binary(&self, bytes: Vec<u8>) {
        self.deliver_audio(bytes, false);
    }

    fn deliver_audio(&self, bytes: Vec<u8>, is_final: bool) {
        let first = {
            let mut timing = match self.timing.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if timing.first_audio_seen {
                None
            } else {
                timing.first_audio_seen = true;
                Some(
                    timing
                        .started_at
                        .map_or(0, |t| t.elapsed().as_millis().try_into().unwrap_or(u64::MAX)),
                )
            }
        };

        if let Some(ttfb_ms) = first {
            tracing::debug!(ttfb_ms, bytes = bytes.len(), "first audio of turn");
            self.emit(ServerEvent::FirstAudio {
                ttfb_ms,
                bytes: bytes.len(),
            });
        }

        if let Some(dropped) = self.frames.push(bytes) {
            tracing::debug!(bytes = dropped.len(), "frame queue full, dropped oldest frame");
        }

        if is_final {
            self.emit(ServerEvent::EndOfTransmission);
        }
    }

    /// Socket closed: back to `Disconnected`
    fn on_close(&self, code: u16, reason: String) {
        tracing::debug!(code, reason, "synthesis socket closed");
        self.state_tx.send_replace(SessionState::Disconnected);
        self.connect_in_flight.store(false, Ordering::SeqCst);
        self.emit(ServerEvent::SocketClosed { code, reason });
    }

    /// Transport failure: terminal `Failed` state for this session
    fn on_failure(&self, error: String) {
        tracing::error!(error, "synthesis socket failure");
        self.state_tx.send_replace(SessionState::Failed {
            reason: error.clone(),
        });
        self.connect_in_flight.store(false, Ordering::SeqCst);
        self.emit(ServerEvent::SocketFailure { error });
    }
}

/// Persistent streaming connection to the TTS backend
pub struct LiveSynthesisSession {
    config: SynthesisConfig,
    state_tx: watch::Sender<SessionState>,
    connect_in_flight: Arc<AtomicBool>,
    sink: Arc<tokio::sync::Mutex<Option<WsSink>>>,
    router: Arc<InboundRouter>,
    events_rx: std::sync::Mutex<Option<BoundedReceiver<ServerEvent>>>,
    frames_rx: std::sync::Mutex<Option<BoundedReceiver<AudioFrame>>>,
    recv_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl LiveSynthesisSession {
    /// Create a session from configuration; no I/O happens until `connect`
    #[must_use]
    pub fn new(config: SynthesisConfig) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Disconnected);
        let connect_in_flight = Arc::new(AtomicBool::new(false));
        let (events_tx, events_rx) = bounded(EVENT_QUEUE_CAPACITY, OverflowPolicy::DropOldest);
        let (frames_tx, frames_rx) = bounded(FRAME_QUEUE_CAPACITY, OverflowPolicy::DropOldest);

        let router = Arc::new(InboundRouter {
            events: events_tx,
            frames: frames_tx,
            state_tx: state_tx.clone(),
            connect_in_flight: Arc::clone(&connect_in_flight),
            timing: std::sync::Mutex::new(TurnTiming::default()),
        });

        Self {
            config,
            state_tx,
            connect_in_flight,
            sink: Arc::new(tokio::sync::Mutex::new(None)),
            router,
            events_rx: std::sync::Mutex::new(Some(events_rx)),
            frames_rx: std::sync::Mutex::new(Some(frames_rx)),
            recv_task: std::sync::Mutex::new(None),
        }
    }

    /// Observe the session state stream
    #[must_use]
    pub fn state(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    /// Snapshot of the current state
    #[must_use]
    pub fn current_state(&self) -> SessionState {
        self.state_tx.borrow().clone()
    }

    /// Take the event stream; `None` after the first call
    #[must_use]
    pub fn take_events(&self) -> Option<BoundedReceiver<ServerEvent>> {
        self.events_rx.lock().ok().and_then(|mut slot| slot.take())
    }

    /// Take the decoded audio-frame stream; `None` after the first call
    #[must_use]
    pub fn take_frames(&self) -> Option<BoundedReceiver<AudioFrame>> {
        self.frames_rx.lock().ok().and_then(|mut slot| slot.take())
    }

    /// Open the streaming connection
    ///
    /// Validates the credential and voice id before any network I/O; a
    /// missing value transitions straight to `Failed`. Idempotent: when
    /// already connected or a connect attempt is in flight, returns the
    /// current state without a second handshake. The returned state is
    /// the snapshot taken before the async handshake completes; observe
    /// [`Self::state`] for the eventual `Connected`/`Failed` transition.
    pub async fn connect(&self) -> SessionState {
        if let Err(reason) = self.config.validate_for_connect() {
            tracing::warn!(reason, "synthesis session misconfigured");
            let failed = SessionState::Failed {
                reason: reason.clone(),
            };
            self.state_tx.send_replace(failed.clone());
            return failed;
        }

        let current = self.current_state();
        if current.is_connected() {
            return current;
        }
        if self.connect_in_flight.swap(true, Ordering::SeqCst) {
            return current;
        }

        self.state_tx.send_replace(SessionState::Connecting);

        let config = self.config.clone();
        let sink_slot = Arc::clone(&self.sink);
        let router = Arc::clone(&self.router);
        let task = tokio::spawn(async move {
            run_connection(config, sink_slot, router).await;
        });
        if let Ok(mut slot) = self.recv_task.lock() {
            *slot = Some(task);
        }

        self.current_state()
    }

    /// Request synthesis of `text`
    ///
    /// No-op unless connected. Restamps the turn-start timestamp used for
    /// the `FirstAudio` TTFB measurement. A transport-level send
    /// rejection emits a `ProtocolError` event and leaves the session
    /// state unchanged; the socket may still be healthy.
    pub async fn speak(&self, text: &str, flush: bool, latency_hint: Option<u32>) {
        if !self.current_state().is_connected() {
            tracing::trace!("speak ignored, session not connected");
            return;
        }
        self.router.begin_turn();
        let request = build_synthesis_request(text, flush, latency_hint);
        self.send_json(&request, "synthesis request").await;
    }

    /// Pause playback generation; no-op unless connected
    pub async fn pause(&self) {
        if !self.current_state().is_connected() {
            return;
        }
        self.send_json(&build_pause_message(), "pause control").await;
    }

    /// Resume playback generation; no-op unless connected
    pub async fn resume(&self) {
        if !self.current_state().is_connected() {
            return;
        }
        self.send_json(&build_resume_message(), "resume control").await;
    }

    /// Signal the end of the current turn (empty-text message)
    pub async fn end_turn(&self) {
        if !self.current_state().is_connected() {
            return;
        }
        self.send_json(&build_end_of_turn_message(), "end of turn").await;
    }

    /// Close the socket and return to `Disconnected`; safe from any state
    pub async fn disconnect(&self) {
        self.connect_in_flight.store(false, Ordering::SeqCst);
        if let Some(mut sink) = self.sink.lock().await.take() {
            let _ = sink
                .send(WsMessage::Close(Some(CloseFrame {
                    code: tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode::Normal,
                    reason: "client disconnect".into(),
                })))
                .await;
        }
        self.state_tx.send_replace(SessionState::Disconnected);
        tracing::debug!("synthesis session disconnected");
    }

    /// Disconnect and tear down delivery; the session is not reusable
    pub async fn close(&self) {
        self.disconnect().await;
        if let Some(task) = self.recv_task.lock().ok().and_then(|mut slot| slot.take()) {
            task.abort();
        }
        self.router.events.close();
        self.router.frames.close();
    }

    /// Serialize and send one outbound message on the active socket
    async fn send_json<T: serde::Serialize>(&self, message: &T, label: &str) {
        let json = match serde_json::to_string(message) {
            Ok(json) => json,
            Err(e) => {
                self.router.emit(ServerEvent::ProtocolError {
                    message: format!("failed to serialize {label}: {e}"),
                });
                return;
            }
        };

        let mut guard = self.sink.lock().await;
        let Some(sink) = guard.as_mut() else {
            tracing::trace!(label, "no active connection, message dropped");
            return;
        };
        if let Err(e) = sink.send(WsMessage::text(json)).await {
            tracing::warn!(error = %e, label, "outbound send failed");
            self.router.emit(ServerEvent::ProtocolError {
                message: format!("{label} send failed: {e}"),
            });
        }
    }
}

/// Handshake plus receive loop for one connection attempt
async fn run_connection(
    config: SynthesisConfig,
    sink_slot: Arc<tokio::sync::Mutex<Option<WsSink>>>,
    router: Arc<InboundRouter>,
) {
    // The voice id is a path segment; the credential never enters the URL
    let url = format!(
        "{}/{}/stream-input?model_id={}&output_format={}",
        config.endpoint, config.voice_id, config.model_id, config.output_format
    );

    let mut request = match url.into_client_request() {
        Ok(request) => request,
        Err(e) => {
            router.on_failure(format!("invalid endpoint: {e}"));
            return;
        }
    };
    let Ok(credential) = config.api_key.parse() else {
        router.on_failure("credential is not a valid header value".to_string());
        return;
    };
    request.headers_mut().insert("xi-api-key", credential);

    tracing::debug!(
        voice_id = config.voice_id,
        model_id = config.model_id,
        output_format = config.output_format,
        "connecting to synthesis backend"
    );

    let ws = match tokio_tungstenite::connect_async(request).await {
        Ok((ws, _response)) => ws,
        Err(e) => {
            router.on_failure(describe_handshake_failure(&e));
            return;
        }
    };

    let (mut ws_sink, mut ws_stream) = ws.split();

    // Arm the remote pipeline with voice-setting defaults before
    // reporting Connected.
    match serde_json::to_string(&build_arming_message(&config.voice_settings)) {
        Ok(json) => {
            if let Err(e) = ws_sink.send(WsMessage::text(json)).await {
                router.on_failure(format!("arming message send failed: {e}"));
                return;
            }
        }
        Err(e) => {
            router.on_failure(format!("arming message serialization failed: {e}"));
            return;
        }
    }

    // The sink must be in place before Connected is observable, so a
    // caller reacting to the state change can speak immediately.
    *sink_slot.lock().await = Some(ws_sink);
    router.on_open(None);

    while let Some(message) = ws_stream.next().await {
        match message {
            Ok(WsMessage::Text(text)) => router.on_text(text.as_str()),
            Ok(WsMessage::Binary(data)) => router.on_binary(data.to_vec()),
            Ok(WsMessage::Close(frame)) => {
                let (code, reason) = frame.map_or((1005, String::new()), |f| {
                    (u16::from(f.code), f.reason.to_string())
                });
                router.on_close(code, reason);
                break;
            }
            Ok(WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_)) => {
                // Handled by the transport
            }
            Err(e) => {
                router.on_failure(format!("receive error: {e}"));
                break;
            }
        }
    }

    sink_slot.lock().await.take();

    // The stream can end without a Close frame or receive error; leaving
    // the state Connected would make every later command a silent no-op.
    let still_connected = router.state_tx.borrow().is_connected();
    if still_connected {
        router.on_close(1006, "stream ended without close".to_string());
    }
    tracing::debug!("receive loop terminated");
}

/// Diagnostics for a failed handshake: status and a short body preview,
/// never the credential
fn describe_handshake_failure(error: &tokio_tungstenite::tungstenite::Error) -> String {
    use tokio_tungstenite::tungstenite::Error as WsError;
    match error {
        WsError::Http(response) => {
            let status = response.status();
            let preview = response
                .body()
                .as_deref()
                .map(|body| {
                    let text = String::from_utf8_lossy(body);
                    let mut preview = text.chars().take(BODY_PREVIEW_LEN).collect::<String>();
                    if text.chars().count() > BODY_PREVIEW_LEN {
                        preview.push_str("...");
                    }
                    preview
                })
                .unwrap_or_default();
            format!("handshake rejected: {status} {preview}")
        }
        other => format!("connection failed: {other}"),
    }
}
