//! Conversation orchestration
//!
//! Serializes utterance-to-reply-to-speech turns: consumes recognized
//! speech text, calls the external reply generator off the interactive
//! path, sanitizes the reply, and emits one speech request per completed
//! turn. Owns the cancel-replace policy for generation jobs and a
//! synthetic level pattern that gives a visualizer something to animate
//! while speech plays without real audio metering.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::sanitize::sanitize_for_speech;
use crate::Result;

/// Capacity of the outbound speech-request channel
const SPEECH_REQUEST_CAPACITY: usize = 8;

/// Cadence of the synthetic level pattern during playback
const SYNTHETIC_FRAME_INTERVAL: Duration = Duration::from_millis(120);

/// Amplitude pattern cycled while speech plays
const SYNTHETIC_PATTERN: [f32; 6] = [0.25, 0.55, 0.85, 0.6, 0.35, 0.7];

/// Smoothing constant for the synthetic pattern
const SYNTHETIC_SMOOTHING: f32 = 0.72;

/// Fallback when a generation failure carries no message
const GENERIC_GENERATION_ERROR: &str = "reply generation failed";

/// External reply-generation function, invoked once per utterance
#[async_trait]
pub trait ReplyGenerator: Send + Sync {
    /// Generate the assistant's reply to the user's utterance
    ///
    /// # Errors
    ///
    /// Returns an error when no reply could be produced; the orchestrator
    /// converts it into a user-visible message.
    async fn generate_reply(&self, text: &str) -> Result<String>;
}

/// UI-observable conversation turn state; single writer (the orchestrator)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TurnState {
    /// Most recent recognized transcript (including partials)
    pub last_transcript: Option<String>,
    /// Most recent completed reply, unsanitized
    pub last_reply: Option<String>,
    /// A generation job is in flight
    pub is_generating: bool,
    /// The playback layer reported speech in progress
    pub is_speaking: bool,
    /// Most recent recoverable error, cleared on the next transcript
    pub last_error: Option<String>,
}

/// One speech request per completed turn, consumed exactly once
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpeechRequest {
    /// Sanitized text to synthesize
    pub text: String,
    /// Correlation id echoed back through playback callbacks
    pub utterance_id: String,
}

/// Serializes conversation turns and owns generation-job cancellation
pub struct ConversationOrchestrator {
    reply: Arc<dyn ReplyGenerator>,
    state_tx: watch::Sender<TurnState>,
    levels_tx: watch::Sender<f32>,
    speech_tx: mpsc::Sender<SpeechRequest>,
    speech_rx: Mutex<Option<mpsc::Receiver<SpeechRequest>>>,
    generation: Mutex<Option<JoinHandle<()>>>,
    level_loop: Mutex<Option<JoinHandle<()>>>,
}

impl ConversationOrchestrator {
    /// Create an orchestrator over the given reply generator
    #[must_use]
    pub fn new(reply: Arc<dyn ReplyGenerator>) -> Self {
        let (state_tx, _) = watch::channel(TurnState::default());
        let (levels_tx, _) = watch::channel(0.0);
        let (speech_tx, speech_rx) = mpsc::channel(SPEECH_REQUEST_CAPACITY);
        Self {
            reply,
            state_tx,
            levels_tx,
            speech_tx,
            speech_rx: Mutex::new(Some(speech_rx)),
            generation: Mutex::new(None),
            level_loop: Mutex::new(None),
        }
    }

    /// Observe the turn state
    #[must_use]
    pub fn state(&self) -> watch::Receiver<TurnState> {
        self.state_tx.subscribe()
    }

    /// Snapshot of the current turn state
    #[must_use]
    pub fn current_state(&self) -> TurnState {
        self.state_tx.borrow().clone()
    }

    /// Observe the synthetic fallback level signal
    #[must_use]
    pub fn levels(&self) -> watch::Receiver<f32> {
        self.levels_tx.subscribe()
    }

    /// Take the speech-request stream; `None` after the first call
    #[must_use]
    pub fn take_speech_requests(&self) -> Option<mpsc::Receiver<SpeechRequest>> {
        self.speech_rx.lock().ok().and_then(|mut slot| slot.take())
    }

    /// Record a recognized transcript for live display
    ///
    /// Clears any prior error; does not trigger generation.
    pub fn on_user_transcript(&self, text: &str) {
        self.state_tx.send_modify(|state| {
            state.last_transcript = Some(text.to_string());
            state.last_error = None;
        });
    }

    /// Run one full turn for a completed utterance
    ///
    /// No-op on blank input. Cancels any in-flight generation job first
    /// (a new utterance always preempts a pending reply), then generates,
    /// sanitizes, and emits exactly one speech request on success.
    pub fn handle_user_utterance(&self, text: &str) {
        if text.trim().is_empty() {
            tracing::trace!("blank utterance ignored");
            return;
        }

        self.cancel_generation();

        self.state_tx.send_modify(|state| {
            state.is_generating = true;
            state.is_speaking = false;
            state.last_error = None;
        });

        let reply = Arc::clone(&self.reply);
        let state_tx = self.state_tx.clone();
        let speech_tx = self.speech_tx.clone();
        let utterance = text.to_string();

        let handle = tokio::spawn(async move {
            match reply.generate_reply(&utterance).await {
                Ok(raw) => {
                    let speech = sanitize_for_speech(&raw);
                    state_tx.send_modify(|state| {
                        state.last_reply = Some(raw);
                        state.is_generating = false;
                    });
                    if speech.is_empty() {
                        tracing::debug!("blank reply, no speech request emitted");
                        return;
                    }
                    let request = SpeechRequest {
                        text: speech,
                        utterance_id: Uuid::new_v4().to_string(),
                    };
                    tracing::debug!(utterance_id = request.utterance_id, "speech request emitted");
                    if speech_tx.send(request).await.is_err() {
                        tracing::warn!("speech request consumer dropped");
                    }
                }
                Err(e) => {
                    let mut message = e.to_string();
                    if message.trim().is_empty() {
                        message = GENERIC_GENERATION_ERROR.to_string();
                    }
                    tracing::warn!(error = message, "reply generation failed");
                    state_tx.send_modify(|state| {
                        state.is_generating = false;
                        state.is_speaking = false;
                        state.last_error = Some(message);
                    });
                }
            }
        });

        if let Ok(mut slot) = self.generation.lock() {
            *slot = Some(handle);
        }
    }

    /// Playback started: raise the speaking flag, animate the fallback level
    pub fn on_speech_started(&self) {
        self.state_tx.send_modify(|state| state.is_speaking = true);
        self.start_level_loop();
    }

    /// Playback finished: clear the flag, settle the level at zero
    pub fn on_speech_finished(&self) {
        self.stop_level_loop();
        self.state_tx.send_modify(|state| state.is_speaking = false);
    }

    /// Playback failed: like finished, plus a user-visible error
    pub fn on_speech_error(&self, error: &str) {
        self.stop_level_loop();
        self.state_tx.send_modify(|state| {
            state.is_speaking = false;
            state.last_error = Some(error.to_string());
        });
    }

    /// Surface a recoverable collaborator error without touching the
    /// generation/speaking flags
    pub fn report_error(&self, message: &str) {
        self.state_tx
            .send_modify(|state| state.last_error = Some(message.to_string()));
    }

    /// Cancel all background work and reset flags; call on teardown
    pub fn stop_all(&self) {
        self.cancel_generation();
        self.stop_level_loop();
        self.state_tx.send_modify(|state| {
            state.is_generating = false;
            state.is_speaking = false;
        });
        tracing::debug!("orchestrator stopped");
    }

    /// Cancel-replace: abort the in-flight generation job, if any
    fn cancel_generation(&self) {
        if let Some(handle) = self.generation.lock().ok().and_then(|mut slot| slot.take()) {
            if !handle.is_finished() {
                tracing::debug!("superseding in-flight generation job");
            }
            handle.abort();
        }
    }

    /// Cycle the synthetic amplitude pattern at a fixed cadence
    fn start_level_loop(&self) {
        let levels = self.levels_tx.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(SYNTHETIC_FRAME_INTERVAL);
            let mut value = 0.0f32;
            for target in SYNTHETIC_PATTERN.iter().copied().cycle() {
                interval.tick().await;
                value += SYNTHETIC_SMOOTHING * (target - value);
                let _ = levels.send(value.clamp(0.0, 1.0));
            }
        });
        if let Ok(mut slot) = self.level_loop.lock() {
            if let Some(previous) = slot.replace(handle) {
                previous.abort();
            }
        }
    }

    /// Stop the pattern loop and publish a final zero level
    fn stop_level_loop(&self) {
        if let Some(handle) = self.level_loop.lock().ok().and_then(|mut slot| slot.take()) {
            handle.abort();
        }
        let _ = self.levels_tx.send(0.0);
    }
}

impl Drop for ConversationOrchestrator {
    fn drop(&mut self) {
        self.stop_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    struct FixedReply(&'static str);

    #[async_trait]
    impl ReplyGenerator for FixedReply {
        async fn generate_reply(&self, _text: &str) -> Result<String> {
            Ok(self.0.to_string())
        }
    }

    struct FailingReply;

    #[async_trait]
    impl ReplyGenerator for FailingReply {
        async fn generate_reply(&self, _text: &str) -> Result<String> {
            Err(Error::Generation("model unavailable".to_string()))
        }
    }

    fn orchestrator(reply: impl ReplyGenerator + 'static) -> ConversationOrchestrator {
        ConversationOrchestrator::new(Arc::new(reply))
    }

    async fn wait_until_idle(orchestrator: &ConversationOrchestrator) {
        let mut state = orchestrator.state();
        tokio::time::timeout(Duration::from_secs(2), async {
            while state.borrow().is_generating {
                state.changed().await.expect("state channel open");
            }
        })
        .await
        .expect("generation settled");
    }

    #[tokio::test]
    async fn test_blank_utterance_is_noop() {
        let orch = orchestrator(FixedReply("hi"));
        let mut requests = orch.take_speech_requests().expect("first take");

        orch.handle_user_utterance("");
        orch.handle_user_utterance("   ");

        assert_eq!(orch.current_state(), TurnState::default());
        assert!(requests.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_transcript_updates_and_clears_error() {
        let orch = orchestrator(FixedReply("hi"));
        orch.report_error("stt glitch");
        assert!(orch.current_state().last_error.is_some());

        orch.on_user_transcript("hello there");
        let state = orch.current_state();
        assert_eq!(state.last_transcript.as_deref(), Some("hello there"));
        assert!(state.last_error.is_none());
        assert!(!state.is_generating);
    }

    #[tokio::test]
    async fn test_successful_turn_emits_sanitized_request() {
        let orch = orchestrator(FixedReply("**Sunny** today!"));
        let mut requests = orch.take_speech_requests().expect("first take");

        orch.handle_user_utterance("What is the weather");
        let request = tokio::time::timeout(Duration::from_secs(2), requests.recv())
            .await
            .expect("request arrives")
            .expect("channel open");

        assert_eq!(request.text, "Sunny today!");
        assert!(!request.utterance_id.is_empty());

        wait_until_idle(&orch).await;
        let state = orch.current_state();
        assert_eq!(state.last_reply.as_deref(), Some("**Sunny** today!"));
        assert!(state.last_error.is_none());
    }

    #[tokio::test]
    async fn test_generation_failure_records_error() {
        let orch = orchestrator(FailingReply);
        orch.handle_user_utterance("anything");
        wait_until_idle(&orch).await;

        let state = orch.current_state();
        assert!(!state.is_generating);
        assert!(!state.is_speaking);
        assert!(
            state
                .last_error
                .as_deref()
                .is_some_and(|e| e.contains("model unavailable"))
        );
    }

    #[tokio::test]
    async fn test_speech_callbacks_drive_flags_and_levels() {
        let orch = orchestrator(FixedReply("hi"));
        let levels = orch.levels();

        orch.on_speech_started();
        assert!(orch.current_state().is_speaking);

        // The synthetic loop publishes within a few frames
        tokio::time::sleep(Duration::from_millis(300)).await;
        let mid = *levels.borrow();
        assert!(mid > 0.0, "synthetic level never rose: {mid}");

        orch.on_speech_finished();
        assert!(!orch.current_state().is_speaking);
        assert!((*levels.borrow() - 0.0).abs() < f32::EPSILON);
    }

    #[tokio::test]
    async fn test_speech_error_sets_message() {
        let orch = orchestrator(FixedReply("hi"));
        orch.on_speech_started();
        orch.on_speech_error("playback device lost");

        let state = orch.current_state();
        assert!(!state.is_speaking);
        assert_eq!(state.last_error.as_deref(), Some("playback device lost"));
    }

    #[tokio::test]
    async fn test_stop_all_resets_flags() {
        let orch = orchestrator(FixedReply("hi"));
        orch.handle_user_utterance("question");
        orch.on_speech_started();
        orch.stop_all();

        let state = orch.current_state();
        assert!(!state.is_generating);
        assert!(!state.is_speaking);
    }
}
