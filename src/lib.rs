//! Aria Voice - real-time voice pipeline for AI assistants
//!
//! This library provides the interactive voice loop for an assistant:
//! - Microphone level extraction (normalized amplitude for visualizers)
//! - Live streaming speech synthesis over WebSocket
//! - Conversation orchestration (transcript, reply generation, speech requests)
//! - Reply sanitization for text-to-speech
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                       UI                             │
//! │   transcript  │  reply  │  level meter  │  errors   │
//! └────────────────────┬────────────────────────────────┘
//!                      │ watch channels
//! ┌────────────────────▼────────────────────────────────┐
//! │           ConversationOrchestrator                   │
//! │   TurnState  │  sanitizer  │  SpeechRequest stream  │
//! └──────┬──────────────────────────────┬───────────────┘
//!        │                              │
//! ┌──────▼───────────────┐   ┌──────────▼───────────────┐
//! │  AudioLevelSource     │   │  LiveSynthesisSession    │
//! │  mic → RMS → [0,1]    │   │  WebSocket TTS streaming │
//! └──────────────────────┘   └──────────────────────────┘
//! ```
//!
//! All observable state flows through `tokio::sync::watch` channels so a
//! late subscriber immediately sees the latest value; bursty streams
//! (server events, audio frames) use bounded drop-oldest queues so a slow
//! consumer can stall the UI but never the socket.

pub mod bounded;
pub mod capture;
pub mod config;
pub mod error;
pub mod level;
pub mod orchestrator;
pub mod sanitize;
pub mod session;

pub use bounded::{BoundedReceiver, BoundedSender, OverflowPolicy, bounded};
pub use capture::{
    AudioLevelSource, CpalRecorderProvider, Recorder, RecorderProvider, frame_level,
};
pub use config::{SynthesisConfig, VoiceSettings};
pub use error::{Error, Result};
pub use level::LevelSmoother;
pub use orchestrator::{ConversationOrchestrator, ReplyGenerator, SpeechRequest, TurnState};
pub use sanitize::sanitize_for_speech;
pub use session::{AudioFrame, LiveSynthesisSession, ServerEvent, SessionState};
