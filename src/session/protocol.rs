//! Wire protocol for the streaming synthesis backend
//!
//! Outbound control messages are small JSON objects; inbound text frames
//! carry one of an `audio` payload (base64 PCM chunk with an optional
//! `isFinal` flag), a terminal marker, or error fields. Binary frames are
//! raw PCM and never pass through this parser.

use base64::Engine;
use serde::Serialize;

use crate::config::VoiceSettings;

/// Arming message sent immediately after socket open
///
/// A single-space text primes the remote pipeline and carries the voice
/// rendering defaults for the session.
#[derive(Debug, Serialize)]
pub struct ArmingMessage<'a> {
    pub text: &'static str,
    pub voice_settings: &'a VoiceSettings,
}

/// Build the post-open arming message
#[must_use]
pub fn build_arming_message(settings: &VoiceSettings) -> ArmingMessage<'_> {
    ArmingMessage {
        text: " ",
        voice_settings: settings,
    }
}

/// Synthesis request for one chunk of text
#[derive(Debug, Serialize)]
pub struct SynthesisRequest<'a> {
    pub text: &'a str,
    pub try_trigger_generation: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub flush: bool,
    /// Advisory latency hint; observed by the backend, never enforced here
    #[serde(skip_serializing_if = "Option::is_none")]
    pub optimize_streaming_latency: Option<u32>,
}

/// Build a synthesis request for `text`
#[must_use]
pub fn build_synthesis_request(text: &str, flush: bool, latency_hint: Option<u32>) -> SynthesisRequest<'_> {
    SynthesisRequest {
        text,
        try_trigger_generation: true,
        flush,
        optimize_streaming_latency: latency_hint,
    }
}

/// Playback control message (`pause` / `resume`)
#[derive(Debug, Serialize)]
pub struct ControlMessage {
    pub event: &'static str,
}

/// Build a pause control message
#[must_use]
pub const fn build_pause_message() -> ControlMessage {
    ControlMessage { event: "pause" }
}

/// Build a resume control message
#[must_use]
pub const fn build_resume_message() -> ControlMessage {
    ControlMessage { event: "resume" }
}

/// End-of-turn marker: an empty-text message
#[derive(Debug, Serialize)]
pub struct EndOfTurnMessage {
    pub text: &'static str,
}

/// Build the end-of-turn message
#[must_use]
pub const fn build_end_of_turn_message() -> EndOfTurnMessage {
    EndOfTurnMessage { text: "" }
}

// Inbound parsing

/// One parsed inbound text frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Decoded audio chunk; `is_final` marks the last chunk of a turn
    Audio { bytes: Vec<u8>, is_final: bool },
    /// Terminal marker without audio
    EndOfTransmission,
    /// Backend-reported error
    RemoteError { code: Option<i64>, message: String },
    /// Unknown message shape, surfaced for observability
    Unhandled { raw: String },
}

/// Parse one inbound text frame
///
/// Field precedence is first-match in the order audio, terminal marker,
/// error/message, unhandled. This mirrors observed backend behavior and
/// is an assumption, not a documented upstream contract.
///
/// # Errors
///
/// Returns a protocol-error message for non-parseable frames and for
/// audio payloads that are empty or fail transport decoding. These are
/// non-fatal: the caller logs them and keeps the socket open.
pub fn parse_text_frame(text: &str) -> std::result::Result<Inbound, String> {
    let value: serde_json::Value = serde_json::from_str(text)
        .map_err(|e| format!("malformed server message: {e}"))?;

    let is_final = value
        .get("isFinal")
        .and_then(serde_json::Value::as_bool)
        .unwrap_or(false);

    if let Some(audio) = value.get("audio").and_then(serde_json::Value::as_str) {
        if audio.is_empty() {
            return Err("empty audio payload".to_string());
        }
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(audio)
            .map_err(|e| format!("audio payload decode failed: {e}"))?;
        return Ok(Inbound::Audio { bytes, is_final });
    }

    if is_final || value.get("final").is_some() {
        return Ok(Inbound::EndOfTransmission);
    }

    if value.get("error").is_some() || value.get("message").is_some() {
        let code = value.get("code").and_then(serde_json::Value::as_i64);
        let message = value
            .get("message")
            .and_then(serde_json::Value::as_str)
            .or_else(|| value.get("error").and_then(serde_json::Value::as_str))
            .map_or_else(|| value.to_string(), ToString::to_string);
        return Ok(Inbound::RemoteError { code, message });
    }

    Ok(Inbound::Unhandled {
        raw: text.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(bytes: &[u8]) -> String {
        base64::engine::general_purpose::STANDARD.encode(bytes)
    }

    #[test]
    fn test_arming_message_shape() {
        let settings = VoiceSettings::default();
        let json = serde_json::to_string(&build_arming_message(&settings)).unwrap();
        assert!(json.contains("\"text\":\" \""));
        assert!(json.contains("voice_settings"));
        assert!(json.contains("stability"));
    }

    #[test]
    fn test_synthesis_request_shape() {
        let json = serde_json::to_string(&build_synthesis_request("hello", false, None)).unwrap();
        assert!(json.contains("\"text\":\"hello\""));
        assert!(json.contains("\"try_trigger_generation\":true"));
        assert!(!json.contains("flush"));
        assert!(!json.contains("optimize_streaming_latency"));
    }

    #[test]
    fn test_synthesis_request_with_flush_and_hint() {
        let json = serde_json::to_string(&build_synthesis_request("hi", true, Some(2))).unwrap();
        assert!(json.contains("\"flush\":true"));
        assert!(json.contains("\"optimize_streaming_latency\":2"));
    }

    #[test]
    fn test_control_messages() {
        assert_eq!(
            serde_json::to_string(&build_pause_message()).unwrap(),
            r#"{"event":"pause"}"#
        );
        assert_eq!(
            serde_json::to_string(&build_resume_message()).unwrap(),
            r#"{"event":"resume"}"#
        );
    }

    #[test]
    fn test_end_of_turn_message() {
        assert_eq!(
            serde_json::to_string(&build_end_of_turn_message()).unwrap(),
            r#"{"text":""}"#
        );
    }

    #[test]
    fn test_parse_audio_chunk() {
        let payload = encode(&[1, 2, 3, 4]);
        let frame = format!(r#"{{"audio": "{payload}"}}"#);
        assert_eq!(
            parse_text_frame(&frame).unwrap(),
            Inbound::Audio {
                bytes: vec![1, 2, 3, 4],
                is_final: false,
            }
        );
    }

    #[test]
    fn test_parse_final_audio_chunk() {
        let payload = encode(&[9, 9]);
        let frame = format!(r#"{{"audio": "{payload}", "isFinal": true}}"#);
        assert_eq!(
            parse_text_frame(&frame).unwrap(),
            Inbound::Audio {
                bytes: vec![9, 9],
                is_final: true,
            }
        );
    }

    #[test]
    fn test_parse_terminal_marker_without_audio() {
        assert_eq!(
            parse_text_frame(r#"{"audio": null, "isFinal": true}"#).unwrap(),
            Inbound::EndOfTransmission
        );
        assert_eq!(
            parse_text_frame(r#"{"final": true}"#).unwrap(),
            Inbound::EndOfTransmission
        );
    }

    #[test]
    fn test_parse_remote_error() {
        let parsed =
            parse_text_frame(r#"{"code": 1008, "message": "quota exceeded"}"#).unwrap();
        assert_eq!(
            parsed,
            Inbound::RemoteError {
                code: Some(1008),
                message: "quota exceeded".to_string(),
            }
        );
    }

    #[test]
    fn test_parse_error_field_only() {
        let parsed = parse_text_frame(r#"{"error": "bad voice"}"#).unwrap();
        assert!(
            matches!(parsed, Inbound::RemoteError { code: None, message } if message == "bad voice")
        );
    }

    #[test]
    fn test_parse_unknown_shape() {
        let parsed = parse_text_frame(r#"{"alignment": {"chars": []}}"#).unwrap();
        assert!(matches!(parsed, Inbound::Unhandled { .. }));
    }

    #[test]
    fn test_parse_malformed_frame() {
        assert!(parse_text_frame("not json at all").is_err());
    }

    #[test]
    fn test_parse_empty_audio_payload() {
        assert!(parse_text_frame(r#"{"audio": ""}"#).is_err());
    }

    #[test]
    fn test_parse_invalid_base64() {
        assert!(parse_text_frame(r#"{"audio": "!!!not-base64!!!"}"#).is_err());
    }

    #[test]
    fn test_audio_takes_precedence_over_error_fields() {
        let payload = encode(&[7]);
        let frame = format!(r#"{{"audio": "{payload}", "message": "ignored"}}"#);
        assert!(matches!(
            parse_text_frame(&frame).unwrap(),
            Inbound::Audio { .. }
        ));
    }
}
