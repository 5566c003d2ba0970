//! Configuration for the streaming synthesis session

use serde::{Deserialize, Serialize};

/// Default synthesis model identifier
pub const DEFAULT_MODEL_ID: &str = "eleven_turbo_v2";

/// Default output audio format (PCM16, 16kHz mono)
pub const DEFAULT_OUTPUT_FORMAT: &str = "pcm_16000";

/// Default streaming endpoint base; the voice id is appended as a path
/// segment and the credential always travels as a connection header
pub const DEFAULT_ENDPOINT: &str = "wss://api.elevenlabs.io/v1/text-to-speech";

fn default_endpoint() -> String {
    DEFAULT_ENDPOINT.to_string()
}

/// Voice rendering defaults sent in the session arming message
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct VoiceSettings {
    /// Speaking speed multiplier
    pub speed: f32,
    /// Voice stability (lower = more expressive)
    pub stability: f32,
    /// Similarity boost toward the reference voice
    pub similarity_boost: f32,
}

impl Default for VoiceSettings {
    fn default() -> Self {
        Self {
            speed: 1.0,
            stability: 0.3,
            similarity_boost: 0.7,
        }
    }
}

/// Streaming text-to-speech session configuration
///
/// The API credential is carried as a connection header and must never
/// appear in URLs or log output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynthesisConfig {
    /// API credential for the TTS backend
    pub api_key: String,

    /// Target voice identifier
    pub voice_id: String,

    /// Synthesis model identifier
    pub model_id: String,

    /// Output audio format selector
    pub output_format: String,

    /// Streaming endpoint base URL
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Voice rendering defaults
    #[serde(default)]
    pub voice_settings: VoiceSettings,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            voice_id: String::new(),
            model_id: DEFAULT_MODEL_ID.to_string(),
            output_format: DEFAULT_OUTPUT_FORMAT.to_string(),
            endpoint: default_endpoint(),
            voice_settings: VoiceSettings::default(),
        }
    }
}

impl SynthesisConfig {
    /// Create a configuration with the given credential and voice
    #[must_use]
    pub fn new(api_key: impl Into<String>, voice_id: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            voice_id: voice_id.into(),
            ..Self::default()
        }
    }

    /// Load configuration from environment variables
    ///
    /// Reads `ELEVENLABS_API_KEY`, `ARIA_VOICE_ID`, and optionally
    /// `ARIA_TTS_MODEL` / `ARIA_TTS_FORMAT` / `ARIA_TTS_ENDPOINT`.
    /// Missing variables leave the corresponding field at its default;
    /// validation happens at connect time, not here.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(key) = std::env::var("ELEVENLABS_API_KEY") {
            config.api_key = key;
        }
        if let Ok(voice) = std::env::var("ARIA_VOICE_ID") {
            config.voice_id = voice;
        }
        if let Ok(model) = std::env::var("ARIA_TTS_MODEL") {
            config.model_id = model;
        }
        if let Ok(format) = std::env::var("ARIA_TTS_FORMAT") {
            config.output_format = format;
        }
        if let Ok(endpoint) = std::env::var("ARIA_TTS_ENDPOINT") {
            config.endpoint = endpoint;
        }
        config
    }

    /// Check that the fields required to open a connection are present
    ///
    /// Returns a human-readable reason when they are not.
    pub(crate) fn validate_for_connect(&self) -> std::result::Result<(), String> {
        if self.api_key.trim().is_empty() {
            return Err("missing TTS API credential".to_string());
        }
        if self.voice_id.trim().is_empty() {
            return Err("missing target voice identifier".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_voice_settings_defaults() {
        let settings = VoiceSettings::default();
        assert!((settings.speed - 1.0).abs() < f32::EPSILON);
        assert!((settings.stability - 0.3).abs() < f32::EPSILON);
        assert!((settings.similarity_boost - 0.7).abs() < f32::EPSILON);
    }

    #[test]
    fn test_validate_missing_credential() {
        let config = SynthesisConfig::new("", "voice-a");
        let reason = config.validate_for_connect().unwrap_err();
        assert!(reason.contains("credential"));
    }

    #[test]
    fn test_validate_missing_voice() {
        let config = SynthesisConfig::new("key", "  ");
        let reason = config.validate_for_connect().unwrap_err();
        assert!(reason.contains("voice"));
    }

    #[test]
    fn test_validate_complete() {
        let config = SynthesisConfig::new("key", "voice-a");
        assert!(config.validate_for_connect().is_ok());
        assert_eq!(config.model_id, DEFAULT_MODEL_ID);
        assert_eq!(config.endpoint, DEFAULT_ENDPOINT);
    }
}
