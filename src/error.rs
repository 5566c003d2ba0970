//! Error types for the voice pipeline

use thiserror::Error;

/// Result type alias for voice pipeline operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the voice pipeline
///
/// Recoverable conditions that are part of normal session operation
/// (backend errors, malformed frames, connection failures) are not
/// errors here; they travel as [`crate::ServerEvent`]s and
/// [`crate::SessionState::Failed`].
#[derive(Debug, Error)]
pub enum Error {
    /// Audio device error (acquisition, read, release)
    #[error("audio error: {0}")]
    Audio(String),

    /// Reply generation error
    #[error("generation error: {0}")]
    Generation(String),
}
