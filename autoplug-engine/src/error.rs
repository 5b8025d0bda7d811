//! Error types for autoplug-engine
//!
//! Variants follow the failure taxonomy of the engine:
//! - Recoverable/local: `Instantiate`, `Link`, `StateChange` (absorbed by
//!   the autoplugger, next candidate tried)
//! - Fatal/group-level: `NoCandidates`, `NoPlayableStream`,
//!   `SubtitleWithoutVideo`
//! - Shutdown: `Flushing` (expected, never reported as a failure)

use thiserror::Error;

/// Main error type for autoplug-engine
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Errors from the common crate (caps parsing, config files)
    #[error(transparent)]
    Common(#[from] autoplug_common::Error),

    /// A factory failed to create its element
    #[error("Failed to instantiate '{factory}': {reason}")]
    Instantiate { factory: String, reason: String },

    /// Linking an output port to a candidate's input failed
    #[error("Failed to link {src} to {sink}: {reason}")]
    Link {
        src: String,
        sink: String,
        reason: String,
    },

    /// Element refused a state change
    #[error("Element '{element}' failed state change: {reason}")]
    StateChange { element: String, reason: String },

    /// No factory can handle a required capability
    #[error("No element available for caps {0}")]
    NoCandidates(String),

    /// Group committed without any playable stream
    #[error("No playable stream found")]
    NoPlayableStream,

    /// Subtitle/subpicture stream without a video stream
    #[error("Subtitle stream found without a video stream")]
    SubtitleWithoutVideo,

    /// Operation aborted because the engine is shutting down
    #[error("Engine is flushing")]
    Flushing,

    /// Stream selection out of range
    #[error("Invalid stream selection: {0}")]
    InvalidSelection(String),

    /// Invalid state for operation
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// File I/O errors
    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Local failures are retried with the next candidate
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::Instantiate { .. } | Error::Link { .. } | Error::StateChange { .. }
        )
    }
}

/// Convenience Result type using autoplug-engine Error
pub type Result<T> = std::result::Result<T, Error>;
