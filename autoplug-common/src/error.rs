//! Common error types for the autoplug workspace

use thiserror::Error;

/// Common result type for autoplug operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error types shared by the engine and its front-ends
#[derive(Error, Debug)]
pub enum Error {
    /// I/O operation error (wraps std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration loading or validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// TOML document could not be parsed
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// A capability string could not be parsed
    #[error("Caps parse error: {0}")]
    Caps(String),
}
