//! Error types for the bot core

use thiserror::Error;

/// Main error type for the bot core
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Message parsing error: {0}")]
    MessageParse(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Connection closed by peer")]
    ConnectionClosed,

    #[error("Resource exhaustion: {0}")]
    Resource(String),

    #[error("State violation: {0}")]
    State(String),

    #[error("Permission denied")]
    PermissionDenied,

    #[error("Plugin load error: {0}")]
    PluginLoad(String),

    #[error("Argument error: {0}")]
    Argument(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
