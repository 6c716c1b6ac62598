//! Error types for the voice SDK.

use thiserror::Error;
use voicelink_protocol::ProtocolError;

/// Errors surfaced by voice connections and the connection manager.
#[derive(Error, Debug)]
pub enum VoiceError {
    #[error("Voice connection is not connected")]
    NotConnected,

    #[error("Timeout exceeded: {0}")]
    Timeout(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("No secret key installed on the audio transport")]
    MissingSecretKey,

    #[error("Voice gateway error: {0}")]
    Gateway(String),

    #[error("Operation cancelled")]
    Cancelled,
}

impl From<tokio_tungstenite::tungstenite::Error> for VoiceError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        VoiceError::Gateway(e.to_string())
    }
}

/// Errors raised by audio sources.
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Seek target {target_ms} ms is out of bounds")]
    OutOfBounds { target_ms: i128 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
