use crate::codec::FramingError;
use crate::config::ConfigError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, VoiceError>;

#[derive(Error, Debug)]
pub enum VoiceError {
    /// Microphone permission denied or no usable device. The session never opens.
    #[error("Audio device unavailable: {0}")]
    DeviceUnavailable(String),

    /// Transport failed to open or dropped. Never retried.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Malformed audio payload. The offending frame is dropped.
    #[error("Framing error: {0}")]
    Framing(#[from] FramingError),

    /// Error reported by the remote session.
    #[error("Remote session error: {0}")]
    Remote(String),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl VoiceError {
    /// Everything except framing errors ends the session.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, VoiceError::Framing(_))
    }
}
