pub mod audio_capture;
pub mod audio_sink;
pub mod codec;
pub mod config;
pub mod devices;
pub mod error;
pub mod playback;
pub mod protocol;
pub mod session;
pub mod transport;
pub mod turn;

pub use error::{Result, VoiceError};
pub use session::{start, SessionHandle, SessionListener, SessionState};
