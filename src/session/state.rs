//! Lifecycle states of a voice session

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created, nothing acquired yet
    Idle,
    /// Devices acquired, connection being opened
    Connecting,
    /// Connected, waiting for the model to respond
    Listening,
    /// Response audio is scheduled or playing
    Speaking,
    /// A fatal error occurred; always followed by `Closed`
    Error,
    /// Terminal. Every resource has been released.
    Closed,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Closed)
    }

    /// Connected and exchanging audio
    pub fn is_active(&self) -> bool {
        matches!(self, SessionState::Listening | SessionState::Speaking)
    }

    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (Idle, Connecting) => true,
            (Connecting, Listening) => true,
            (Listening, Speaking) | (Speaking, Listening) => true,
            (Error, Closed) => true,
            (Error, _) | (Closed, _) => false,
            (_, Error) | (_, Closed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "IDLE",
            SessionState::Connecting => "CONNECTING",
            SessionState::Listening => "LISTENING",
            SessionState::Speaking => "SPEAKING",
            SessionState::Error => "ERROR",
            SessionState::Closed => "CLOSED",
        };
        f.write_str(name)
    }
}
