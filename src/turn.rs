//! Accumulates streamed transcripts and turns them into chat-history records.

use chrono::{DateTime, Utc};
use std::fmt;

/// Which side of the conversation a transcript belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Speaker {
    /// Speech-to-text of the microphone
    User,
    /// Speech-to-text of the model's spoken reply
    Model,
}

impl fmt::Display for Speaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Speaker::User => write!(f, "user"),
            Speaker::Model => write!(f, "model"),
        }
    }
}

/// One finished spoken exchange
#[derive(Debug, Clone, PartialEq)]
pub struct Turn {
    pub user_text: String,
    pub model_text: String,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct TranscriptBuffer {
    pub inbound: String,
    pub outbound: String,
}

impl TranscriptBuffer {
    pub fn is_empty(&self) -> bool {
        self.inbound.is_empty() && self.outbound.is_empty()
    }

    fn side_mut(&mut self, speaker: Speaker) -> &mut String {
        match speaker {
            Speaker::User => &mut self.inbound,
            Speaker::Model => &mut self.outbound,
        }
    }

    fn take(&mut self) -> (String, String) {
        (
            std::mem::take(&mut self.inbound),
            std::mem::take(&mut self.outbound),
        )
    }
}

#[derive(Debug, Default)]
pub struct TurnAggregator {
    buffer: TranscriptBuffer,
}

impl TurnAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a delta and return the accumulated text for that side
    pub fn push_delta(&mut self, speaker: Speaker, text: &str) -> &str {
        let side = self.buffer.side_mut(speaker);
        side.push_str(text);
        side
    }

    /// Close the current turn. Returns a record only when both sides spoke;
    /// the buffers are cleared either way.
    pub fn complete(&mut self) -> Option<Turn> {
        let (user_text, model_text) = self.buffer.take();
        if user_text.is_empty() || model_text.is_empty() {
            if !user_text.is_empty() || !model_text.is_empty() {
                log::debug!(
                    "Turn: Dropping one-sided turn (user: {} chars, model: {} chars)",
                    user_text.len(),
                    model_text.len()
                );
            }
            return None;
        }

        Some(Turn {
            user_text,
            model_text,
            completed_at: Utc::now(),
        })
    }

    /// Discard the in-progress exchange
    pub fn interrupt(&mut self) {
        self.buffer.take();
    }

    pub fn buffer(&self) -> &TranscriptBuffer {
        &self.buffer
    }
}
