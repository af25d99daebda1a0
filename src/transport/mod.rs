//! Connection to the remote speech model.
//!
//! Frames are handed to a [`FrameSender`] that exists before the connection
//! does; the transport drains the matching receiver only after `open()`
//! resolves, so frames captured while connecting are flushed in capture order.

pub mod websocket;

use crate::codec::AudioFrame;
use crate::config::SessionParams;
use crate::protocol::{ProtocolError, ServerEvent};
use thiserror::Error;
use tokio::sync::mpsc;

pub use websocket::LiveTransport;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("URL parsing error: {0}")]
    UrlParse(#[from] url::ParseError),
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("Session setup failed: {0}")]
    Handshake(String),
}

pub type FrameReceiver = mpsc::UnboundedReceiver<AudioFrame>;
pub type EventSender = mpsc::UnboundedSender<ServerEvent>;

/// Fire-and-forget producer side of the outbound audio queue
#[derive(Clone)]
pub struct FrameSender {
    tx: mpsc::UnboundedSender<AudioFrame>,
}

impl FrameSender {
    pub fn send_frame(&self, frame: AudioFrame) {
        if self.tx.send(frame).is_err() {
            log::trace!("Transport: Dropping frame, connection already closed");
        }
    }
}

/// Outbound queue: the sender goes to the capture pipeline, the receiver to
/// [`Transport::open`].
pub fn frame_channel() -> (FrameSender, FrameReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (FrameSender { tx }, rx)
}

/// A live connection. Dropping it must also close it.
pub trait TransportHandle: Send {
    /// Stop sending and receiving. Safe to call more than once.
    fn close(&mut self);
}

#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Open a session and start pumping `frames` out and server events into
    /// `events`. Resolves once the remote side accepted the session.
    async fn open(
        &self,
        params: &SessionParams,
        frames: FrameReceiver,
        events: EventSender,
    ) -> Result<Box<dyn TransportHandle>, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::INPUT_SAMPLE_RATE;

    #[tokio::test]
    async fn test_frames_queue_until_drained_in_order() {
        let (sender, mut rx) = frame_channel();
        for i in 0..5 {
            sender.send_frame(AudioFrame::new(vec![i], INPUT_SAMPLE_RATE));
        }
        for i in 0..5 {
            assert_eq!(rx.recv().await.unwrap().samples(), &[i]);
        }
    }

    #[test]
    fn test_send_after_close_is_silent() {
        let (sender, rx) = frame_channel();
        drop(rx);
        sender.send_frame(AudioFrame::new(vec![0; 16], INPUT_SAMPLE_RATE));
    }
}
