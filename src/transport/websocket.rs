use super::{EventSender, FrameReceiver, Transport, TransportError, TransportHandle};
use crate::config::{ApiConfig, SessionParams};
use crate::protocol::{ClientMessage, ServerEvent, ServerMessage};
use futures_util::{SinkExt, StreamExt};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tokio_util::sync::CancellationToken;
use url::Url;

/// Websocket transport for the hosted live speech API
pub struct LiveTransport {
    endpoint: String,
    api: ApiConfig,
}

impl LiveTransport {
    pub fn new(endpoint: impl Into<String>, api: ApiConfig) -> Self {
        Self {
            endpoint: endpoint.into(),
            api,
        }
    }

    fn url(&self) -> Result<Url, TransportError> {
        let mut url = Url::parse(&self.endpoint)?;
        url.query_pairs_mut().append_pair("key", self.api.api_key());
        Ok(url)
    }
}

struct LiveConnection {
    cancel: CancellationToken,
    writer: Option<JoinHandle<()>>,
    reader: Option<JoinHandle<()>>,
}

impl TransportHandle for LiveConnection {
    fn close(&mut self) {
        if self.cancel.is_cancelled() {
            return;
        }
        log::info!("Transport: Closing connection");
        self.cancel.cancel();
        // The writer sends a close frame on cancellation; the reader has
        // nothing left to deliver.
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        self.writer.take();
    }
}

impl Drop for LiveConnection {
    fn drop(&mut self) {
        self.close();
    }
}

#[async_trait::async_trait]
impl Transport for LiveTransport {
    async fn open(
        &self,
        params: &SessionParams,
        mut frames: FrameReceiver,
        events: EventSender,
    ) -> Result<Box<dyn TransportHandle>, TransportError> {
        let url = self.url()?;
        log::info!("Transport: Connecting to {}", self.endpoint);

        let (ws_stream, response) = connect_async(url.as_str()).await?;
        log::debug!("Transport: WebSocket connected, status: {}", response.status());
        let (mut write, mut read) = ws_stream.split();

        let setup = ClientMessage::setup(params).to_json()?;
        write.send(Message::Text(setup.into())).await?;
        log::debug!(
            "Transport: Sent setup (model: {}, voice: {})",
            params.model,
            params.voice
        );

        // Nothing else is meaningful until the server accepts the setup
        loop {
            let message = match read.next().await {
                Some(Ok(Message::Text(text))) => ServerMessage::parse(&text.to_string())?,
                Some(Ok(Message::Binary(data))) => ServerMessage::parse_bytes(data.as_slice())?,
                Some(Ok(Message::Close(frame))) => {
                    let reason = frame
                        .map(|f| f.reason.to_string())
                        .unwrap_or_else(|| "closed during setup".to_string());
                    return Err(TransportError::Handshake(reason));
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e.into()),
                None => {
                    return Err(TransportError::Handshake(
                        "connection ended during setup".to_string(),
                    ))
                }
            };
            if message.is_setup_complete() {
                log::info!("Transport: Session setup complete");
                break;
            }
        }

        let cancel = CancellationToken::new();

        let writer_cancel = cancel.clone();
        let writer = tokio::spawn(async move {
            let mut frame_count = 0usize;
            loop {
                tokio::select! {
                    biased;
                    _ = writer_cancel.cancelled() => break,
                    frame = frames.recv() => {
                        let Some(frame) = frame else { break };
                        frame_count += 1;
                        let json = match ClientMessage::audio(&frame).to_json() {
                            Ok(json) => json,
                            Err(e) => {
                                log::warn!("Transport: Failed to encode frame {}: {}", frame_count, e);
                                continue;
                            }
                        };
                        log::trace!(
                            "Transport: Sending frame {} ({} samples)",
                            frame_count,
                            frame.len()
                        );
                        if let Err(e) = write.send(Message::Text(json.into())).await {
                            log::warn!("Transport: Failed to send frame {}: {}", frame_count, e);
                            break;
                        }
                    }
                }
            }
            log::debug!("Transport: Writer exiting after {} frames", frame_count);
            let _ = write.close().await;
        });

        let reader_cancel = cancel.clone();
        let reader = tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    biased;
                    _ = reader_cancel.cancelled() => break,
                    next = read.next() => next,
                };
                let message = match next {
                    Some(Ok(Message::Text(text))) => ServerMessage::parse(&text.to_string()),
                    Some(Ok(Message::Binary(data))) => ServerMessage::parse_bytes(data.as_slice()),
                    Some(Ok(Message::Close(frame))) => {
                        let event = match frame {
                            Some(f) if f.code != CloseCode::Normal => {
                                ServerEvent::Error(format!("{} ({})", f.reason, f.code))
                            }
                            Some(f) => ServerEvent::Closed(Some(f.reason.to_string())),
                            None => ServerEvent::Closed(None),
                        };
                        log::info!("Transport: Server closed connection: {:?}", event);
                        let _ = events.send(event);
                        break;
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        log::error!("Transport: WebSocket error: {}", e);
                        let _ = events.send(ServerEvent::ConnectionLost(e.to_string()));
                        break;
                    }
                    None => {
                        // A clean close always arrives as a Close frame first
                        log::error!("Transport: Stream ended without a close frame");
                        let _ = events.send(ServerEvent::ConnectionLost(
                            "stream ended without a close frame".to_string(),
                        ));
                        break;
                    }
                };

                match message {
                    Ok(message) => {
                        if message.go_away.is_some() {
                            log::warn!("Transport: Server announced it will disconnect soon");
                        }
                        for event in message.into_events() {
                            if events.send(event).is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        log::warn!("Transport: Failed to parse server message: {}", e);
                    }
                }
            }
            log::debug!("Transport: Reader exiting");
        });

        Ok(Box::new(LiveConnection {
            cancel,
            writer: Some(writer),
            reader: Some(reader),
        }))
    }
}
