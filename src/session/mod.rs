//! Session controller: one live conversation from device acquisition to
//! teardown.
//!
//! All inbound traffic (server events and playback completions) is handled on
//! a single task, so no two events are ever processed concurrently. Resources
//! live in [`SessionResources`], shared with the [`SessionHandle`] so that
//! `close()` can release them synchronously from any thread.

pub mod state;

pub use state::SessionState;

use crate::audio_capture::{AudioInput, CaptureConfig, CapturePipeline, SpeakingGate};
use crate::audio_sink::OutputConfig;
use crate::codec::decode;
use crate::config::SessionConfig;
use crate::devices::AudioBackend;
use crate::error::VoiceError;
use crate::playback::{AudioOutput, BufferId, PlaybackClock, PlaybackEvent, PlaybackScheduler};
use crate::protocol::ServerEvent;
use crate::transport::{frame_channel, Transport, TransportHandle};
use crate::turn::{Speaker, Turn, TurnAggregator};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Capture windows buffered between the device callback and the pipeline
const WINDOW_QUEUE: usize = 32;

/// Receives everything the session wants to tell the outside world
pub trait SessionListener: Send + Sync {
    fn on_status_change(&self, state: SessionState);

    /// A finished exchange where both sides spoke
    fn on_turn_complete(&self, turn: &Turn);

    /// Accumulated text of one side after every delta
    fn on_transcript(&self, _speaker: Speaker, _text: &str) {}

    /// A fatal error, reported just before the session moves to `Error`
    fn on_error(&self, _error: &VoiceError) {}
}

/// Everything a session holds open. Released at most once.
#[derive(Default)]
struct SessionResources {
    released: bool,
    input: Option<Box<dyn AudioInput>>,
    capture_task: Option<JoinHandle<()>>,
    transport: Option<Box<dyn TransportHandle>>,
    output: Option<Box<dyn AudioOutput>>,
}

impl SessionResources {
    /// Keep the input, unless the session was already released, in which case
    /// it is closed on the spot. Returns whether it was kept.
    fn attach_input(&mut self, mut input: Box<dyn AudioInput>) -> bool {
        if self.released {
            input.close();
            return false;
        }
        self.input = Some(input);
        true
    }

    fn attach_output(&mut self, mut output: Box<dyn AudioOutput>) -> bool {
        if self.released {
            output.close();
            return false;
        }
        self.output = Some(output);
        true
    }

    fn attach_capture_task(&mut self, task: JoinHandle<()>) -> bool {
        if self.released {
            task.abort();
            return false;
        }
        self.capture_task = Some(task);
        true
    }

    fn attach_transport(&mut self, mut transport: Box<dyn TransportHandle>) -> bool {
        if self.released {
            transport.close();
            return false;
        }
        self.transport = Some(transport);
        true
    }

    /// Microphone first (its callback is stopped before anything else goes
    /// away), then the pipeline, the connection and finally the speaker.
    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        if let Some(mut input) = self.input.take() {
            input.close();
        }
        if let Some(task) = self.capture_task.take() {
            task.abort();
        }
        if let Some(mut transport) = self.transport.take() {
            transport.close();
        }
        if let Some(mut output) = self.output.take() {
            output.close();
        }
        log::info!("Session: Resources released");
    }
}

/// State shared by the controller task and the handle
struct Shared {
    resources: Mutex<SessionResources>,
    state: watch::Sender<SessionState>,
    listener: Arc<dyn SessionListener>,
    cancel: CancellationToken,
}

impl Shared {
    fn resources(&self) -> MutexGuard<'_, SessionResources> {
        // A panic while holding the lock must not prevent release
        self.resources
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn release(&self) {
        self.resources().release();
    }

    fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Move to `next` if the state machine allows it, notifying the listener.
    fn transition(&self, next: SessionState) -> bool {
        let mut previous = None;
        self.state.send_if_modified(|current| {
            if current.can_transition_to(next) {
                previous = Some(*current);
                *current = next;
                true
            } else {
                false
            }
        });

        match previous {
            Some(previous) => {
                log::info!("Session: {} -> {}", previous, next);
                self.listener.on_status_change(next);
                true
            }
            None => false,
        }
    }

    fn with_output(&self, f: impl FnOnce(&mut dyn AudioOutput)) {
        if let Some(output) = self.resources().output.as_mut() {
            f(output.as_mut());
        }
    }
}

/// Channels and clock of a session that made it to `Listening`
struct Connected {
    events: mpsc::UnboundedReceiver<ServerEvent>,
    playback: mpsc::UnboundedReceiver<PlaybackEvent>,
    clock: Arc<dyn PlaybackClock>,
}

struct SessionController {
    config: SessionConfig,
    backend: Arc<dyn AudioBackend>,
    transport: Arc<dyn Transport>,
    shared: Arc<Shared>,
    volume: Option<watch::Sender<f32>>,
    scheduler: PlaybackScheduler,
    turns: TurnAggregator,
}

impl SessionController {
    async fn run(mut self) {
        if !self.shared.transition(SessionState::Connecting) {
            log::debug!("Session: Closed before it started");
            return;
        }

        match self.connect().await {
            Ok(Some(connected)) => self.event_loop(connected).await,
            Ok(None) => log::debug!("Session: Closed while connecting"),
            Err(e) => self.fail(e),
        }

        self.shared.release();
        self.shared.transition(SessionState::Closed);
    }

    fn fail(&self, error: VoiceError) {
        log::error!("Session: {}", error);
        self.shared.listener.on_error(&error);
        self.shared.transition(SessionState::Error);
    }

    /// Check the configuration, acquire both devices, start capturing, then
    /// open the connection.
    /// `Ok(None)` means the session was closed in the meantime.
    async fn connect(&mut self) -> Result<Option<Connected>, VoiceError> {
        self.config.validate()?;

        let capture = CaptureConfig {
            device_name: self.config.input_device.clone(),
            channel: self.config.input_channel,
            sample_rate: self.config.input_sample_rate,
            window: self.config.capture_window,
        };
        let (window_tx, window_rx) = mpsc::channel(WINDOW_QUEUE);
        let input = self
            .backend
            .open_input(&capture, window_tx)
            .map_err(|e| VoiceError::DeviceUnavailable(e.to_string()))?;
        if !self.shared.resources().attach_input(input) {
            return Ok(None);
        }

        let output_config = OutputConfig {
            device_name: self.config.output_device.clone(),
            sample_rate: self.config.output_sample_rate,
        };
        let (playback_tx, playback_rx) = mpsc::unbounded_channel();
        let output = self
            .backend
            .open_output(&output_config, playback_tx)
            .map_err(|e| VoiceError::DeviceUnavailable(e.to_string()))?;
        let clock = output.clock();
        if !self.shared.resources().attach_output(output) {
            return Ok(None);
        }

        // Capture starts before the connection exists; frames queue until
        // the transport drains them.
        let (frames, frame_rx) = frame_channel();
        let volume = match self.volume.take() {
            Some(volume) => volume,
            None => watch::channel(0.0).0,
        };
        let pipeline = CapturePipeline::new(
            frames,
            SpeakingGate::new(Arc::clone(&clock), self.scheduler.subscribe()),
            volume,
            self.config.upstream_gate,
            self.config.input_sample_rate,
        );
        let capture_task = tokio::spawn(pipeline.run(window_rx));
        if !self.shared.resources().attach_capture_task(capture_task) {
            return Ok(None);
        }

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let timeout = self.config.connect_timeout;
        let opened = tokio::select! {
            _ = self.shared.cancel.cancelled() => return Ok(None),
            result = tokio::time::timeout(
                timeout,
                self.transport.open(&self.config.params, frame_rx, event_tx),
            ) => result,
        };

        let handle = match opened {
            Ok(Ok(handle)) => handle,
            Ok(Err(e)) => return Err(VoiceError::Connection(e.to_string())),
            Err(_) => {
                return Err(VoiceError::Connection(format!(
                    "timed out after {}ms",
                    timeout.as_millis()
                )))
            }
        };
        if !self.shared.resources().attach_transport(handle) {
            return Ok(None);
        }

        self.shared.transition(SessionState::Listening);
        Ok(Some(Connected {
            events: event_rx,
            playback: playback_rx,
            clock,
        }))
    }

    async fn event_loop(&mut self, connected: Connected) {
        let Connected {
            mut events,
            mut playback,
            clock,
        } = connected;
        let cancel = self.shared.cancel.clone();

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    log::debug!("Session: Event loop cancelled");
                    return;
                }
                event = events.recv() => {
                    let Some(event) = event else {
                        self.fail(VoiceError::Connection(
                            "transport stopped without closing".to_string(),
                        ));
                        return;
                    };
                    if !self.handle_server_event(event, clock.as_ref()) {
                        return;
                    }
                }
                Some(PlaybackEvent::Finished(id)) = playback.recv() => {
                    self.on_buffer_finished(id, clock.as_ref());
                }
            }
        }
    }

    /// Returns false once the session has to end
    fn handle_server_event(&mut self, event: ServerEvent, clock: &dyn PlaybackClock) -> bool {
        match event {
            ServerEvent::AudioDelta(bytes) => self.on_audio(&bytes, clock),
            ServerEvent::TranscriptDelta { speaker, text } => {
                let accumulated = self.turns.push_delta(speaker, &text);
                self.shared.listener.on_transcript(speaker, accumulated);
            }
            ServerEvent::TurnComplete => {
                if let Some(turn) = self.turns.complete() {
                    log::info!(
                        "Session: Turn complete (user: {} chars, model: {} chars)",
                        turn.user_text.len(),
                        turn.model_text.len()
                    );
                    self.shared.listener.on_turn_complete(&turn);
                }
            }
            ServerEvent::Interrupted => self.on_interrupted(clock),
            ServerEvent::Error(reason) => {
                self.fail(VoiceError::Remote(reason));
                return false;
            }
            ServerEvent::ConnectionLost(reason) => {
                self.fail(VoiceError::Connection(format!("connection lost: {}", reason)));
                return false;
            }
            ServerEvent::Closed(reason) => {
                log::info!(
                    "Session: Remote closed the session{}",
                    reason.map(|r| format!(": {}", r)).unwrap_or_default()
                );
                return false;
            }
        }
        true
    }

    fn on_audio(&mut self, bytes: &[u8], clock: &dyn PlaybackClock) {
        let audio = match decode(bytes, self.config.output_sample_rate, 1) {
            Ok(audio) => audio,
            Err(e) => {
                log::warn!("Session: Dropping response audio: {}", e);
                return;
            }
        };
        if audio.frames() == 0 {
            return;
        }

        let buffer = self.scheduler.schedule(audio.duration_secs(), clock.now());
        let samples = audio.into_mono();
        self.shared
            .with_output(|output| output.play_at(buffer.id, samples, buffer.start_at));

        if self.shared.state() == SessionState::Listening {
            self.shared.transition(SessionState::Speaking);
        }
    }

    fn on_interrupted(&mut self, clock: &dyn PlaybackClock) {
        let stopped = self.scheduler.interrupt(clock.now());
        self.shared.with_output(|output| {
            for id in &stopped {
                output.stop(*id);
            }
        });
        self.turns.interrupt();
        log::info!("Session: Interrupted, stopped {} buffers", stopped.len());

        if self.shared.state() == SessionState::Speaking {
            self.shared.transition(SessionState::Listening);
        }
    }

    fn on_buffer_finished(&mut self, id: BufferId, clock: &dyn PlaybackClock) {
        if !self.scheduler.complete(id) {
            log::trace!("Session: Ignoring completion of stopped buffer {}", id);
            return;
        }
        if self.shared.state() == SessionState::Speaking && self.scheduler.is_drained(clock.now())
        {
            self.shared.transition(SessionState::Listening);
        }
    }
}

/// Start a session on the current tokio runtime.
///
/// Returns immediately; progress is reported through `listener` and the
/// returned handle.
pub fn start(
    config: SessionConfig,
    backend: Arc<dyn AudioBackend>,
    transport: Arc<dyn Transport>,
    listener: Arc<dyn SessionListener>,
) -> SessionHandle {
    let (state, _) = watch::channel(SessionState::Idle);
    let (volume_tx, volume_rx) = watch::channel(0.0);
    let shared = Arc::new(Shared {
        resources: Mutex::new(SessionResources::default()),
        state,
        listener,
        cancel: CancellationToken::new(),
    });

    let controller = SessionController {
        config,
        backend,
        transport,
        shared: Arc::clone(&shared),
        volume: Some(volume_tx),
        scheduler: PlaybackScheduler::new(),
        turns: TurnAggregator::new(),
    };
    let task = tokio::spawn(controller.run());

    SessionHandle {
        shared,
        volume: volume_rx,
        task: Some(task),
    }
}

/// Owner of one live session. Dropping it closes the session.
pub struct SessionHandle {
    shared: Arc<Shared>,
    volume: watch::Receiver<f32>,
    task: Option<JoinHandle<()>>,
}

impl SessionHandle {
    /// Stop capture, close the connection and cancel scheduled playback.
    /// Returns once the devices are released; calling it again does nothing.
    pub fn close(&self) {
        self.shared.cancel.cancel();
        self.shared.release();
        self.shared.transition(SessionState::Closed);
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.shared.state.subscribe()
    }

    /// Latest microphone RMS; zero while the model is audible
    pub fn volume(&self) -> f32 {
        *self.volume.borrow()
    }

    pub fn is_model_speaking(&self) -> bool {
        self.state() == SessionState::Speaking
    }

    /// Wait until the session reaches `Closed`, whatever the cause
    pub async fn closed(&mut self) {
        let mut state = self.shared.state.subscribe();
        let _ = state.wait_for(|s| s.is_terminal()).await;
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.close();
    }
}
