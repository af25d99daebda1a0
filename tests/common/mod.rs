//! In-memory devices and transport for driving a session without hardware
//! or network.

#![allow(dead_code)]

use async_trait::async_trait;
use live_voice::audio_capture::{AudioInput, CaptureConfig};
use live_voice::audio_sink::OutputConfig;
use live_voice::config::{SessionConfig, SessionParams};
use live_voice::devices::{AudioBackend, AudioDeviceError};
use live_voice::error::VoiceError;
use live_voice::playback::{AudioOutput, BufferId, PlaybackClock, PlaybackEvent};
use live_voice::session::{SessionHandle, SessionListener, SessionState};
use live_voice::transport::{
    EventSender, FrameReceiver, Transport, TransportError, TransportHandle,
};
use live_voice::turn::{Speaker, Turn};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};

const WAIT: Duration = Duration::from_secs(5);

pub fn test_config() -> SessionConfig {
    SessionConfig {
        connect_timeout: Duration::from_secs(2),
        ..SessionConfig::default()
    }
}

/// Output clock the test moves by hand
#[derive(Default)]
pub struct FakeClock {
    now: Mutex<f64>,
}

impl FakeClock {
    pub fn set(&self, now: f64) {
        *self.now.lock().unwrap() = now;
    }
}

impl PlaybackClock for FakeClock {
    fn now(&self) -> f64 {
        *self.now.lock().unwrap()
    }
}

/// What the session asked the speaker to do
#[derive(Default)]
pub struct OutputLog {
    /// (id, sample count, start time)
    pub played: Mutex<Vec<(BufferId, usize, f64)>>,
    pub stopped: Mutex<Vec<BufferId>>,
    pub closes: AtomicUsize,
}

impl OutputLog {
    pub fn played_ids(&self) -> Vec<BufferId> {
        self.played.lock().unwrap().iter().map(|p| p.0).collect()
    }
}

struct FakeOutput {
    clock: Arc<FakeClock>,
    log: Arc<OutputLog>,
}

impl AudioOutput for FakeOutput {
    fn clock(&self) -> Arc<dyn PlaybackClock> {
        self.clock.clone()
    }

    fn play_at(&mut self, id: BufferId, samples: Vec<f32>, start_at: f64) {
        self.log
            .played
            .lock()
            .unwrap()
            .push((id, samples.len(), start_at));
    }

    fn stop(&mut self, id: BufferId) {
        self.log.stopped.lock().unwrap().push(id);
    }

    fn close(&mut self) {
        self.log.closes.fetch_add(1, Ordering::SeqCst);
    }
}

struct FakeInput {
    closes: Arc<AtomicUsize>,
}

impl AudioInput for FakeInput {
    fn close(&mut self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct FakeBackend {
    pub clock: Arc<FakeClock>,
    pub output: Arc<OutputLog>,
    pub input_closes: Arc<AtomicUsize>,
    pub fail_input: bool,
    windows: Mutex<Option<mpsc::Sender<Vec<f32>>>>,
    playback: Mutex<Option<mpsc::UnboundedSender<PlaybackEvent>>>,
}

impl FakeBackend {
    pub fn failing() -> Self {
        Self {
            fail_input: true,
            ..Self::default()
        }
    }

    /// Where the "microphone" delivers windows, once the input is open
    pub fn windows(&self) -> Option<mpsc::Sender<Vec<f32>>> {
        self.windows.lock().unwrap().clone()
    }

    /// Report a buffer as played out
    pub fn finish(&self, id: BufferId) {
        if let Some(tx) = self.playback.lock().unwrap().as_ref() {
            let _ = tx.send(PlaybackEvent::Finished(id));
        }
    }
}

impl AudioBackend for FakeBackend {
    fn open_input(
        &self,
        _config: &CaptureConfig,
        windows: mpsc::Sender<Vec<f32>>,
    ) -> Result<Box<dyn AudioInput>, AudioDeviceError> {
        if self.fail_input {
            return Err(AudioDeviceError::NoDevice("permission denied".to_string()));
        }
        *self.windows.lock().unwrap() = Some(windows);
        Ok(Box::new(FakeInput {
            closes: self.input_closes.clone(),
        }))
    }

    fn open_output(
        &self,
        _config: &OutputConfig,
        events: mpsc::UnboundedSender<PlaybackEvent>,
    ) -> Result<Box<dyn AudioOutput>, AudioDeviceError> {
        *self.playback.lock().unwrap() = Some(events);
        Ok(Box::new(FakeOutput {
            clock: self.clock.clone(),
            log: self.output.clone(),
        }))
    }
}

struct FakeConnection {
    closes: Arc<AtomicUsize>,
}

impl TransportHandle for FakeConnection {
    fn close(&mut self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Transport whose server side is driven by the test
#[derive(Default)]
pub struct ScriptedTransport {
    /// Fail `open()` with this reason
    pub fail: Option<String>,
    /// Hold `open()` until notified
    pub gate: Option<Arc<Notify>>,
    pub opens: AtomicUsize,
    pub handle_closes: Arc<AtomicUsize>,
    pub params: Mutex<Option<SessionParams>>,
    server: Mutex<Option<(FrameReceiver, EventSender)>>,
}

impl ScriptedTransport {
    pub fn failing(reason: &str) -> Self {
        Self {
            fail: Some(reason.to_string()),
            ..Self::default()
        }
    }

    pub fn gated(gate: Arc<Notify>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::default()
        }
    }

    /// Frames the client sent and the sender for server events
    pub fn server(&self) -> (FrameReceiver, EventSender) {
        self.server
            .lock()
            .unwrap()
            .take()
            .expect("transport was not opened")
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn open(
        &self,
        params: &SessionParams,
        frames: FrameReceiver,
        events: EventSender,
    ) -> Result<Box<dyn TransportHandle>, TransportError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        *self.params.lock().unwrap() = Some(params.clone());
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        if let Some(reason) = &self.fail {
            return Err(TransportError::Handshake(reason.clone()));
        }
        *self.server.lock().unwrap() = Some((frames, events));
        Ok(Box::new(FakeConnection {
            closes: self.handle_closes.clone(),
        }))
    }
}

#[derive(Default)]
pub struct RecordingListener {
    pub states: Mutex<Vec<SessionState>>,
    pub turns: Mutex<Vec<Turn>>,
    pub transcripts: Mutex<Vec<(Speaker, String)>>,
    pub errors: Mutex<Vec<String>>,
}

impl RecordingListener {
    pub fn states(&self) -> Vec<SessionState> {
        self.states.lock().unwrap().clone()
    }

    pub fn turns(&self) -> Vec<Turn> {
        self.turns.lock().unwrap().clone()
    }

    pub fn errors(&self) -> Vec<String> {
        self.errors.lock().unwrap().clone()
    }
}

impl SessionListener for RecordingListener {
    fn on_status_change(&self, state: SessionState) {
        self.states.lock().unwrap().push(state);
    }

    fn on_turn_complete(&self, turn: &Turn) {
        self.turns.lock().unwrap().push(turn.clone());
    }

    fn on_transcript(&self, speaker: Speaker, text: &str) {
        self.transcripts
            .lock()
            .unwrap()
            .push((speaker, text.to_string()));
    }

    fn on_error(&self, error: &VoiceError) {
        self.errors.lock().unwrap().push(error.to_string());
    }
}

pub async fn wait_for_state(handle: &SessionHandle, state: SessionState) {
    let mut rx = handle.subscribe_state();
    tokio::time::timeout(WAIT, rx.wait_for(|s| *s == state))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {}", state))
        .expect("state channel closed");
}

pub async fn wait_closed(handle: &mut SessionHandle) {
    tokio::time::timeout(WAIT, handle.closed())
        .await
        .expect("session did not close");
}

/// Poll `condition` until it holds
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition never became true");
}
