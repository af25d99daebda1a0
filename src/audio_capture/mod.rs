//! Microphone side of a session: fixed windows in, encoded frames out.

pub mod imp_cpal;

use crate::codec::{rms, AudioFrame, INPUT_SAMPLE_RATE};
use crate::config::{UpstreamGate, DEFAULT_CAPTURE_WINDOW};
use crate::playback::PlaybackClock;
use crate::transport::FrameSender;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

pub use imp_cpal::CpalInput;

/// Audio capture configuration
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Device name to capture from (None = default device)
    pub device_name: Option<String>,
    /// Channel to capture (0-based index)
    pub channel: u16,
    pub sample_rate: u32,
    /// Samples per window handed to the pipeline
    pub window: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device_name: None,
            channel: 0,
            sample_rate: INPUT_SAMPLE_RATE,
            window: DEFAULT_CAPTURE_WINDOW,
        }
    }
}

/// An open microphone stream feeding windows into a channel
pub trait AudioInput: Send {
    /// Stop the capture callback. Returns only once the callback can no
    /// longer run; calling it again is a no-op.
    fn close(&mut self);
}

/// Cuts an arbitrary stream of samples into fixed-size windows
#[derive(Debug)]
pub struct WindowAccumulator {
    window: usize,
    buffer: Vec<f32>,
}

impl WindowAccumulator {
    pub fn new(window: usize) -> Self {
        Self {
            window,
            buffer: Vec::with_capacity(window),
        }
    }

    /// Append samples, calling `emit` for each completed window
    pub fn push(&mut self, samples: &[f32], mut emit: impl FnMut(Vec<f32>)) {
        for &sample in samples {
            self.buffer.push(sample);
            if self.buffer.len() >= self.window {
                let full = std::mem::replace(&mut self.buffer, Vec::with_capacity(self.window));
                emit(full);
            }
        }
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

/// Streaming linear-interpolation resampler that stays continuous across
/// callback boundaries.
#[derive(Debug)]
pub struct LinearResampler {
    step: f64,
    pos: f64,
    pending: Vec<f32>,
}

impl LinearResampler {
    pub fn new(from_rate: u32, to_rate: u32) -> Self {
        Self {
            step: from_rate as f64 / to_rate as f64,
            pos: 0.0,
            pending: Vec::new(),
        }
    }

    pub fn is_passthrough(&self) -> bool {
        (self.step - 1.0).abs() < 1e-9
    }

    pub fn process(&mut self, input: &[f32], out: &mut Vec<f32>) {
        if self.is_passthrough() {
            out.extend_from_slice(input);
            return;
        }

        self.pending.extend_from_slice(input);
        while self.pos + 1.0 < self.pending.len() as f64 {
            let idx = self.pos.floor() as usize;
            let frac = (self.pos - idx as f64) as f32;
            out.push(self.pending[idx] * (1.0 - frac) + self.pending[idx + 1] * frac);
            self.pos += self.step;
        }

        let consumed = (self.pos.floor() as usize).min(self.pending.len());
        self.pending.drain(..consumed);
        self.pos -= consumed as f64;
    }
}

/// Tells whether response audio is still audible: the output clock has not
/// yet reached the end of the last scheduled buffer.
#[derive(Clone)]
pub struct SpeakingGate {
    clock: Arc<dyn PlaybackClock>,
    next_start_time: watch::Receiver<f64>,
}

impl SpeakingGate {
    pub fn new(clock: Arc<dyn PlaybackClock>, next_start_time: watch::Receiver<f64>) -> Self {
        Self {
            clock,
            next_start_time,
        }
    }

    pub fn is_model_audible(&self) -> bool {
        self.clock.now() < *self.next_start_time.borrow()
    }
}

/// Encodes capture windows and forwards them upstream
pub struct CapturePipeline {
    frames: FrameSender,
    gate: SpeakingGate,
    volume: watch::Sender<f32>,
    upstream: UpstreamGate,
    sample_rate: u32,
    window_count: u64,
}

impl CapturePipeline {
    pub fn new(
        frames: FrameSender,
        gate: SpeakingGate,
        volume: watch::Sender<f32>,
        upstream: UpstreamGate,
        sample_rate: u32,
    ) -> Self {
        Self {
            frames,
            gate,
            volume,
            upstream,
            sample_rate,
            window_count: 0,
        }
    }

    pub fn process_window(&mut self, window: &[f32]) {
        self.window_count += 1;
        let audible = self.gate.is_model_audible();

        let level = if audible { 0.0 } else { rms(window) };
        self.volume.send_replace(level);

        let frame = if audible && self.upstream == UpstreamGate::Mute {
            AudioFrame::new(vec![0; window.len()], self.sample_rate)
        } else {
            AudioFrame::from_f32(window, self.sample_rate)
        };

        log::trace!(
            "Capture: Window {} ({} samples, rms {:.3}, model audible: {})",
            self.window_count,
            window.len(),
            level,
            audible
        );
        self.frames.send_frame(frame);
    }

    /// Drain windows until the input closes
    pub async fn run(mut self, mut windows: mpsc::Receiver<Vec<f32>>) {
        log::debug!("Capture: Pipeline started");
        while let Some(window) = windows.recv().await {
            self.process_window(&window);
        }
        self.volume.send_replace(0.0);
        log::debug!(
            "Capture: Pipeline stopped after {} windows",
            self.window_count
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::frame_channel;
    use std::sync::Mutex;

    struct ManualClock(Mutex<f64>);

    impl PlaybackClock for ManualClock {
        fn now(&self) -> f64 {
            *self.0.lock().unwrap()
        }
    }

    fn pipeline(
        upstream: UpstreamGate,
        now: f64,
        next_start: f64,
    ) -> (CapturePipeline, crate::transport::FrameReceiver, watch::Receiver<f32>) {
        let (frames, frame_rx) = frame_channel();
        let (_next_tx, next_rx) = watch::channel(next_start);
        let gate = SpeakingGate::new(Arc::new(ManualClock(Mutex::new(now))), next_rx);
        let (volume_tx, volume_rx) = watch::channel(0.0);
        (
            CapturePipeline::new(frames, gate, volume_tx, upstream, INPUT_SAMPLE_RATE),
            frame_rx,
            volume_rx,
        )
    }

    #[test]
    fn test_window_accumulator_emits_fixed_windows() {
        let mut acc = WindowAccumulator::new(4);
        let mut windows = Vec::new();
        acc.push(&[1.0, 2.0, 3.0], |w| windows.push(w));
        assert!(windows.is_empty());
        acc.push(&[4.0, 5.0, 6.0, 7.0, 8.0, 9.0], |w| windows.push(w));
        assert_eq!(windows, vec![vec![1.0, 2.0, 3.0, 4.0], vec![5.0, 6.0, 7.0, 8.0]]);
        assert_eq!(acc.buffered(), 1);
    }

    #[test]
    fn test_resampler_downsamples_by_three() {
        let mut resampler = LinearResampler::new(48_000, 16_000);
        let input: Vec<f32> = (0..300).map(|i| i as f32).collect();
        let mut out = Vec::new();
        for chunk in input.chunks(37) {
            resampler.process(chunk, &mut out);
        }
        // Continuous across chunk boundaries: every third input sample
        assert!(out.len() >= 99);
        for (i, v) in out.iter().enumerate() {
            assert!((v - (i * 3) as f32).abs() < 1e-3, "{} at {}", v, i);
        }
    }

    #[test]
    fn test_resampler_passthrough() {
        let mut resampler = LinearResampler::new(16_000, 16_000);
        let mut out = Vec::new();
        resampler.process(&[0.1, 0.2], &mut out);
        assert_eq!(out, vec![0.1, 0.2]);
    }

    #[test]
    fn test_frames_carry_audio_and_volume() {
        let (mut pipeline, mut frames, volume) = pipeline(UpstreamGate::MeterOnly, 1.0, 0.0);
        pipeline.process_window(&[0.5, -0.5, 0.5, -0.5]);

        let frame = frames.try_recv().unwrap();
        assert_eq!(frame.samples(), &[16384, -16384, 16384, -16384]);
        assert_eq!(frame.sample_rate(), 16_000);
        assert!((*volume.borrow() - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_meter_only_gate_still_streams_audio() {
        let (mut pipeline, mut frames, volume) = pipeline(UpstreamGate::MeterOnly, 1.0, 2.0);
        pipeline.process_window(&[0.5, -0.5]);

        assert_eq!(frames.try_recv().unwrap().samples(), &[16384, -16384]);
        assert_eq!(*volume.borrow(), 0.0);
    }

    #[test]
    fn test_mute_gate_sends_silence_of_same_length() {
        let (mut pipeline, mut frames, volume) = pipeline(UpstreamGate::Mute, 1.0, 2.0);
        pipeline.process_window(&[0.5, -0.5, 0.25]);

        assert_eq!(frames.try_recv().unwrap().samples(), &[0, 0, 0]);
        assert_eq!(*volume.borrow(), 0.0);
    }

    #[tokio::test]
    async fn test_run_preserves_capture_order() {
        let (pipeline, mut frames, _volume) = pipeline(UpstreamGate::MeterOnly, 0.0, 0.0);
        let (tx, rx) = mpsc::channel(8);
        let task = tokio::spawn(pipeline.run(rx));
        for i in 1..=3 {
            tx.send(vec![i as f32 / 10.0; 4]).await.unwrap();
        }
        drop(tx);
        task.await.unwrap();

        let firsts: Vec<i16> = std::iter::from_fn(|| frames.try_recv().ok())
            .map(|f| f.samples()[0])
            .collect();
        assert_eq!(firsts, vec![3277, 6553, 9830]);
    }
}
