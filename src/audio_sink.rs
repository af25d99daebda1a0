use crate::devices::{find_device, AudioDeviceError, Direction};
use crate::playback::{AudioOutput, BufferId, PlaybackClock, PlaybackEvent};
use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{Device, FromSample, SampleFormat, SizedSample, Stream, StreamConfig};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use tokio::sync::mpsc;

#[derive(Debug, Clone)]
pub struct OutputConfig {
    /// Device name to play on (None = default device)
    pub device_name: Option<String>,
    /// Rate of the buffers handed to `play_at`
    pub sample_rate: u32,
}

/// Clock driven by the output callback: frames rendered / device rate
pub struct CpalClock {
    frames: AtomicU64,
    device_rate: u32,
}

impl CpalClock {
    fn new(device_rate: u32) -> Self {
        Self {
            frames: AtomicU64::new(0),
            device_rate,
        }
    }

    fn frames(&self) -> u64 {
        self.frames.load(Ordering::Acquire)
    }

    fn advance(&self, frames: usize) {
        self.frames.fetch_add(frames as u64, Ordering::AcqRel);
    }
}

impl PlaybackClock for CpalClock {
    fn now(&self) -> f64 {
        self.frames() as f64 / self.device_rate as f64
    }
}

struct ScheduledVoice {
    id: BufferId,
    start_at: f64,
    samples: Vec<f32>,
}

/// Buffers placed on the output clock, rendered by the device callback
struct Timeline {
    voices: Vec<ScheduledVoice>,
    source_rate: f64,
    /// End of the last inserted voice
    tail_end: f64,
}

impl Timeline {
    fn new(source_rate: u32) -> Self {
        Self {
            voices: Vec::new(),
            source_rate: source_rate as f64,
            tail_end: 0.0,
        }
    }

    fn end_of(&self, voice: &ScheduledVoice) -> f64 {
        voice.start_at + voice.samples.len() as f64 / self.source_rate
    }

    /// Add a buffer. A start the device already rendered past is moved to
    /// `next_render` so the first sample is never skipped, and a buffer never
    /// starts before the previous one ends.
    fn insert(&mut self, id: BufferId, samples: Vec<f32>, start_at: f64, next_render: f64) {
        let actual = start_at.max(next_render).max(self.tail_end);
        if actual > start_at {
            log::trace!(
                "Playback: Buffer {} start moved by {:.1}ms",
                id,
                (actual - start_at) * 1000.0
            );
        }
        let voice = ScheduledVoice {
            id,
            start_at: actual,
            samples,
        };
        self.tail_end = self.end_of(&voice);
        self.voices.push(voice);
    }

    fn remove(&mut self, id: BufferId) {
        self.voices.retain(|voice| voice.id != id);
        self.tail_end = self
            .voices
            .iter()
            .map(|voice| self.end_of(voice))
            .fold(0.0, f64::max);
    }

    /// Value at clock time `t`, linearly interpolated from the source rate
    fn sample_at(&self, t: f64) -> f32 {
        let mut value = 0.0;
        for voice in &self.voices {
            if t < voice.start_at {
                continue;
            }
            let pos = (t - voice.start_at) * self.source_rate;
            let idx = pos.floor() as usize;
            let frac = (pos - idx as f64) as f32;
            value += match (voice.samples.get(idx), voice.samples.get(idx + 1)) {
                (Some(a), Some(b)) => a * (1.0 - frac) + b * frac,
                (Some(a), None) => *a,
                _ => 0.0,
            };
        }
        value
    }

    /// Remove voices that ended at or before `t`, collecting their ids
    fn retire(&mut self, t: f64, finished: &mut Vec<BufferId>) {
        let source_rate = self.source_rate;
        self.voices.retain(|voice| {
            let end = voice.start_at + voice.samples.len() as f64 / source_rate;
            if end <= t {
                finished.push(voice.id);
                false
            } else {
                true
            }
        });
    }
}

/// Speaker output that plays buffers at exact positions on its own clock.
///
/// Like the capture side, the CPAL stream lives on a dedicated thread.
pub struct CpalOutput {
    clock: Arc<CpalClock>,
    timeline: Arc<Mutex<Timeline>>,
    stop_tx: Option<std_mpsc::Sender<()>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl CpalOutput {
    pub fn open(
        config: &OutputConfig,
        events: mpsc::UnboundedSender<PlaybackEvent>,
    ) -> Result<Self, AudioDeviceError> {
        let timeline = Arc::new(Mutex::new(Timeline::new(config.sample_rate)));
        let (ready_tx, ready_rx) = std_mpsc::channel();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
        let device_name = config.device_name.clone();
        let stream_timeline = Arc::clone(&timeline);

        let thread = thread::Builder::new()
            .name("playback".to_string())
            .spawn(move || {
                let started = find_device(Direction::Output, device_name.as_deref())
                    .and_then(|device| build_output_stream(&device, stream_timeline, events));
                let (stream, clock) = match started {
                    Ok(started) => started,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(AudioDeviceError::Stream(e.to_string())));
                    return;
                }
                let _ = ready_tx.send(Ok(clock));

                let _ = stop_rx.recv();
                if let Err(e) = stream.pause() {
                    log::debug!("Playback: Failed to pause stream: {}", e);
                }
                drop(stream);
                log::debug!("Playback: Stream released");
            })
            .map_err(|e| AudioDeviceError::Stream(format!("Failed to spawn playback thread: {}", e)))?;

        match ready_rx.recv() {
            Ok(Ok(clock)) => Ok(Self {
                clock,
                timeline,
                stop_tx: Some(stop_tx),
                thread: Some(thread),
            }),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(AudioDeviceError::Stream(
                    "Playback thread exited before the stream started".to_string(),
                ))
            }
        }
    }
}

impl AudioOutput for CpalOutput {
    fn clock(&self) -> Arc<dyn PlaybackClock> {
        self.clock.clone()
    }

    fn play_at(&mut self, id: BufferId, samples: Vec<f32>, start_at: f64) {
        match self.timeline.lock() {
            // The callback advances the clock while holding this lock, so
            // `now()` is the first frame it has not rendered yet
            Ok(mut timeline) => timeline.insert(id, samples, start_at, self.clock.now()),
            Err(_) => log::error!("Playback: Timeline lock poisoned, dropping buffer {}", id),
        }
    }

    fn stop(&mut self, id: BufferId) {
        if let Ok(mut timeline) = self.timeline.lock() {
            timeline.remove(id);
        }
    }

    fn close(&mut self) {
        if let Ok(mut timeline) = self.timeline.lock() {
            timeline.voices.clear();
        }
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            if let Err(e) = thread.join() {
                log::error!("Playback: Failed to join playback thread: {:?}", e);
            }
            log::info!("Playback: Output device released");
        }
    }
}

impl Drop for CpalOutput {
    fn drop(&mut self) {
        self.close();
    }
}

fn build_output_stream(
    device: &Device,
    timeline: Arc<Mutex<Timeline>>,
    events: mpsc::UnboundedSender<PlaybackEvent>,
) -> Result<(Stream, Arc<CpalClock>), AudioDeviceError> {
    log::info!(
        "Playback: Using output device: {}",
        device.name().unwrap_or_else(|_| "unknown".to_string())
    );

    // Get the default output config - buffers are resampled onto it by the timeline
    let supported = device
        .default_output_config()
        .map_err(|e| AudioDeviceError::Config(e.to_string()))?;
    let format = supported.sample_format();
    let stream_config = supported.config();
    log::info!(
        "Playback: {} channels @ {}Hz ({:?})",
        stream_config.channels,
        stream_config.sample_rate.0,
        format
    );

    let clock = Arc::new(CpalClock::new(stream_config.sample_rate.0));
    let stream = match format {
        SampleFormat::I16 => build_stream::<i16>(device, &stream_config, &clock, timeline, events),
        SampleFormat::U16 => build_stream::<u16>(device, &stream_config, &clock, timeline, events),
        SampleFormat::I32 => build_stream::<i32>(device, &stream_config, &clock, timeline, events),
        SampleFormat::F32 => build_stream::<f32>(device, &stream_config, &clock, timeline, events),
        other => Err(AudioDeviceError::Config(format!(
            "Unsupported sample format: {:?}",
            other
        ))),
    }?;
    Ok((stream, clock))
}

fn build_stream<T>(
    device: &Device,
    stream_config: &StreamConfig,
    clock: &Arc<CpalClock>,
    timeline: Arc<Mutex<Timeline>>,
    events: mpsc::UnboundedSender<PlaybackEvent>,
) -> Result<Stream, AudioDeviceError>
where
    T: SizedSample + FromSample<f32> + Send + 'static,
{
    let channels = stream_config.channels as usize;
    let device_rate = stream_config.sample_rate.0 as f64;
    let clock = Arc::clone(clock);
    let mut finished = Vec::new();

    device
        .build_output_stream(
            stream_config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                let frame_count = data.len() / channels;

                match timeline.lock() {
                    Ok(mut timeline) => {
                        let start_frame = clock.frames();
                        for (k, frame) in data.chunks_mut(channels).enumerate() {
                            let t = (start_frame + k as u64) as f64 / device_rate;
                            let value = T::from_sample(timeline.sample_at(t).clamp(-1.0, 1.0));
                            for sample in frame.iter_mut() {
                                *sample = value;
                            }
                        }
                        let end = (start_frame + frame_count as u64) as f64 / device_rate;
                        timeline.retire(end, &mut finished);
                        clock.advance(frame_count);
                    }
                    Err(_) => {
                        data.fill(T::EQUILIBRIUM);
                        clock.advance(frame_count);
                    }
                }

                for id in finished.drain(..) {
                    let _ = events.send(PlaybackEvent::Finished(id));
                }
            },
            |err| log::error!("Playback: Stream error: {}", err),
            None,
        )
        .map_err(|e| AudioDeviceError::Stream(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeline_plays_buffers_back_to_back() {
        let mut timeline = Timeline::new(4);
        timeline.voices.push(ScheduledVoice {
            id: 0,
            start_at: 0.0,
            samples: vec![0.1; 4],
        });
        timeline.voices.push(ScheduledVoice {
            id: 1,
            start_at: 1.0,
            samples: vec![0.2; 4],
        });

        assert!((timeline.sample_at(0.5) - 0.1).abs() < 1e-6);
        assert!((timeline.sample_at(1.25) - 0.2).abs() < 1e-6);
        assert_eq!(timeline.sample_at(2.5), 0.0);
    }

    #[test]
    fn test_timeline_interpolates_between_source_samples() {
        let mut timeline = Timeline::new(2);
        timeline.voices.push(ScheduledVoice {
            id: 0,
            start_at: 0.0,
            samples: vec![0.0, 1.0],
        });
        assert!((timeline.sample_at(0.25) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_retire_reports_finished_buffers() {
        let mut timeline = Timeline::new(4);
        for (id, start_at) in [(0, 0.0), (1, 1.0)] {
            timeline.voices.push(ScheduledVoice {
                id,
                start_at,
                samples: vec![0.0; 4],
            });
        }
        let mut finished = Vec::new();
        timeline.retire(1.5, &mut finished);
        assert_eq!(finished, vec![0]);
        timeline.retire(2.0, &mut finished);
        assert_eq!(finished, vec![0, 1]);
        assert!(timeline.voices.is_empty());
    }

    #[test]
    fn test_late_start_plays_from_first_sample() {
        let mut timeline = Timeline::new(4);
        // Scheduled at 0.0, but the device already rendered up to 0.5
        timeline.insert(7, vec![0.1, 0.2, 0.3, 0.4], 0.0, 0.5);

        assert_eq!(timeline.voices[0].start_at, 0.5);
        assert!((timeline.sample_at(0.5) - 0.1).abs() < 1e-6);
        assert!((timeline.sample_at(1.25) - 0.4).abs() < 1e-6);

        let mut finished = Vec::new();
        timeline.retire(1.25, &mut finished);
        assert!(finished.is_empty());
        timeline.retire(1.5, &mut finished);
        assert_eq!(finished, vec![7]);
    }

    #[test]
    fn test_shifted_buffer_pushes_the_next_one_back() {
        let mut timeline = Timeline::new(4);
        timeline.insert(0, vec![0.1; 4], 0.0, 0.25);
        // Scheduled right after buffer 0's original end
        timeline.insert(1, vec![0.2; 4], 1.0, 0.25);

        assert_eq!(timeline.voices[1].start_at, 1.25);
        assert!((timeline.sample_at(1.0) - 0.1).abs() < 1e-6);
        assert!((timeline.sample_at(1.25) - 0.2).abs() < 1e-6);
    }

    #[test]
    fn test_removing_all_buffers_resets_the_tail() {
        let mut timeline = Timeline::new(4);
        timeline.insert(0, vec![0.1; 40], 0.0, 0.0);
        timeline.remove(0);
        timeline.insert(1, vec![0.2; 4], 0.5, 0.5);
        assert_eq!(timeline.voices[0].start_at, 0.5);
    }

    #[test]
    fn test_future_start_is_kept() {
        let mut timeline = Timeline::new(4);
        timeline.insert(0, vec![0.5; 4], 2.0, 0.5);
        assert_eq!(timeline.voices[0].start_at, 2.0);
        assert_eq!(timeline.sample_at(1.0), 0.0);
    }

    #[test]
    fn test_clock_counts_rendered_frames() {
        let clock = CpalClock::new(48_000);
        clock.advance(24_000);
        assert!((clock.now() - 0.5).abs() < 1e-12);
    }
}
