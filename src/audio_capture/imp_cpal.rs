use super::{AudioInput, CaptureConfig, LinearResampler, WindowAccumulator};
use crate::devices::{find_device, AudioDeviceError, Direction};
use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{Device, FromSample, SampleFormat, SizedSample, Stream, StreamConfig};
use std::sync::mpsc as std_mpsc;
use std::thread;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Microphone capture on a dedicated thread that owns the CPAL stream.
///
/// CPAL streams are not `Send` on every platform, so the stream is created,
/// played and dropped on the same thread; the handle only talks to it over a
/// channel.
pub struct CpalInput {
    stop_tx: Option<std_mpsc::Sender<()>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl CpalInput {
    pub fn open(
        config: &CaptureConfig,
        windows: mpsc::Sender<Vec<f32>>,
    ) -> Result<Self, AudioDeviceError> {
        let (ready_tx, ready_rx) = std_mpsc::channel();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
        let config = config.clone();

        let thread = thread::Builder::new()
            .name("capture".to_string())
            .spawn(move || {
                let stream = match build_capture_stream(&config, windows) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(AudioDeviceError::Stream(e.to_string())));
                    return;
                }
                let _ = ready_tx.send(Ok(()));

                // Runs until close() or until the handle is dropped
                let _ = stop_rx.recv();
                if let Err(e) = stream.pause() {
                    log::debug!("Capture: Failed to pause stream: {}", e);
                }
                drop(stream);
                log::debug!("Capture: Stream released");
            })
            .map_err(|e| AudioDeviceError::Stream(format!("Failed to spawn capture thread: {}", e)))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
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
                    "Capture thread exited before the stream started".to_string(),
                ))
            }
        }
    }
}

impl AudioInput for CpalInput {
    fn close(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            if let Err(e) = thread.join() {
                log::error!("Capture: Failed to join capture thread: {:?}", e);
            }
            log::info!("Capture: Microphone released");
        }
    }
}

impl Drop for CpalInput {
    fn drop(&mut self) {
        self.close();
    }
}

fn select_config(
    device: &Device,
    config: &CaptureConfig,
) -> Result<(StreamConfig, SampleFormat), AudioDeviceError> {
    let supported = device
        .supported_input_configs()
        .map_err(|e| AudioDeviceError::Config(e.to_string()))?;

    // First, try to find a config that natively supports the capture rate
    let native = supported
        .filter(|c| {
            c.min_sample_rate().0 <= config.sample_rate
                && c.max_sample_rate().0 >= config.sample_rate
                && c.channels() > config.channel
        })
        .max_by_key(|c| match c.sample_format() {
            SampleFormat::F32 => 2,
            SampleFormat::I16 => 1,
            _ => 0,
        });

    let chosen = match native {
        Some(range) => {
            log::info!(
                "Capture: Found config with native {}Hz support: {:?}",
                config.sample_rate,
                range.sample_format()
            );
            range.with_sample_rate(cpal::SampleRate(config.sample_rate))
        }
        None => {
            let default = device
                .default_input_config()
                .map_err(|e| AudioDeviceError::Config(e.to_string()))?;
            log::info!(
                "Capture: Using default config with resampling: {:?} @ {}Hz",
                default.sample_format(),
                default.sample_rate().0
            );
            default
        }
    };

    if config.channel >= chosen.channels() {
        return Err(AudioDeviceError::Config(format!(
            "Selected channel {} is not available (device has {} channels)",
            config.channel,
            chosen.channels()
        )));
    }

    Ok((chosen.config(), chosen.sample_format()))
}

fn build_capture_stream(
    config: &CaptureConfig,
    windows: mpsc::Sender<Vec<f32>>,
) -> Result<Stream, AudioDeviceError> {
    let device = find_device(Direction::Input, config.device_name.as_deref())?;
    log::info!(
        "Capture: Using input device: {}",
        device.name().unwrap_or_else(|_| "unknown".to_string())
    );

    let (stream_config, format) = select_config(&device, config)?;
    log::info!(
        "Capture: {} channels @ {}Hz ({:?}), window {} samples @ {}Hz",
        stream_config.channels,
        stream_config.sample_rate.0,
        format,
        config.window,
        config.sample_rate
    );

    match format {
        SampleFormat::I16 => build_stream::<i16>(&device, &stream_config, config, windows),
        SampleFormat::U16 => build_stream::<u16>(&device, &stream_config, config, windows),
        SampleFormat::I32 => build_stream::<i32>(&device, &stream_config, config, windows),
        SampleFormat::F32 => build_stream::<f32>(&device, &stream_config, config, windows),
        other => Err(AudioDeviceError::Config(format!(
            "Unsupported sample format: {:?}",
            other
        ))),
    }
}

fn build_stream<T>(
    device: &Device,
    stream_config: &StreamConfig,
    config: &CaptureConfig,
    windows: mpsc::Sender<Vec<f32>>,
) -> Result<Stream, AudioDeviceError>
where
    T: SizedSample + Send + 'static,
    f32: FromSample<T>,
{
    let channels = stream_config.channels as usize;
    let channel = config.channel as usize;
    let mut resampler = LinearResampler::new(stream_config.sample_rate.0, config.sample_rate);
    let mut accumulator = WindowAccumulator::new(config.window);
    let mut mono = Vec::new();
    let mut resampled = Vec::new();

    device
        .build_input_stream(
            stream_config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                mono.clear();
                mono.extend(
                    data.chunks(channels)
                        .filter_map(|frame| frame.get(channel).copied())
                        .map(|sample| sample.to_sample::<f32>()),
                );
                resampled.clear();
                resampler.process(&mono, &mut resampled);
                accumulator.push(&resampled, |window| {
                    if let Err(TrySendError::Full(_)) = windows.try_send(window) {
                        log::warn!("Capture: Pipeline is behind, dropping a window");
                    }
                });
            },
            |err| log::error!("Capture: Stream error: {}", err),
            None,
        )
        .map_err(|e| AudioDeviceError::Stream(e.to_string()))
}
