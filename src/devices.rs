//! Device discovery and the backend seam between a session and real hardware.

use crate::audio_capture::{AudioInput, CaptureConfig, CpalInput};
use crate::audio_sink::{CpalOutput, OutputConfig};
use crate::playback::{AudioOutput, PlaybackEvent};
use cpal::traits::{DeviceTrait, HostTrait};
use cpal::Device;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Error, Debug)]
pub enum AudioDeviceError {
    #[error("No audio device: {0}")]
    NoDevice(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Stream error: {0}")]
    Stream(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Input,
    Output,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Input => write!(f, "input"),
            Direction::Output => write!(f, "output"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AudioDeviceInfo {
    pub name: String,
    pub direction: Direction,
    pub is_default: bool,
    pub channel_count: u16,
    pub sample_rate: u32,
}

/// Look a device up by exact name, or take the host default
pub fn find_device(direction: Direction, name: Option<&str>) -> Result<Device, AudioDeviceError> {
    let host = cpal::default_host();

    match name {
        Some(name) => {
            let devices: Vec<Device> = match direction {
                Direction::Input => host.input_devices().map(|d| d.collect()),
                Direction::Output => host.output_devices().map(|d| d.collect()),
            }
            .map_err(|e| AudioDeviceError::NoDevice(format!("Failed to enumerate devices: {}", e)))?;

            devices
                .into_iter()
                .find(|dev| dev.name().unwrap_or_default() == name)
                .ok_or_else(|| AudioDeviceError::NoDevice(format!("Device '{}' not found", name)))
        }
        None => match direction {
            Direction::Input => host.default_input_device(),
            Direction::Output => host.default_output_device(),
        }
        .ok_or_else(|| {
            AudioDeviceError::NoDevice(format!("No default {} device available", direction))
        }),
    }
}

/// Every input and output device with its default format
pub fn list_devices() -> Result<Vec<AudioDeviceInfo>, AudioDeviceError> {
    let host = cpal::default_host();
    let mut result = Vec::new();

    for direction in [Direction::Input, Direction::Output] {
        let default_name = match direction {
            Direction::Input => host.default_input_device(),
            Direction::Output => host.default_output_device(),
        }
        .and_then(|d| d.name().ok());

        let devices: Vec<Device> = match direction {
            Direction::Input => host.input_devices().map(|d| d.collect()),
            Direction::Output => host.output_devices().map(|d| d.collect()),
        }
        .map_err(|e| AudioDeviceError::NoDevice(e.to_string()))?;

        for device in devices {
            let Ok(name) = device.name() else { continue };
            let config = match direction {
                Direction::Input => device.default_input_config(),
                Direction::Output => device.default_output_config(),
            };
            let config = match config {
                Ok(config) => config,
                Err(e) => {
                    log::debug!("Devices: Skipping {} ({}): {}", name, direction, e);
                    continue;
                }
            };

            result.push(AudioDeviceInfo {
                is_default: default_name.as_deref() == Some(name.as_str()),
                name,
                direction,
                channel_count: config.channels(),
                sample_rate: config.sample_rate().0,
            });
        }
    }

    Ok(result)
}

/// Opens the microphone and speaker for a session
pub trait AudioBackend: Send + Sync {
    /// Start capturing; windows of `config.window` samples arrive on `windows`
    fn open_input(
        &self,
        config: &CaptureConfig,
        windows: mpsc::Sender<Vec<f32>>,
    ) -> Result<Box<dyn AudioInput>, AudioDeviceError>;

    /// Start the output clock; finished buffers are reported on `events`
    fn open_output(
        &self,
        config: &OutputConfig,
        events: mpsc::UnboundedSender<PlaybackEvent>,
    ) -> Result<Box<dyn AudioOutput>, AudioDeviceError>;
}

/// Real hardware through CPAL
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalBackend;

impl AudioBackend for CpalBackend {
    fn open_input(
        &self,
        config: &CaptureConfig,
        windows: mpsc::Sender<Vec<f32>>,
    ) -> Result<Box<dyn AudioInput>, AudioDeviceError> {
        Ok(Box::new(CpalInput::open(config, windows)?))
    }

    fn open_output(
        &self,
        config: &OutputConfig,
        events: mpsc::UnboundedSender<PlaybackEvent>,
    ) -> Result<Box<dyn AudioOutput>, AudioDeviceError> {
        Ok(Box::new(CpalOutput::open(config, events)?))
    }
}
