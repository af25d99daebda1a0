//! Linear PCM16 framing between f32 samples and little-endian wire bytes.

use thiserror::Error;

/// Capture rate expected by the remote model
pub const INPUT_SAMPLE_RATE: u32 = 16_000;
/// Rate of the audio the remote model streams back
pub const OUTPUT_SAMPLE_RATE: u32 = 24_000;

const ENCODE_SCALE: f32 = 32767.0;
const DECODE_SCALE: f32 = 32768.0;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FramingError {
    #[error("payload of {len} bytes is not a whole number of {channels}-channel PCM16 frames")]
    Misaligned { len: usize, channels: usize },

    #[error("channel count must be at least 1")]
    NoChannels,

    #[error("invalid base64 audio payload: {0}")]
    Base64(String),
}

/// A mono block of PCM16 samples at a fixed rate.
///
/// Frames are never mutated after construction; they move from producer to
/// consumer (capture to transport, transport to playback).
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    samples: Vec<i16>,
    sample_rate: u32,
}

impl AudioFrame {
    pub fn new(samples: Vec<i16>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    /// Quantize float samples into a frame.
    pub fn from_f32(samples: &[f32], sample_rate: u32) -> Self {
        Self::new(samples.iter().map(|&s| quantize(s)).collect(), sample_rate)
    }

    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn duration_secs(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }

    /// Little-endian wire bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.samples.len() * 2);
        for sample in &self.samples {
            bytes.extend_from_slice(&sample.to_le_bytes());
        }
        bytes
    }

    /// The MIME type announced to the remote model for this frame
    pub fn mime_type(&self) -> String {
        format!("audio/pcm;rate={}", self.sample_rate)
    }
}

/// Float audio decoded from the wire, one vector per channel.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedAudio {
    pub sample_rate: u32,
    pub channels: Vec<Vec<f32>>,
}

impl DecodedAudio {
    /// Samples per channel
    pub fn frames(&self) -> usize {
        self.channels.first().map(Vec::len).unwrap_or(0)
    }

    pub fn duration_secs(&self) -> f64 {
        self.frames() as f64 / self.sample_rate as f64
    }

    /// Consume into the first channel, used for mono playback
    pub fn into_mono(self) -> Vec<f32> {
        self.channels.into_iter().next().unwrap_or_default()
    }
}

fn quantize(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * ENCODE_SCALE).round() as i16
}

/// Convert f32 samples to PCM 16-bit little-endian bytes
pub fn encode(samples: &[f32]) -> Vec<u8> {
    let mut pcm = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        pcm.extend_from_slice(&quantize(sample).to_le_bytes());
    }
    pcm
}

/// Convert interleaved PCM 16-bit little-endian bytes back into per-channel floats
pub fn decode(bytes: &[u8], sample_rate: u32, channels: usize) -> Result<DecodedAudio, FramingError> {
    if channels == 0 {
        return Err(FramingError::NoChannels);
    }
    if bytes.len() % (2 * channels) != 0 {
        return Err(FramingError::Misaligned {
            len: bytes.len(),
            channels,
        });
    }

    let frame_count = bytes.len() / (2 * channels);
    let mut out = vec![Vec::with_capacity(frame_count); channels];
    for (i, pair) in bytes.chunks_exact(2).enumerate() {
        let value = i16::from_le_bytes([pair[0], pair[1]]);
        out[i % channels].push(value as f32 / DECODE_SCALE);
    }

    Ok(DecodedAudio {
        sample_rate,
        channels: out,
    })
}

/// Root-mean-square level of a window, 0.0 for an empty one
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f32 = samples.iter().map(|s| s * s).sum();
    (sum / samples.len() as f32).sqrt()
}
