//! # PCM Wire Codec
//!
//! Converts between the floating-point sample buffers the audio devices work with and
//! the base64-encoded little-endian PCM16 payloads the remote voice service speaks.
//!
//! ## Wire Format:
//! - **Bit Depth**: 16-bit signed PCM, little-endian
//! - **Framing**: base64 text, declared by a MIME descriptor such as `audio/pcm;rate=16000`
//! - **Channels**: interleaved when more than one
//!
//! ## Scaling:
//! Encoding is asymmetric: negative samples scale by 32768 and non-negative ones by
//! 32767, so `-1.0` maps to `i16::MIN` and `1.0` to `i16::MAX` without overflow.
//! Decoding divides by 32768 for both signs.

use crate::error::{VoiceError, VoiceResult};
use base64::Engine;
use byteorder::{ByteOrder, LittleEndian};

/// MIME type prefix for raw PCM16 payloads.
pub const PCM_MIME_PREFIX: &str = "audio/pcm";

/// One captured block ready to be sent: the outbound half of the wire format.
///
/// Immutable once built; the transport consumes it exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    /// base64 of little-endian PCM16 bytes
    pub data: String,
    /// e.g. `audio/pcm;rate=16000`
    pub mime_type: String,
    pub sample_rate: u32,
}

/// A received audio payload, still encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioChunk {
    /// base64 of little-endian PCM16 bytes
    pub data: String,
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioChunk {
    pub fn new(data: impl Into<String>, sample_rate: u32, channels: u16) -> Self {
        Self {
            data: data.into(),
            sample_rate,
            channels,
        }
    }
}

/// Decoded, playable audio: one sample vector per channel, normalized to [-1.0, 1.0].
#[derive(Debug, Clone, PartialEq)]
pub struct PcmBuffer {
    sample_rate: u32,
    channels: Vec<Vec<f32>>,
}

impl PcmBuffer {
    /// Build a buffer from per-channel sample vectors.
    ///
    /// Channels must all have the same length.
    pub fn new(sample_rate: u32, channels: Vec<Vec<f32>>) -> VoiceResult<Self> {
        if sample_rate == 0 {
            return Err(VoiceError::decode("sample rate must be greater than 0"));
        }
        if channels.is_empty() {
            return Err(VoiceError::decode("buffer needs at least one channel"));
        }
        let frames = channels[0].len();
        if channels.iter().any(|channel| channel.len() != frames) {
            return Err(VoiceError::decode("channels have different lengths"));
        }
        Ok(Self { sample_rate, channels })
    }

    /// Mono convenience constructor.
    pub fn mono(sample_rate: u32, samples: Vec<f32>) -> VoiceResult<Self> {
        Self::new(sample_rate, vec![samples])
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Number of sample frames (samples per channel).
    pub fn frames(&self) -> usize {
        self.channels.first().map(Vec::len).unwrap_or(0)
    }

    pub fn channel(&self, index: usize) -> Option<&[f32]> {
        self.channels.get(index).map(Vec::as_slice)
    }

    /// Playback length in seconds.
    pub fn duration(&self) -> f64 {
        self.frames() as f64 / self.sample_rate as f64
    }
}

/// Build the MIME descriptor for PCM16 at the given rate.
pub fn pcm_mime_type(sample_rate: u32) -> String {
    format!("{};rate={}", PCM_MIME_PREFIX, sample_rate)
}

/// Read the `rate=` parameter out of a PCM MIME descriptor.
///
/// Returns `None` for non-PCM types or when no rate is declared.
pub fn parse_pcm_rate(mime_type: &str) -> Option<u32> {
    let mut parts = mime_type.split(';').map(str::trim);
    if !parts.next()?.eq_ignore_ascii_case(PCM_MIME_PREFIX) {
        return None;
    }
    parts
        .filter_map(|param| param.split_once('='))
        .find(|(key, _)| key.trim().eq_ignore_ascii_case("rate"))
        .and_then(|(_, value)| value.trim().parse().ok())
}

/// Whether a MIME descriptor names raw PCM audio.
pub fn is_pcm_mime(mime_type: &str) -> bool {
    mime_type
        .split(';')
        .next()
        .map(|base| base.trim().eq_ignore_ascii_case(PCM_MIME_PREFIX))
        .unwrap_or(false)
}

/// Convert normalized float samples to PCM16.
///
/// ## Conversion:
/// Each sample is clamped to [-1.0, 1.0] first, so `1.5` encodes exactly like `1.0`.
/// The cast truncates toward zero; NaN becomes 0.
pub fn float_to_pcm16(samples: &[f32]) -> Vec<i16> {
    samples
        .iter()
        .map(|&sample| {
            let s = sample.clamp(-1.0, 1.0);
            if s < 0.0 {
                (s * 32768.0) as i16
            } else {
                (s * 32767.0) as i16
            }
        })
        .collect()
}

/// Encode one captured block into a wire frame.
///
/// Pure and deterministic: the same samples always produce the same frame.
pub fn encode_frame(samples: &[f32], sample_rate: u32) -> AudioFrame {
    let pcm = float_to_pcm16(samples);
    let mut bytes = vec![0u8; pcm.len() * 2];
    LittleEndian::write_i16_into(&pcm, &mut bytes);

    AudioFrame {
        data: base64::engine::general_purpose::STANDARD.encode(&bytes),
        mime_type: pcm_mime_type(sample_rate),
        sample_rate,
    }
}

/// Decode a received chunk into a playable buffer.
///
/// ## Process:
/// 1. base64-decode the payload
/// 2. Reinterpret the bytes as little-endian i16 samples
/// 3. De-interleave by channel count
/// 4. Normalize by dividing by 32768
///
/// ## Errors:
/// `VoiceError::Decode` when the base64 is malformed, the payload is empty, or its
/// byte length is not a multiple of `2 * channels`.
pub fn decode_chunk(chunk: &AudioChunk) -> VoiceResult<PcmBuffer> {
    let channels = chunk.channels as usize;
    if channels == 0 {
        return Err(VoiceError::decode("channel count must be at least 1"));
    }

    let bytes = base64::engine::general_purpose::STANDARD
        .decode(chunk.data.trim())
        .map_err(|e| VoiceError::decode(format!("invalid base64 payload: {}", e)))?;

    if bytes.is_empty() {
        return Err(VoiceError::decode("empty audio payload"));
    }
    if bytes.len() % (2 * channels) != 0 {
        return Err(VoiceError::decode(format!(
            "payload of {} bytes is not a whole number of {}-channel PCM16 frames",
            bytes.len(),
            channels
        )));
    }

    let mut interleaved = vec![0i16; bytes.len() / 2];
    LittleEndian::read_i16_into(&bytes, &mut interleaved);

    let frames = interleaved.len() / channels;
    let mut planar = vec![Vec::with_capacity(frames); channels];
    for frame in interleaved.chunks_exact(channels) {
        for (channel, &sample) in planar.iter_mut().zip(frame) {
            channel.push(sample as f32 / 32768.0);
        }
    }

    PcmBuffer::new(chunk.sample_rate, planar)
}

/// Root-mean-square level of a block, scaled for a level meter and capped at 1.0.
pub fn rms_level(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f32 = samples.iter().map(|s| s * s).sum();
    let rms = (sum / samples.len() as f32).sqrt();
    (rms * 10.0).min(1.0)
}
