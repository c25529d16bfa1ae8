//! # Audio Module
//!
//! Everything that touches sample data on this side of the wire.
//!
//! ## Key Components:
//! - **Codec**: PCM16 framing and unframing (`encode_frame` / `decode_chunk`)
//! - **Device**: traits for the microphone and speaker collaborators
//! - **Capture**: owns the microphone and slices its stream into fixed-size frames
//! - **Playback**: gapless scheduling of decoded buffers on an output clock
//! - **Wav**: a file-backed device pair so the service can run headless
//!
//! ## Audio Format Conventions:
//! - **Outbound**: 16 kHz mono, 4096-sample blocks
//! - **Inbound**: 24 kHz mono unless the payload declares otherwise
//! - **Encoding**: little-endian signed 16-bit integers, base64 on the wire

pub mod capture;    // Microphone ownership and block slicing
pub mod codec;      // PCM16 <-> f32 conversion
pub mod device;     // Input/output device traits
pub mod playback;   // Gapless playback scheduler
pub mod wav;        // WAV file device backend

pub use codec::{decode_chunk, encode_frame, AudioChunk, AudioFrame, PcmBuffer};
pub use device::{AudioBackend, AudioOutput, InputStream, SourceId};
