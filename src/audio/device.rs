//! # Audio Device Seams
//!
//! The microphone and the speaker are boundary collaborators. The session core only
//! talks to them through these traits, which keeps it testable with fake devices and
//! lets the binary plug in whatever backend the host provides.
//!
//! ## Key Rust Concepts:
//! - **async_trait**: `open_input` may wait on a permission prompt, so it is async
//! - **Trait objects**: `Box<dyn InputStream>` lets one session own any backend's stream
//! - **Channels**: devices push samples and completion notices into tokio channels
//!   instead of calling back into session state

use crate::audio::codec::PcmBuffer;
use crate::config::{CaptureConfig, DeviceConfig, PlaybackConfig};
use crate::error::VoiceResult;
use async_trait::async_trait;
use std::fmt;
use tokio::sync::mpsc;

/// Runs of captured samples, of whatever length the device produces.
pub type SampleSender = mpsc::UnboundedSender<Vec<f32>>;

/// Natural-completion notices for scheduled buffers.
pub type EndedSender = mpsc::UnboundedSender<SourceId>;

/// Handle to one buffer scheduled on an output device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceId(pub u64);

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "source-{}", self.0)
    }
}

/// Factory for the device pair one session uses.
///
/// `devices` names which microphone and speaker to open. It comes from the
/// configuration of the session being started, so a config update reaches the
/// next session without rebuilding the backend.
#[async_trait]
pub trait AudioBackend: Send + Sync {
    /// Acquire the microphone.
    ///
    /// Fails with `VoiceError::Permission` when access is denied or no device exists.
    /// On success the caller holds the device exclusively until `release()`.
    async fn open_input(
        &self,
        devices: &DeviceConfig,
        config: &CaptureConfig,
    ) -> VoiceResult<Box<dyn InputStream>>;

    /// Open an output device. Natural completion of each scheduled buffer is reported
    /// on `ended`.
    fn open_output(
        &self,
        devices: &DeviceConfig,
        config: &PlaybackConfig,
        ended: EndedSender,
    ) -> VoiceResult<Box<dyn AudioOutput>>;
}

/// An acquired microphone stream.
pub trait InputStream: Send {
    /// Rate the stream actually delivers samples at.
    fn sample_rate(&self) -> u32;

    /// Begin delivering sample runs to `samples`.
    fn start(&mut self, samples: SampleSender) -> VoiceResult<()>;

    /// Stop delivering samples. The device stays held.
    fn disconnect(&mut self);

    /// Give the physical device back. Must tolerate being called twice.
    fn release(&mut self);
}

/// A speaker with a monotonic clock and sample-accurate scheduling.
pub trait AudioOutput: Send {
    /// Current output clock time, in seconds.
    fn now(&self) -> f64;

    /// Schedule `buffer` to begin playing at `start_at` seconds on the output clock.
    fn schedule(&mut self, buffer: PcmBuffer, start_at: f64) -> VoiceResult<SourceId>;

    /// Force-stop one source. Stopping a source that already ended is not an error.
    fn stop_source(&mut self, id: SourceId) -> VoiceResult<()>;

    /// Close the device. A second close is a no-op.
    fn close(&mut self) -> VoiceResult<()>;
}
