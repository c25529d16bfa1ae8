//! # Capture Pipeline
//!
//! Owns the microphone for one session and turns its continuous sample stream into
//! fixed-size outbound frames.
//!
//! ## Lifecycle:
//! 1. **open**: acquire the microphone (may fail with a permission error)
//! 2. **start**: connect the stream and begin receiving sample runs
//! 3. **push_samples**: re-slice runs into `block_size` blocks and frame each one
//! 4. **stop**: disconnect, then release the device
//!
//! Devices deliver runs of any length. Leftover samples are carried into the next run,
//! so no sample is dropped while the pipeline is running.

use crate::audio::codec::{encode_frame, rms_level, AudioFrame};
use crate::audio::device::{AudioBackend, InputStream};
use crate::config::{CaptureConfig, DeviceConfig};
use crate::error::{VoiceError, VoiceResult};
use tokio::sync::mpsc;
use tracing::{debug, info, trace};

/// One framed block plus its meter level.
#[derive(Debug, Clone, PartialEq)]
pub struct CapturedBlock {
    pub frame: AudioFrame,
    /// `min(rms * 10, 1)` of the block's samples
    pub level: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CaptureState {
    Opened,
    Running,
    Stopped,
}

pub struct CapturePipeline {
    stream: Option<Box<dyn InputStream>>,
    sample_rate: u32,
    block_size: usize,
    pending: Vec<f32>,
    state: CaptureState,
}

impl CapturePipeline {
    /// Acquire the microphone.
    ///
    /// A stream running at a different rate than `config.sample_rate` is released again
    /// and reported as unusable.
    pub async fn open(
        backend: &dyn AudioBackend,
        devices: &DeviceConfig,
        config: &CaptureConfig,
    ) -> VoiceResult<Self> {
        let mut stream = backend.open_input(devices, config).await?;

        if stream.sample_rate() != config.sample_rate {
            let actual = stream.sample_rate();
            stream.release();
            return Err(VoiceError::permission(format!(
                "capture device runs at {} Hz, {} Hz required",
                actual, config.sample_rate
            )));
        }

        info!(sample_rate = config.sample_rate, block_size = config.block_size, "Microphone acquired");

        Ok(Self {
            stream: Some(stream),
            sample_rate: config.sample_rate,
            block_size: config.block_size.max(1),
            pending: Vec::with_capacity(config.block_size),
            state: CaptureState::Opened,
        })
    }

    /// Connect the stream. Sample runs arrive on the returned receiver and should be
    /// fed back through `push_samples`.
    pub fn start(&mut self) -> VoiceResult<mpsc::UnboundedReceiver<Vec<f32>>> {
        if self.state != CaptureState::Opened {
            return Err(VoiceError::device("capture pipeline cannot be started twice"));
        }
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| VoiceError::device("microphone already released"))?;

        let (tx, rx) = mpsc::unbounded_channel();
        stream.start(tx)?;
        self.state = CaptureState::Running;
        debug!("Capture started");
        Ok(rx)
    }

    /// Append a run of samples and return every complete block it produced.
    ///
    /// Returns nothing unless the pipeline is running.
    pub fn push_samples(&mut self, samples: &[f32]) -> Vec<CapturedBlock> {
        if self.state != CaptureState::Running {
            return Vec::new();
        }

        self.pending.extend_from_slice(samples);
        let complete = self.pending.len() / self.block_size;
        if complete == 0 {
            return Vec::new();
        }

        let consumed = complete * self.block_size;
        let blocks: Vec<CapturedBlock> = self.pending[..consumed]
            .chunks_exact(self.block_size)
            .map(|block| CapturedBlock {
                frame: encode_frame(block, self.sample_rate),
                level: rms_level(block),
            })
            .collect();
        self.pending.drain(..consumed);

        trace!(blocks = blocks.len(), carried = self.pending.len(), "Framed capture blocks");
        blocks
    }

    pub fn is_running(&self) -> bool {
        self.state == CaptureState::Running
    }

    /// Disconnect the stream, then release the microphone.
    ///
    /// Safe to call in any state and more than once.
    pub fn stop(&mut self) {
        if self.state == CaptureState::Stopped {
            return;
        }
        if let Some(mut stream) = self.stream.take() {
            if self.state == CaptureState::Running {
                stream.disconnect();
            }
            stream.release();
        }
        self.pending.clear();
        self.state = CaptureState::Stopped;
        info!("Microphone released");
    }
}

impl Drop for CapturePipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeBackend;

    fn config(block_size: usize) -> CaptureConfig {
        CaptureConfig {
            sample_rate: 16000,
            block_size,
        }
    }

    #[tokio::test]
    async fn test_open_fails_when_microphone_denied() {
        let backend = FakeBackend::new();
        backend.deny_microphone();

        let result = CapturePipeline::open(&backend, &DeviceConfig::default(), &config(4096)).await;
        assert!(matches!(result, Err(VoiceError::Permission(_))));
        assert!(!backend.microphone_held());
    }

    #[tokio::test]
    async fn test_rate_mismatch_releases_device() {
        let backend = FakeBackend::new();
        backend.set_input_rate(44100);

        let result = CapturePipeline::open(&backend, &DeviceConfig::default(), &config(4096)).await;
        assert!(matches!(result, Err(VoiceError::Permission(_))));
        assert!(!backend.microphone_held());
    }

    #[tokio::test]
    async fn test_runs_are_resliced_into_blocks() {
        let backend = FakeBackend::new();
        let mut capture = CapturePipeline::open(&backend, &DeviceConfig::default(), &config(4)).await.unwrap();

        // Not started yet: nothing is framed
        assert!(capture.push_samples(&[0.1; 8]).is_empty());

        let _rx = capture.start().unwrap();
        assert!(capture.push_samples(&[0.1; 3]).is_empty());
        let blocks = capture.push_samples(&[0.1; 6]);
        assert_eq!(blocks.len(), 2);
        let blocks = capture.push_samples(&[0.1; 3]);
        assert_eq!(blocks.len(), 1);

        for block in &blocks {
            assert_eq!(block.frame.mime_type, "audio/pcm;rate=16000");
            assert!(block.level > 0.99);
        }
    }

    #[tokio::test]
    async fn test_device_samples_reach_receiver() {
        let backend = FakeBackend::new();
        let mut capture = CapturePipeline::open(&backend, &DeviceConfig::default(), &config(4096)).await.unwrap();
        let mut rx = capture.start().unwrap();

        backend.feed_microphone(vec![0.25; 100]);
        assert_eq!(rx.recv().await.unwrap().len(), 100);
    }

    #[tokio::test]
    async fn test_stop_disconnects_before_release_and_is_idempotent() {
        let backend = FakeBackend::new();
        let mut capture = CapturePipeline::open(&backend, &DeviceConfig::default(), &config(4096)).await.unwrap();
        let _rx = capture.start().unwrap();

        capture.stop();
        capture.stop();

        assert_eq!(backend.events(), vec!["input.open", "input.start", "input.disconnect", "input.release"]);
        assert!(!backend.microphone_held());
        assert!(!capture.is_running());
        assert!(capture.push_samples(&[0.0; 8192]).is_empty());
    }
}
