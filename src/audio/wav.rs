//! # WAV File Devices
//!
//! A device backend for hosts without a sound card: the microphone replays a WAV file
//! in real time and the speaker records everything it plays into another WAV file.
//!
//! ## Input:
//! - Mono 16-bit PCM or 32-bit float, at exactly the capture sample rate
//! - Delivered one block per block duration, like a real capture callback
//! - A missing, unreadable or mismatched file is a permission error (no usable device)
//!
//! ## Output:
//! - The clock is time elapsed since the device was opened
//! - Each scheduled buffer is placed on a timeline; a tokio timer reports its natural end
//! - Force-stopped buffers are cut at the moment they were stopped
//! - `close()` mixes the timeline down to a 16-bit WAV at the playback sample rate

use crate::audio::codec::{float_to_pcm16, PcmBuffer};
use crate::audio::device::{AudioBackend, AudioOutput, EndedSender, InputStream, SampleSender, SourceId};
use crate::config::{CaptureConfig, DeviceConfig, PlaybackConfig};
use crate::error::{VoiceError, VoiceResult};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fs::File;
use std::io::Cursor;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use wav::{BitDepth, Header};

/// Read a mono WAV file as normalized samples, returning them with the file's rate.
pub fn read_mono_wav(bytes: &[u8]) -> VoiceResult<(Vec<f32>, u32)> {
    let (header, data) = wav::read(&mut Cursor::new(bytes))
        .map_err(|e| VoiceError::permission(format!("unreadable WAV input: {}", e)))?;

    if header.channel_count != 1 {
        return Err(VoiceError::permission(format!(
            "WAV input has {} channels, mono required",
            header.channel_count
        )));
    }

    let samples: Vec<f32> = match data {
        BitDepth::Sixteen(samples) => samples.into_iter().map(|s| s as f32 / 32768.0).collect(),
        BitDepth::ThirtyTwoFloat(samples) => samples,
        _ => {
            return Err(VoiceError::permission(
                "WAV input must be 16-bit PCM or 32-bit float",
            ))
        }
    };
    Ok((samples, header.sampling_rate))
}

/// Backend that reads and writes the WAV files named by `DeviceConfig`.
#[derive(Debug, Clone, Copy, Default)]
pub struct WavBackend;

#[async_trait]
impl AudioBackend for WavBackend {
    async fn open_input(
        &self,
        devices: &DeviceConfig,
        config: &CaptureConfig,
    ) -> VoiceResult<Box<dyn InputStream>> {
        let path = PathBuf::from(&devices.input_wav);
        let bytes = tokio::fs::read(&path).await.map_err(|e| {
            VoiceError::permission(format!("no capture device available ({}: {})", path.display(), e))
        })?;
        let (samples, sample_rate) = read_mono_wav(&bytes)?;

        info!(
            path = %path.display(),
            sample_rate,
            seconds = samples.len() as f64 / sample_rate.max(1) as f64,
            "Opened WAV capture source"
        );

        Ok(Box::new(WavInput {
            samples: Arc::new(samples),
            sample_rate,
            block_size: config.block_size.max(1),
            pump: None,
            released: false,
        }))
    }

    fn open_output(
        &self,
        devices: &DeviceConfig,
        config: &PlaybackConfig,
        ended: EndedSender,
    ) -> VoiceResult<Box<dyn AudioOutput>> {
        if config.sample_rate == 0 || config.channels == 0 {
            return Err(VoiceError::device("output needs a sample rate and at least one channel"));
        }
        Ok(Box::new(WavRecorder {
            path: PathBuf::from(&devices.output_wav),
            sample_rate: config.sample_rate,
            channels: config.channels,
            opened_at: Instant::now(),
            clips: Vec::new(),
            timers: HashMap::new(),
            ended,
            next_source: 0,
            closed: false,
        }))
    }
}

/// A WAV file replayed as a live microphone.
struct WavInput {
    samples: Arc<Vec<f32>>,
    sample_rate: u32,
    block_size: usize,
    pump: Option<JoinHandle<()>>,
    released: bool,
}

impl InputStream for WavInput {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn start(&mut self, tx: SampleSender) -> VoiceResult<()> {
        if self.released {
            return Err(VoiceError::device("WAV input already released"));
        }
        let samples = self.samples.clone();
        let block_size = self.block_size;
        let period = Duration::from_secs_f64(block_size as f64 / self.sample_rate as f64);

        self.pump = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            for block in samples.chunks(block_size) {
                ticker.tick().await;
                if tx.send(block.to_vec()).is_err() {
                    return;
                }
            }
            debug!("WAV capture source exhausted");
        }));
        Ok(())
    }

    fn disconnect(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }

    fn release(&mut self) {
        self.disconnect();
        self.released = true;
    }
}

/// One buffer placed on the recording timeline.
struct Clip {
    source: SourceId,
    buffer: PcmBuffer,
    start: f64,
    /// Set when force-stopped before its natural end
    cut_at: Option<f64>,
}

/// Speaker that records to a WAV file on close.
struct WavRecorder {
    path: PathBuf,
    sample_rate: u32,
    channels: u16,
    opened_at: Instant,
    clips: Vec<Clip>,
    timers: HashMap<SourceId, JoinHandle<()>>,
    ended: EndedSender,
    next_source: u64,
    closed: bool,
}

impl WavRecorder {
    /// Mix the timeline into interleaved samples at the recorder's rate and channel count.
    fn mix(&self) -> Vec<f32> {
        let rate = self.sample_rate as f64;
        let channels = self.channels as usize;
        let end = self
            .clips
            .iter()
            .map(|clip| clip.cut_at.unwrap_or(clip.start + clip.buffer.duration()))
            .fold(0.0f64, f64::max);
        let total_frames = (end * rate).ceil() as usize;
        let mut mixed = vec![0.0f32; total_frames * channels];

        for clip in &self.clips {
            let clip_end = clip.cut_at.unwrap_or(clip.start + clip.buffer.duration());
            let first = (clip.start * rate).round() as usize;
            let last = ((clip_end * rate).round() as usize).min(total_frames);
            let ratio = clip.buffer.sample_rate() as f64 / rate;

            for frame in first..last {
                let source_frame = ((frame - first) as f64 * ratio) as usize;
                if source_frame >= clip.buffer.frames() {
                    break;
                }
                for channel in 0..channels {
                    let source_channel = channel.min(clip.buffer.channel_count() - 1);
                    if let Some(samples) = clip.buffer.channel(source_channel) {
                        mixed[frame * channels + channel] += samples[source_frame];
                    }
                }
            }
        }
        mixed
    }

    fn write_file(&self) -> VoiceResult<()> {
        let pcm = float_to_pcm16(&self.mix());
        let header = Header::new(wav::header::WAV_FORMAT_PCM, self.channels, self.sample_rate, 16);
        let mut file = File::create(&self.path)
            .map_err(|e| VoiceError::device(format!("cannot create {}: {}", self.path.display(), e)))?;
        wav::write(header, &BitDepth::Sixteen(pcm), &mut file)
            .map_err(|e| VoiceError::device(format!("cannot write {}: {}", self.path.display(), e)))
    }
}

impl AudioOutput for WavRecorder {
    fn now(&self) -> f64 {
        self.opened_at.elapsed().as_secs_f64()
    }

    fn schedule(&mut self, buffer: PcmBuffer, start_at: f64) -> VoiceResult<SourceId> {
        if self.closed {
            return Err(VoiceError::device("output device is closed"));
        }
        self.next_source += 1;
        let source = SourceId(self.next_source);

        let ends_in = (start_at + buffer.duration() - self.now()).max(0.0);
        let ended = self.ended.clone();
        self.timers.insert(
            source,
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs_f64(ends_in)).await;
                let _ = ended.send(source);
            }),
        );
        self.clips.push(Clip {
            source,
            buffer,
            start: start_at,
            cut_at: None,
        });
        Ok(source)
    }

    fn stop_source(&mut self, source: SourceId) -> VoiceResult<()> {
        let Some(timer) = self.timers.remove(&source) else {
            return Ok(());
        };
        if timer.is_finished() {
            return Ok(());
        }
        timer.abort();

        let now = self.now();
        if let Some(clip) = self.clips.iter_mut().find(|clip| clip.source == source) {
            // A clip stopped before it began never sounds
            clip.cut_at = Some(now.max(clip.start));
        }
        Ok(())
    }

    fn close(&mut self) -> VoiceResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        for (_, timer) in self.timers.drain() {
            timer.abort();
        }
        let now = self.now();
        for clip in &mut self.clips {
            let natural_end = clip.start + clip.buffer.duration();
            if clip.cut_at.is_none() && natural_end > now {
                clip.cut_at = Some(now.max(clip.start));
            }
        }

        self.write_file()?;
        info!(path = %self.path.display(), clips = self.clips.len(), "Recorded playback to WAV");
        Ok(())
    }
}

impl Drop for WavRecorder {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(error = %e, "Failed to write playback recording");
        }
    }
}
