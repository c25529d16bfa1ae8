//! In-memory devices and service used by unit tests.

use crate::audio::codec::AudioChunk;
use crate::audio::codec::PcmBuffer;
use crate::audio::device::{AudioBackend, AudioOutput, EndedSender, InputStream, SampleSender, SourceId};
use crate::config::{CaptureConfig, DeviceConfig, PlaybackConfig};
use crate::error::{VoiceError, VoiceResult};
use crate::protocol::{
    Connection, InboundEvent, OutboundMessage, OutboundSink, SessionSetup, VoiceConnector,
};
use async_trait::async_trait;
use base64::Engine;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Base64 PCM16 silence lasting `seconds` at `sample_rate`.
pub(crate) fn silent_chunk(seconds: f64, sample_rate: u32) -> AudioChunk {
    let frames = (seconds * sample_rate as f64).round() as usize;
    let data = base64::engine::general_purpose::STANDARD.encode(vec![0u8; frames * 2]);
    AudioChunk::new(data, sample_rate, 1)
}

#[derive(Default)]
struct Devices {
    deny_mic: bool,
    input_rate: Option<u32>,
    mic_held: bool,
    input_tx: Option<SampleSender>,
    output_open: bool,
    clock: f64,
    next_source: u64,
    live: HashSet<SourceId>,
    scheduled: Vec<(SourceId, f64, f64)>,
    ended_tx: Option<EndedSender>,
    events: Vec<String>,
    opened_with: Vec<DeviceConfig>,
}

/// Microphone and speaker that record what was done to them.
#[derive(Clone, Default)]
pub(crate) struct FakeBackend {
    devices: Arc<Mutex<Devices>>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deny_microphone(&self) {
        self.devices.lock().unwrap().deny_mic = true;
    }

    pub fn set_input_rate(&self, rate: u32) {
        self.devices.lock().unwrap().input_rate = Some(rate);
    }

    pub fn set_clock(&self, seconds: f64) {
        self.devices.lock().unwrap().clock = seconds;
    }

    /// Deliver one run of samples as the microphone would.
    pub fn feed_microphone(&self, samples: Vec<f32>) {
        if let Some(tx) = &self.devices.lock().unwrap().input_tx {
            let _ = tx.send(samples);
        }
    }

    /// Finish a source on the device side without notifying anyone.
    pub fn finish_source(&self, source: SourceId) {
        self.devices.lock().unwrap().live.remove(&source);
    }

    pub fn microphone_held(&self) -> bool {
        self.devices.lock().unwrap().mic_held
    }

    pub fn output_open(&self) -> bool {
        self.devices.lock().unwrap().output_open
    }

    pub fn live_sources(&self) -> Vec<SourceId> {
        self.devices.lock().unwrap().live.iter().copied().collect()
    }

    /// Every schedule call as `(source, start, duration)`.
    pub fn scheduled(&self) -> Vec<(SourceId, f64, f64)> {
        self.devices.lock().unwrap().scheduled.clone()
    }

    pub fn events(&self) -> Vec<String> {
        self.devices.lock().unwrap().events.clone()
    }

    /// Device selection passed to each `open_input` and `open_output` call.
    pub fn opened_with(&self) -> Vec<DeviceConfig> {
        self.devices.lock().unwrap().opened_with.clone()
    }
}

#[async_trait]
impl AudioBackend for FakeBackend {
    async fn open_input(
        &self,
        selection: &DeviceConfig,
        config: &CaptureConfig,
    ) -> VoiceResult<Box<dyn InputStream>> {
        let mut devices = self.devices.lock().unwrap();
        devices.opened_with.push(selection.clone());
        if devices.deny_mic {
            return Err(VoiceError::permission("Permission denied"));
        }
        devices.mic_held = true;
        devices.events.push("input.open".into());
        Ok(Box::new(FakeInput {
            devices: self.devices.clone(),
            sample_rate: devices.input_rate.unwrap_or(config.sample_rate),
        }))
    }

    fn open_output(
        &self,
        selection: &DeviceConfig,
        _config: &PlaybackConfig,
        ended: EndedSender,
    ) -> VoiceResult<Box<dyn AudioOutput>> {
        let mut devices = self.devices.lock().unwrap();
        devices.opened_with.push(selection.clone());
        devices.output_open = true;
        devices.ended_tx = Some(ended);
        devices.events.push("output.open".into());
        Ok(Box::new(FakeOutput {
            devices: self.devices.clone(),
        }))
    }
}

struct FakeInput {
    devices: Arc<Mutex<Devices>>,
    sample_rate: u32,
}

impl InputStream for FakeInput {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn start(&mut self, samples: SampleSender) -> VoiceResult<()> {
        let mut devices = self.devices.lock().unwrap();
        devices.input_tx = Some(samples);
        devices.events.push("input.start".into());
        Ok(())
    }

    fn disconnect(&mut self) {
        let mut devices = self.devices.lock().unwrap();
        devices.input_tx = None;
        devices.events.push("input.disconnect".into());
    }

    fn release(&mut self) {
        let mut devices = self.devices.lock().unwrap();
        if devices.mic_held {
            devices.mic_held = false;
            devices.events.push("input.release".into());
        }
    }
}

struct FakeOutput {
    devices: Arc<Mutex<Devices>>,
}

impl AudioOutput for FakeOutput {
    fn now(&self) -> f64 {
        self.devices.lock().unwrap().clock
    }

    fn schedule(&mut self, buffer: PcmBuffer, start_at: f64) -> VoiceResult<SourceId> {
        let mut devices = self.devices.lock().unwrap();
        devices.next_source += 1;
        let source = SourceId(devices.next_source);
        devices.live.insert(source);
        devices.scheduled.push((source, start_at, buffer.duration()));
        devices.events.push("output.schedule".into());
        Ok(source)
    }

    fn stop_source(&mut self, source: SourceId) -> VoiceResult<()> {
        let mut devices = self.devices.lock().unwrap();
        devices.events.push("output.stop".into());
        if devices.live.remove(&source) {
            Ok(())
        } else {
            Err(VoiceError::device(format!("{} already finished", source)))
        }
    }

    fn close(&mut self) -> VoiceResult<()> {
        let mut devices = self.devices.lock().unwrap();
        if devices.output_open {
            devices.output_open = false;
            devices.events.push("output.close".into());
        }
        Ok(())
    }
}

impl Drop for FakeOutput {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[derive(Default)]
struct Service {
    fail_with: Option<String>,
    hang: bool,
    attempts: usize,
    setups: Vec<SessionSetup>,
    sent: Vec<OutboundMessage>,
    events_tx: Option<mpsc::Sender<InboundEvent>>,
    sink_closed: bool,
}

/// Remote service double: records what was sent, lets tests inject events.
#[derive(Clone, Default)]
pub(crate) struct FakeConnector {
    service: Arc<Mutex<Service>>,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_connect(&self, reason: &str) {
        self.service.lock().unwrap().fail_with = Some(reason.to_string());
    }

    pub fn hang_connect(&self) {
        self.service.lock().unwrap().hang = true;
    }

    /// Push an event into the most recent connection.
    pub async fn emit(&self, event: InboundEvent) {
        let tx = self.service.lock().unwrap().events_tx.clone();
        if let Some(tx) = tx {
            let _ = tx.send(event).await;
        }
    }

    pub fn sent(&self) -> Vec<OutboundMessage> {
        self.service.lock().unwrap().sent.clone()
    }

    pub fn connect_attempts(&self) -> usize {
        self.service.lock().unwrap().attempts
    }

    pub fn last_setup(&self) -> Option<SessionSetup> {
        self.service.lock().unwrap().setups.last().cloned()
    }

    pub fn sink_closed(&self) -> bool {
        self.service.lock().unwrap().sink_closed
    }
}

#[async_trait]
impl VoiceConnector for FakeConnector {
    async fn connect(&self, setup: SessionSetup) -> VoiceResult<Connection> {
        let hang = {
            let mut service = self.service.lock().unwrap();
            service.attempts += 1;
            if let Some(reason) = &service.fail_with {
                return Err(VoiceError::connect(reason.clone()));
            }
            service.hang
        };
        if hang {
            std::future::pending::<()>().await;
        }

        let (tx, events) = mpsc::channel(64);
        let mut service = self.service.lock().unwrap();
        service.setups.push(setup);
        service.events_tx = Some(tx);
        service.sink_closed = false;
        Ok(Connection {
            sink: Box::new(FakeSink {
                service: self.service.clone(),
            }),
            events,
        })
    }
}

struct FakeSink {
    service: Arc<Mutex<Service>>,
}

#[async_trait]
impl OutboundSink for FakeSink {
    async fn send(&mut self, message: OutboundMessage) -> VoiceResult<()> {
        self.service.lock().unwrap().sent.push(message);
        Ok(())
    }

    async fn close(&mut self) -> VoiceResult<()> {
        self.service.lock().unwrap().sink_closed = true;
        Ok(())
    }
}
