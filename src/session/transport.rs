//! # Session Transport
//!
//! One live conversation with the remote voice service. The transport owns every
//! resource of the session (microphone, speaker, connection) and runs inside a single
//! tokio task, so all session state has exactly one mutation point.
//!
//! ## State Machine:
//! ```text
//! Idle -> Connecting -> Active -> Closed
//!             |            |
//!             +--> Failed <+
//! ```
//!
//! - **Connecting -> Active**: the service reports `Open`. Capture starts, queued
//!   messages are flushed, the opening trigger is armed.
//! - **Active**: audio is scheduled for playback, tool calls are dispatched and
//!   acknowledged, captured frames are sent.
//! - **-> Closed**: explicit stop or the service closing the stream.
//! - **-> Failed**: a transport error, or the connect deadline passing.
//!
//! Both exits tear down in the same order: capture, then playback, then the connection.
//!
//! ## Key Rust Concepts:
//! - **tokio::select!**: commands, inbound events, captured samples, playback
//!   completions and timers are awaited together in one loop
//! - **watch channel**: every state change is published as a `SessionSnapshot`

use crate::audio::capture::{CapturePipeline, CapturedBlock};
use crate::audio::device::SourceId;
use crate::audio::playback::PlaybackScheduler;
use crate::config::AppConfig;
use crate::error::{VoiceError, VoiceResult};
use crate::protocol::{InboundEvent, OutboundMessage, OutboundSink, ToolCall, ToolResponse};
use crate::session::tools::{Detection, ToolRegistry};
use serde::Serialize;
use serde_json::json;
use std::collections::VecDeque;
use std::future::pending;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, sleep_until, Instant, Sleep};
use tracing::{debug, error, info, trace, warn};

/// Consumer notified once per acknowledged tool call.
pub type DetectionCallback = Arc<dyn Fn(Detection) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportState {
    Idle,
    Connecting,
    Active,
    Closed,
    Failed,
}

impl TransportState {
    /// Connecting or Active.
    pub fn is_live(&self) -> bool {
        matches!(self, TransportState::Connecting | TransportState::Active)
    }
}

/// Observable view of the current (or most recent) session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub state: TransportState,
    pub session_id: Option<String>,
    pub last_error: Option<String>,
    pub last_detection: Option<Detection>,
    /// Meter level of the last captured block, 0.0 to 1.0
    pub input_level: f32,
    pub frames_sent: u64,
    pub chunks_played: u64,
}

impl Default for SessionSnapshot {
    fn default() -> Self {
        Self {
            state: TransportState::Idle,
            session_id: None,
            last_error: None,
            last_detection: None,
            input_level: 0.0,
            frames_sent: 0,
            chunks_played: 0,
        }
    }
}

/// Requests from the controller to a running session.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Stop,
    SendText(String),
}

enum Flow {
    Continue,
    Stop,
}

/// The settings one session needs, frozen when it starts.
#[derive(Debug, Clone)]
pub struct TransportSettings {
    pub opening_trigger: String,
    pub opening_trigger_delay: Duration,
    pub flush_on_interrupt: bool,
    pub ack_invalid_tool_calls: bool,
}

impl From<&AppConfig> for TransportSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            opening_trigger: config.session.opening_trigger.clone(),
            opening_trigger_delay: Duration::from_millis(config.session.opening_trigger_delay_ms),
            flush_on_interrupt: config.playback.flush_on_interrupt,
            ack_invalid_tool_calls: config.session.ack_invalid_tool_calls,
        }
    }
}

/// Receiving ends the session task listens on.
pub struct TransportInputs {
    pub commands: mpsc::UnboundedReceiver<Command>,
    pub events: mpsc::Receiver<InboundEvent>,
    pub playback_ended: mpsc::UnboundedReceiver<SourceId>,
    /// Fail with a connect error if the service has not opened by then
    pub connect_deadline: Option<Instant>,
}

pub struct SessionTransport {
    settings: TransportSettings,
    capture: CapturePipeline,
    playback: PlaybackScheduler,
    sink: Box<dyn OutboundSink>,
    outbound: VecDeque<OutboundMessage>,
    tools: Arc<ToolRegistry>,
    status: Arc<watch::Sender<SessionSnapshot>>,
    on_detection: Option<DetectionCallback>,
    state: TransportState,
}

impl SessionTransport {
    /// Assemble a session from already acquired resources.
    ///
    /// The published state is set to `Connecting`.
    pub fn new(
        settings: TransportSettings,
        capture: CapturePipeline,
        playback: PlaybackScheduler,
        sink: Box<dyn OutboundSink>,
        tools: Arc<ToolRegistry>,
        status: Arc<watch::Sender<SessionSnapshot>>,
        on_detection: Option<DetectionCallback>,
    ) -> Self {
        let transport = Self {
            settings,
            capture,
            playback,
            sink,
            outbound: VecDeque::new(),
            tools,
            status,
            on_detection,
            state: TransportState::Connecting,
        };
        transport.status.send_modify(|s| s.state = TransportState::Connecting);
        transport
    }

    /// Hold a message until the service opens the session.
    pub fn queue(&mut self, message: OutboundMessage) {
        trace!(kind = message.kind(), queued = self.outbound.len() + 1, "Queued outbound message");
        self.outbound.push_back(message);
    }

    /// Drive the session until it is closed or fails.
    pub async fn run(mut self, inputs: TransportInputs) -> TransportState {
        let TransportInputs {
            mut commands,
            mut events,
            mut playback_ended,
            connect_deadline,
        } = inputs;
        let mut samples: Option<mpsc::UnboundedReceiver<Vec<f32>>> = None;
        let mut opening_trigger: Option<Pin<Box<Sleep>>> = None;

        loop {
            let connecting = self.state == TransportState::Connecting;

            let step: VoiceResult<Flow> = tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::SendText(text)) => self.send(OutboundMessage::Text(text)).await.map(|_| Flow::Continue),
                    Some(Command::Stop) | None => Ok(Flow::Stop),
                },
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event, &mut samples, &mut opening_trigger).await,
                    None => Err(VoiceError::transport("event stream ended without a close")),
                },
                run = next_run(&mut samples) => match run {
                    Some(run) => self.handle_samples(&run).await,
                    None => {
                        debug!("Capture stream ended");
                        samples = None;
                        Ok(Flow::Continue)
                    }
                },
                Some(source) = playback_ended.recv() => {
                    self.playback.on_ended(source);
                    Ok(Flow::Continue)
                },
                _ = fire(&mut opening_trigger) => {
                    opening_trigger = None;
                    let text = self.settings.opening_trigger.clone();
                    debug!(%text, "Sending opening trigger");
                    self.send(OutboundMessage::Text(text)).await.map(|_| Flow::Continue)
                },
                _ = deadline(connect_deadline), if connecting => {
                    Err(VoiceError::connect("timed out waiting for the service to open the session"))
                },
            };

            match step {
                Ok(Flow::Continue) => {}
                Err(e) if !e.is_fatal() => warn!(error = %e, "Session continues after error"),
                Ok(Flow::Stop) => {
                    self.close().await;
                    break;
                }
                Err(e) => {
                    self.fail(e).await;
                    break;
                }
            }
        }

        self.state
    }

    async fn handle_event(
        &mut self,
        event: InboundEvent,
        samples: &mut Option<mpsc::UnboundedReceiver<Vec<f32>>>,
        opening_trigger: &mut Option<Pin<Box<Sleep>>>,
    ) -> VoiceResult<Flow> {
        match event {
            InboundEvent::Open => {
                if self.state != TransportState::Connecting {
                    debug!("Ignoring duplicate open");
                    return Ok(Flow::Continue);
                }
                *samples = Some(self.capture.start().map_err(|e| match e {
                    VoiceError::Permission(_) => e,
                    other => VoiceError::permission(other.to_string()),
                })?);
                self.set_state(TransportState::Active);
                self.flush_outbound().await?;
                if !self.settings.opening_trigger.is_empty() {
                    *opening_trigger = Some(Box::pin(sleep(self.settings.opening_trigger_delay)));
                }
                Ok(Flow::Continue)
            }
            InboundEvent::Audio(chunk) => {
                match self.playback.enqueue(&chunk) {
                    Ok(entry) => {
                        trace!(start = entry.start_time, duration = entry.duration, "Queued speech");
                        self.status.send_modify(|s| s.chunks_played += 1);
                    }
                    Err(e) => warn!(error = %e, "Dropping audio chunk"),
                }
                Ok(Flow::Continue)
            }
            InboundEvent::ToolCall(calls) => {
                for call in calls {
                    self.handle_tool_call(call).await?;
                }
                Ok(Flow::Continue)
            }
            InboundEvent::Interrupted => {
                if self.settings.flush_on_interrupt {
                    info!(dropped = self.playback.live_count(), "Agent interrupted; flushing playback");
                    self.playback.stop_all();
                }
                Ok(Flow::Continue)
            }
            InboundEvent::TurnComplete => {
                debug!("Agent turn complete");
                Ok(Flow::Continue)
            }
            InboundEvent::Closed { reason } => {
                info!(reason = reason.as_deref().unwrap_or("none"), "Service closed the session");
                Ok(Flow::Stop)
            }
            InboundEvent::Error(message) => Err(VoiceError::transport(message)),
        }
    }

    async fn handle_tool_call(&mut self, call: ToolCall) -> VoiceResult<()> {
        match self.tools.dispatch(&call) {
            Ok(outcome) => {
                info!(call_id = %call.id, tool = %call.name, "Tool call handled");
                self.send(OutboundMessage::ToolResponse(ToolResponse {
                    call_id: call.id,
                    name: call.name,
                    response: outcome.response,
                }))
                .await?;

                if let Some(detection) = outcome.detection {
                    self.status.send_modify(|s| s.last_detection = Some(detection));
                    if let Some(callback) = &self.on_detection {
                        callback(detection);
                    }
                }
            }
            Err(e @ VoiceError::UnknownTool(_)) => {
                warn!(call_id = %call.id, error = %e, "Ignoring tool call");
            }
            Err(e) => {
                warn!(call_id = %call.id, error = %e, "Rejected tool call");
                if self.settings.ack_invalid_tool_calls {
                    self.send(OutboundMessage::ToolResponse(ToolResponse {
                        call_id: call.id,
                        name: call.name,
                        response: json!({ "error": e.to_string() }),
                    }))
                    .await?;
                }
            }
        }
        Ok(())
    }

    async fn handle_samples(&mut self, run: &[f32]) -> VoiceResult<Flow> {
        let blocks = self.capture.push_samples(run);
        for CapturedBlock { frame, level } in blocks {
            self.send(OutboundMessage::Audio(frame)).await?;
            self.status.send_modify(|s| {
                s.input_level = level;
                s.frames_sent += 1;
            });
        }
        Ok(Flow::Continue)
    }

    /// The single outbound path: queued while connecting, sent while active,
    /// dropped once the session is over.
    async fn send(&mut self, message: OutboundMessage) -> VoiceResult<()> {
        match self.state {
            TransportState::Idle | TransportState::Connecting => {
                self.queue(message);
                Ok(())
            }
            TransportState::Active => self.sink.send(message).await,
            TransportState::Closed | TransportState::Failed => {
                debug!(kind = message.kind(), "Session over; dropping outbound message");
                Ok(())
            }
        }
    }

    async fn flush_outbound(&mut self) -> VoiceResult<()> {
        if !self.outbound.is_empty() {
            debug!(count = self.outbound.len(), "Flushing queued messages");
        }
        while let Some(message) = self.outbound.pop_front() {
            self.sink.send(message).await?;
        }
        Ok(())
    }

    fn set_state(&mut self, state: TransportState) {
        if self.state != state {
            info!(from = ?self.state, to = ?state, "Session state changed");
        }
        self.state = state;
        self.status.send_modify(|s| s.state = state);
    }

    async fn teardown(&mut self) {
        self.capture.stop();
        self.playback.close();
        if !self.outbound.is_empty() {
            debug!(dropped = self.outbound.len(), "Discarding unsent messages");
            self.outbound.clear();
        }
        if let Err(e) = self.sink.close().await {
            debug!(error = %e, "Connection did not close cleanly");
        }
    }

    async fn close(&mut self) {
        self.teardown().await;
        self.status.send_modify(|s| s.input_level = 0.0);
        self.set_state(TransportState::Closed);
    }

    async fn fail(&mut self, err: VoiceError) {
        error!(error = %err, "Session failed");
        self.teardown().await;
        let message = err.to_string();
        self.status.send_modify(|s| {
            s.last_error = Some(message);
            s.input_level = 0.0;
        });
        self.set_state(TransportState::Failed);
    }
}

async fn next_run(samples: &mut Option<mpsc::UnboundedReceiver<Vec<f32>>>) -> Option<Vec<f32>> {
    match samples {
        Some(rx) => rx.recv().await,
        None => pending().await,
    }
}

async fn fire(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(sleep) => sleep.as_mut().await,
        None => pending().await,
    }
}

async fn deadline(at: Option<Instant>) {
    match at {
        Some(at) => sleep_until(at).await,
        None => pending().await,
    }
}
