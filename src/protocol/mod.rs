//! # Remote Voice Service Protocol
//!
//! The session core treats the AI voice service as an opaque bidirectional stream.
//! This module defines the vocabulary of that stream and the seams a concrete service
//! plugs into.
//!
//! ## Message Kinds:
//! - **Outbound**: realtime audio frames, text turns, tool responses
//! - **Inbound**: open, audio chunks, tool calls, interruption, turn end, close, error
//!
//! ## Key Rust Concepts:
//! - **Tagged enums**: every message is one variant, dispatched with a single `match`
//! - **Split ownership**: a `Connection` hands the write half (`OutboundSink`) and the
//!   read half (an event channel) to the session separately, so both can be awaited
//!   in the same `select!` loop

pub mod gemini;

use crate::audio::codec::{AudioChunk, AudioFrame};
use crate::config::{AppConfig, PlaybackConfig, ServiceConfig};
use crate::error::VoiceResult;
use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::mpsc;

/// A function call requested by the remote agent.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    /// Opaque id the response must echo back
    pub id: String,
    pub name: String,
    pub args: Map<String, Value>,
}

/// Acknowledgement of one tool call.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolResponse {
    pub call_id: String,
    pub name: String,
    pub response: Value,
}

/// Everything the session sends to the service.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundMessage {
    /// One captured audio frame
    Audio(AudioFrame),
    /// A complete user text turn
    Text(String),
    ToolResponse(ToolResponse),
}

impl OutboundMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            OutboundMessage::Audio(_) => "audio",
            OutboundMessage::Text(_) => "text",
            OutboundMessage::ToolResponse(_) => "tool_response",
        }
    }
}

/// Everything the service can send to the session.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    /// The service accepted the session and is ready for input
    Open,
    /// One chunk of synthesized speech
    Audio(AudioChunk),
    /// One or more function calls, each to be acknowledged
    ToolCall(Vec<ToolCall>),
    /// The user talked over the agent; queued speech is stale
    Interrupted,
    /// The agent finished its turn
    TurnComplete,
    /// The service closed the stream
    Closed { reason: Option<String> },
    /// The stream failed
    Error(String),
}

/// What the service needs to know before the first message.
///
/// Built from the configuration of the session being started, so runtime config
/// updates take effect on the next connect.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSetup {
    /// Endpoint, credential, model, voice and system instruction
    pub service: ServiceConfig,
    /// Format assumed for inbound audio that does not declare its own
    pub playback: PlaybackConfig,
    /// Function declarations, one JSON object per tool
    pub tools: Vec<Value>,
}

impl SessionSetup {
    pub fn new(config: &AppConfig, tools: Vec<Value>) -> Self {
        Self {
            service: config.service.clone(),
            playback: config.playback.clone(),
            tools,
        }
    }
}

/// Write half of a live connection.
#[async_trait]
pub trait OutboundSink: Send {
    async fn send(&mut self, message: OutboundMessage) -> VoiceResult<()>;

    /// Close the connection. Closing twice is not an error.
    async fn close(&mut self) -> VoiceResult<()>;
}

/// A live connection: the write half plus the stream of inbound events.
///
/// The event channel ends after `Closed` or `Error` has been delivered.
pub struct Connection {
    pub sink: Box<dyn OutboundSink>,
    pub events: mpsc::Receiver<InboundEvent>,
}

/// Opens connections to a remote voice service.
#[async_trait]
pub trait VoiceConnector: Send + Sync {
    /// Connect and send the session setup.
    ///
    /// Fails with `VoiceError::Connect` when the service cannot be reached. Success does
    /// not mean the session is open yet; that is signalled by `InboundEvent::Open`.
    async fn connect(&self, setup: SessionSetup) -> VoiceResult<Connection>;
}
