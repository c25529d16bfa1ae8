//! # Gemini Live Connector
//!
//! Speaks the Gemini Live bidirectional WebSocket protocol.
//!
//! ## Wire Format:
//! Every frame is a JSON object with exactly one top-level key.
//!
//! Client to server:
//! - `setup`: model, response modality, voice, system instruction, tool declarations
//! - `realtimeInput.mediaChunks[]`: base64 PCM16 with a `mimeType`
//! - `clientContent.turns[]`: user text turns, `turnComplete: true`
//! - `toolResponse.functionResponses[]`: `{id, name, response}`
//!
//! Server to client:
//! - `setupComplete`: the session is open
//! - `serverContent.modelTurn.parts[].inlineData`: synthesized audio
//! - `serverContent.interrupted` / `serverContent.turnComplete`
//! - `toolCall.functionCalls[]`: `{id, name, args}`
//!
//! ## Connection Layout:
//! The socket is split. The write half becomes the session's `OutboundSink`; a spawned
//! reader task owns the read half and translates frames into `InboundEvent`s.

use crate::audio::codec::{is_pcm_mime, parse_pcm_rate, AudioChunk, AudioFrame};
use crate::config::ServiceConfig;
use crate::error::{VoiceError, VoiceResult};
use crate::protocol::{
    Connection, InboundEvent, OutboundMessage, OutboundSink, SessionSetup, ToolCall, ToolResponse,
    VoiceConnector,
};
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, trace, warn};

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Inbound event buffer between the reader task and the session.
const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
enum ClientMessage {
    Setup(Setup),
    RealtimeInput(RealtimeInput),
    ClientContent(ClientContent),
    ToolResponse(ToolResponsePayload),
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Setup {
    model: String,
    generation_config: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<Value>,
}

#[derive(Debug, Serialize)]
struct Content {
    parts: Vec<TextPart>,
}

#[derive(Debug, Serialize)]
struct TextPart {
    text: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RealtimeInput {
    media_chunks: Vec<MediaChunk>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MediaChunk {
    mime_type: String,
    data: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ClientContent {
    turns: Vec<Turn>,
    turn_complete: bool,
}

#[derive(Debug, Serialize)]
struct Turn {
    role: &'static str,
    parts: Vec<TextPart>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ToolResponsePayload {
    function_responses: Vec<FunctionResponse>,
}

#[derive(Debug, Serialize)]
struct FunctionResponse {
    id: String,
    name: String,
    response: Value,
}

fn audio_message(frame: &AudioFrame) -> ClientMessage {
    ClientMessage::RealtimeInput(RealtimeInput {
        media_chunks: vec![MediaChunk {
            mime_type: frame.mime_type.clone(),
            data: frame.data.clone(),
        }],
    })
}

fn text_message(text: &str) -> ClientMessage {
    ClientMessage::ClientContent(ClientContent {
        turns: vec![Turn {
            role: "user",
            parts: vec![TextPart { text: text.to_string() }],
        }],
        turn_complete: true,
    })
}

fn tool_response_message(response: &ToolResponse) -> ClientMessage {
    ClientMessage::ToolResponse(ToolResponsePayload {
        function_responses: vec![FunctionResponse {
            id: response.call_id.clone(),
            name: response.name.clone(),
            response: response.response.clone(),
        }],
    })
}

/// Serialize an outbound message into the text of one WebSocket frame.
pub fn encode_client_message(message: &OutboundMessage) -> VoiceResult<String> {
    let wire = match message {
        OutboundMessage::Audio(frame) => audio_message(frame),
        OutboundMessage::Text(text) => text_message(text),
        OutboundMessage::ToolResponse(response) => tool_response_message(response),
    };
    serde_json::to_string(&wire)
        .map_err(|e| VoiceError::transport(format!("failed to serialize {}: {}", message.kind(), e)))
}

/// Translate one server frame into session events, in the order they should be handled.
///
/// Audio parts without a `rate=` parameter are assumed to be at `default_rate`.
/// Frames with nothing the session cares about translate to no events.
pub fn translate_server_message(value: &Value, default_rate: u32, channels: u16) -> Vec<InboundEvent> {
    let mut events = Vec::new();

    if value.get("setupComplete").is_some() {
        events.push(InboundEvent::Open);
    }

    if let Some(content) = value.get("serverContent") {
        if content.get("interrupted").and_then(Value::as_bool).unwrap_or(false) {
            events.push(InboundEvent::Interrupted);
        }

        let parts = content
            .get("modelTurn")
            .and_then(|turn| turn.get("parts"))
            .and_then(Value::as_array);
        for part in parts.into_iter().flatten() {
            let Some(inline) = part.get("inlineData") else {
                continue;
            };
            let mime_type = inline.get("mimeType").and_then(Value::as_str).unwrap_or_default();
            let Some(data) = inline.get("data").and_then(Value::as_str) else {
                continue;
            };
            if !is_pcm_mime(mime_type) {
                debug!(mime_type, "Skipping non-PCM inline data");
                continue;
            }
            let rate = parse_pcm_rate(mime_type).unwrap_or(default_rate);
            events.push(InboundEvent::Audio(AudioChunk::new(data, rate, channels)));
        }

        if content.get("turnComplete").and_then(Value::as_bool).unwrap_or(false) {
            events.push(InboundEvent::TurnComplete);
        }
    }

    if let Some(calls) = value
        .get("toolCall")
        .and_then(|call| call.get("functionCalls"))
        .and_then(Value::as_array)
    {
        let calls: Vec<ToolCall> = calls
            .iter()
            .filter_map(|call| {
                let name = call.get("name").and_then(Value::as_str)?;
                Some(ToolCall {
                    id: call.get("id").and_then(Value::as_str).unwrap_or_default().to_string(),
                    name: name.to_string(),
                    args: call.get("args").and_then(Value::as_object).cloned().unwrap_or_default(),
                })
            })
            .collect();
        if !calls.is_empty() {
            events.push(InboundEvent::ToolCall(calls));
        }
    }

    if value.get("goAway").is_some() {
        warn!("Service announced it will close the connection soon");
    }

    events
}

fn endpoint_url(service: &ServiceConfig) -> VoiceResult<String> {
    if service.api_key.trim().is_empty() {
        return Err(VoiceError::connect("no API key configured"));
    }
    let separator = if service.endpoint.contains('?') { '&' } else { '?' };
    Ok(format!("{}{}key={}", service.endpoint, separator, service.api_key.trim()))
}

fn setup_message(setup: &SessionSetup) -> ClientMessage {
    let service = &setup.service;
    let mut generation_config = json!({ "responseModalities": ["AUDIO"] });
    if !service.voice_name.is_empty() {
        generation_config["speechConfig"] = json!({
            "voiceConfig": { "prebuiltVoiceConfig": { "voiceName": service.voice_name } }
        });
    }

    let system_instruction = (!service.system_instruction.is_empty()).then(|| Content {
        parts: vec![TextPart {
            text: service.system_instruction.clone(),
        }],
    });

    let tools = if setup.tools.is_empty() {
        Vec::new()
    } else {
        vec![json!({ "functionDeclarations": setup.tools })]
    };

    ClientMessage::Setup(Setup {
        model: service.model.clone(),
        generation_config,
        system_instruction,
        tools,
    })
}

/// Connects sessions to the Gemini Live API.
///
/// Holds no settings of its own: endpoint, key, model and voice come with each
/// `SessionSetup`.
#[derive(Debug, Clone, Copy, Default)]
pub struct GeminiConnector;

#[async_trait]
impl VoiceConnector for GeminiConnector {
    async fn connect(&self, setup: SessionSetup) -> VoiceResult<Connection> {
        let request = endpoint_url(&setup.service)?
            .into_client_request()
            .map_err(|e| VoiceError::connect(format!("invalid endpoint: {}", e)))?;

        let (stream, _response) = connect_async(request)
            .await
            .map_err(|e| VoiceError::connect(format!("WebSocket connect error: {}", e)))?;
        let (mut sink, source) = stream.split();

        let setup_text = serde_json::to_string(&setup_message(&setup))
            .map_err(|e| VoiceError::connect(format!("failed to serialize setup: {}", e)))?;
        sink.send(Message::Text(setup_text.into()))
            .await
            .map_err(|e| VoiceError::connect(format!("failed to send setup: {}", e)))?;
        info!(model = %setup.service.model, tools = setup.tools.len(), "Sent session setup");

        let (tx, events) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let reader = tokio::spawn(read_frames(
            source,
            tx,
            setup.playback.sample_rate,
            setup.playback.channels,
        ));

        Ok(Connection {
            sink: Box::new(GeminiSink {
                sink,
                reader,
                closed: false,
            }),
            events,
        })
    }
}

/// Pump server frames into the event channel until the socket or the session goes away.
async fn read_frames(
    mut source: SplitStream<WsStream>,
    tx: mpsc::Sender<InboundEvent>,
    default_rate: u32,
    channels: u16,
) {
    loop {
        let events = match source.next().await {
            Some(Ok(Message::Text(text))) => parse_frame(text.as_bytes(), default_rate, channels),
            Some(Ok(Message::Binary(bytes))) => parse_frame(&bytes, default_rate, channels),
            Some(Ok(Message::Close(frame))) => {
                let reason = frame.map(|f| f.reason.to_string()).filter(|r| !r.is_empty());
                vec![InboundEvent::Closed { reason }]
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => vec![InboundEvent::Error(format!("receive error: {}", e))],
            None => vec![InboundEvent::Closed { reason: None }],
        };

        let terminal = events
            .iter()
            .any(|event| matches!(event, InboundEvent::Closed { .. } | InboundEvent::Error(_)));
        for event in events {
            if tx.send(event).await.is_err() {
                debug!("Session dropped its event receiver; reader exiting");
                return;
            }
        }
        if terminal {
            return;
        }
    }
}

fn parse_frame(bytes: &[u8], default_rate: u32, channels: u16) -> Vec<InboundEvent> {
    match serde_json::from_slice::<Value>(bytes) {
        Ok(value) => {
            trace!(bytes = bytes.len(), "Server frame");
            translate_server_message(&value, default_rate, channels)
        }
        Err(e) => {
            warn!(error = %e, "Ignoring unparseable server frame");
            Vec::new()
        }
    }
}

struct GeminiSink {
    sink: SplitSink<WsStream, Message>,
    reader: JoinHandle<()>,
    closed: bool,
}

#[async_trait]
impl OutboundSink for GeminiSink {
    async fn send(&mut self, message: OutboundMessage) -> VoiceResult<()> {
        if self.closed {
            return Err(VoiceError::transport("connection already closed"));
        }
        let text = encode_client_message(&message)?;
        self.sink
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| VoiceError::transport(format!("send error: {}", e)))
    }

    async fn close(&mut self) -> VoiceResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let result = self.sink.close().await;
        self.reader.abort();
        result.map_err(|e| VoiceError::transport(format!("close error: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::codec::encode_frame;
    use crate::config::AppConfig;

    fn service(api_key: &str) -> ServiceConfig {
        let mut service = AppConfig::default().service;
        service.api_key = api_key.to_string();
        service
    }

    #[test]
    fn test_url_requires_api_key() {
        assert!(matches!(endpoint_url(&service("")), Err(VoiceError::Connect(_))));

        let url = endpoint_url(&service("secret")).unwrap();
        assert!(url.starts_with("wss://generativelanguage.googleapis.com/"));
        assert!(url.ends_with("BidiGenerateContent?key=secret"));
    }

    #[tokio::test]
    async fn test_connect_without_key_fails_before_dialing() {
        let setup = SessionSetup::new(&AppConfig::default(), Vec::new());
        let result = GeminiConnector.connect(setup).await;
        assert!(matches!(result, Err(VoiceError::Connect(_))));
    }

    #[test]
    fn test_setup_message_shape() {
        let mut config = AppConfig::default();
        config.service.system_instruction = "Be kind.".to_string();
        let setup = SessionSetup::new(&config, vec![json!({ "name": "detectSymptom" })]);
        let value = serde_json::to_value(setup_message(&setup)).unwrap();

        assert_eq!(value["setup"]["model"], "models/gemini-2.5-flash-native-audio-preview-09-2025");
        assert_eq!(value["setup"]["generationConfig"]["responseModalities"][0], "AUDIO");
        assert_eq!(value["setup"]["systemInstruction"]["parts"][0]["text"], "Be kind.");
        assert_eq!(value["setup"]["tools"][0]["functionDeclarations"][0]["name"], "detectSymptom");
        assert!(value["setup"]["generationConfig"].get("speechConfig").is_none());
    }

    #[test]
    fn test_setup_message_follows_session_config() {
        let mut config = AppConfig::default();
        config.service.model = "models/other-audio-model".to_string();
        config.service.voice_name = "Kore".to_string();
        let value = serde_json::to_value(setup_message(&SessionSetup::new(&config, Vec::new()))).unwrap();

        assert_eq!(value["setup"]["model"], "models/other-audio-model");
        assert_eq!(
            value["setup"]["generationConfig"]["speechConfig"]["voiceConfig"]["prebuiltVoiceConfig"]["voiceName"],
            "Kore"
        );
        assert!(value["setup"].get("tools").is_none());
    }

    #[test]
    fn test_client_message_encoding() {
        let frame = encode_frame(&[0.0; 4], 16000);
        let value: Value =
            serde_json::from_str(&encode_client_message(&OutboundMessage::Audio(frame.clone())).unwrap()).unwrap();
        assert_eq!(value["realtimeInput"]["mediaChunks"][0]["mimeType"], "audio/pcm;rate=16000");
        assert_eq!(value["realtimeInput"]["mediaChunks"][0]["data"], frame.data.as_str());

        let value: Value =
            serde_json::from_str(&encode_client_message(&OutboundMessage::Text("Start".into())).unwrap()).unwrap();
        assert_eq!(value["clientContent"]["turns"][0]["role"], "user");
        assert_eq!(value["clientContent"]["turns"][0]["parts"][0]["text"], "Start");
        assert_eq!(value["clientContent"]["turnComplete"], true);

        let response = OutboundMessage::ToolResponse(ToolResponse {
            call_id: "call-7".into(),
            name: "detectSymptom".into(),
            response: json!({ "result": "ok" }),
        });
        let value: Value = serde_json::from_str(&encode_client_message(&response).unwrap()).unwrap();
        assert_eq!(value["toolResponse"]["functionResponses"][0]["id"], "call-7");
        assert_eq!(value["toolResponse"]["functionResponses"][0]["response"]["result"], "ok");
    }

    #[test]
    fn test_translate_setup_complete() {
        let events = translate_server_message(&json!({ "setupComplete": {} }), 24000, 1);
        assert_eq!(events, vec![InboundEvent::Open]);
    }

    #[test]
    fn test_translate_every_audio_part() {
        let frame = json!({
            "serverContent": {
                "modelTurn": { "parts": [
                    { "inlineData": { "mimeType": "audio/pcm;rate=24000", "data": "AAAA" } },
                    { "text": "thinking" },
                    { "inlineData": { "mimeType": "audio/pcm", "data": "AQAB" } },
                    { "inlineData": { "mimeType": "image/png", "data": "iVBO" } }
                ]},
                "turnComplete": true
            }
        });

        let events = translate_server_message(&frame, 22050, 1);
        assert_eq!(
            events,
            vec![
                InboundEvent::Audio(AudioChunk::new("AAAA", 24000, 1)),
                InboundEvent::Audio(AudioChunk::new("AQAB", 22050, 1)),
                InboundEvent::TurnComplete,
            ]
        );
    }

    #[test]
    fn test_translate_interruption_comes_first() {
        let frame = json!({ "serverContent": { "interrupted": true } });
        assert_eq!(translate_server_message(&frame, 24000, 1), vec![InboundEvent::Interrupted]);
    }

    #[test]
    fn test_translate_multiple_function_calls() {
        let frame = json!({
            "toolCall": { "functionCalls": [
                { "id": "a", "name": "detectSymptom", "args": { "symptom": "stress" } },
                { "id": "b", "name": "updatePatientStatus", "args": { "status": "Calm" } },
                { "id": "c" }
            ]}
        });

        let events = translate_server_message(&frame, 24000, 1);
        let InboundEvent::ToolCall(calls) = &events[0] else {
            panic!("expected tool call, got {:?}", events);
        };
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].id, "a");
        assert_eq!(calls[0].args["symptom"], "stress");
        assert_eq!(calls[1].name, "updatePatientStatus");
    }

    #[test]
    fn test_translate_ignores_unrelated_frames() {
        assert!(translate_server_message(&json!({ "usageMetadata": {} }), 24000, 1).is_empty());
        assert!(parse_frame(b"not json", 24000, 1).is_empty());
    }
}
