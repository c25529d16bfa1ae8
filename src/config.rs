//! # Configuration Management
//!
//! This module handles loading and managing application configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix)
//! - Default values (built into the code)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Special environment variables (`HOST`, `PORT`, `GEMINI_API_KEY`, `API_KEY`)
//! 2. Environment variables (`APP_SERVER__PORT`, `APP_SESSION__CONNECT_TIMEOUT_MS`, ...)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)
//!
//! Nested keys are separated by a double underscore so that field names which
//! themselves contain underscores (`block_size`, `api_key`) stay unambiguous.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::env;

/// Instruction given to the remote agent when the session is set up.
pub const DEFAULT_SYSTEM_INSTRUCTION: &str = "You are a professional, compassionate, and observant nurse. \
Your goal is to check in on the patient's well-being. \
IMMEDIATELY upon starting the conversation, say exactly: \"Hi, I'm your nurse, how are you feeling today?\" in a warm voice. \
As you listen to the user, analyze their voice tone and word choice. \
Use the 'detectSymptom' tool to update the dashboard if you detect one of the following symptoms: \
anxiety, painRelief, painTolerance, depression, stress, fatigue, distress, normal. \
Use the 'updatePatientStatus' tool if you detect they are Stressed, Anxious, Happy, Calm, or Neutral. \
Keep your responses concise, empathetic, and supportive.";

/// Main application configuration that contains all settings.
///
/// ## Why separate config structs:
/// Each section maps to one component: the HTTP shell (`server`), the remote voice
/// service (`service`), the two halves of the audio pipeline (`capture`, `playback`),
/// the session state machine (`session`) and the device backend (`devices`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub service: ServiceConfig,
    pub capture: CaptureConfig,
    pub playback: PlaybackConfig,
    pub session: SessionConfig,
    pub devices: DeviceConfig,
}

/// Server-specific configuration settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: Accept connections from any IP address (production)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Remote voice service settings.
///
/// `api_key` is a credential: it is loaded like any other field but never
/// rendered back by [`AppConfig::redacted`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceConfig {
    /// WebSocket endpoint of the bidirectional generate-content API
    pub endpoint: String,
    /// Model name sent in the setup message
    pub model: String,
    pub api_key: String,
    /// Prebuilt voice name; empty means the service default
    pub voice_name: String,
    pub system_instruction: String,
}

/// Microphone capture settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CaptureConfig {
    /// Capture sample rate in Hz (the outbound wire rate)
    pub sample_rate: u32,
    /// Samples per outbound frame
    pub block_size: usize,
}

/// Speaker playback settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlaybackConfig {
    /// Default rate of inbound audio when the chunk does not declare one
    pub sample_rate: u32,
    pub channels: u16,
    /// Stop everything scheduled when the remote agent is interrupted
    pub flush_on_interrupt: bool,
}

/// Session state machine tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionConfig {
    /// Text turn sent after the session opens so the agent speaks first (empty = off)
    pub opening_trigger: String,
    pub opening_trigger_delay_ms: u64,
    /// Fail a session still connecting after this long (0 = never)
    pub connect_timeout_ms: u64,
    /// Answer tool calls with bad arguments with an error response instead of silence
    pub ack_invalid_tool_calls: bool,
}

/// Which audio devices a session opens; for the binary's WAV backend, file paths.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceConfig {
    /// WAV file replayed as the microphone
    pub input_wav: String,
    /// WAV file the speaker output is recorded to on session end
    pub output_wav: String,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,  // 16kHz outbound PCM
            block_size: 4096,    // One frame every 256ms
        }
    }
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            sample_rate: 24000,  // 24kHz inbound PCM
            channels: 1,
            flush_on_interrupt: true,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            opening_trigger: "Start".to_string(),
            opening_trigger_delay_ms: 500,
            connect_timeout_ms: 0,
            ack_invalid_tool_calls: false,
        }
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            input_wav: "input.wav".to_string(),
            output_wav: "nurse-output.wav".to_string(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),  // Localhost only (safe for development)
                port: 8080,
            },
            service: ServiceConfig {
                endpoint: "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent".to_string(),
                model: "models/gemini-2.5-flash-native-audio-preview-09-2025".to_string(),
                api_key: String::new(),
                voice_name: String::new(),
                system_instruction: DEFAULT_SYSTEM_INSTRUCTION.to_string(),
            },
            capture: CaptureConfig::default(),
            playback: PlaybackConfig::default(),
            session: SessionConfig::default(),
            devices: DeviceConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__PORT=3000`: Override server port
    /// - `APP_SESSION__CONNECT_TIMEOUT_MS=8000`: Enable the connect timeout
    /// - `GEMINI_API_KEY=...`: Credential for the remote voice service
    /// - `HOST=0.0.0.0` / `PORT=3000`: Special cases for deployment platforms
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        // The web client read the key from either name
        if let Ok(key) = env::var("GEMINI_API_KEY").or_else(|_| env::var("API_KEY")) {
            settings = settings.set_override("service.api_key", key)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// ## What this checks:
    /// - Server port is not 0
    /// - Service endpoint and model are present
    /// - Sample rates, block size and channel count are non-zero
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.service.endpoint.trim().is_empty() {
            return Err(anyhow::anyhow!("Service endpoint cannot be empty"));
        }

        if self.service.model.trim().is_empty() {
            return Err(anyhow::anyhow!("Service model cannot be empty"));
        }

        if self.capture.sample_rate == 0 || self.playback.sample_rate == 0 {
            return Err(anyhow::anyhow!("Sample rates must be greater than 0"));
        }

        if self.capture.block_size == 0 {
            return Err(anyhow::anyhow!("Capture block size must be greater than 0"));
        }

        if self.playback.channels == 0 {
            return Err(anyhow::anyhow!("Playback channel count must be greater than 0"));
        }

        Ok(())
    }

    /// Update configuration from a JSON string (used for runtime config updates).
    ///
    /// ## Partial updates:
    /// Only the keys present in the JSON are changed. For example,
    /// `{"session": {"connect_timeout_ms": 5000}}` touches that one field.
    /// The merged result is validated before it replaces `self`, so a rejected
    /// update leaves the configuration untouched.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial: Value = serde_json::from_str(json_str)?;
        if !partial.is_object() {
            return Err(anyhow::anyhow!("Configuration update must be a JSON object"));
        }

        let mut merged = serde_json::to_value(&*self)?;
        merge_json(&mut merged, partial);

        let updated: AppConfig = serde_json::from_value(merged)?;
        updated.validate()?;
        *self = updated;
        Ok(())
    }

    /// JSON view of the configuration with credentials blanked out.
    pub fn redacted(&self) -> Value {
        let mut value = serde_json::to_value(self).unwrap_or(Value::Null);
        if let Some(service) = value.get_mut("service").and_then(Value::as_object_mut) {
            let configured = !self.service.api_key.is_empty();
            service.insert("api_key".to_string(), Value::String(if configured { "********".to_string() } else { String::new() }));
        }
        value
    }
}

/// Recursively overlay `patch` onto `target`; objects merge, everything else replaces.
fn merge_json(target: &mut Value, patch: Value) {
    match (target, patch) {
        (Value::Object(target), Value::Object(patch)) => {
            for (key, value) in patch {
                match target.get_mut(&key) {
                    Some(existing) => merge_json(existing, value),
                    None => {
                        target.insert(key, value);
                    }
                }
            }
        }
        (target, patch) => *target = patch,
    }
}
