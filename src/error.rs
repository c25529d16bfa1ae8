//! # Error Handling
//!
//! Two layers of errors live here:
//!
//! - **VoiceError**: everything the audio core can fail with (microphone, remote
//!   service, decoding, tool dispatch). These never cross the HTTP boundary directly.
//! - **AppError**: what the HTTP control surface returns to clients, rendered as JSON.
//!
//! ## Propagation policy:
//! - `Permission`, `Connect` and `Transport` are fatal to a session. The session is torn
//!   down (capture and playback stopped) and the message is surfaced as `last_error`.
//! - `Decode` and `Device` errors on a single inbound chunk drop that chunk only.
//! - `UnknownTool` and `InvalidToolArguments` are logged and the call is ignored.

use actix_web::{HttpResponse, ResponseError};  // Web framework error handling
use serde_json::json;                          // For creating JSON error responses
use std::fmt;                                  // For implementing Display trait
use thiserror::Error;

/// Result type for audio core operations.
pub type VoiceResult<T> = Result<T, VoiceError>;

/// Errors raised by the audio core.
///
/// ## Rust Concepts:
/// - **thiserror**: `#[error(...)]` generates the `Display` impl from a format string
/// - **Struct variants**: `InvalidToolArguments { tool, reason }` carries named fields
///
/// The `Display` text is what ends up in `last_error`, so it must read well on its own.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum VoiceError {
    /// Microphone access denied or no capture device available.
    #[error("Microphone unavailable: {0}")]
    Permission(String),

    /// The remote voice service could not be reached.
    #[error("Connection failed: {0}")]
    Connect(String),

    /// The live connection failed mid-session.
    #[error("Connection lost: {0}")]
    Transport(String),

    /// A received audio chunk could not be decoded.
    #[error("Audio decode error: {0}")]
    Decode(String),

    /// The remote agent called a tool nobody registered.
    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    /// A registered tool was called with missing or invalid arguments.
    #[error("Invalid arguments for tool '{tool}': {reason}")]
    InvalidToolArguments { tool: String, reason: String },

    /// The output device refused an operation.
    #[error("Audio device error: {0}")]
    Device(String),

    /// An operation needed a live session and there was none.
    #[error("No active voice session")]
    NotActive,

    /// Settings rejected before a session could be built.
    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl VoiceError {
    pub fn permission<S: Into<String>>(msg: S) -> Self {
        Self::Permission(msg.into())
    }

    pub fn connect<S: Into<String>>(msg: S) -> Self {
        Self::Connect(msg.into())
    }

    pub fn transport<S: Into<String>>(msg: S) -> Self {
        Self::Transport(msg.into())
    }

    pub fn decode<S: Into<String>>(msg: S) -> Self {
        Self::Decode(msg.into())
    }

    pub fn device<S: Into<String>>(msg: S) -> Self {
        Self::Device(msg.into())
    }

    /// Whether this error ends the session it happened in.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            VoiceError::Permission(_) | VoiceError::Connect(_) | VoiceError::Transport(_)
        )
    }
}

/// Custom error types for the HTTP control surface.
///
/// ## Error Categories:
/// - **Internal**: Server-side problems (500 errors)
/// - **BadRequest**: Client sent invalid data (400 errors)
/// - **Forbidden**: The microphone could not be acquired (403 errors)
/// - **Conflict**: The request needs a session in another state (409 errors)
/// - **BadGateway**: The remote voice service failed (502 errors)
/// - **ConfigError**: Configuration problems (500 errors)
/// - **ValidationError**: Data validation failed (400 errors)
///
/// ## Usage Example:
/// ```rust,ignore
/// return Err(AppError::BadRequest("Invalid JSON".to_string()));
/// ```
#[derive(Debug)]
pub enum AppError {
    /// Internal server errors
    Internal(String),

    /// Client sent invalid or malformed data
    BadRequest(String),

    /// Microphone access was denied or no device exists
    Forbidden(String),

    /// No session in a state that allows the request
    Conflict(String),

    /// The remote voice service failed
    BadGateway(String),

    /// Configuration file or environment variable problems
    ConfigError(String),

    /// User input failed validation rules
    ValidationError(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::Forbidden(msg) => write!(f, "Forbidden: {}", msg),
            AppError::Conflict(msg) => write!(f, "Conflict: {}", msg),
            AppError::BadGateway(msg) => write!(f, "Bad gateway: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            AppError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for AppError {}

/// Converts errors into JSON HTTP responses.
///
/// ## JSON Response Format:
/// ```json
/// {
///   "error": {
///     "type": "forbidden",
///     "message": "Microphone unavailable: permission denied",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        use actix_web::http::StatusCode;

        let (status, error_type, message) = match self {
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg.clone()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg.clone()),
            AppError::Forbidden(msg) => (StatusCode::FORBIDDEN, "forbidden", msg.clone()),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, "conflict", msg.clone()),
            AppError::BadGateway(msg) => (StatusCode::BAD_GATEWAY, "bad_gateway", msg.clone()),
            AppError::ConfigError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "config_error", msg.clone()),
            AppError::ValidationError(msg) => (StatusCode::BAD_REQUEST, "validation_error", msg.clone()),
        };

        HttpResponse::build(status).json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

/// Session failures map onto HTTP categories by who is at fault:
/// the device (403), the remote service (502), the caller (400/409).
impl From<VoiceError> for AppError {
    fn from(err: VoiceError) -> Self {
        let message = err.to_string();
        match err {
            VoiceError::Permission(_) => AppError::Forbidden(message),
            VoiceError::Connect(_) | VoiceError::Transport(_) => AppError::BadGateway(message),
            VoiceError::NotActive => AppError::Conflict(message),
            VoiceError::Config(_) => AppError::ValidationError(message),
            VoiceError::Decode(_)
            | VoiceError::UnknownTool(_)
            | VoiceError::InvalidToolArguments { .. } => AppError::BadRequest(message),
            VoiceError::Device(_) => AppError::Internal(message),
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

/// JSON parsing errors are almost always the client's fault, so they become a 400.
impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON parsing error: {}", err))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

/// Shorthand for `Result<T, AppError>`.
pub type AppResult<T> = Result<T, AppError>;
