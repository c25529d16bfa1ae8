//! # Tool Dispatch
//!
//! The remote agent updates the patient dashboard by calling functions. Each function
//! has exactly one registered handler; the registry also produces the declarations sent
//! in the session setup so the agent knows what it may call.
//!
//! ## Registered Tools:
//! - **detectSymptom**: `{ symptom: anxiety | painRelief | painTolerance | depression |
//!   stress | fatigue | distress | normal }`
//! - **updatePatientStatus**: `{ status: Neutral | Calm | Stressed | Anxious | Happy }`

use crate::error::{VoiceError, VoiceResult};
use crate::protocol::ToolCall;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Symptoms the agent can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Symptom {
    Anxiety,
    PainRelief,
    PainTolerance,
    Depression,
    Stress,
    Fatigue,
    Distress,
    Normal,
}

impl Symptom {
    pub const ALL: [Symptom; 8] = [
        Symptom::Anxiety,
        Symptom::PainRelief,
        Symptom::PainTolerance,
        Symptom::Depression,
        Symptom::Stress,
        Symptom::Fatigue,
        Symptom::Distress,
        Symptom::Normal,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Symptom::Anxiety => "anxiety",
            Symptom::PainRelief => "painRelief",
            Symptom::PainTolerance => "painTolerance",
            Symptom::Depression => "depression",
            Symptom::Stress => "stress",
            Symptom::Fatigue => "fatigue",
            Symptom::Distress => "distress",
            Symptom::Normal => "normal",
        }
    }
}

/// Emotional state the agent can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PatientStatus {
    Neutral,
    Calm,
    Stressed,
    Anxious,
    Happy,
}

impl PatientStatus {
    pub const ALL: [PatientStatus; 5] = [
        PatientStatus::Neutral,
        PatientStatus::Calm,
        PatientStatus::Stressed,
        PatientStatus::Anxious,
        PatientStatus::Happy,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PatientStatus::Neutral => "Neutral",
            PatientStatus::Calm => "Calm",
            PatientStatus::Stressed => "Stressed",
            PatientStatus::Anxious => "Anxious",
            PatientStatus::Happy => "Happy",
        }
    }
}

/// What a successful tool call tells the rest of the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Detection {
    Symptom(Symptom),
    PatientStatus(PatientStatus),
}

impl fmt::Display for Detection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Detection::Symptom(symptom) => write!(f, "symptom:{}", symptom.as_str()),
            Detection::PatientStatus(status) => write!(f, "status:{}", status.as_str()),
        }
    }
}

/// Result of a handled call: the acknowledgement payload and what was detected.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutcome {
    pub response: Value,
    pub detection: Option<Detection>,
}

/// One function the remote agent may call.
pub trait ToolHandler: Send + Sync {
    fn name(&self) -> &'static str;

    /// Function declaration in the service's schema dialect.
    fn declaration(&self) -> Value;

    fn call(&self, args: &Map<String, Value>) -> VoiceResult<ToolOutcome>;
}

/// Pull a required string-enum argument out of a call.
fn enum_argument<T>(tool: &str, args: &Map<String, Value>, key: &str) -> VoiceResult<T>
where
    T: for<'de> Deserialize<'de>,
{
    let value = args.get(key).ok_or_else(|| VoiceError::InvalidToolArguments {
        tool: tool.to_string(),
        reason: format!("missing '{}'", key),
    })?;
    serde_json::from_value(value.clone()).map_err(|_| VoiceError::InvalidToolArguments {
        tool: tool.to_string(),
        reason: format!("unsupported {} {}", key, value),
    })
}

pub struct DetectSymptomTool;

impl ToolHandler for DetectSymptomTool {
    fn name(&self) -> &'static str {
        "detectSymptom"
    }

    fn declaration(&self) -> Value {
        let symptoms: Vec<&str> = Symptom::ALL.iter().map(Symptom::as_str).collect();
        json!({
            "name": self.name(),
            "description": "Update the patient's detected symptom based on their voice and description.",
            "parameters": {
                "type": "OBJECT",
                "properties": {
                    "symptom": {
                        "type": "STRING",
                        "enum": symptoms,
                        "description": "The detected symptom of the patient."
                    }
                },
                "required": ["symptom"]
            }
        })
    }

    fn call(&self, args: &Map<String, Value>) -> VoiceResult<ToolOutcome> {
        let symptom: Symptom = enum_argument(self.name(), args, "symptom")?;
        Ok(ToolOutcome {
            response: json!({ "result": "Symptom detected and updated" }),
            detection: Some(Detection::Symptom(symptom)),
        })
    }
}

pub struct UpdatePatientStatusTool;

impl ToolHandler for UpdatePatientStatusTool {
    fn name(&self) -> &'static str {
        "updatePatientStatus"
    }

    fn declaration(&self) -> Value {
        let statuses: Vec<&str> = PatientStatus::ALL.iter().map(PatientStatus::as_str).collect();
        json!({
            "name": self.name(),
            "description": "Update the patient's detected stress or emotional level based on their voice and tone.",
            "parameters": {
                "type": "OBJECT",
                "properties": {
                    "status": {
                        "type": "STRING",
                        "enum": statuses,
                        "description": "The detected emotional state of the patient."
                    }
                },
                "required": ["status"]
            }
        })
    }

    fn call(&self, args: &Map<String, Value>) -> VoiceResult<ToolOutcome> {
        let status: PatientStatus = enum_argument(self.name(), args, "status")?;
        Ok(ToolOutcome {
            response: json!({ "result": "Status updated" }),
            detection: Some(Detection::PatientStatus(status)),
        })
    }
}

/// Handlers keyed by tool name, in registration order.
#[derive(Default, Clone)]
pub struct ToolRegistry {
    handlers: HashMap<&'static str, Arc<dyn ToolHandler>>,
    order: Vec<&'static str>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with both nurse dashboard tools.
    pub fn nurse() -> Self {
        let mut registry = Self::new();
        // Names are distinct constants, so these cannot collide
        let _ = registry.register(Arc::new(DetectSymptomTool));
        let _ = registry.register(Arc::new(UpdatePatientStatusTool));
        registry
    }

    /// Add a handler. A second handler for the same name is rejected.
    pub fn register(&mut self, handler: Arc<dyn ToolHandler>) -> VoiceResult<()> {
        let name = handler.name();
        if self.handlers.contains_key(name) {
            return Err(VoiceError::Config(format!("tool '{}' is already registered", name)));
        }
        self.handlers.insert(name, handler);
        self.order.push(name);
        Ok(())
    }

    /// Run the handler for a call.
    ///
    /// ## Errors:
    /// - `UnknownTool` when nothing is registered under the call's name
    /// - `InvalidToolArguments` when the handler rejects the arguments
    pub fn dispatch(&self, call: &ToolCall) -> VoiceResult<ToolOutcome> {
        let handler = self
            .handlers
            .get(call.name.as_str())
            .ok_or_else(|| VoiceError::UnknownTool(call.name.clone()))?;
        handler.call(&call.args)
    }

    pub fn declarations(&self) -> Vec<Value> {
        self.order
            .iter()
            .filter_map(|name| self.handlers.get(name))
            .map(|handler| handler.declaration())
            .collect()
    }

    pub fn names(&self) -> &[&'static str] {
        &self.order
    }
}

impl fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolRegistry").field("tools", &self.order).finish()
    }
}
