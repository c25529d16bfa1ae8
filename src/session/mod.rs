//! # Voice Session
//!
//! Lifecycle of one conversation with the remote nurse agent.
//!
//! ## Key Components:
//! - **Controller**: start/stop entry points and observable state
//! - **Transport**: the per-session task and its state machine
//! - **Tools**: function calls the agent makes to update the dashboard

pub mod controller;
pub mod tools;
pub mod transport;

pub use controller::SessionController;
pub use tools::{Detection, PatientStatus, Symptom, ToolRegistry};
pub use transport::{SessionSnapshot, TransportState};
