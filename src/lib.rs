//! # Nurse Voice Backend
//!
//! Real-time bidirectional audio streaming between a microphone, a remote AI voice
//! agent (the "nurse") and a speaker.
//!
//! ## Data Flow:
//! - microphone -> capture pipeline -> PCM16 framer -> session transport -> network
//! - network -> session transport -> { tool dispatch, PCM16 unframer -> playback scheduler -> speaker }
//!
//! ## Application Architecture:
//! - **audio**: codecs, device seams, capture and playback
//! - **protocol**: message vocabulary and the Gemini Live connector
//! - **session**: the state machine, the controller and tool dispatch
//! - **config** / **error**: configuration layering and error types
//! - **state**, **health**, **handlers**: the HTTP control surface

pub mod audio;
pub mod config;
pub mod error;
pub mod handlers;
pub mod health;
pub mod protocol;
pub mod session;
pub mod state;

#[cfg(test)]
pub(crate) mod testing;
