//! Core protocol types for the Loqa runtime
//!
//! This crate provides the canonical message shapes exchanged on the bus and
//! the subject names they travel on. Every other crate depends on these types;
//! nothing here performs I/O.

pub mod protocol;
pub mod subjects;

pub use protocol::{
    Announce, AudioChunk, AudioFrame, Capability, Heartbeat, LlmRequest, LlmResponse, Transcript,
    TtsRequest, TtsStatus,
};
