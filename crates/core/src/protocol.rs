//! Bus message shapes
//!
//! All payloads are JSON. PCM byte fields travel as base64 strings. The
//! `partial` / `final` / `completed` flags are always serialized even when the
//! subject already implies them, because skills may consume either signal.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// PCM audio streamed from an edge device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioFrame {
    pub session_id: String,
    pub sequence: u64,
    pub sample_rate: u32,
    pub channels: u16,
    #[serde(with = "base64_bytes")]
    pub pcm: Vec<u8>,
    #[serde(rename = "final")]
    pub is_final: bool,
}

/// Recognized speech broadcast by the STT service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transcript {
    pub session_id: String,
    pub text: String,
    pub partial: bool,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

/// A prompt for the language model service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmRequest {
    pub session_id: String,
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tier: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// A streamed or final completion fragment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmResponse {
    pub session_id: String,
    pub content: String,
    pub partial: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    pub timestamp: DateTime<Utc>,
}

/// A phrase to synthesize.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtsRequest {
    pub session_id: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
}

/// Synthesized PCM destined for an output device. Chunks are sequence-numbered
/// within a single request; ordering across requests is not preserved.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioChunk {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    pub sequence: u64,
    pub sample_rate: u32,
    pub channels: u16,
    #[serde(with = "base64_bytes")]
    pub pcm: Vec<u8>,
    #[serde(rename = "final")]
    pub is_final: bool,
}

/// Synthesis status published after the final audio chunk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtsStatus {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    pub completed: bool,
    pub timestamp: DateTime<Utc>,
}

/// An advertised capability of a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capability {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tier: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub attributes: HashMap<String, String>,
}

/// Node announcement carrying its full capability list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Announce {
    pub node_id: String,
    pub role: String,
    #[serde(default)]
    pub capabilities: Vec<Capability>,
    pub timestamp: DateTime<Utc>,
}

/// Periodic liveness signal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Heartbeat {
    pub node_id: String,
    pub timestamp: DateTime<Utc>,
}

/// Serde adapter encoding byte fields as base64 strings in JSON.
mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audio_frame_round_trip() {
        let frame = AudioFrame {
            session_id: "s1".to_string(),
            sequence: 3,
            sample_rate: 16000,
            channels: 1,
            pcm: vec![0, 1, 2, 255],
            is_final: true,
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["final"], true);
        assert_eq!(json["pcm"], "AAEC/w==");

        let back: AudioFrame = serde_json::from_value(json).unwrap();
        assert_eq!(back.pcm, frame.pcm);
        assert!(back.is_final);
    }

    #[test]
    fn test_llm_request_omits_unset_fields() {
        let req = LlmRequest {
            session_id: "s1".to_string(),
            prompt: "hello".to_string(),
            system: None,
            tier: Some("fast".to_string()),
            max_tokens: None,
            temperature: None,
            trace_id: None,
            timestamp: Utc::now(),
        };
        let json = serde_json::to_string(&req).unwrap();
        assert!(!json.contains("system"));
        assert!(!json.contains("max_tokens"));
        assert!(json.contains("\"tier\":\"fast\""));
    }

    #[test]
    fn test_transcript_accepts_missing_confidence() {
        let json = r#"{"session_id":"s1","text":"hi","partial":false,"timestamp":"2025-06-01T00:00:00Z"}"#;
        let transcript: Transcript = serde_json::from_str(json).unwrap();
        assert!(transcript.confidence.is_none());
        assert!(!transcript.partial);
    }
}
