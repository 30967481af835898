//! Generator contract

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::PipelineError;
use loqa_config::LlmConfig;
use loqa_core::protocol::LlmRequest;

/// A fully resolved generation request (defaults already merged).
#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub session_id: String,
    pub prompt: String,
    pub system: Option<String>,
    pub tier: String,
    pub max_tokens: u32,
    pub temperature: f64,
    pub trace_id: Option<String>,
}

/// One streamed completion fragment. A successful stream carries exactly one
/// fragment with `partial == false`.
#[derive(Debug, Clone)]
pub struct CompletionChunk {
    pub session_id: String,
    pub content: String,
    pub partial: bool,
    pub prompt_tokens: Option<u32>,
    pub completion_tokens: Option<u32>,
    pub elapsed: Duration,
    pub trace_id: Option<String>,
}

/// Pluggable language model backend. Fragments are pushed into `sink` as
/// they are produced; a closed sink aborts the generation.
#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(
        &self,
        req: GenerateRequest,
        sink: mpsc::Sender<CompletionChunk>,
    ) -> Result<(), PipelineError>;
}

impl GenerateRequest {
    /// Merge config defaults with request-provided overrides.
    pub fn from_config(cfg: &LlmConfig, req: LlmRequest) -> Self {
        Self {
            session_id: req.session_id,
            prompt: req.prompt,
            system: req.system,
            tier: req
                .tier
                .filter(|t| !t.is_empty())
                .unwrap_or_else(|| cfg.default_tier.clone()),
            max_tokens: req.max_tokens.filter(|&m| m > 0).unwrap_or(cfg.max_tokens),
            temperature: req.temperature.unwrap_or(cfg.temperature),
            trace_id: req.trace_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn incoming(tier: Option<&str>, max_tokens: Option<u32>, temperature: Option<f64>) -> LlmRequest {
        LlmRequest {
            session_id: "s1".to_string(),
            prompt: "hi".to_string(),
            system: None,
            tier: tier.map(str::to_string),
            max_tokens,
            temperature,
            trace_id: None,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_request_merges_defaults() {
        let cfg = LlmConfig::default();

        let req = GenerateRequest::from_config(&cfg, incoming(None, None, None));
        assert_eq!(req.tier, cfg.default_tier);
        assert_eq!(req.max_tokens, cfg.max_tokens);

        let req = GenerateRequest::from_config(&cfg, incoming(Some("fast"), Some(32), Some(0.1)));
        assert_eq!(req.tier, "fast");
        assert_eq!(req.max_tokens, 32);
        assert!((req.temperature - 0.1).abs() < f64::EPSILON);
    }
}
