//! Ollama generator
//!
//! Streams completions from a local Ollama endpoint
//! (`POST {endpoint}/api/generate`, NDJSON response lines). The configured
//! tier picks the model: `fast` and `balanced` map to their configured model
//! names, anything else falls back to balanced then fast.

use std::time::Instant;

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::{CompletionChunk, GenerateRequest, Generator};
use crate::PipelineError;

pub struct OllamaGenerator {
    endpoint: String,
    model_fast: String,
    model_balanced: String,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct OllamaRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Serialize)]
struct OllamaOptions {
    temperature: f64,
    num_predict: u32,
}

#[derive(Deserialize)]
struct OllamaStreamResponse {
    #[serde(default)]
    response: String,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    eval_count: Option<u32>,
    #[serde(default)]
    prompt_eval_count: Option<u32>,
}

impl OllamaGenerator {
    pub fn new(endpoint: String, model_fast: String, model_balanced: String) -> Self {
        Self {
            endpoint,
            model_fast,
            model_balanced,
            client: reqwest::Client::new(),
        }
    }

    fn model_for_tier(&self, tier: &str) -> &str {
        match tier {
            "fast" if !self.model_fast.is_empty() => &self.model_fast,
            "balanced" if !self.model_balanced.is_empty() => &self.model_balanced,
            _ if !self.model_balanced.is_empty() => &self.model_balanced,
            _ if !self.model_fast.is_empty() => &self.model_fast,
            _ => "llama3.2:latest",
        }
    }
}

#[async_trait]
impl Generator for OllamaGenerator {
    async fn generate(
        &self,
        req: GenerateRequest,
        sink: mpsc::Sender<CompletionChunk>,
    ) -> Result<(), PipelineError> {
        let payload = OllamaRequest {
            model: self.model_for_tier(&req.tier),
            prompt: &req.prompt,
            system: req.system.as_deref(),
            stream: true,
            options: OllamaOptions {
                temperature: req.temperature,
                num_predict: req.max_tokens,
            },
        };

        let response = self
            .client
            .post(format!("{}/api/generate", self.endpoint))
            .json(&payload)
            .send()
            .await
            .map_err(|e| PipelineError::Adapter(format!("ollama request: {e}")))?;

        if !response.status().is_success() {
            return Err(PipelineError::Adapter(format!(
                "ollama returned status {}",
                response.status()
            )));
        }

        let started = Instant::now();
        let mut prompt_tokens = None;
        let mut completion_tokens = None;
        let mut buffer: Vec<u8> = Vec::new();
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| PipelineError::Adapter(format!("ollama stream: {e}")))?;
            buffer.extend_from_slice(&chunk);

            while let Some(newline) = buffer.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=newline).collect();
                let line = &line[..line.len() - 1];
                if line.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }
                let parsed: OllamaStreamResponse = serde_json::from_slice(line)
                    .map_err(|e| PipelineError::Adapter(format!("ollama decode: {e}")))?;
                if parsed.eval_count.is_some() {
                    completion_tokens = parsed.eval_count;
                }
                if parsed.prompt_eval_count.is_some() {
                    prompt_tokens = parsed.prompt_eval_count;
                }
                let fragment = CompletionChunk {
                    session_id: req.session_id.clone(),
                    content: parsed.response,
                    partial: !parsed.done,
                    prompt_tokens,
                    completion_tokens,
                    elapsed: started.elapsed(),
                    trace_id: req.trace_id.clone(),
                };
                sink.send(fragment)
                    .await
                    .map_err(|_| PipelineError::Adapter("completion sink closed".to_string()))?;
            }
        }
        Ok(())
    }
}
