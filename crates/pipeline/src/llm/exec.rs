//! Subprocess generator
//!
//! Pipes `{"prompt", "system", "max_tokens", "temperature"}` to an external
//! command's stdin and reads a single JSON completion from stdout. Produces
//! one final fragment per request; invocations are serialized.

use std::process::Stdio;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, Mutex};

use super::{CompletionChunk, GenerateRequest, Generator};
use crate::PipelineError;

#[derive(Serialize)]
struct ExecRequest<'a> {
    prompt: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    max_tokens: u32,
    temperature: f64,
}

#[derive(Deserialize)]
struct ExecResponse {
    content: String,
    #[serde(default)]
    prompt_tokens: Option<u32>,
    #[serde(default)]
    completion_tokens: Option<u32>,
}

pub struct ExecGenerator {
    program: String,
    args: Vec<String>,
    guard: Mutex<()>,
}

impl ExecGenerator {
    pub fn new(command: &str) -> Result<Self, PipelineError> {
        let mut parts = command.split_whitespace().map(str::to_string);
        let program = parts
            .next()
            .ok_or_else(|| PipelineError::Adapter("llm command is empty".to_string()))?;
        Ok(Self {
            program,
            args: parts.collect(),
            guard: Mutex::new(()),
        })
    }
}

#[async_trait]
impl Generator for ExecGenerator {
    async fn generate(
        &self,
        req: GenerateRequest,
        sink: mpsc::Sender<CompletionChunk>,
    ) -> Result<(), PipelineError> {
        let _serial = self.guard.lock().await;

        let input = serde_json::to_vec(&ExecRequest {
            prompt: &req.prompt,
            system: req.system.as_deref(),
            max_tokens: req.max_tokens,
            temperature: req.temperature,
        })?;

        let started = std::time::Instant::now();
        let mut child = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&input).await?;
            stdin.shutdown().await?;
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(PipelineError::Adapter(format!(
                "llm command exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr)
            )));
        }

        let response: ExecResponse = serde_json::from_slice(&output.stdout)
            .map_err(|e| PipelineError::Adapter(format!("decode llm exec response: {e}")))?;

        sink.send(CompletionChunk {
            session_id: req.session_id,
            content: response.content,
            partial: false,
            prompt_tokens: response.prompt_tokens,
            completion_tokens: response.completion_tokens,
            elapsed: started.elapsed(),
            trace_id: req.trace_id,
        })
        .await
        .map_err(|_| PipelineError::Adapter("completion sink closed".to_string()))
    }
}
