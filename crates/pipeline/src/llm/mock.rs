//! Mock generator for development and tests

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{CompletionChunk, GenerateRequest, Generator};
use crate::PipelineError;

/// Emits one final fragment echoing the prompt after a short delay.
#[derive(Debug, Default)]
pub struct MockGenerator;

#[async_trait]
impl Generator for MockGenerator {
    async fn generate(
        &self,
        req: GenerateRequest,
        sink: mpsc::Sender<CompletionChunk>,
    ) -> Result<(), PipelineError> {
        let delay = Duration::from_millis(20);
        tokio::time::sleep(delay).await;
        let chunk = CompletionChunk {
            session_id: req.session_id,
            content: format!("[mock completion for {}]", req.prompt.trim()),
            partial: false,
            prompt_tokens: None,
            completion_tokens: None,
            elapsed: delay,
            trace_id: req.trace_id,
        };
        sink.send(chunk)
            .await
            .map_err(|_| PipelineError::Adapter("completion sink closed".to_string()))
    }
}
