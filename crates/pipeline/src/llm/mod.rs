//! Language model service
//!
//! Subscribes to `nlu.request`, merges configured defaults with the request,
//! and streams completion fragments from the configured [`Generator`].
//! Partials go out on `nlu.response.partial`, the closing fragment on
//! `nlu.response.final`. Empty fragments are dropped.

mod exec;
mod generator;
mod mock;
mod ollama;

pub use exec::ExecGenerator;
pub use generator::{CompletionChunk, GenerateRequest, Generator};
pub use mock::MockGenerator;
pub use ollama::OllamaGenerator;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use futures::StreamExt;
use loqa_bus::{BusClient, Publisher};
use loqa_config::LlmConfig;
use loqa_core::protocol::{LlmRequest, LlmResponse};
use loqa_core::subjects;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::PipelineError;

const GENERATE_DEADLINE: Duration = Duration::from_secs(60);

/// LLM worker service.
pub struct LlmService {
    cfg: LlmConfig,
    publisher: Arc<dyn Publisher>,
    generator: Arc<dyn Generator>,
    shutdown: watch::Sender<bool>,
    reader: Mutex<Option<JoinHandle<()>>>,
    ready: AtomicBool,
}

impl LlmService {
    pub fn new(
        cfg: LlmConfig,
        publisher: Arc<dyn Publisher>,
        generator: Arc<dyn Generator>,
    ) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            cfg,
            publisher,
            generator,
            shutdown,
            reader: Mutex::new(None),
            ready: AtomicBool::new(false),
        })
    }

    pub async fn start(self: &Arc<Self>, bus: &BusClient) -> Result<(), PipelineError> {
        if !self.cfg.enabled {
            return Ok(());
        }
        let mut sub = bus.subscribe(subjects::LLM_REQUEST).await?;
        let service = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        let reader = tokio::spawn(async move {
            loop {
                tokio::select! {
                    msg = sub.next() => {
                        let Some(msg) = msg else { break };
                        service.handle_request(&msg.payload);
                    }
                    _ = shutdown.changed() => {
                        let _ = sub.unsubscribe().await;
                        break;
                    }
                }
            }
        });
        *self.reader.lock() = Some(reader);
        self.ready.store(true, Ordering::Release);
        Ok(())
    }

    pub async fn close(&self) {
        let _ = self.shutdown.send(true);
        if let Some(reader) = self.reader.lock().take() {
            let _ = reader.await;
        }
    }

    pub fn healthy(&self) -> bool {
        !self.cfg.enabled || self.ready.load(Ordering::Acquire)
    }

    pub(crate) fn handle_request(self: &Arc<Self>, payload: &[u8]) {
        let request: LlmRequest = match serde_json::from_slice(payload) {
            Ok(request) => request,
            Err(error) => {
                tracing::warn!(%error, "failed to decode llm request");
                return;
            }
        };

        let merged = GenerateRequest::from_config(&self.cfg, request);

        let service = Arc::clone(self);
        tokio::spawn(async move {
            service.run_generation(merged).await;
        });
    }

    async fn run_generation(self: Arc<Self>, request: GenerateRequest) {
        let session_id = request.session_id.clone();
        let started = std::time::Instant::now();

        let (tx, mut rx) = mpsc::channel::<CompletionChunk>(32);
        let generator = Arc::clone(&self.generator);
        let producer = tokio::spawn(async move {
            tokio::time::timeout(GENERATE_DEADLINE, generator.generate(request, tx))
                .await
                .map_err(|_| PipelineError::DeadlineExceeded {
                    operation: "llm generation",
                    seconds: GENERATE_DEADLINE.as_secs(),
                })?
        });

        while let Some(chunk) = rx.recv().await {
            self.publish_chunk(chunk).await;
        }

        match producer.await {
            Ok(Ok(())) => {
                tracing::info!(
                    session_id,
                    latency_ms = started.elapsed().as_millis() as u64,
                    "llm generation complete"
                );
            }
            Ok(Err(error)) => {
                tracing::warn!(%error, session_id, "llm generation failed");
            }
            Err(error) => {
                tracing::warn!(%error, session_id, "llm generation task panicked");
            }
        }
    }

    async fn publish_chunk(&self, chunk: CompletionChunk) {
        if chunk.content.is_empty() {
            return;
        }
        let subject = if chunk.partial {
            subjects::LLM_RESPONSE_PARTIAL
        } else {
            subjects::LLM_RESPONSE_FINAL
        };
        let response = LlmResponse {
            session_id: chunk.session_id,
            content: chunk.content,
            partial: chunk.partial,
            trace_id: chunk.trace_id,
            prompt_tokens: chunk.prompt_tokens,
            completion_tokens: chunk.completion_tokens,
            latency_ms: Some(chunk.elapsed.as_millis() as u64),
            timestamp: Utc::now(),
        };
        let payload = match serde_json::to_vec(&response) {
            Ok(payload) => payload,
            Err(error) => {
                tracing::warn!(%error, "failed to encode llm response");
                return;
            }
        };
        if let Err(error) = self.publisher.publish(subject, Bytes::from(payload)).await {
            tracing::warn!(%error, subject, "failed to publish llm response");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use loqa_bus::BusError;

    struct CapturePublisher {
        messages: Mutex<Vec<(String, Vec<u8>)>>,
    }

    #[async_trait]
    impl Publisher for CapturePublisher {
        async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), BusError> {
            self.messages
                .lock()
                .push((subject.to_string(), payload.to_vec()));
            Ok(())
        }
    }

    fn request(session_id: &str, prompt: &str) -> Vec<u8> {
        serde_json::to_vec(&LlmRequest {
            session_id: session_id.to_string(),
            prompt: prompt.to_string(),
            system: None,
            tier: None,
            max_tokens: None,
            temperature: None,
            trace_id: None,
            timestamp: Utc::now(),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_mock_generation_publishes_single_final() {
        let publisher = Arc::new(CapturePublisher {
            messages: Mutex::new(Vec::new()),
        });
        let cfg = LlmConfig {
            enabled: true,
            ..LlmConfig::default()
        };
        let service = LlmService::new(cfg, publisher.clone(), Arc::new(MockGenerator));

        service.handle_request(&request("s1", "turn on the lights"));
        tokio::time::sleep(Duration::from_millis(120)).await;

        let messages = publisher.messages.lock();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].0, subjects::LLM_RESPONSE_FINAL);
        let response: LlmResponse = serde_json::from_slice(&messages[0].1).unwrap();
        assert_eq!(response.content, "[mock completion for turn on the lights]");
        assert!(!response.partial);
    }

    struct EmptyChunkGenerator;

    #[async_trait]
    impl Generator for EmptyChunkGenerator {
        async fn generate(
            &self,
            req: GenerateRequest,
            sink: mpsc::Sender<CompletionChunk>,
        ) -> Result<(), PipelineError> {
            for (content, partial) in [("", true), ("hello", true), ("", false)] {
                let _ = sink
                    .send(CompletionChunk {
                        session_id: req.session_id.clone(),
                        content: content.to_string(),
                        partial,
                        prompt_tokens: None,
                        completion_tokens: None,
                        elapsed: Duration::ZERO,
                        trace_id: None,
                    })
                    .await;
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_empty_fragments_dropped() {
        let publisher = Arc::new(CapturePublisher {
            messages: Mutex::new(Vec::new()),
        });
        let cfg = LlmConfig {
            enabled: true,
            ..LlmConfig::default()
        };
        let service = LlmService::new(cfg, publisher.clone(), Arc::new(EmptyChunkGenerator));

        service.handle_request(&request("s1", "hi"));
        tokio::time::sleep(Duration::from_millis(60)).await;

        let messages = publisher.messages.lock();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].0, subjects::LLM_RESPONSE_PARTIAL);
    }
}
