//! Voice session router
//!
//! Chains the worker services into a complete voice turn: final transcript →
//! language model request → synthesis request → done-marker. Records a
//! latency histogram per completed turn, tagged by voice and tier, and sweeps
//! turns that never complete.

mod state;

pub use state::{ClosedTurn, RouterState};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::StreamExt;
use loqa_bus::{BusClient, Publisher};
use loqa_config::RouterConfig;
use loqa_core::protocol::{LlmResponse, Transcript, TtsStatus};
use loqa_core::subjects;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::PipelineError;

const SWEEP_PERIOD: Duration = Duration::from_secs(10);

/// Router service handle.
pub struct RouterService {
    cfg: RouterConfig,
    publisher: Arc<dyn Publisher>,
    state: Mutex<RouterState>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    ready: AtomicBool,
}

impl RouterService {
    pub fn new(cfg: RouterConfig, publisher: Arc<dyn Publisher>) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            state: Mutex::new(RouterState::new(cfg.clone())),
            cfg,
            publisher,
            shutdown,
            tasks: Mutex::new(Vec::new()),
            ready: AtomicBool::new(false),
        })
    }

    pub async fn start(self: &Arc<Self>, bus: &BusClient) -> Result<(), PipelineError> {
        if !self.cfg.enabled {
            return Ok(());
        }
        self.spawn_reader(bus, subjects::TRANSCRIPT_FINAL, Inbound::Transcript)
            .await?;
        self.spawn_reader(bus, subjects::LLM_RESPONSE_FINAL, Inbound::Completion)
            .await?;
        self.spawn_reader(bus, subjects::TTS_DONE, Inbound::Done)
            .await?;
        self.spawn_sweeper();
        self.ready.store(true, Ordering::Release);
        Ok(())
    }

    pub async fn close(&self) {
        let _ = self.shutdown.send(true);
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
    }

    pub fn healthy(&self) -> bool {
        !self.cfg.enabled || self.ready.load(Ordering::Acquire)
    }

    async fn spawn_reader(
        self: &Arc<Self>,
        bus: &BusClient,
        subject: &str,
        kind: Inbound,
    ) -> Result<(), PipelineError> {
        let mut sub = bus.subscribe(subject).await?;
        let service = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        self.tasks.lock().push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    msg = sub.next() => {
                        let Some(msg) = msg else { break };
                        service.dispatch(kind, &msg.payload).await;
                    }
                    _ = shutdown.changed() => {
                        let _ = sub.unsubscribe().await;
                        break;
                    }
                }
            }
        }));
        Ok(())
    }

    fn spawn_sweeper(self: &Arc<Self>) {
        let service = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        let timeout = Duration::from_secs(self.cfg.session_timeout_secs);
        self.tasks.lock().push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_PERIOD);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let swept = service.state.lock().sweep(Instant::now(), timeout);
                        for session_id in swept {
                            tracing::warn!(session_id, "voice turn timed out");
                        }
                        let active = service.state.lock().len();
                        metrics::gauge!("loqa_router_sessions_active").set(active as f64);
                    }
                    _ = shutdown.changed() => break,
                }
            }
        }));
    }

    async fn dispatch(self: &Arc<Self>, kind: Inbound, payload: &[u8]) {
        match kind {
            Inbound::Transcript => self.handle_transcript(payload).await,
            Inbound::Completion => self.handle_completion(payload).await,
            Inbound::Done => self.handle_done(payload),
        }
    }

    pub(crate) async fn handle_transcript(self: &Arc<Self>, payload: &[u8]) {
        let transcript: Transcript = match serde_json::from_slice(payload) {
            Ok(msg) => msg,
            Err(error) => {
                tracing::warn!(%error, "router failed to decode transcript");
                return;
            }
        };
        let request = self
            .state
            .lock()
            .on_final_transcript(&transcript, Instant::now());
        if let Some(request) = request {
            self.publish(subjects::LLM_REQUEST, &request).await;
        }
    }

    pub(crate) async fn handle_completion(self: &Arc<Self>, payload: &[u8]) {
        let response: LlmResponse = match serde_json::from_slice(payload) {
            Ok(msg) => msg,
            Err(error) => {
                tracing::warn!(%error, "router failed to decode llm response");
                return;
            }
        };
        let request = self.state.lock().on_completion(&response);
        if let Some(request) = request {
            self.publish(subjects::TTS_REQUEST, &request).await;
        }
    }

    pub(crate) fn handle_done(self: &Arc<Self>, payload: &[u8]) {
        let status: TtsStatus = match serde_json::from_slice(payload) {
            Ok(msg) => msg,
            Err(error) => {
                tracing::warn!(%error, "router failed to decode tts status");
                return;
            }
        };
        let closed = self.state.lock().on_done(&status, Instant::now());
        if let Some(closed) = closed {
            metrics::histogram!(
                "loqa_voice_turn_duration_seconds",
                "voice" => closed.voice.clone(),
                "tier" => closed.tier.clone(),
            )
            .record(closed.elapsed.as_secs_f64());
            tracing::info!(
                session_id = closed.session_id,
                latency_ms = closed.elapsed.as_millis() as u64,
                "voice turn complete"
            );
        }
    }

    async fn publish<T: Serialize>(&self, subject: &str, message: &T) {
        let payload = match serde_json::to_vec(message) {
            Ok(payload) => payload,
            Err(error) => {
                tracing::warn!(%error, subject, "router failed to encode message");
                return;
            }
        };
        if let Err(error) = self.publisher.publish(subject, Bytes::from(payload)).await {
            tracing::warn!(%error, subject, "router failed to publish");
        }
    }

    #[cfg(test)]
    fn session_count(&self) -> usize {
        self.state.lock().len()
    }
}

#[derive(Clone, Copy)]
enum Inbound {
    Transcript,
    Completion,
    Done,
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use loqa_bus::BusError;
    use loqa_core::protocol::{LlmRequest, TtsRequest};

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

    fn service() -> (Arc<RouterService>, Arc<CapturePublisher>) {
        let publisher = Arc::new(CapturePublisher {
            messages: Mutex::new(Vec::new()),
        });
        let cfg = RouterConfig {
            enabled: true,
            default_voice: "aria".to_string(),
            default_tier: "fast".to_string(),
            target: None,
            session_timeout_secs: 120,
        };
        (RouterService::new(cfg, publisher.clone()), publisher)
    }

    fn transcript_payload(session_id: &str, text: &str) -> Vec<u8> {
        serde_json::to_vec(&Transcript {
            session_id: session_id.to_string(),
            text: text.to_string(),
            partial: false,
            timestamp: Utc::now(),
            confidence: None,
        })
        .unwrap()
    }

    fn completion_payload(session_id: &str, content: &str) -> Vec<u8> {
        serde_json::to_vec(&LlmResponse {
            session_id: session_id.to_string(),
            content: content.to_string(),
            partial: false,
            trace_id: None,
            prompt_tokens: None,
            completion_tokens: None,
            latency_ms: None,
            timestamp: Utc::now(),
        })
        .unwrap()
    }

    fn done_payload(session_id: &str) -> Vec<u8> {
        serde_json::to_vec(&TtsStatus {
            session_id: session_id.to_string(),
            target: None,
            completed: true,
            timestamp: Utc::now(),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_turn_flows_through_llm_and_tts_requests() {
        let (service, publisher) = service();

        service.handle_transcript(&transcript_payload("s1", "what time is it")).await;
        service.handle_completion(&completion_payload("s1", "it is noon")).await;
        service.handle_done(&done_payload("s1"));

        let messages = publisher.messages.lock();
        assert_eq!(messages.len(), 2);

        let llm: LlmRequest = serde_json::from_slice(&messages[0].1).unwrap();
        assert_eq!(messages[0].0, subjects::LLM_REQUEST);
        assert_eq!(llm.prompt, "what time is it");
        assert_eq!(llm.tier.as_deref(), Some("fast"));

        let tts: TtsRequest = serde_json::from_slice(&messages[1].1).unwrap();
        assert_eq!(messages[1].0, subjects::TTS_REQUEST);
        assert_eq!(tts.text, "it is noon");
        assert_eq!(tts.voice.as_deref(), Some("aria"));
        drop(messages);

        assert_eq!(service.session_count(), 0);
    }

    #[tokio::test]
    async fn test_completion_for_unknown_session_dropped() {
        let (service, publisher) = service();
        service.handle_completion(&completion_payload("ghost", "hello")).await;
        assert!(publisher.messages.lock().is_empty());
    }
}
