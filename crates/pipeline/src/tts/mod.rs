//! Text-to-speech service
//!
//! Subscribes to `tts.request` and streams synthesized PCM chunks on
//! `tts.audio`, sequence-numbered per request. The chunk flagged final is
//! followed by a `tts.done` status message.

mod exec;
mod mock;
mod synthesizer;

pub use exec::ExecSynthesizer;
pub use mock::MockSynthesizer;
pub use synthesizer::{SynthChunk, SynthRequest, Synthesizer};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use futures::StreamExt;
use loqa_bus::{BusClient, Publisher};
use loqa_config::TtsConfig;
use loqa_core::protocol::{AudioChunk, TtsRequest, TtsStatus};
use loqa_core::subjects;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::PipelineError;

const SYNTH_DEADLINE: Duration = Duration::from_secs(45);

/// TTS worker service.
pub struct TtsService {
    cfg: TtsConfig,
    publisher: Arc<dyn Publisher>,
    synthesizer: Arc<dyn Synthesizer>,
    shutdown: watch::Sender<bool>,
    reader: Mutex<Option<JoinHandle<()>>>,
    ready: AtomicBool,
}

impl TtsService {
    pub fn new(
        cfg: TtsConfig,
        publisher: Arc<dyn Publisher>,
        synthesizer: Arc<dyn Synthesizer>,
    ) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            cfg,
            publisher,
            synthesizer,
            shutdown,
            reader: Mutex::new(None),
            ready: AtomicBool::new(false),
        })
    }

    pub async fn start(self: &Arc<Self>, bus: &BusClient) -> Result<(), PipelineError> {
        if !self.cfg.enabled {
            return Ok(());
        }
        let mut sub = bus.subscribe(subjects::TTS_REQUEST).await?;
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
        let request: TtsRequest = match serde_json::from_slice(payload) {
            Ok(request) => request,
            Err(error) => {
                tracing::warn!(%error, "failed to decode tts request");
                return;
            }
        };
        let service = Arc::clone(self);
        tokio::spawn(async move {
            service.run_synthesis(request).await;
        });
    }

    async fn run_synthesis(self: Arc<Self>, request: TtsRequest) {
        let synth_request = SynthRequest {
            session_id: request.session_id.clone(),
            text: request.text.clone(),
            voice: request
                .voice
                .clone()
                .or_else(|| Some(self.cfg.voice.clone())),
        };

        let (tx, mut rx) = mpsc::channel::<SynthChunk>(32);
        let synthesizer = Arc::clone(&self.synthesizer);
        let producer = tokio::spawn(async move {
            tokio::time::timeout(SYNTH_DEADLINE, synthesizer.synthesize(synth_request, tx))
                .await
                .map_err(|_| PipelineError::DeadlineExceeded {
                    operation: "tts synthesis",
                    seconds: SYNTH_DEADLINE.as_secs(),
                })?
        });

        let mut sequence = 0u64;
        while let Some(chunk) = rx.recv().await {
            self.publish_chunk(&request, chunk, sequence).await;
            sequence += 1;
        }

        match producer.await {
            Ok(Ok(())) => {}
            Ok(Err(error)) => {
                tracing::warn!(%error, session_id = request.session_id, "tts synthesis failed");
            }
            Err(error) => {
                tracing::warn!(%error, session_id = request.session_id, "tts synthesis task panicked");
            }
        }
    }

    async fn publish_chunk(&self, request: &TtsRequest, chunk: SynthChunk, sequence: u64) {
        let is_final = chunk.is_final;
        let packet = AudioChunk {
            session_id: request.session_id.clone(),
            target: request.target.clone(),
            sequence,
            sample_rate: chunk.sample_rate,
            channels: chunk.channels,
            pcm: chunk.pcm,
            is_final,
        };
        match serde_json::to_vec(&packet) {
            Ok(payload) => {
                if let Err(error) = self
                    .publisher
                    .publish(subjects::TTS_AUDIO, Bytes::from(payload))
                    .await
                {
                    tracing::warn!(%error, "failed to publish tts chunk");
                }
            }
            Err(error) => {
                tracing::warn!(%error, "failed to encode tts chunk");
                return;
            }
        }

        if is_final {
            let status = TtsStatus {
                session_id: request.session_id.clone(),
                target: request.target.clone(),
                completed: true,
                timestamp: Utc::now(),
            };
            if let Ok(payload) = serde_json::to_vec(&status) {
                if let Err(error) = self
                    .publisher
                    .publish(subjects::TTS_DONE, Bytes::from(payload))
                    .await
                {
                    tracing::warn!(%error, "failed to publish tts done");
                }
            }
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

    struct MultiChunkSynth;

    #[async_trait]
    impl Synthesizer for MultiChunkSynth {
        async fn synthesize(
            &self,
            _req: SynthRequest,
            sink: mpsc::Sender<SynthChunk>,
        ) -> Result<(), PipelineError> {
            for is_final in [false, false, true] {
                sink.send(SynthChunk {
                    pcm: vec![1, 2],
                    sample_rate: 24_000,
                    channels: 1,
                    is_final,
                })
                .await
                .map_err(|_| PipelineError::Adapter("sink closed".to_string()))?;
            }
            Ok(())
        }
    }

    fn request(session_id: &str) -> Vec<u8> {
        serde_json::to_vec(&TtsRequest {
            session_id: session_id.to_string(),
            text: "hello there".to_string(),
            voice: None,
            target: Some("kitchen".to_string()),
            trace_id: None,
        })
        .unwrap()
    }

    fn service(synth: Arc<dyn Synthesizer>) -> (Arc<TtsService>, Arc<CapturePublisher>) {
        let publisher = Arc::new(CapturePublisher {
            messages: Mutex::new(Vec::new()),
        });
        let cfg = TtsConfig {
            enabled: true,
            ..TtsConfig::default()
        };
        (TtsService::new(cfg, publisher.clone(), synth), publisher)
    }

    #[tokio::test]
    async fn test_chunks_numbered_and_done_after_final() {
        let (service, publisher) = service(Arc::new(MultiChunkSynth));
        service.handle_request(&request("s1"));
        tokio::time::sleep(Duration::from_millis(80)).await;

        let messages = publisher.messages.lock();
        let audio: Vec<AudioChunk> = messages
            .iter()
            .filter(|(s, _)| s == subjects::TTS_AUDIO)
            .map(|(_, p)| serde_json::from_slice(p).unwrap())
            .collect();
        assert_eq!(audio.len(), 3);
        for (i, chunk) in audio.iter().enumerate() {
            assert_eq!(chunk.sequence, i as u64);
            // The synthesizer's format wins over the service config.
            assert_eq!(chunk.sample_rate, 24_000);
        }
        assert!(audio[2].is_final);

        // Done-marker follows the final audio chunk.
        let last = messages.last().unwrap();
        assert_eq!(last.0, subjects::TTS_DONE);
        let status: TtsStatus = serde_json::from_slice(&last.1).unwrap();
        assert!(status.completed);
        assert_eq!(status.target.as_deref(), Some("kitchen"));
    }

    #[tokio::test]
    async fn test_mock_synth_single_final_chunk() {
        let (service, publisher) = service(Arc::new(MockSynthesizer::new(22_050, 1)));
        service.handle_request(&request("s2"));
        tokio::time::sleep(Duration::from_millis(120)).await;

        let messages = publisher.messages.lock();
        let subjects_seen: Vec<&str> = messages.iter().map(|(s, _)| s.as_str()).collect();
        assert_eq!(subjects_seen, vec![subjects::TTS_AUDIO, subjects::TTS_DONE]);
    }
}
