//! Speech-to-text service
//!
//! Subscribes to `audio.frame.>`, accumulates PCM per session and dispatches
//! transcriptions to the configured [`Recognizer`]. Interim transcripts are
//! rate-limited; finals are serialized behind any in-flight transcription.

mod exec;
mod mock;
mod recognizer;
mod sessions;

pub use exec::ExecRecognizer;
pub use mock::MockRecognizer;
pub use recognizer::{Recognizer, TranscriptResult};
pub use sessions::{FinalDecision, Followup, SessionTable};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::Utc;
use futures::StreamExt;
use loqa_bus::{BusClient, Publisher};
use loqa_config::SttConfig;
use loqa_core::protocol::{AudioFrame, Transcript};
use loqa_core::subjects;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::PipelineError;

const TRANSCRIBE_DEADLINE: Duration = Duration::from_secs(45);

/// STT worker service.
pub struct SttService {
    cfg: SttConfig,
    publisher: Arc<dyn Publisher>,
    recognizer: Arc<dyn Recognizer>,
    sessions: Mutex<SessionTable>,
    shutdown: watch::Sender<bool>,
    reader: Mutex<Option<JoinHandle<()>>>,
    ready: AtomicBool,
}

impl SttService {
    pub fn new(
        cfg: SttConfig,
        publisher: Arc<dyn Publisher>,
        recognizer: Arc<dyn Recognizer>,
    ) -> Arc<Self> {
        let partial_every = Duration::from_millis(cfg.partial_every_ms);
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            cfg,
            publisher,
            recognizer,
            sessions: Mutex::new(SessionTable::new(partial_every)),
            shutdown,
            reader: Mutex::new(None),
            ready: AtomicBool::new(false),
        })
    }

    /// Subscribe to audio frames and start the reader task. A disabled
    /// service starts nothing and reports healthy.
    pub async fn start(self: &Arc<Self>, bus: &BusClient) -> Result<(), PipelineError> {
        if !self.cfg.enabled {
            return Ok(());
        }
        let mut sub = bus.subscribe(&subjects::audio_frame_wildcard()).await?;
        let service = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        let reader = tokio::spawn(async move {
            loop {
                tokio::select! {
                    msg = sub.next() => {
                        let Some(msg) = msg else { break };
                        service.handle_frame(&msg.payload);
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

    /// Handle one inbound frame payload. Buffer mutation happens under the
    /// table lock; transcription runs on its own task over a snapshot.
    pub(crate) fn handle_frame(self: &Arc<Self>, payload: &[u8]) {
        let frame: AudioFrame = match serde_json::from_slice(payload) {
            Ok(frame) => frame,
            Err(error) => {
                tracing::warn!(%error, "failed to decode audio frame");
                return;
            }
        };

        let mut table = self.sessions.lock();
        table.append_frame(&frame.session_id, &frame.pcm);

        if self.cfg.publish_interim && !frame.is_final {
            if let Some(pcm) = table.maybe_begin_partial(&frame.session_id, Instant::now()) {
                drop(table);
                self.spawn_transcription(frame.session_id, pcm, false);
                return;
            }
        } else if frame.is_final {
            match table.begin_final(&frame.session_id) {
                FinalDecision::Start(pcm) => {
                    drop(table);
                    self.spawn_transcription(frame.session_id, pcm, true);
                }
                FinalDecision::Deferred | FinalDecision::Unknown => {}
            }
        }
    }

    fn spawn_transcription(self: &Arc<Self>, session_id: String, pcm: Vec<u8>, is_final: bool) {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            service.run_transcription(session_id, pcm, is_final).await;
        });
    }

    async fn run_transcription(self: Arc<Self>, session_id: String, pcm: Vec<u8>, is_final: bool) {
        let outcome = tokio::time::timeout(
            TRANSCRIBE_DEADLINE,
            self.recognizer
                .transcribe(&pcm, self.cfg.sample_rate, self.cfg.channels, is_final),
        )
        .await;

        match outcome {
            Ok(Ok(result)) => {
                self.publish_transcript(&session_id, result, is_final).await;
            }
            Ok(Err(error)) => {
                tracing::warn!(%error, session_id, "transcription failed");
            }
            Err(_) => {
                tracing::warn!(
                    session_id,
                    deadline_secs = TRANSCRIBE_DEADLINE.as_secs(),
                    "transcription timed out"
                );
            }
        }

        // Cleanup runs on every path so a deferred final is never stranded.
        let followup = self
            .sessions
            .lock()
            .complete(&session_id, is_final, Instant::now());
        if let Followup::StartFinal(pcm) = followup {
            self.spawn_transcription(session_id, pcm, true);
        }
    }

    async fn publish_transcript(&self, session_id: &str, result: TranscriptResult, is_final: bool) {
        if result.text.is_empty() {
            return;
        }
        let subject = if is_final {
            subjects::TRANSCRIPT_FINAL
        } else {
            subjects::TRANSCRIPT_PARTIAL
        };
        let transcript = Transcript {
            session_id: session_id.to_string(),
            text: result.text,
            partial: !is_final,
            timestamp: Utc::now(),
            confidence: result.confidence,
        };
        let payload = match serde_json::to_vec(&transcript) {
            Ok(payload) => payload,
            Err(error) => {
                tracing::warn!(%error, "failed to encode transcript");
                return;
            }
        };
        if let Err(error) = self.publisher.publish(subject, Bytes::from(payload)).await {
            tracing::warn!(%error, subject, "failed to publish transcript");
        }
    }

    #[cfg(test)]
    fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stt::recognizer::TranscriptResult;
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

    struct SlowRecognizer {
        delay: Duration,
    }

    #[async_trait]
    impl Recognizer for SlowRecognizer {
        async fn transcribe(
            &self,
            pcm: &[u8],
            _sample_rate: u32,
            _channels: u16,
            is_final: bool,
        ) -> Result<TranscriptResult, PipelineError> {
            tokio::time::sleep(self.delay).await;
            let mode = if is_final { "final" } else { "partial" };
            Ok(TranscriptResult {
                text: format!("[{mode} transcript length={}]", pcm.len()),
                confidence: None,
            })
        }
    }

    fn frame(session_id: &str, sequence: u64, pcm: &[u8], is_final: bool) -> Vec<u8> {
        serde_json::to_vec(&AudioFrame {
            session_id: session_id.to_string(),
            sequence,
            sample_rate: 16_000,
            channels: 1,
            pcm: pcm.to_vec(),
            is_final,
        })
        .unwrap()
    }

    fn service(
        publish_interim: bool,
        partial_every_ms: u64,
        delay: Duration,
    ) -> (Arc<SttService>, Arc<CapturePublisher>) {
        let publisher = Arc::new(CapturePublisher {
            messages: Mutex::new(Vec::new()),
        });
        let cfg = SttConfig {
            enabled: true,
            publish_interim,
            partial_every_ms,
            ..SttConfig::default()
        };
        let service = SttService::new(
            cfg,
            publisher.clone(),
            Arc::new(SlowRecognizer { delay }),
        );
        (service, publisher)
    }

    #[tokio::test]
    async fn test_final_frame_produces_final_transcript_and_clears_buffer() {
        let (service, publisher) = service(false, 200, Duration::from_millis(10));

        service.handle_frame(&frame("s1", 0, &[0u8; 320], false));
        service.handle_frame(&frame("s1", 1, &[0u8; 320], true));
        tokio::time::sleep(Duration::from_millis(100)).await;

        let messages = publisher.messages.lock();
        let finals: Vec<_> = messages
            .iter()
            .filter(|(subject, _)| subject == subjects::TRANSCRIPT_FINAL)
            .collect();
        assert_eq!(finals.len(), 1);
        let transcript: Transcript = serde_json::from_slice(&finals[0].1).unwrap();
        assert_eq!(transcript.text, "[final transcript length=640]");
        assert!(!transcript.partial);
        drop(messages);
        assert_eq!(service.session_count(), 0);
    }

    #[tokio::test]
    async fn test_pending_final_runs_after_in_flight_partial() {
        let (service, publisher) = service(true, 200, Duration::from_millis(80));

        // First partial starts a slow transcription; the final arrives while
        // it is still in flight and must be deferred, not dropped.
        service.handle_frame(&frame("s1", 0, &[0u8; 100], false));
        tokio::time::sleep(Duration::from_millis(10)).await;
        service.handle_frame(&frame("s1", 1, &[0u8; 100], true));
        tokio::time::sleep(Duration::from_millis(300)).await;

        let messages = publisher.messages.lock();
        let partials = messages
            .iter()
            .filter(|(s, _)| s == subjects::TRANSCRIPT_PARTIAL)
            .count();
        let finals = messages
            .iter()
            .filter(|(s, _)| s == subjects::TRANSCRIPT_FINAL)
            .count();
        assert_eq!(partials, 1);
        assert_eq!(finals, 1);
        drop(messages);
        assert_eq!(service.session_count(), 0);
    }

    #[tokio::test]
    async fn test_malformed_frame_dropped() {
        let (service, publisher) = service(false, 200, Duration::from_millis(5));
        service.handle_frame(b"not json");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(publisher.messages.lock().is_empty());
        assert_eq!(service.session_count(), 0);
    }
}
