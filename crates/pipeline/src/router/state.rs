//! Voice turn state machine
//!
//! Pure per-session bookkeeping for the router: final transcript opens a
//! turn, final completion forwards it to synthesis, the done-marker closes
//! it. Unknown sessions and empty payloads are dropped idempotently.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::Utc;
use loqa_config::RouterConfig;
use loqa_core::protocol::{LlmRequest, LlmResponse, Transcript, TtsRequest, TtsStatus};

struct TurnSession {
    voice: String,
    tier: String,
    started: Instant,
    span: tracing::Span,
}

/// Latency sample for a completed turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClosedTurn {
    pub session_id: String,
    pub voice: String,
    pub tier: String,
    pub elapsed: Duration,
}

/// Map of live voice turns. At most one per session identifier.
pub struct RouterState {
    cfg: RouterConfig,
    sessions: HashMap<String, TurnSession>,
}

impl RouterState {
    pub fn new(cfg: RouterConfig) -> Self {
        Self {
            cfg,
            sessions: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// A final transcript opens (or reopens) the turn and yields the prompt
    /// to forward. Empty text is ignored.
    pub fn on_final_transcript(
        &mut self,
        transcript: &Transcript,
        now: Instant,
    ) -> Option<LlmRequest> {
        if transcript.text.is_empty() {
            return None;
        }
        let span = tracing::info_span!(
            "voice_turn",
            session_id = %transcript.session_id,
            prompt_tokens = tracing::field::Empty,
            completion_tokens = tracing::field::Empty,
            outcome = tracing::field::Empty,
        );
        self.sessions.insert(
            transcript.session_id.clone(),
            TurnSession {
                voice: self.cfg.default_voice.clone(),
                tier: self.cfg.default_tier.clone(),
                started: now,
                span,
            },
        );
        Some(LlmRequest {
            session_id: transcript.session_id.clone(),
            prompt: transcript.text.clone(),
            system: None,
            tier: Some(self.cfg.default_tier.clone()),
            max_tokens: None,
            temperature: None,
            trace_id: None,
            timestamp: Utc::now(),
        })
    }

    /// A final completion for a known turn yields the synthesis request.
    /// Token counts are recorded on the turn's span.
    pub fn on_completion(&mut self, response: &LlmResponse) -> Option<TtsRequest> {
        if response.content.is_empty() {
            return None;
        }
        let session = self.sessions.get(&response.session_id)?;
        if let Some(tokens) = response.prompt_tokens {
            session.span.record("prompt_tokens", tokens);
        }
        if let Some(tokens) = response.completion_tokens {
            session.span.record("completion_tokens", tokens);
        }
        Some(TtsRequest {
            session_id: response.session_id.clone(),
            text: response.content.clone(),
            voice: Some(session.voice.clone()),
            target: self.cfg.target.clone(),
            trace_id: response.trace_id.clone(),
        })
    }

    /// A completed done-marker closes the turn and yields its latency.
    /// `completed=false` markers and unknown sessions are ignored.
    pub fn on_done(&mut self, status: &TtsStatus, now: Instant) -> Option<ClosedTurn> {
        if !status.completed {
            return None;
        }
        let session = self.sessions.remove(&status.session_id)?;
        session.span.record("outcome", "completed");
        Some(ClosedTurn {
            session_id: status.session_id.clone(),
            voice: session.voice,
            tier: session.tier,
            elapsed: now.duration_since(session.started),
        })
    }

    /// Remove turns that never saw their done-marker. Swept turns get a
    /// timeout annotation and no latency sample.
    pub fn sweep(&mut self, now: Instant, timeout: Duration) -> Vec<String> {
        let stuck: Vec<String> = self
            .sessions
            .iter()
            .filter(|(_, session)| now.duration_since(session.started) > timeout)
            .map(|(id, _)| id.clone())
            .collect();
        for session_id in &stuck {
            if let Some(session) = self.sessions.remove(session_id) {
                session.span.record("outcome", "timeout");
            }
        }
        stuck
    }
}
