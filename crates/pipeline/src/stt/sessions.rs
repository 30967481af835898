//! Per-session transcription buffers
//!
//! Pure state, no bus wiring. The table enforces the scheduling rules:
//! at most one transcription in flight per session; a final frame arriving
//! mid-flight defers until the current transcription completes; interim
//! transcriptions are rate-limited by `partial_every`.

use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct SessionBuffer {
    buffer: Vec<u8>,
    last_partial: Option<Instant>,
    in_flight: bool,
    pending_final: bool,
}

/// Decision for a frame carrying `final=true`.
#[derive(Debug, PartialEq, Eq)]
pub enum FinalDecision {
    /// Start a final transcription over this snapshot now.
    Start(Vec<u8>),
    /// A transcription is in flight; the final will run when it completes.
    Deferred,
    /// The session is unknown (no frames buffered).
    Unknown,
}

/// What to do after a transcription completes.
#[derive(Debug, PartialEq, Eq)]
pub enum Followup {
    None,
    /// A final frame arrived mid-flight; run the final over this snapshot.
    StartFinal(Vec<u8>),
}

/// Table of live session buffers.
#[derive(Debug)]
pub struct SessionTable {
    sessions: HashMap<String, SessionBuffer>,
    partial_every: Duration,
}

impl SessionTable {
    pub fn new(partial_every: Duration) -> Self {
        Self {
            sessions: HashMap::new(),
            partial_every,
        }
    }

    /// Append PCM bytes, creating the session buffer on first sight.
    pub fn append_frame(&mut self, session_id: &str, pcm: &[u8]) {
        self.sessions
            .entry(session_id.to_string())
            .or_default()
            .buffer
            .extend_from_slice(pcm);
    }

    /// Decide whether to start an interim transcription. Returns a snapshot
    /// of the buffer when one should run: never while in flight, and only on
    /// the first partial or once `partial_every` has elapsed since the last.
    pub fn maybe_begin_partial(&mut self, session_id: &str, now: Instant) -> Option<Vec<u8>> {
        let state = self.sessions.get_mut(session_id)?;
        if state.in_flight {
            return None;
        }
        match state.last_partial {
            None => {}
            Some(_) if self.partial_every.is_zero() => return None,
            Some(last) if now.duration_since(last) < self.partial_every => return None,
            Some(_) => {}
        }
        state.last_partial = Some(now);
        state.in_flight = true;
        Some(state.buffer.clone())
    }

    /// Decide what to do with a final frame.
    pub fn begin_final(&mut self, session_id: &str) -> FinalDecision {
        let Some(state) = self.sessions.get_mut(session_id) else {
            return FinalDecision::Unknown;
        };
        if state.in_flight {
            state.pending_final = true;
            return FinalDecision::Deferred;
        }
        state.in_flight = true;
        FinalDecision::Start(state.buffer.clone())
    }

    /// Mark a transcription finished. Runs regardless of transcription
    /// success so a failed partial still releases the deferred final. A
    /// completed final removes the session buffer.
    pub fn complete(&mut self, session_id: &str, was_final: bool, now: Instant) -> Followup {
        let Some(state) = self.sessions.get_mut(session_id) else {
            return Followup::None;
        };
        state.in_flight = false;
        let pending_final = state.pending_final;
        if was_final {
            self.sessions.remove(session_id);
            return Followup::None;
        }
        state.last_partial = Some(now);
        if pending_final {
            state.pending_final = false;
            state.in_flight = true;
            return Followup::StartFinal(state.buffer.clone());
        }
        Followup::None
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EVERY: Duration = Duration::from_millis(200);

    #[test]
    fn test_first_partial_starts_immediately() {
        let mut table = SessionTable::new(EVERY);
        let now = Instant::now();
        table.append_frame("s1", &[1, 2]);

        assert_eq!(table.maybe_begin_partial("s1", now), Some(vec![1, 2]));
        // In flight: nothing new may start.
        assert_eq!(table.maybe_begin_partial("s1", now), None);
    }

    #[test]
    fn test_partials_rate_limited() {
        let mut table = SessionTable::new(EVERY);
        let start = Instant::now();
        table.append_frame("s1", &[1]);

        assert!(table.maybe_begin_partial("s1", start).is_some());
        table.complete("s1", false, start + Duration::from_millis(50));

        // 100 ms after the last partial finished: too soon.
        assert!(table
            .maybe_begin_partial("s1", start + Duration::from_millis(150))
            .is_none());
        // 250 ms later: due again.
        assert!(table
            .maybe_begin_partial("s1", start + Duration::from_millis(300))
            .is_some());
    }

    #[test]
    fn test_final_defers_while_in_flight() {
        let mut table = SessionTable::new(EVERY);
        let now = Instant::now();
        table.append_frame("s1", &[1]);
        assert!(table.maybe_begin_partial("s1", now).is_some());

        table.append_frame("s1", &[2]);
        assert_eq!(table.begin_final("s1"), FinalDecision::Deferred);

        // Partial completes; the deferred final starts over the full buffer.
        match table.complete("s1", false, now) {
            Followup::StartFinal(pcm) => assert_eq!(pcm, vec![1, 2]),
            other => panic!("expected deferred final, got {other:?}"),
        }

        // Final completion drops the session.
        assert_eq!(table.complete("s1", true, now), Followup::None);
        assert!(table.is_empty());
    }

    #[test]
    fn test_final_starts_immediately_when_idle() {
        let mut table = SessionTable::new(EVERY);
        table.append_frame("s1", &[9, 9]);
        assert_eq!(table.begin_final("s1"), FinalDecision::Start(vec![9, 9]));
        assert_eq!(table.begin_final("missing"), FinalDecision::Unknown);
    }

    #[test]
    fn test_failed_partial_still_releases_pending_final() {
        // complete() is called on the error path too; the deferred final must
        // run even though the partial produced nothing.
        let mut table = SessionTable::new(EVERY);
        let now = Instant::now();
        table.append_frame("s1", &[1]);
        assert!(table.maybe_begin_partial("s1", now).is_some());
        assert_eq!(table.begin_final("s1"), FinalDecision::Deferred);

        match table.complete("s1", false, now) {
            Followup::StartFinal(_) => {}
            other => panic!("expected deferred final, got {other:?}"),
        }
    }

    #[test]
    fn test_single_in_flight_per_session() {
        let mut table = SessionTable::new(EVERY);
        let now = Instant::now();
        table.append_frame("s1", &[1]);
        table.append_frame("s2", &[2]);

        assert!(table.maybe_begin_partial("s1", now).is_some());
        // s1 is busy but s2 is independent.
        assert!(table.maybe_begin_partial("s2", now).is_some());
        assert!(table.maybe_begin_partial("s1", now + EVERY * 2).is_none());
    }
}
