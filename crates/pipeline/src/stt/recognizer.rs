//! Recognizer contract

use async_trait::async_trait;

use crate::PipelineError;

/// Output of one transcription.
#[derive(Debug, Clone)]
pub struct TranscriptResult {
    pub text: String,
    pub confidence: Option<f64>,
}

/// Pluggable speech-to-text backend.
#[async_trait]
pub trait Recognizer: Send + Sync {
    /// Transcribe a buffer of 16-bit little-endian PCM. Implementations must
    /// honor cancellation; the service applies the deadline.
    async fn transcribe(
        &self,
        pcm: &[u8],
        sample_rate: u32,
        channels: u16,
        is_final: bool,
    ) -> Result<TranscriptResult, PipelineError>;
}
