//! Synthesizer contract

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::PipelineError;

/// Parameters for one synthesis request.
#[derive(Debug, Clone)]
pub struct SynthRequest {
    pub session_id: String,
    pub text: String,
    pub voice: Option<String>,
}

/// One chunk of synthesized PCM. The sample rate and channel count reported
/// here are authoritative for the published audio.
#[derive(Debug, Clone)]
pub struct SynthChunk {
    pub pcm: Vec<u8>,
    pub sample_rate: u32,
    pub channels: u16,
    pub is_final: bool,
}

/// Pluggable text-to-speech backend. Chunks are pushed into `sink` as they
/// are produced; the stream ends when the sender is dropped.
#[async_trait]
pub trait Synthesizer: Send + Sync {
    async fn synthesize(
        &self,
        req: SynthRequest,
        sink: mpsc::Sender<SynthChunk>,
    ) -> Result<(), PipelineError>;
}
