//! Mock synthesizer for development and tests

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{SynthChunk, SynthRequest, Synthesizer};
use crate::PipelineError;

/// Emits a single empty final chunk after a short delay.
#[derive(Debug)]
pub struct MockSynthesizer {
    sample_rate: u32,
    channels: u16,
}

impl MockSynthesizer {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
        }
    }
}

#[async_trait]
impl Synthesizer for MockSynthesizer {
    async fn synthesize(
        &self,
        _req: SynthRequest,
        sink: mpsc::Sender<SynthChunk>,
    ) -> Result<(), PipelineError> {
        tokio::time::sleep(Duration::from_millis(50)).await;
        sink.send(SynthChunk {
            pcm: Vec::new(),
            sample_rate: self.sample_rate,
            channels: self.channels,
            is_final: true,
        })
        .await
        .map_err(|_| PipelineError::Adapter("synthesis sink closed".to_string()))
    }
}
