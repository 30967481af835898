//! Mock recognizer for development and tests

use async_trait::async_trait;

use super::{Recognizer, TranscriptResult};
use crate::PipelineError;

/// Returns a fixed-format transcript describing the buffered audio.
#[derive(Debug, Default)]
pub struct MockRecognizer;

#[async_trait]
impl Recognizer for MockRecognizer {
    async fn transcribe(
        &self,
        pcm: &[u8],
        _sample_rate: u32,
        _channels: u16,
        is_final: bool,
    ) -> Result<TranscriptResult, PipelineError> {
        let mode = if is_final { "final" } else { "partial" };
        Ok(TranscriptResult {
            text: format!("[{mode} transcript length={}]", pcm.len()),
            confidence: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_recognizer_output() {
        let result = MockRecognizer
            .transcribe(&[0u8; 4], 16_000, 1, true)
            .await
            .unwrap();
        assert_eq!(result.text, "[final transcript length=4]");
    }
}
