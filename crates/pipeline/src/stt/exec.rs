//! Subprocess recognizer
//!
//! Encodes the buffered PCM as a WAV file and invokes an external command
//! (`<command> --audio <wav> [--model <path>] [--language <lang>]
//! [--partial]`), expecting `{"text": ..., "confidence": ...}` on stdout.
//! Invocations are serialized; most wrapped models are single-instance.

use std::process::Stdio;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::Mutex;

use super::{Recognizer, TranscriptResult};
use crate::PipelineError;
use loqa_config::SttConfig;

#[derive(Debug, Deserialize)]
struct ExecResult {
    text: String,
    #[serde(default)]
    confidence: Option<f64>,
}

pub struct ExecRecognizer {
    program: String,
    args: Vec<String>,
    cfg: SttConfig,
    guard: Mutex<()>,
}

impl ExecRecognizer {
    pub fn new(cfg: SttConfig) -> Result<Self, PipelineError> {
        let command = cfg.command.clone().unwrap_or_default();
        let mut parts = command.split_whitespace().map(str::to_string);
        let program = parts
            .next()
            .ok_or_else(|| PipelineError::Adapter("stt command is empty".to_string()))?;
        Ok(Self {
            program,
            args: parts.collect(),
            cfg,
            guard: Mutex::new(()),
        })
    }

    fn write_wav(
        &self,
        pcm: &[u8],
        sample_rate: u32,
        channels: u16,
    ) -> Result<tempfile::NamedTempFile, PipelineError> {
        if pcm.len() % 2 != 0 {
            return Err(PipelineError::Adapter(
                "pcm payload not 16-bit aligned".to_string(),
            ));
        }
        let file = tempfile::Builder::new()
            .prefix("loqa_stt_")
            .suffix(".wav")
            .tempfile()?;
        let spec = hound::WavSpec {
            channels,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(file.path(), spec)
            .map_err(|e| PipelineError::Adapter(format!("create wav: {e}")))?;
        for sample in pcm.chunks_exact(2) {
            writer
                .write_sample(i16::from_le_bytes([sample[0], sample[1]]))
                .map_err(|e| PipelineError::Adapter(format!("write wav: {e}")))?;
        }
        writer
            .finalize()
            .map_err(|e| PipelineError::Adapter(format!("finalize wav: {e}")))?;
        Ok(file)
    }
}

#[async_trait]
impl Recognizer for ExecRecognizer {
    async fn transcribe(
        &self,
        pcm: &[u8],
        sample_rate: u32,
        channels: u16,
        is_final: bool,
    ) -> Result<TranscriptResult, PipelineError> {
        let _serial = self.guard.lock().await;

        let wav = self.write_wav(pcm, sample_rate, channels)?;

        let mut command = tokio::process::Command::new(&self.program);
        command.args(&self.args);
        command.arg("--audio").arg(wav.path());
        if let Some(model) = self.cfg.model_path.as_deref() {
            command.arg("--model").arg(model);
        }
        if let Some(language) = self.cfg.language.as_deref() {
            command.arg("--language").arg(language);
        }
        if self.cfg.publish_interim && !is_final {
            command.arg("--partial");
        }
        command.stdin(Stdio::null());
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());
        command.kill_on_drop(true);

        let output = command.output().await?;
        if !output.status.success() {
            return Err(PipelineError::Adapter(format!(
                "stt command exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr)
            )));
        }

        let result: ExecResult = serde_json::from_slice(&output.stdout)
            .map_err(|e| PipelineError::Adapter(format!("decode stt response: {e}")))?;
        Ok(TranscriptResult {
            text: result.text,
            confidence: result.confidence,
        })
    }
}
