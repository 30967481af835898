//! Subprocess synthesizer
//!
//! Pipes `{"text", "voice", "sample_rate", "channels"}` to an external
//! command's stdin and streams NDJSON `{"pcm_base64", "final"}` lines from
//! its stdout, one chunk per line. Invocations are serialized.

use std::process::Stdio;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, Mutex};

use super::{SynthChunk, SynthRequest, Synthesizer};
use crate::PipelineError;

#[derive(Serialize)]
struct ExecRequest<'a> {
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    voice: Option<&'a str>,
    sample_rate: u32,
    channels: u16,
}

#[derive(Deserialize)]
struct ExecChunk {
    pcm_base64: String,
    #[serde(rename = "final", default)]
    is_final: bool,
}

pub struct ExecSynthesizer {
    program: String,
    args: Vec<String>,
    sample_rate: u32,
    channels: u16,
    guard: Mutex<()>,
}

impl ExecSynthesizer {
    pub fn new(command: &str, sample_rate: u32, channels: u16) -> Result<Self, PipelineError> {
        let mut parts = command.split_whitespace().map(str::to_string);
        let program = parts
            .next()
            .ok_or_else(|| PipelineError::Adapter("tts command is empty".to_string()))?;
        Ok(Self {
            program,
            args: parts.collect(),
            sample_rate,
            channels,
            guard: Mutex::new(()),
        })
    }
}

#[async_trait]
impl Synthesizer for ExecSynthesizer {
    async fn synthesize(
        &self,
        req: SynthRequest,
        sink: mpsc::Sender<SynthChunk>,
    ) -> Result<(), PipelineError> {
        let _serial = self.guard.lock().await;

        let input = serde_json::to_vec(&ExecRequest {
            text: &req.text,
            voice: req.voice.as_deref(),
            sample_rate: self.sample_rate,
            channels: self.channels,
        })?;

        let mut child = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&input).await?;
            stdin.shutdown().await?;
        }

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| PipelineError::Adapter("tts command has no stdout".to_string()))?;
        let mut lines = BufReader::new(stdout).lines();

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let parsed: ExecChunk = serde_json::from_str(&line)
                .map_err(|e| PipelineError::Adapter(format!("decode tts chunk: {e}")))?;
            let pcm = STANDARD
                .decode(parsed.pcm_base64)
                .map_err(|e| PipelineError::Adapter(format!("decode tts pcm: {e}")))?;
            sink.send(SynthChunk {
                pcm,
                sample_rate: self.sample_rate,
                channels: self.channels,
                is_final: parsed.is_final,
            })
            .await
            .map_err(|_| PipelineError::Adapter("synthesis sink closed".to_string()))?;
        }

        let status = child.wait().await?;
        if !status.success() {
            return Err(PipelineError::Adapter(format!(
                "tts command exited with {status}"
            )));
        }
        Ok(())
    }
}
