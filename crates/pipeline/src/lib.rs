//! Voice pipeline workers
//!
//! The three bus-driven worker services (speech-to-text, language model,
//! text-to-speech) and the per-session voice router that chains them into a
//! complete turn. Model backends plug in behind the `Recognizer`, `Generator`
//! and `Synthesizer` traits; each ships a mock and a subprocess variant, the
//! language model additionally an Ollama HTTP variant.

mod error;
pub mod llm;
pub mod router;
pub mod stt;
pub mod tts;

pub use error::PipelineError;
