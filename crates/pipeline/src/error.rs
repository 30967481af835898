//! Pipeline error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("adapter failure: {0}")]
    Adapter(String),

    #[error("{operation} exceeded its {seconds}s deadline")]
    DeadlineExceeded {
        operation: &'static str,
        seconds: u64,
    },

    #[error("transport failure: {0}")]
    Transport(#[from] loqa_bus::BusError),

    #[error("codec failure: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),
}
