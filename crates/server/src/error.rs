//! Runtime error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("configuration error: {0}")]
    Config(#[from] loqa_config::ConfigError),

    #[error("bus error: {0}")]
    Bus(#[from] loqa_bus::BusError),

    #[error("event store error: {0}")]
    Store(#[from] loqa_store::StoreError),

    #[error("skill host error: {0}")]
    Skills(#[from] loqa_skills::SkillError),

    #[error("pipeline error: {0}")]
    Pipeline(#[from] loqa_pipeline::PipelineError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
