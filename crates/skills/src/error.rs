//! Skill host error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SkillError {
    #[error("invalid manifest: {0}")]
    Manifest(String),

    #[error("manifest parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("duplicate skill name {0:?}")]
    Duplicate(String),

    #[error("sandbox failure: {0}")]
    Sandbox(String),

    #[error("skill invocation exceeded its {0}s deadline")]
    Timeout(u64),

    #[error("transport failure: {0}")]
    Transport(#[from] loqa_bus::BusError),
}
