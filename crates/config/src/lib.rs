//! Configuration for the Loqa runtime
//!
//! Settings are loaded from a YAML file and overridden by `LOQA__`-prefixed
//! environment variables (`LOQA__NODE__ID`, `LOQA__BUS__SERVERS`, ...).
//! Validation runs once at startup; an invalid configuration aborts the
//! process before any subsystem starts.

mod error;
mod settings;

pub use error::ConfigError;
pub use settings::{
    load_settings, BusConfig, EventStoreConfig, HttpConfig, LlmConfig, NodeCapability, NodeConfig,
    RetentionMode, RouterConfig, Settings, SkillsConfig, SttConfig, TelemetryConfig, TtsConfig,
};
