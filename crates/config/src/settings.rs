//! Main settings module

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::ConfigError;

/// Top-level runtime settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Process name reported in telemetry.
    #[serde(default = "default_runtime_name")]
    pub runtime_name: String,

    /// Deployment environment tag.
    #[serde(default = "default_environment")]
    pub environment: String,

    /// Liveness/readiness HTTP surface.
    #[serde(default)]
    pub http: HttpConfig,

    /// Logging, tracing and metrics.
    #[serde(default)]
    pub telemetry: TelemetryConfig,

    /// Message bus connection.
    #[serde(default)]
    pub bus: BusConfig,

    /// Local node identity and heartbeat cadence.
    #[serde(default)]
    pub node: NodeConfig,

    /// Audit event store.
    #[serde(default)]
    pub event_store: EventStoreConfig,

    /// Speech-to-text worker.
    #[serde(default)]
    pub stt: SttConfig,

    /// Language model worker.
    #[serde(default)]
    pub llm: LlmConfig,

    /// Text-to-speech worker.
    #[serde(default)]
    pub tts: TtsConfig,

    /// Voice session router.
    #[serde(default)]
    pub router: RouterConfig,

    /// WASM skill host.
    #[serde(default)]
    pub skills: SkillsConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            runtime_name: default_runtime_name(),
            environment: default_environment(),
            http: HttpConfig::default(),
            telemetry: TelemetryConfig::default(),
            bus: BusConfig::default(),
            node: NodeConfig::default(),
            event_store: EventStoreConfig::default(),
            stt: SttConfig::default(),
            llm: LlmConfig::default(),
            tts: TtsConfig::default(),
            router: RouterConfig::default(),
            skills: SkillsConfig::default(),
        }
    }
}

fn default_runtime_name() -> String {
    "loqa-runtime".to_string()
}
fn default_environment() -> String {
    "development".to_string()
}

/// HTTP surface configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_http_bind")]
    pub bind: String,
    #[serde(default = "default_http_port")]
    pub port: u16,
}

fn default_http_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_http_port() -> u16 {
    8080
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind: default_http_bind(),
            port: default_http_port(),
        }
    }
}

/// Telemetry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Emit JSON-formatted log lines.
    #[serde(default)]
    pub log_json: bool,

    /// OTLP collector endpoint for trace export; console-only when unset.
    #[serde(default)]
    pub otlp_endpoint: Option<String>,

    /// Bind address for the Prometheus scrape endpoint.
    #[serde(default = "default_prometheus_bind")]
    pub prometheus_bind: String,
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_prometheus_bind() -> String {
    "127.0.0.1:9091".to_string()
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_json: false,
            otlp_endpoint: None,
            prometheus_bind: default_prometheus_bind(),
        }
    }
}

/// Message bus connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    #[serde(default = "default_bus_servers")]
    pub servers: Vec<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

fn default_bus_servers() -> Vec<String> {
    vec!["nats://localhost:4222".to_string()]
}
fn default_connect_timeout_ms() -> u64 {
    2000
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            servers: default_bus_servers(),
            username: None,
            password: None,
            token: None,
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

/// Local node identity and heartbeat cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default = "default_node_id")]
    pub id: String,
    #[serde(default = "default_node_role")]
    pub role: String,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,
    #[serde(default = "default_capabilities")]
    pub capabilities: Vec<NodeCapability>,
}

/// One advertised capability of the local node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeCapability {
    pub name: String,
    #[serde(default)]
    pub tier: Option<String>,
    #[serde(default)]
    pub attributes: std::collections::HashMap<String, String>,
}

fn default_node_id() -> String {
    "loqa-node-1".to_string()
}
fn default_node_role() -> String {
    "runtime".to_string()
}
fn default_heartbeat_interval_ms() -> u64 {
    2000
}
fn default_heartbeat_timeout_ms() -> u64 {
    6000
}
fn default_capabilities() -> Vec<NodeCapability> {
    vec![NodeCapability {
        name: "runtime.core".to_string(),
        tier: Some("balanced".to_string()),
        attributes: Default::default(),
    }]
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: default_node_id(),
            role: default_node_role(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
            capabilities: default_capabilities(),
        }
    }
}

/// Retention policy for the audit event store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetentionMode {
    /// Accept and silently drop; no backing storage.
    Ephemeral,
    /// Persist everything; no automatic pruning.
    Session,
    /// Persist everything; prune on startup.
    Persistent,
}

/// Audit event store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventStoreConfig {
    #[serde(default = "default_event_store_path")]
    pub path: String,
    #[serde(default = "default_retention_mode")]
    pub retention_mode: RetentionMode,
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    #[serde(default = "default_max_sessions")]
    pub max_sessions: u32,
    #[serde(default)]
    pub vacuum_on_start: bool,
}

fn default_event_store_path() -> String {
    "./data/loqa-events.db".to_string()
}
fn default_retention_mode() -> RetentionMode {
    RetentionMode::Session
}
fn default_retention_days() -> u32 {
    30
}
fn default_max_sessions() -> u32 {
    10_000
}

impl Default for EventStoreConfig {
    fn default() -> Self {
        Self {
            path: default_event_store_path(),
            retention_mode: default_retention_mode(),
            retention_days: default_retention_days(),
            max_sessions: default_max_sessions(),
            vacuum_on_start: false,
        }
    }
}

/// Speech-to-text worker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SttConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_mode_mock")]
    pub mode: String,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub model_path: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default = "default_stt_sample_rate")]
    pub sample_rate: u32,
    #[serde(default = "default_channels")]
    pub channels: u16,
    #[serde(default = "default_frame_duration_ms")]
    pub frame_duration_ms: u64,
    #[serde(default = "default_partial_every_ms")]
    pub partial_every_ms: u64,
    #[serde(default)]
    pub publish_interim: bool,
}

fn default_mode_mock() -> String {
    "mock".to_string()
}
fn default_stt_sample_rate() -> u32 {
    16_000
}
fn default_channels() -> u16 {
    1
}
fn default_frame_duration_ms() -> u64 {
    20
}
fn default_partial_every_ms() -> u64 {
    800
}

impl Default for SttConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            mode: default_mode_mock(),
            command: None,
            model_path: None,
            language: None,
            sample_rate: default_stt_sample_rate(),
            channels: default_channels(),
            frame_duration_ms: default_frame_duration_ms(),
            partial_every_ms: default_partial_every_ms(),
            publish_interim: false,
        }
    }
}

/// Language model worker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_mode_mock")]
    pub mode: String,
    #[serde(default = "default_llm_endpoint")]
    pub endpoint: String,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default = "default_llm_model")]
    pub model_fast: String,
    #[serde(default = "default_llm_model")]
    pub model_balanced: String,
    #[serde(default = "default_tier")]
    pub default_tier: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
}

fn default_llm_endpoint() -> String {
    "http://localhost:11434".to_string()
}
fn default_llm_model() -> String {
    "llama3.2:latest".to_string()
}
fn default_tier() -> String {
    "balanced".to_string()
}
fn default_max_tokens() -> u32 {
    256
}
fn default_temperature() -> f64 {
    0.7
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            mode: default_mode_mock(),
            endpoint: default_llm_endpoint(),
            command: None,
            model_fast: default_llm_model(),
            model_balanced: default_llm_model(),
            default_tier: default_tier(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
        }
    }
}

/// Text-to-speech worker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_mode_mock")]
    pub mode: String,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default = "default_voice")]
    pub voice: String,
    #[serde(default = "default_tts_sample_rate")]
    pub sample_rate: u32,
    #[serde(default = "default_channels")]
    pub channels: u16,
    #[serde(default = "default_chunk_duration_ms")]
    pub chunk_duration_ms: u64,
}

fn default_voice() -> String {
    "default".to_string()
}
fn default_tts_sample_rate() -> u32 {
    22_050
}
fn default_chunk_duration_ms() -> u64 {
    400
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            mode: default_mode_mock(),
            command: None,
            voice: default_voice(),
            sample_rate: default_tts_sample_rate(),
            channels: default_channels(),
            chunk_duration_ms: default_chunk_duration_ms(),
        }
    }
}

/// Voice session router configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_voice")]
    pub default_voice: String,
    #[serde(default = "default_tier")]
    pub default_tier: String,
    /// Playback target carried into TTS requests.
    #[serde(default)]
    pub target: Option<String>,
    /// Sessions without a done-marker are swept after this long.
    #[serde(default = "default_session_timeout_secs")]
    pub session_timeout_secs: u64,
}

fn default_session_timeout_secs() -> u64 {
    120
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            default_voice: default_voice(),
            default_tier: default_tier(),
            target: None,
            session_timeout_secs: default_session_timeout_secs(),
        }
    }
}

/// WASM skill host configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_skills_directory")]
    pub directory: String,
    /// Upper bound on concurrently executing guests; clamped to at least 1.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Privacy scope attached to skill audit sessions.
    #[serde(default = "default_audit_privacy")]
    pub audit_privacy: String,
}

fn default_skills_directory() -> String {
    "./skills".to_string()
}
fn default_max_concurrency() -> usize {
    4
}
fn default_audit_privacy() -> String {
    "local".to_string()
}

impl Default for SkillsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            directory: default_skills_directory(),
            max_concurrency: default_max_concurrency(),
            audit_privacy: default_audit_privacy(),
        }
    }
}

impl Settings {
    /// Validate settings. Called once after loading; any failure aborts
    /// startup.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.runtime_name.is_empty() {
            return Err(ConfigError::invalid("runtime_name", "must not be empty"));
        }
        if self.http.port == 0 {
            return Err(ConfigError::invalid("http.port", "must be non-zero"));
        }
        if self.telemetry.prometheus_bind.is_empty() {
            return Err(ConfigError::invalid(
                "telemetry.prometheus_bind",
                "must not be empty",
            ));
        }
        if self.bus.servers.is_empty() {
            return Err(ConfigError::invalid("bus.servers", "must not be empty"));
        }
        if self.node.id.is_empty() {
            return Err(ConfigError::invalid("node.id", "must not be empty"));
        }
        if self.node.heartbeat_interval_ms == 0 {
            return Err(ConfigError::invalid(
                "node.heartbeat_interval_ms",
                "must be positive",
            ));
        }
        if self.node.heartbeat_timeout_ms <= self.node.heartbeat_interval_ms {
            return Err(ConfigError::invalid(
                "node.heartbeat_timeout_ms",
                "must be greater than heartbeat interval",
            ));
        }
        if self.node.capabilities.is_empty() {
            return Err(ConfigError::invalid(
                "node.capabilities",
                "must not be empty",
            ));
        }
        if self.event_store.retention_mode != RetentionMode::Ephemeral
            && self.event_store.path.is_empty()
        {
            return Err(ConfigError::invalid("event_store.path", "must not be empty"));
        }
        self.validate_stt()?;
        self.validate_llm()?;
        self.validate_tts()?;
        if self.skills.enabled && self.skills.directory.is_empty() {
            return Err(ConfigError::invalid(
                "skills.directory",
                "must not be empty",
            ));
        }
        Ok(())
    }

    fn validate_stt(&self) -> Result<(), ConfigError> {
        if !self.stt.enabled {
            return Ok(());
        }
        match self.stt.mode.as_str() {
            "mock" | "exec" => {}
            other => {
                return Err(ConfigError::invalid(
                    "stt.mode",
                    format!("{other:?} is not one of mock|exec"),
                ))
            }
        }
        if self.stt.sample_rate == 0 {
            return Err(ConfigError::invalid("stt.sample_rate", "must be positive"));
        }
        if self.stt.channels == 0 {
            return Err(ConfigError::invalid("stt.channels", "must be positive"));
        }
        if self.stt.mode == "exec" && self.stt.command.as_deref().unwrap_or("").is_empty() {
            return Err(ConfigError::invalid(
                "stt.command",
                "must be set when mode=exec",
            ));
        }
        Ok(())
    }

    fn validate_llm(&self) -> Result<(), ConfigError> {
        if !self.llm.enabled {
            return Ok(());
        }
        match self.llm.mode.as_str() {
            "mock" | "ollama" | "exec" => {}
            other => {
                return Err(ConfigError::invalid(
                    "llm.mode",
                    format!("{other:?} is not one of mock|ollama|exec"),
                ))
            }
        }
        if self.llm.mode == "ollama" && self.llm.endpoint.is_empty() {
            return Err(ConfigError::invalid(
                "llm.endpoint",
                "must be set when mode=ollama",
            ));
        }
        if self.llm.mode == "exec" && self.llm.command.as_deref().unwrap_or("").is_empty() {
            return Err(ConfigError::invalid(
                "llm.command",
                "must be set when mode=exec",
            ));
        }
        Ok(())
    }

    fn validate_tts(&self) -> Result<(), ConfigError> {
        if !self.tts.enabled {
            return Ok(());
        }
        match self.tts.mode.as_str() {
            "mock" | "exec" => {}
            other => {
                return Err(ConfigError::invalid(
                    "tts.mode",
                    format!("{other:?} is not one of mock|exec"),
                ))
            }
        }
        if self.tts.mode == "exec" && self.tts.command.as_deref().unwrap_or("").is_empty() {
            return Err(ConfigError::invalid(
                "tts.command",
                "must be set when mode=exec",
            ));
        }
        if self.tts.sample_rate == 0 {
            return Err(ConfigError::invalid("tts.sample_rate", "must be positive"));
        }
        if self.tts.channels == 0 {
            return Err(ConfigError::invalid("tts.channels", "must be positive"));
        }
        Ok(())
    }
}

/// Load settings from a YAML file and the environment.
///
/// Priority (highest to lowest):
/// 1. Environment variables (`LOQA__SECTION__FIELD`)
/// 2. The given file, when present
/// 3. Built-in defaults
pub fn load_settings(path: Option<&str>) -> Result<Settings, ConfigError> {
    let mut builder = Config::builder();

    if let Some(path) = path {
        builder = builder.add_source(File::with_name(path).required(false));
    }

    builder = builder.add_source(
        Environment::with_prefix("LOQA")
            .prefix_separator("__")
            .separator("__")
            .list_separator(",")
            .with_list_parse_key("bus.servers")
            .try_parsing(true),
    );

    let loaded = builder.build()?;
    // Deserialize over defaults so absent sections fall back field by field.
    let settings: Settings = loaded.try_deserialize()?;
    settings.validate()?;
    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_settings_validate() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.http.port, 8080);
        assert_eq!(settings.node.heartbeat_interval_ms, 2000);
        assert_eq!(settings.event_store.retention_mode, RetentionMode::Session);
    }

    #[test]
    fn test_heartbeat_timeout_must_exceed_interval() {
        let mut settings = Settings::default();
        settings.node.heartbeat_timeout_ms = settings.node.heartbeat_interval_ms;
        assert!(settings.validate().is_err());

        settings.node.heartbeat_timeout_ms = settings.node.heartbeat_interval_ms + 1;
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_exec_modes_require_commands() {
        let mut settings = Settings::default();
        settings.stt.enabled = true;
        settings.stt.mode = "exec".to_string();
        assert!(settings.validate().is_err());
        settings.stt.command = Some("whisper-wrapper".to_string());
        assert!(settings.validate().is_ok());

        settings.llm.enabled = true;
        settings.llm.mode = "exec".to_string();
        settings.llm.command = None;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_unknown_adapter_mode_rejected() {
        let mut settings = Settings::default();
        settings.llm.enabled = true;
        settings.llm.mode = "gpu".to_string();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_load_from_yaml_file() {
        let mut file = tempfile::Builder::new()
            .suffix(".yaml")
            .tempfile()
            .unwrap();
        writeln!(
            file,
            "runtime_name: test-runtime\nnode:\n  id: node-a\n  heartbeat_interval_ms: 100\n  heartbeat_timeout_ms: 450"
        )
        .unwrap();

        let settings = load_settings(file.path().to_str()).unwrap();
        assert_eq!(settings.runtime_name, "test-runtime");
        assert_eq!(settings.node.id, "node-a");
        assert_eq!(settings.node.heartbeat_timeout_ms, 450);
        // Untouched sections keep defaults.
        assert_eq!(settings.llm.max_tokens, 256);
    }
}
