//! WASM skill host
//!
//! Skills are self-contained extensions: a validated `skill.yaml` manifest
//! plus a WebAssembly module. The host discovers them at startup, subscribes
//! on their behalf, and executes each inbound message in a freshly
//! instantiated sandbox exposing exactly the `v1` host interface
//! (`host_log`, `host_publish`). Publishes are permission-checked before any
//! side effect and every invocation is audited.

mod error;
mod host;
mod manifest;
mod sandbox;

pub use error::SkillError;
pub use host::{discover, SkillBinding, SkillHost};
pub use manifest::{BusSpec, Capabilities, Manifest, Metadata, RuntimeSpec, StorageSpec, Surfaces};
pub use sandbox::{HostAuditEvent, HostBindings, PUBLISH_ERR_NOT_ALLOWED, PUBLISH_ERR_RUNTIME, PUBLISH_OK};
