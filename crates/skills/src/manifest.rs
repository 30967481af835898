//! Skill manifest
//!
//! A manifest declares a skill's identity, runtime requirements, bus
//! capabilities and permissions. Discovery looks for files literally named
//! `skill.yaml` (case-insensitive); the module path is resolved relative to
//! the manifest's own directory.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::SkillError;

/// Host interface version implemented by this process.
pub const HOST_VERSION: &str = "v1";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub runtime: RuntimeSpec,
    #[serde(default)]
    pub capabilities: Capabilities,
    #[serde(default)]
    pub permissions: Vec<String>,
    #[serde(default)]
    pub surfaces: Surfaces,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeSpec {
    #[serde(default)]
    pub mode: String,
    #[serde(default)]
    pub module: String,
    #[serde(default)]
    pub entrypoint: String,
    #[serde(default)]
    pub host_version: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Capabilities {
    #[serde(default)]
    pub bus: BusSpec,
    #[serde(default)]
    pub storage: Option<StorageSpec>,
    #[serde(default)]
    pub timers: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BusSpec {
    #[serde(default)]
    pub publish: Vec<String>,
    #[serde(default)]
    pub subscribe: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageSpec {
    #[serde(default)]
    pub kv: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Surfaces {
    #[serde(default)]
    pub voice: bool,
    #[serde(default)]
    pub display: bool,
    #[serde(default)]
    pub automations: bool,
}

impl Manifest {
    /// Read and parse a manifest from disk. Validation is separate.
    pub fn load(path: &Path) -> Result<Self, SkillError> {
        let data = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&data)?)
    }

    /// Ensure the manifest carries every required field.
    pub fn validate(&self) -> Result<(), SkillError> {
        if self.metadata.name.is_empty() {
            return Err(SkillError::Manifest("metadata.name is required".to_string()));
        }
        if self.metadata.version.is_empty() {
            return Err(SkillError::Manifest(
                "metadata.version is required".to_string(),
            ));
        }
        match self.runtime.mode.as_str() {
            "" => {
                return Err(SkillError::Manifest("runtime.mode is required".to_string()));
            }
            "wasm" => {
                if self.runtime.module.is_empty() {
                    return Err(SkillError::Manifest(
                        "runtime.module is required for wasm".to_string(),
                    ));
                }
                if self.runtime.entrypoint.is_empty() {
                    return Err(SkillError::Manifest(
                        "runtime.entrypoint is required for wasm".to_string(),
                    ));
                }
            }
            other => {
                return Err(SkillError::Manifest(format!(
                    "runtime.mode {other:?} not supported"
                )));
            }
        }
        if !self.runtime.host_version.is_empty() && self.runtime.host_version != HOST_VERSION {
            return Err(SkillError::Manifest(format!(
                "runtime.host_version {:?} not supported",
                self.runtime.host_version
            )));
        }
        if self.capabilities.bus.publish.is_empty() && self.capabilities.bus.subscribe.is_empty() {
            return Err(SkillError::Manifest(
                "capabilities.bus must declare publish or subscribe subjects".to_string(),
            ));
        }
        if self.permissions.is_empty() {
            return Err(SkillError::Manifest(
                "permissions must include at least one entry".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
metadata:
  name: timer
  version: 0.1.0
  description: kitchen timer
runtime:
  mode: wasm
  module: timer.wasm
  entrypoint: run
  host_version: v1
capabilities:
  bus:
    publish:
      - timer.fired
    subscribe:
      - stt.text.final
permissions:
  - bus:publish
  - bus:subscribe
"#;

    fn parsed(yaml: &str) -> Manifest {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_valid_manifest_passes() {
        let manifest = parsed(SAMPLE);
        assert!(manifest.validate().is_ok());
        assert_eq!(manifest.metadata.name, "timer");
        assert_eq!(manifest.capabilities.bus.subscribe, vec!["stt.text.final"]);
    }

    #[test]
    fn test_missing_required_fields_rejected() {
        let mut manifest = parsed(SAMPLE);
        manifest.metadata.name.clear();
        assert!(manifest.validate().is_err());

        let mut manifest = parsed(SAMPLE);
        manifest.metadata.version.clear();
        assert!(manifest.validate().is_err());

        let mut manifest = parsed(SAMPLE);
        manifest.runtime.mode.clear();
        assert!(manifest.validate().is_err());

        let mut manifest = parsed(SAMPLE);
        manifest.runtime.module.clear();
        assert!(manifest.validate().is_err());

        let mut manifest = parsed(SAMPLE);
        manifest.runtime.entrypoint.clear();
        assert!(manifest.validate().is_err());
    }

    #[test]
    fn test_non_wasm_mode_rejected() {
        let mut manifest = parsed(SAMPLE);
        manifest.runtime.mode = "native".to_string();
        assert!(manifest.validate().is_err());
    }

    #[test]
    fn test_unknown_host_version_rejected() {
        let mut manifest = parsed(SAMPLE);
        manifest.runtime.host_version = "v2".to_string();
        assert!(manifest.validate().is_err());
    }

    #[test]
    fn test_empty_bus_capabilities_rejected() {
        let mut manifest = parsed(SAMPLE);
        manifest.capabilities.bus.publish.clear();
        manifest.capabilities.bus.subscribe.clear();
        assert!(manifest.validate().is_err());
    }

    #[test]
    fn test_empty_permissions_rejected() {
        let mut manifest = parsed(SAMPLE);
        manifest.permissions.clear();
        assert!(manifest.validate().is_err());
    }

    #[test]
    fn test_load_from_disk() {
        let mut file = tempfile::Builder::new()
            .suffix(".yaml")
            .tempfile()
            .unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let manifest = Manifest::load(file.path()).unwrap();
        assert!(manifest.validate().is_ok());
    }
}
