//! The application catalog: immutable, control-plane-provided definitions of
//! what a given `(app_id, version)` deploys as.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// One version of one application, as handed down by the control plane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub app_id: String,
    pub version: String,
    pub source: SourceSpec,
    #[serde(default)]
    pub build: Option<BuildSpec>,
    pub runtime: RuntimeSpec,
    #[serde(default)]
    pub resource_limits: ResourceLimits,
}

/// Where the bits for a deployment come from. A tagged variant matched on
/// `kind` in the fetcher — never reflected on at runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceSpec {
    Git { url: String, r#ref: String },
    Image { reference: String },
}

impl SourceSpec {
    pub fn kind(&self) -> &'static str {
        match self {
            SourceSpec::Git { .. } => "git",
            SourceSpec::Image { .. } => "image",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildSpec {
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub dockerfile: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeSpec {
    pub start_command: Option<String>,
    pub exposed_port: u16,
    #[serde(default)]
    pub required_env: Vec<String>,
    /// Optional HTTP health check path; absence falls back to the liveness
    /// proxy (container still running N seconds after start).
    #[serde(default)]
    pub health_check_path: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    #[serde(default = "default_cpu")]
    pub cpu_cores: f64,
    #[serde(default = "default_memory_bytes")]
    pub memory_bytes: u64,
    #[serde(default = "default_storage_bytes")]
    pub storage_bytes: u64,
}

fn default_cpu() -> f64 {
    0.5
}

fn default_memory_bytes() -> u64 {
    256 * 1024 * 1024
}

fn default_storage_bytes() -> u64 {
    1024 * 1024 * 1024
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            cpu_cores: default_cpu(),
            memory_bytes: default_memory_bytes(),
            storage_bytes: default_storage_bytes(),
        }
    }
}

/// Merge catalog default environment with operator overrides; operator wins.
pub fn merge_env(
    catalog_defaults: &BTreeMap<String, String>,
    operator_overrides: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut merged = catalog_defaults.clone();
    for (k, v) in operator_overrides {
        merged.insert(k.clone(), v.clone());
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operator_env_overrides_catalog_defaults() {
        let mut defaults = BTreeMap::new();
        defaults.insert("LOG_LEVEL".to_string(), "info".to_string());
        defaults.insert("PORT".to_string(), "8080".to_string());

        let mut overrides = BTreeMap::new();
        overrides.insert("LOG_LEVEL".to_string(), "debug".to_string());

        let merged = merge_env(&defaults, &overrides);
        assert_eq!(merged.get("LOG_LEVEL").map(String::as_str), Some("debug"));
        assert_eq!(merged.get("PORT").map(String::as_str), Some("8080"));
    }

    #[test]
    fn source_spec_kind_matches_tag() {
        let git = SourceSpec::Git {
            url: "https://example/r".into(),
            r#ref: "main".into(),
        };
        assert_eq!(git.kind(), "git");

        let image = SourceSpec::Image {
            reference: "registry/app:1.0".into(),
        };
        assert_eq!(image.kind(), "image");
    }

    #[test]
    fn source_spec_serializes_with_kind_tag() {
        let git = SourceSpec::Git {
            url: "https://example/r".into(),
            r#ref: "v1.2.0".into(),
        };
        let json = serde_json::to_value(&git).expect("serialize");
        assert_eq!(json["kind"], "git");
        assert_eq!(json["ref"], "v1.2.0");
    }
}
