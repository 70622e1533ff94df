//! Configuration loading: the YAML config file, its env-var
//! override layer, and the secure-store passphrase resolution that both
//! read from it.
//!
//! Generalized from `shipper-config`, which loads a single TOML file with no
//! override layer and no search path, since a cargo-workspace tool only
//! ever has one obvious config location. This agent is a daemon installed
//! system-wide, so it needs the search-path-then-default-write behavior and
//! the environment-variable override layer this crate adds; the
//! section-by-section struct shape and "defaults function per struct" idiom
//! carry over unchanged.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const CONFIG_FILE_NAME: &str = ".superagent.yaml";
pub const ENV_PREFIX: &str = "SUPERAGENT_";

/// Section names, in the exact order the config file documents them.
const SECTIONS: &[&str] = &[
    "agent",
    "backend",
    "docker",
    "git",
    "traefik",
    "security",
    "monitoring",
    "logging",
    "resources",
    "networking",
    "admin_panel",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    // Field order mirrors the documented section order in the config file.
    pub agent: AgentConfig,
    pub backend: BackendConfig,
    pub docker: DockerConfig,
    pub git: GitConfig,
    pub traefik: TraefikConfig,
    pub security: SecurityConfig,
    pub monitoring: MonitoringConfig,
    pub logging: LoggingConfig,
    pub resources: ResourcesConfig,
    pub networking: NetworkingConfig,
    pub admin_panel: AdminPanelConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            agent: AgentConfig::default(),
            backend: BackendConfig::default(),
            docker: DockerConfig::default(),
            git: GitConfig::default(),
            traefik: TraefikConfig::default(),
            security: SecurityConfig::default(),
            monitoring: MonitoringConfig::default(),
            logging: LoggingConfig::default(),
            resources: ResourcesConfig::default(),
            networking: NetworkingConfig::default(),
            admin_panel: AdminPanelConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub id: Option<String>,
    pub data_dir: PathBuf,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            id: None,
            data_dir: PathBuf::from("/var/lib/superagent"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub base_url: String,
    pub heartbeat_interval_secs: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: "standalone".to_string(),
            heartbeat_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerConfig {
    pub binary: String,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            binary: "docker".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GitConfig {
    pub default_depth: u32,
    /// Bare-repo cache entries untouched for longer than this are pruned on
    /// the sweep the daemon runs alongside reconciliation.
    pub cache_max_age_days: u32,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            default_depth: 1,
            cache_max_age_days: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TraefikConfig {
    pub enabled: bool,
    pub routing_file: PathBuf,
    pub debounce_ms: u64,
}

impl Default for TraefikConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            routing_file: PathBuf::from("/etc/traefik/dynamic/superagent.yaml"),
            debounce_ms: 50,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    pub encryption_key_file: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub bind: String,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:9090".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "json".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourcesConfig {
    pub max_concurrent_ops: usize,
    pub max_deployments: usize,
}

impl Default for ResourcesConfig {
    fn default() -> Self {
        Self {
            max_concurrent_ops: 5,
            max_deployments: 50,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkingConfig {
    pub bind: String,
}

impl Default for NetworkingConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdminPanelConfig {
    pub sync_interval_secs: u64,
}

impl Default for AdminPanelConfig {
    fn default() -> Self {
        Self {
            sync_interval_secs: 300,
        }
    }
}

/// Search order: `./.superagent.yaml`, `~/.superagent.yaml`,
/// `/etc/superagent/config.yaml`.
pub fn search_paths() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from(format!("./{CONFIG_FILE_NAME}"))];
    if let Some(home) = dirs::home_dir() {
        paths.push(home.join(CONFIG_FILE_NAME));
    }
    paths.push(PathBuf::from("/etc/superagent/config.yaml"));
    paths
}

/// Load the config, applying env-var overrides. If no config file exists on
/// the search path, a documented default is written to `~/.superagent.yaml`
/// and the in-memory default (with overrides applied) is returned.
pub fn load() -> Result<Config> {
    let found = search_paths().into_iter().find(|p| p.exists());

    let mut value = match &found {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config file {}", path.display()))?;
            serde_yaml::from_str(&raw).with_context(|| format!("failed to parse config file {}", path.display()))?
        }
        None => serde_json::to_value(Config::default()).context("failed to serialize default config")?,
    };

    apply_env_overrides(&mut value, std::env::vars())?;

    let config: Config = serde_json::from_value(value).context("failed to apply config overrides")?;

    if found.is_none() {
        write_default(&config)?;
    }

    Ok(config)
}

fn write_default(config: &Config) -> Result<()> {
    let Some(home) = dirs::home_dir() else {
        return Ok(());
    };
    let path = home.join(CONFIG_FILE_NAME);
    let yaml = serde_yaml::to_string(config).context("failed to serialize default config")?;
    std::fs::write(&path, yaml).with_context(|| format!("failed to write default config to {}", path.display()))?;
    Ok(())
}

/// Apply `SUPERAGENT_<SECTION>_<FIELD>` overrides onto a deserialized config
/// value. `<FIELD>` may itself contain underscores (`BACKEND_BASE_URL` ->
/// section `backend`, field `base_url`), so sections are matched first and
/// the remainder is taken verbatim as the field name.
fn apply_env_overrides(value: &mut Value, vars: impl Iterator<Item = (String, String)>) -> Result<()> {
    let Value::Object(root) = value else {
        bail!("config value is not an object");
    };

    for (key, raw) in vars {
        let Some(rest) = key.strip_prefix(ENV_PREFIX) else {
            continue;
        };
        let rest_lower = rest.to_lowercase();

        let Some(section) = SECTIONS.iter().find(|s| rest_lower.starts_with(&format!("{s}_"))) else {
            continue;
        };
        let field = &rest_lower[section.len() + 1..];
        if field.is_empty() {
            continue;
        }

        let section_obj = root
            .entry(section.to_string())
            .or_insert_with(|| Value::Object(Default::default()));
        if let Value::Object(section_map) = section_obj {
            section_map.insert(field.to_string(), guess_value(&raw));
        }
    }

    Ok(())
}

fn guess_value(raw: &str) -> Value {
    if let Ok(b) = raw.parse::<bool>() {
        return Value::Bool(b);
    }
    if let Ok(n) = raw.parse::<i64>() {
        return Value::Number(n.into());
    }
    if let Ok(f) = raw.parse::<f64>()
        && let Some(n) = serde_json::Number::from_f64(f)
    {
        return Value::Number(n);
    }
    Value::String(raw.to_string())
}

/// Resolve the secure store's passphrase: `SUPERAGENT_ENCRYPTION_KEY` wins,
/// then `security.encryption_key_file`.
pub fn resolve_passphrase(config: &Config) -> Result<String> {
    if let Ok(key) = std::env::var("SUPERAGENT_ENCRYPTION_KEY") {
        return Ok(key);
    }
    if let Some(path) = &config.security.encryption_key_file {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read encryption key file {path}"))?;
        return Ok(contents.trim().to_string());
    }
    bail!("no encryption key configured: set SUPERAGENT_ENCRYPTION_KEY or security.encryption_key_file")
}

/// Whether `base_url` means "no control plane configured". This enumeration
/// is load-bearing and intentionally not generalized into a pattern match —
/// see DESIGN.md.
pub fn control_plane_disabled(base_url: &str) -> bool {
    matches!(
        base_url,
        "standalone" | "none" | "local" | "" | "localhost:9999" | "http://localhost:9999" | "https://localhost:9999"
    )
}

pub fn config_path_for_dir(dir: &Path) -> PathBuf {
    dir.join(CONFIG_FILE_NAME)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_standalone_backend() {
        let config = Config::default();
        assert!(control_plane_disabled(&config.backend.base_url));
    }

    #[test]
    fn env_override_sets_nested_field_with_underscored_name() {
        let mut value = serde_json::to_value(Config::default()).expect("serialize");
        apply_env_overrides(
            &mut value,
            vec![("SUPERAGENT_BACKEND_BASE_URL".to_string(), "https://cp.example.com".to_string())].into_iter(),
        )
        .expect("apply");

        let config: Config = serde_json::from_value(value).expect("deserialize");
        assert_eq!(config.backend.base_url, "https://cp.example.com");
    }

    #[test]
    fn env_override_parses_numbers_and_bools() {
        let mut value = serde_json::to_value(Config::default()).expect("serialize");
        apply_env_overrides(
            &mut value,
            vec![
                ("SUPERAGENT_RESOURCES_MAX_CONCURRENT_OPS".to_string(), "12".to_string()),
                ("SUPERAGENT_TRAEFIK_ENABLED".to_string(), "false".to_string()),
            ]
            .into_iter(),
        )
        .expect("apply");

        let config: Config = serde_json::from_value(value).expect("deserialize");
        assert_eq!(config.resources.max_concurrent_ops, 12);
        assert!(!config.traefik.enabled);
    }

    #[test]
    fn unrelated_env_vars_are_ignored() {
        let mut value = serde_json::to_value(Config::default()).expect("serialize");
        apply_env_overrides(&mut value, vec![("PATH".to_string(), "/usr/bin".to_string())].into_iter())
            .expect("apply");
        let config: Config = serde_json::from_value(value).expect("deserialize");
        assert_eq!(config, Config::default());
    }

    #[test]
    fn control_plane_disabled_recognizes_every_standalone_alias() {
        assert!(control_plane_disabled("standalone"));
        assert!(control_plane_disabled("none"));
        assert!(control_plane_disabled("local"));
        assert!(control_plane_disabled(""));
        assert!(control_plane_disabled("localhost:9999"));
        assert!(!control_plane_disabled("https://cp.example.com"));
        assert!(!control_plane_disabled("localhost:9998"));
    }

    #[test]
    fn resolve_passphrase_reads_key_file_when_no_env_var() {
        let dir = tempfile::tempdir().expect("tempdir");
        let key_path = dir.path().join("key.txt");
        std::fs::write(&key_path, "passphrase-from-file\n").expect("write");

        let mut config = Config::default();
        config.security.encryption_key_file = Some(key_path.to_string_lossy().into_owned());

        unsafe {
            std::env::remove_var("SUPERAGENT_ENCRYPTION_KEY");
        }
        let resolved = resolve_passphrase(&config).expect("resolve");
        assert_eq!(resolved, "passphrase-from-file");
    }
}
