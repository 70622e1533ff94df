//! Loads the local catalog file a standalone (control-plane-free) agent
//! uses in place of a control-plane-pushed catalog, through the engine's
//! `CatalogProvider` seam.

use std::path::Path;

use anyhow::{Context, Result};
use superagent_engine::StaticCatalog;
use superagent_types::CatalogEntry;

/// Reads a YAML list of [`CatalogEntry`] from `path`. A missing file is not
/// an error — it just means no app versions are deployable yet, the same
/// way a fresh agent starts with an empty registry.
pub fn load(path: &Path) -> Result<StaticCatalog> {
    if !path.exists() {
        return Ok(StaticCatalog::new(Vec::new()));
    }
    let raw = std::fs::read_to_string(path).with_context(|| format!("failed to read catalog file {}", path.display()))?;
    let entries: Vec<CatalogEntry> = serde_yaml::from_str(&raw).with_context(|| format!("failed to parse catalog file {}", path.display()))?;
    Ok(StaticCatalog::new(entries))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_catalog_file_yields_an_empty_catalog() {
        use superagent_engine::CatalogProvider;
        let catalog = load(Path::new("/nonexistent/catalog.yaml")).expect("load");
        assert!(catalog.lookup("react-starter", "1.0.0").is_none());
    }

    #[test]
    fn parses_a_catalog_file_with_one_entry() {
        use superagent_engine::CatalogProvider;
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("catalog.yaml");
        std::fs::write(
            &path,
            r#"
- app_id: react-starter
  version: "1.0.0"
  source:
    kind: image
    reference: ghcr.io/acme/widgets:1.0
  runtime:
    start_command: null
    exposed_port: 8080
"#,
        )
        .expect("write");

        let catalog = load(&path).expect("load");
        let entry = catalog.lookup("react-starter", "1.0.0").expect("entry present");
        assert_eq!(entry.runtime.exposed_port, 8080);
    }
}
