//! The contract the engine uses to resolve `(app_id, version)` into a
//! [`CatalogEntry`] without depending on how the catalog is sourced
//! (control-plane sync cache, or a local file when running standalone).
//!
//! Mirrors the shape of `superagent_process::ContainerDriver`: an abstract
//! trait at the seam, a concrete implementation living one layer up.

use superagent_types::CatalogEntry;

pub trait CatalogProvider: Send + Sync {
    fn lookup(&self, app_id: &str, version: &str) -> Option<CatalogEntry>;
}

/// Fixed in-memory catalog, useful for tests and for a control-plane-free
/// agent that loads its catalog from a local file once at startup.
pub struct StaticCatalog {
    entries: Vec<CatalogEntry>,
}

impl StaticCatalog {
    pub fn new(entries: Vec<CatalogEntry>) -> Self {
        Self { entries }
    }
}

impl CatalogProvider for StaticCatalog {
    fn lookup(&self, app_id: &str, version: &str) -> Option<CatalogEntry> {
        self.entries.iter().find(|e| e.app_id == app_id && e.version == version).cloned()
    }
}
