//! Resolves this agent's stable identifier: `config.agent.id` if set,
//! otherwise a generated id persisted under `data_dir` so it survives
//! restarts (the secure store's encryption key is namespaced to it).

use std::path::Path;

use anyhow::{Context, Result};
use rand::Rng;

const ID_FILE: &str = "agent_id";

pub fn resolve(data_dir: &Path, configured: Option<&str>) -> Result<String> {
    if let Some(id) = configured {
        return Ok(id.to_string());
    }

    let path = data_dir.join(ID_FILE);
    if path.exists() {
        let raw = std::fs::read_to_string(&path).with_context(|| format!("failed to read {}", path.display()))?;
        return Ok(raw.trim().to_string());
    }

    let mut bytes = [0u8; 8];
    rand::rng().fill(&mut bytes);
    let id = format!("agent-{}", hex::encode(bytes));
    std::fs::write(&path, &id).with_context(|| format!("failed to persist agent id to {}", path.display()))?;
    Ok(id)
}
