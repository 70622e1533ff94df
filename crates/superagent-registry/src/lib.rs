//! Deployment Registry: the authoritative `id -> Deployment` map.
//!
//! Backed by an append-only `registry.log` JSONL event journal so the full
//! map can be rebuilt after a crash by replaying every event in order.
//! Generalized from two halves bridged here: `shipper/src/state.rs`'s
//! atomic single-snapshot persistence, and `shipper-events::EventLog`'s
//! append-only JSONL journal. The registry needs both at once —
//! a fast in-memory map for reads, and a durable log so a crash mid-write
//! never loses or corrupts a deployment's history the way overwriting one
//! `state.json` would.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex, RwLock};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as AsyncMutex;

use superagent_types::{Deployment, DeploymentId};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum RegistryEvent {
    Put(Deployment),
    Retract(DeploymentId),
}

pub struct Registry {
    log_path: PathBuf,
    log_file: AsyncMutex<File>,
    map: RwLock<BTreeMap<DeploymentId, Deployment>>,
    id_locks: StdMutex<HashMap<DeploymentId, Arc<AsyncMutex<()>>>>,
}

impl Registry {
    /// Open (or create) the registry log at `log_path`, replaying every
    /// event to rebuild the in-memory map.
    pub async fn open(log_path: impl Into<PathBuf>) -> Result<Self> {
        let log_path = log_path.into();
        if let Some(parent) = log_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create registry dir {}", parent.display()))?;
        }

        let map = replay(&log_path)?;

        let log_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .with_context(|| format!("failed to open registry log {}", log_path.display()))?;

        Ok(Self {
            log_path,
            log_file: AsyncMutex::new(log_file),
            map: RwLock::new(map),
            id_locks: StdMutex::new(HashMap::new()),
        })
    }

    /// Insert a brand-new deployment. Fails if the id is already known,
    /// since ids are never reused once a record exists.
    pub async fn create(&self, deployment: Deployment) -> Result<()> {
        if self.map.read().unwrap().contains_key(&deployment.id) {
            bail!("deployment id {} already exists in the registry", deployment.id);
        }
        self.append(&RegistryEvent::Put(deployment.clone())).await?;
        self.map.write().unwrap().insert(deployment.id.clone(), deployment);
        Ok(())
    }

    /// Snapshot-read a single deployment. Never blocks a concurrent
    /// `update_with` on a different id.
    pub fn get(&self, id: &DeploymentId) -> Option<Deployment> {
        self.map.read().unwrap().get(id).cloned()
    }

    /// Snapshot-read every deployment currently known. Readers never block
    /// writers for longer than a clone of the map takes.
    pub fn list(&self) -> Vec<Deployment> {
        self.map.read().unwrap().values().cloned().collect()
    }

    /// Apply a mutation to the deployment identified by `id` under that
    /// deployment's own lock, guaranteeing total transition ordering per id
    /// with no ordering imposed across different ids.
    pub async fn update_with<F>(&self, id: &DeploymentId, f: F) -> Result<Deployment>
    where
        F: FnOnce(&mut Deployment) -> Result<()>,
    {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let mut snapshot = self
            .map
            .read()
            .unwrap()
            .get(id)
            .cloned()
            .with_context(|| format!("no such deployment: {id}"))?;

        f(&mut snapshot)?;

        self.append(&RegistryEvent::Put(snapshot.clone())).await?;
        self.map.write().unwrap().insert(id.clone(), snapshot.clone());
        Ok(snapshot)
    }

    /// Permanently remove a deployment from the registry, purging it after
    /// stop+remove+retract.
    pub async fn retract(&self, id: &DeploymentId) -> Result<()> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        self.append(&RegistryEvent::Retract(id.clone())).await?;
        self.map.write().unwrap().remove(id);
        Ok(())
    }

    fn lock_for(&self, id: &DeploymentId) -> Arc<AsyncMutex<()>> {
        let mut locks = self.id_locks.lock().unwrap();
        locks.entry(id.clone()).or_insert_with(|| Arc::new(AsyncMutex::new(()))).clone()
    }

    async fn append(&self, event: &RegistryEvent) -> Result<()> {
        let line = serde_json::to_string(event).context("failed to serialize registry event")?;
        let mut file = self.log_file.lock().await;
        writeln!(file, "{line}").with_context(|| format!("failed to append to {}", self.log_path.display()))?;
        file.flush().context("failed to flush registry log")?;
        Ok(())
    }
}

fn replay(log_path: &std::path::Path) -> Result<BTreeMap<DeploymentId, Deployment>> {
    let mut map = BTreeMap::new();
    if !log_path.exists() {
        return Ok(map);
    }

    let file = File::open(log_path).with_context(|| format!("failed to open {}", log_path.display()))?;
    for (lineno, line) in BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| format!("failed to read {} line {}", log_path.display(), lineno + 1))?;
        if line.trim().is_empty() {
            continue;
        }
        let event: RegistryEvent = serde_json::from_str(&line)
            .with_context(|| format!("failed to parse registry event at line {}", lineno + 1))?;
        match event {
            RegistryEvent::Put(d) => {
                map.insert(d.id.clone(), d);
            }
            RegistryEvent::Retract(id) => {
                map.remove(&id);
            }
        }
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap as Map;
    use tempfile::tempdir;

    fn sample(id: &str) -> Deployment {
        Deployment::new(
            DeploymentId(id.to_string()),
            "react-starter".into(),
            "1.0.0".into(),
            superagent_types::catalog::ResourceLimits::default(),
            Map::new(),
            Map::new(),
            chrono::Utc::now(),
        )
    }

    #[tokio::test]
    async fn create_then_get_round_trips() {
        let dir = tempdir().expect("tempdir");
        let registry = Registry::open(dir.path().join("registry.log")).await.expect("open");

        registry.create(sample("dep-1")).await.expect("create");
        let got = registry.get(&DeploymentId("dep-1".into())).expect("present");
        assert_eq!(got.app_id, "react-starter");
    }

    #[tokio::test]
    async fn creating_a_duplicate_id_fails() {
        let dir = tempdir().expect("tempdir");
        let registry = Registry::open(dir.path().join("registry.log")).await.expect("open");

        registry.create(sample("dep-1")).await.expect("create");
        assert!(registry.create(sample("dep-1")).await.is_err());
    }

    #[tokio::test]
    async fn update_with_mutates_and_persists() {
        let dir = tempdir().expect("tempdir");
        let registry = Registry::open(dir.path().join("registry.log")).await.expect("open");
        registry.create(sample("dep-1")).await.expect("create");

        let id = DeploymentId("dep-1".into());
        registry
            .update_with(&id, |d| {
                d.transition(superagent_types::DeploymentStatus::Fetching, chrono::Utc::now());
                Ok(())
            })
            .await
            .expect("update");

        assert_eq!(
            registry.get(&id).expect("present").status,
            superagent_types::DeploymentStatus::Fetching
        );
    }

    #[tokio::test]
    async fn registry_survives_reopen_by_replaying_the_log() {
        let dir = tempdir().expect("tempdir");
        let log_path = dir.path().join("registry.log");
        {
            let registry = Registry::open(&log_path).await.expect("open");
            registry.create(sample("dep-1")).await.expect("create");
            let id = DeploymentId("dep-1".into());
            registry
                .update_with(&id, |d| {
                    d.transition(superagent_types::DeploymentStatus::Fetching, chrono::Utc::now());
                    Ok(())
                })
                .await
                .expect("update");
        }

        let reopened = Registry::open(&log_path).await.expect("reopen");
        let got = reopened.get(&DeploymentId("dep-1".into())).expect("present after replay");
        assert_eq!(got.status, superagent_types::DeploymentStatus::Fetching);
    }

    #[tokio::test]
    async fn retract_removes_from_the_map_and_a_replay() {
        let dir = tempdir().expect("tempdir");
        let log_path = dir.path().join("registry.log");
        let id = DeploymentId("dep-1".into());
        {
            let registry = Registry::open(&log_path).await.expect("open");
            registry.create(sample("dep-1")).await.expect("create");
            registry.retract(&id).await.expect("retract");
            assert!(registry.get(&id).is_none());
        }

        let reopened = Registry::open(&log_path).await.expect("reopen");
        assert!(reopened.get(&id).is_none());
    }

    #[tokio::test]
    async fn list_returns_every_known_deployment() {
        let dir = tempdir().expect("tempdir");
        let registry = Registry::open(dir.path().join("registry.log")).await.expect("open");
        registry.create(sample("dep-1")).await.expect("create");
        registry.create(sample("dep-2")).await.expect("create");

        assert_eq!(registry.list().len(), 2);
    }
}
