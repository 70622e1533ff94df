//! Encrypted, namespaced on-disk key/value store (the Secure Store).
//!
//! Keys are relative paths (`tokens/current`, `secrets/<name>`) resolved
//! under a data directory; values are encrypted with `superagent-encrypt`
//! before hitting disk. Writes are atomic against a process crash via a
//! temp-file-then-rename, the same shape as a JSON-receipt writer,
//! generalized here to opaque encrypted byte blobs.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};

/// Encrypted, crash-atomic key/value store rooted at a directory.
pub struct SecureStore {
    root: PathBuf,
    passphrase: String,
    agent_id: String,
}

impl SecureStore {
    pub fn open(root: impl Into<PathBuf>, passphrase: impl Into<String>, agent_id: impl Into<String>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .with_context(|| format!("failed to create secure store dir {}", root.display()))?;
        Ok(Self {
            root,
            passphrase: passphrase.into(),
            agent_id: agent_id.into(),
        })
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        if key.is_empty() || key.contains("..") {
            bail!("invalid secure store key: {key:?}");
        }
        Ok(self.root.join(key))
    }

    /// Encrypt and atomically persist `value` under `key`.
    pub fn store(&self, key: &str, value: &[u8]) -> Result<()> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let encrypted = superagent_encrypt::encrypt(value, &self.passphrase, &self.agent_id)
            .context("failed to encrypt value for secure store")?;

        atomic_write(&path, encrypted.as_bytes())
    }

    /// Load and decrypt the value stored under `key`, or `None` if absent.
    pub fn load(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(key)?;
        if !path.exists() {
            return Ok(None);
        }

        let raw = fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let plaintext = superagent_encrypt::decrypt(&raw, &self.passphrase, &self.agent_id)
            .context("failed to decrypt secure store value")?;
        Ok(Some(plaintext))
    }

    /// Remove the value stored under `key`. Idempotent.
    pub fn delete(&self, key: &str) -> Result<()> {
        let path = self.path_for(key)?;
        if path.exists() {
            fs::remove_file(&path)
                .with_context(|| format!("failed to remove {}", path.display()))?;
        }
        Ok(())
    }

    pub fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.path_for(key)?.exists())
    }
}

fn atomic_write(path: &Path, data: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    {
        let mut f = fs::File::create(&tmp)
            .with_context(|| format!("failed to create tmp file {}", tmp.display()))?;
        std::io::Write::write_all(&mut f, data)
            .with_context(|| format!("failed to write tmp file {}", tmp.display()))?;
        f.sync_all().ok();
    }
    fs::rename(&tmp, path).with_context(|| {
        format!(
            "failed to rename tmp file {} to {}",
            tmp.display(),
            path.display()
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn store_then_load_round_trips_bit_identically() {
        let dir = tempdir().expect("tempdir");
        let store = SecureStore::open(dir.path(), "pass", "agent-1").expect("open");

        store.store("tokens/current", b"token-value-1").expect("store");
        let loaded = store.load("tokens/current").expect("load");
        assert_eq!(loaded.as_deref(), Some(b"token-value-1".as_slice()));
    }

    #[test]
    fn missing_key_loads_as_none() {
        let dir = tempdir().expect("tempdir");
        let store = SecureStore::open(dir.path(), "pass", "agent-1").expect("open");
        assert_eq!(store.load("tokens/current").expect("load"), None);
    }

    #[test]
    fn delete_then_load_returns_none() {
        let dir = tempdir().expect("tempdir");
        let store = SecureStore::open(dir.path(), "pass", "agent-1").expect("open");
        store.store("secrets/db", b"hunter2").expect("store");
        store.delete("secrets/db").expect("delete");
        assert_eq!(store.load("secrets/db").expect("load"), None);
    }

    #[test]
    fn delete_is_idempotent() {
        let dir = tempdir().expect("tempdir");
        let store = SecureStore::open(dir.path(), "pass", "agent-1").expect("open");
        store.delete("secrets/never-existed").expect("first delete");
        store.delete("secrets/never-existed").expect("second delete");
    }

    #[test]
    fn on_disk_value_is_not_plaintext() {
        let dir = tempdir().expect("tempdir");
        let store = SecureStore::open(dir.path(), "pass", "agent-1").expect("open");
        store.store("tokens/current", b"super-secret").expect("store");

        let raw = fs::read_to_string(dir.path().join("tokens/current")).expect("read raw");
        assert!(raw.starts_with("encrypted:"));
        assert!(!raw.contains("super-secret"));
    }

    #[test]
    fn rejects_path_traversal_keys() {
        let dir = tempdir().expect("tempdir");
        let store = SecureStore::open(dir.path(), "pass", "agent-1").expect("open");
        assert!(store.store("../escape", b"x").is_err());
    }
}
