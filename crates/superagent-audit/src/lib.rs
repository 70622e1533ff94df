//! Append-only, rotating audit log.
//!
//! One JSON object per line. Rotation is size-triggered, keeps a bounded
//! number of numbered backups, optionally gzips them, and never deletes the
//! live file's entries — only rotation produces sibling files. Generalized
//! from `shipper-events::EventLog`, which only ever appends to a single
//! never-rotated file; this crate adds the rotation and single-writer-lock
//! machinery a long-lived daemon needs.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use flate2::Compression;
use flate2::write::GzEncoder;
use tokio::sync::Mutex;

pub use superagent_types::{AuditEntry, AuditKind};

#[derive(Debug, Clone)]
pub struct AuditConfig {
    pub path: PathBuf,
    pub max_bytes: u64,
    pub max_backups: u32,
    pub max_age_days: u32,
    pub compress: bool,
}

impl AuditConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            max_bytes: 10 * 1024 * 1024,
            max_backups: 5,
            max_age_days: 30,
            compress: false,
        }
    }
}

/// Serializes all writers onto a single logical writer, so events within
/// one logical operation appear in causal order in the log.
pub struct AuditLog {
    config: AuditConfig,
    file: Mutex<File>,
}

impl AuditLog {
    pub fn open(config: AuditConfig) -> Result<Self> {
        if let Some(parent) = config.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create audit dir {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&config.path)
            .with_context(|| format!("failed to open audit log {}", config.path.display()))?;
        Ok(Self {
            config,
            file: Mutex::new(file),
        })
    }

    /// Append one entry, rotating first if the write would exceed `max_bytes`.
    /// On any I/O failure the caller is expected to treat the parent
    /// operation as fatally failed, never to swallow the error.
    pub async fn record(&self, entry: &AuditEntry) -> Result<()> {
        let line = serde_json::to_string(entry).context("failed to serialize audit entry")?;

        let mut file = self.file.lock().await;

        let projected = file
            .metadata()
            .map(|m| m.len())
            .unwrap_or(0)
            .saturating_add(line.len() as u64 + 1);
        if projected > self.config.max_bytes {
            rotate(&self.config)?;
            *file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.config.path)
                .with_context(|| format!("failed to reopen audit log {}", self.config.path.display()))?;
        }

        writeln!(file, "{line}").context("failed to write audit entry")?;
        file.flush().context("failed to flush audit log")?;
        Ok(())
    }

    /// Convenience constructor for a successful/failed security-relevant event.
    pub async fn emit(&self, kind: &str, success: bool, fields: &[(&str, &str)]) -> Result<()> {
        let mut entry = AuditEntry::new(kind, success, Utc::now());
        for (k, v) in fields {
            entry = entry.with_field(*k, *v);
        }
        self.record(&entry).await
    }

    /// Read all entries currently in the live (unrotated) file, for tests and
    /// the (future) log-inspection CLI surface.
    pub fn read_current(&self) -> Result<Vec<AuditEntry>> {
        read_jsonl(&self.config.path)
    }
}

fn read_jsonl(path: &Path) -> Result<Vec<AuditEntry>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let reader = BufReader::new(file);
    let mut out = Vec::new();
    for line in reader.lines() {
        let line = line.with_context(|| format!("failed to read line from {}", path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        let entry: AuditEntry =
            serde_json::from_str(&line).with_context(|| format!("failed to parse audit line: {line}"))?;
        out.push(entry);
    }
    Ok(out)
}

/// Shift `audit.log.N` -> `audit.log.N+1` (dropping entries past
/// `max_backups`), then move the live file to `audit.log.1`.
fn rotate(config: &AuditConfig) -> Result<()> {
    for n in (1..config.max_backups).rev() {
        let from = backup_path(&config.path, n, config.compress);
        let to = backup_path(&config.path, n + 1, config.compress);
        if from.exists() {
            fs::rename(&from, &to)
                .with_context(|| format!("failed to rotate {} -> {}", from.display(), to.display()))?;
        }
    }

    // Drop anything beyond the retention window.
    let overflow = backup_path(&config.path, config.max_backups + 1, config.compress);
    if overflow.exists() {
        fs::remove_file(&overflow).ok();
    }

    let target = backup_path(&config.path, 1, false);
    if config.path.exists() {
        fs::rename(&config.path, &target)
            .with_context(|| format!("failed to rotate live audit log to {}", target.display()))?;
        if config.compress {
            gzip_in_place(&target)?;
        }
    }

    prune_expired_backups(config)?;

    Ok(())
}

/// Remove rotated backups older than `max_age_days`, independent of the
/// `max_backups` count cap applied above.
fn prune_expired_backups(config: &AuditConfig) -> Result<()> {
    let Some(parent) = config.path.parent() else {
        return Ok(());
    };
    let cutoff = std::time::SystemTime::now()
        .checked_sub(std::time::Duration::from_secs(u64::from(config.max_age_days) * 86_400));
    let Some(cutoff) = cutoff else { return Ok(()) };

    let base_name = config.path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
    for entry in fs::read_dir(parent).with_context(|| format!("failed to list {}", parent.display()))? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if !name.starts_with(&format!("{base_name}.")) {
            continue;
        }
        if let Ok(meta) = entry.metadata()
            && let Ok(modified) = meta.modified()
            && modified < cutoff
        {
            fs::remove_file(entry.path()).ok();
        }
    }
    Ok(())
}

fn backup_path(base: &Path, n: u32, compressed: bool) -> PathBuf {
    let name = format!("{}.{n}", base.display());
    if compressed {
        PathBuf::from(format!("{name}.gz"))
    } else {
        PathBuf::from(name)
    }
}

fn gzip_in_place(path: &Path) -> Result<()> {
    let data = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let gz_path = PathBuf::from(format!("{}.gz", path.display()));
    let gz_file = File::create(&gz_path)
        .with_context(|| format!("failed to create {}", gz_path.display()))?;
    let mut encoder = GzEncoder::new(gz_file, Compression::default());
    encoder.write_all(&data)?;
    encoder.finish()?;
    fs::remove_file(path).ok();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn record_then_read_round_trips() {
        let dir = tempdir().expect("tempdir");
        let log = AuditLog::open(AuditConfig::new(dir.path().join("audit.log"))).expect("open");

        log.emit("DEPLOYMENT_CREATED", true, &[("deployment_id", "dep-1")])
            .await
            .expect("emit");
        log.emit("TOKEN_SET", true, &[("token_id", "tok-1")])
            .await
            .expect("emit");

        let entries = log.read_current().expect("read");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].kind.0, "DEPLOYMENT_CREATED");
        assert!(entries[0].success);
    }

    #[tokio::test]
    async fn rotation_preserves_old_entries_in_a_sibling_file() {
        let dir = tempdir().expect("tempdir");
        let mut config = AuditConfig::new(dir.path().join("audit.log"));
        config.max_bytes = 64; // force rotation almost immediately
        let log = AuditLog::open(config.clone()).expect("open");

        for i in 0..10 {
            log.emit("DEPLOYMENT_CREATED", true, &[("deployment_id", &format!("dep-{i}"))])
                .await
                .expect("emit");
        }

        assert!(config.path.with_extension("log.1").exists() || dir.path().join("audit.log.1").exists());
    }

    #[tokio::test]
    async fn never_deletes_entries_only_rotates_them() {
        let dir = tempdir().expect("tempdir");
        let mut config = AuditConfig::new(dir.path().join("audit.log"));
        config.max_bytes = 64;
        let log = AuditLog::open(config).expect("open");

        for i in 0..5 {
            log.emit("TOKEN_SET", true, &[("token_id", &format!("tok-{i}"))])
                .await
                .expect("emit");
        }

        let live = log.read_current().expect("read live");
        let rotated = read_jsonl(&dir.path().join("audit.log.1")).unwrap_or_default();
        assert!(live.len() + rotated.len() >= 5);
    }
}
