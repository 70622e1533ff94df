//! Container Driver: build/create/start/stop/remove/inspect/stats/logs over
//! a CLI-based container runtime (Docker or Podman), plus the image-pull
//! half of the Source Fetcher and its registry allow/block-list
//! enforcement.
//!
//! A typed contract over one external tool (`docker` or `podman`): every
//! operation must tell its caller whether a failure means "that reference
//! doesn't exist" (don't retry, treat as gone) or "the runtime hiccuped"
//! (transient, safe to retry) versus something unrecoverable.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use superagent_retry::{RetryExecutor, RetryStrategyConfig};
use tracing::{debug, warn};

/// Why a container driver call failed, so callers (the reconciliation loop
/// especially) know whether to retry, give up, or treat the container as
/// already gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverErrorKind {
    /// The referenced container/image does not exist. Never retried.
    UnknownRef,
    /// The runtime itself failed in a way that may succeed on retry
    /// (daemon busy, socket timeout).
    Transient,
    /// Anything else: bad arguments, permission denied, corrupt image.
    Fatal,
}

#[derive(Debug, thiserror::Error)]
#[error("{kind:?}: {message}")]
pub struct DriverError {
    pub kind: DriverErrorKind,
    pub message: String,
}

impl DriverError {
    fn new(kind: DriverErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

pub type DriverResult<T> = Result<T, DriverError>;

#[derive(Debug, Clone, Default)]
pub struct ContainerInspect {
    pub running: bool,
    pub exit_code: Option<i32>,
    pub started_at: Option<String>,
    /// Host-published port the engine's health gate and the proxy
    /// integrator reach the container through (the runtime maps a random
    /// host port per `create`'s `-p 0:{exposed_port}`, resolved here via
    /// `NetworkSettings.Ports` rather than the container's internal IP).
    pub host_port: Option<u16>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ContainerStats {
    pub cpu_ratio: f64,
    pub memory_bytes: u64,
}

/// The full contract the Deployment Engine drives a container runtime
/// through. Every call is blocking-but-cancellable: implementations must
/// honor `tokio` task cancellation (dropping the future) rather than
/// detaching work that outlives the caller.
#[async_trait]
pub trait ContainerDriver: Send + Sync {
    async fn build(&self, context_dir: &Path, dockerfile: Option<&str>, tag: &str) -> DriverResult<()>;
    async fn create(
        &self,
        image: &str,
        name: &str,
        env: &BTreeMap<String, String>,
        exposed_port: u16,
    ) -> DriverResult<String>;
    async fn start(&self, container_ref: &str) -> DriverResult<()>;
    async fn stop(&self, container_ref: &str, timeout: Duration) -> DriverResult<()>;
    async fn remove(&self, container_ref: &str) -> DriverResult<()>;
    async fn inspect(&self, container_ref: &str) -> DriverResult<ContainerInspect>;
    async fn stats(&self, container_ref: &str) -> DriverResult<ContainerStats>;
    async fn logs(&self, container_ref: &str, tail: Option<usize>) -> DriverResult<String>;
    /// Pull an image by reference and return its resolved content digest.
    async fn pull_image(&self, reference: &str) -> DriverResult<String>;
}

/// Host-pattern allow/block list for the image half of the Source Fetcher.
/// A block-list entry always wins over an allow-list entry for the same
/// host. An empty allow-list means "no restriction beyond the block list".
#[derive(Debug, Clone, Default)]
pub struct RegistryPolicy {
    pub allow: Vec<String>,
    pub block: Vec<String>,
}

impl RegistryPolicy {
    pub fn check(&self, reference: &str) -> DriverResult<()> {
        let host = registry_host(reference);
        if self.block.iter().any(|b| b == host) {
            return Err(DriverError::new(
                DriverErrorKind::Fatal,
                format!("registry {host} is on the block list"),
            ));
        }
        if !self.allow.is_empty() && !self.allow.iter().any(|a| a == host) {
            return Err(DriverError::new(
                DriverErrorKind::Fatal,
                format!("registry {host} is not on the allow list"),
            ));
        }
        Ok(())
    }
}

fn registry_host(reference: &str) -> &str {
    match reference.split_once('/') {
        Some((first, _)) if first.contains('.') || first.contains(':') || first == "localhost" => first,
        _ => "docker.io",
    }
}

/// Shells out to `docker` (or a compatible CLI, e.g. `podman`) for every
/// operation, in a "spawn, capture output, check exit status" shape over
/// `tokio::process::Command` so one slow build doesn't stall the runtime
/// thread shared with every other in-flight deployment.
pub struct CliContainerDriver {
    binary: String,
    registry_policy: RegistryPolicy,
}

impl CliContainerDriver {
    pub fn new(binary: impl Into<String>, registry_policy: RegistryPolicy) -> Self {
        Self {
            binary: binary.into(),
            registry_policy,
        }
    }

    /// Retries only the attempts `run_once` classifies as [`DriverErrorKind::Transient`];
    /// an `UnknownRef`/`Fatal` failure returns on the first attempt.
    async fn run(&self, args: &[&str]) -> DriverResult<String> {
        let executor = RetryExecutor::new(RetryStrategyConfig::container_driver());
        executor
            .run(|attempt| async move {
                match self.run_once(args).await {
                    Err(e) if e.kind == DriverErrorKind::Transient => {
                        if attempt > 1 {
                            debug!(attempt, args = ?args, "retrying transient container runtime failure");
                        }
                        Err(e)
                    }
                    other => Ok(other),
                }
            })
            .await
            .unwrap_or_else(Err)
    }

    async fn run_once(&self, args: &[&str]) -> DriverResult<String> {
        let output = tokio::process::Command::new(&self.binary)
            .args(args)
            .output()
            .await
            .map_err(|e| DriverError::new(DriverErrorKind::Transient, format!("failed to spawn {}: {e}", self.binary)))?;

        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        let kind = classify_failure(&stderr);
        warn!(args = ?args, %stderr, "container runtime command failed");
        Err(DriverError::new(kind, stderr))
    }
}

fn classify_failure(stderr: &str) -> DriverErrorKind {
    let lower = stderr.to_lowercase();
    if lower.contains("no such container") || lower.contains("no such image") || lower.contains("not found") {
        DriverErrorKind::UnknownRef
    } else if lower.contains("timeout")
        || lower.contains("cannot connect to the docker daemon")
        || lower.contains("resource temporarily unavailable")
    {
        DriverErrorKind::Transient
    } else {
        DriverErrorKind::Fatal
    }
}

#[async_trait]
impl ContainerDriver for CliContainerDriver {
    async fn build(&self, context_dir: &Path, dockerfile: Option<&str>, tag: &str) -> DriverResult<()> {
        let dockerfile_arg = dockerfile.unwrap_or("Dockerfile");
        let context = context_dir.to_string_lossy();
        self.run(&["build", "-f", dockerfile_arg, "-t", tag, &context]).await?;
        Ok(())
    }

    async fn create(
        &self,
        image: &str,
        name: &str,
        env: &BTreeMap<String, String>,
        exposed_port: u16,
    ) -> DriverResult<String> {
        let mut args: Vec<String> = vec!["create".into(), "--name".into(), name.into()];
        for (k, v) in env {
            args.push("-e".into());
            args.push(format!("{k}={v}"));
        }
        args.push("-p".into());
        args.push(format!("0:{exposed_port}"));
        args.push(image.into());

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let out = self.run(&arg_refs).await?;
        Ok(out.trim().to_string())
    }

    async fn start(&self, container_ref: &str) -> DriverResult<()> {
        self.run(&["start", container_ref]).await?;
        Ok(())
    }

    async fn stop(&self, container_ref: &str, timeout: Duration) -> DriverResult<()> {
        let secs = timeout.as_secs().to_string();
        self.run(&["stop", "-t", &secs, container_ref]).await?;
        Ok(())
    }

    async fn remove(&self, container_ref: &str) -> DriverResult<()> {
        match self.run(&["rm", "-f", container_ref]).await {
            Ok(_) => Ok(()),
            // Already gone is success for an idempotent remove.
            Err(e) if e.kind == DriverErrorKind::UnknownRef => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn inspect(&self, container_ref: &str) -> DriverResult<ContainerInspect> {
        let out = self
            .run(&[
                "inspect",
                "--format",
                "{{json .State}}\t{{json .NetworkSettings.Ports}}",
                container_ref,
            ])
            .await?;
        let (state_json, ports_json) = out.trim().split_once('\t').unwrap_or((out.trim(), "null"));
        let state: InspectState = serde_json::from_str(state_json)
            .map_err(|e| DriverError::new(DriverErrorKind::Fatal, format!("failed to parse inspect output: {e}")))?;
        let host_port = serde_json::from_str::<Option<PortMap>>(ports_json)
            .ok()
            .flatten()
            .and_then(|ports| first_host_port(&ports));
        Ok(ContainerInspect {
            running: state.running,
            exit_code: state.exit_code,
            started_at: state.started_at,
            host_port,
        })
    }

    async fn stats(&self, container_ref: &str) -> DriverResult<ContainerStats> {
        let out = self
            .run(&["stats", "--no-stream", "--format", "{{json .}}", container_ref])
            .await?;
        let raw: StatsLine = serde_json::from_str(out.trim())
            .map_err(|e| DriverError::new(DriverErrorKind::Fatal, format!("failed to parse stats output: {e}")))?;
        Ok(ContainerStats {
            cpu_ratio: parse_percent(&raw.cpu_perc),
            memory_bytes: parse_mem_usage(&raw.mem_usage),
        })
    }

    async fn logs(&self, container_ref: &str, tail: Option<usize>) -> DriverResult<String> {
        let tail_str = tail.map(|n| n.to_string());
        let mut args = vec!["logs"];
        if let Some(n) = tail_str.as_deref() {
            args.push("--tail");
            args.push(n);
        }
        args.push(container_ref);
        self.run(&args).await
    }

    async fn pull_image(&self, reference: &str) -> DriverResult<String> {
        self.registry_policy.check(reference)?;
        self.run(&["pull", reference]).await?;
        let digest = self
            .run(&["inspect", "--format", "{{index .RepoDigests 0}}", reference])
            .await
            .unwrap_or_else(|_| reference.to_string());
        debug!(%reference, %digest, "pulled image");
        Ok(digest.trim().to_string())
    }
}

#[derive(Debug, Deserialize)]
struct InspectState {
    #[serde(rename = "Running")]
    running: bool,
    #[serde(rename = "ExitCode")]
    exit_code: Option<i32>,
    #[serde(rename = "StartedAt")]
    started_at: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StatsLine {
    #[serde(rename = "CPUPerc")]
    cpu_perc: String,
    #[serde(rename = "MemUsage")]
    mem_usage: String,
}

#[derive(Debug, Deserialize)]
struct PortBinding {
    #[serde(rename = "HostPort")]
    host_port: String,
}

type PortMap = BTreeMap<String, Option<Vec<PortBinding>>>;

fn first_host_port(ports: &PortMap) -> Option<u16> {
    ports.values().flatten().flatten().next().and_then(|b| b.host_port.parse().ok())
}

fn parse_percent(s: &str) -> f64 {
    s.trim_end_matches('%').parse::<f64>().unwrap_or(0.0) / 100.0
}

/// Parses docker's `"12.3MiB / 512MiB"` stats format, returning the first
/// (used) figure in bytes.
fn parse_mem_usage(s: &str) -> u64 {
    let Some(used) = s.split('/').next() else {
        return 0;
    };
    let used = used.trim();
    let (digits, unit) = used.split_at(used.find(|c: char| c.is_alphabetic()).unwrap_or(used.len()));
    let value: f64 = digits.trim().parse().unwrap_or(0.0);
    let multiplier = match unit.trim() {
        "GiB" => 1024.0 * 1024.0 * 1024.0,
        "MiB" => 1024.0 * 1024.0,
        "KiB" => 1024.0,
        "GB" => 1_000_000_000.0,
        "MB" => 1_000_000.0,
        "KB" => 1_000.0,
        _ => 1.0,
    };
    (value * multiplier) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_no_such_container_as_unknown_ref() {
        assert_eq!(classify_failure("Error: No such container: abc123"), DriverErrorKind::UnknownRef);
    }

    #[test]
    fn classifies_daemon_connect_failure_as_transient() {
        assert_eq!(
            classify_failure("Cannot connect to the Docker daemon at unix:///var/run/docker.sock"),
            DriverErrorKind::Transient
        );
    }

    #[test]
    fn classifies_other_errors_as_fatal() {
        assert_eq!(classify_failure("invalid reference format"), DriverErrorKind::Fatal);
    }

    #[test]
    fn registry_policy_blocks_listed_host_even_if_also_allowed() {
        let policy = RegistryPolicy {
            allow: vec!["docker.io".into()],
            block: vec!["docker.io".into()],
        };
        assert!(policy.check("docker.io/library/nginx:latest").is_err());
    }

    #[test]
    fn registry_policy_allows_unlisted_host_when_allow_list_is_empty() {
        let policy = RegistryPolicy::default();
        assert!(policy.check("ghcr.io/acme/widgets:1.0").is_ok());
    }

    #[test]
    fn registry_policy_rejects_host_missing_from_nonempty_allow_list() {
        let policy = RegistryPolicy {
            allow: vec!["ghcr.io".into()],
            block: vec![],
        };
        assert!(policy.check("docker.io/library/nginx:latest").is_err());
    }

    #[test]
    fn registry_host_defaults_unqualified_refs_to_docker_hub() {
        assert_eq!(registry_host("library/nginx:latest"), "docker.io");
        assert_eq!(registry_host("nginx:latest"), "docker.io");
        assert_eq!(registry_host("ghcr.io/acme/widgets:1.0"), "ghcr.io");
        assert_eq!(registry_host("localhost:5000/widgets:1.0"), "localhost:5000");
    }

    #[test]
    fn parses_docker_stats_percent_and_mem_usage() {
        assert_eq!(parse_percent("12.50%"), 0.125);
        assert_eq!(parse_mem_usage("128MiB / 512MiB"), 128 * 1024 * 1024);
        assert_eq!(parse_mem_usage("1.5GiB / 4GiB"), (1.5 * 1024.0 * 1024.0 * 1024.0) as u64);
    }

    #[test]
    fn first_host_port_reads_the_mapped_port_from_docker_json() {
        let raw = r#"{"8080/tcp":[{"HostIp":"0.0.0.0","HostPort":"32768"}]}"#;
        let ports: PortMap = serde_json::from_str(raw).expect("parse");
        assert_eq!(first_host_port(&ports), Some(32768));
    }

    #[test]
    fn first_host_port_is_none_for_unpublished_ports() {
        let raw = r#"{"8080/tcp":null}"#;
        let ports: PortMap = serde_json::from_str(raw).expect("parse");
        assert_eq!(first_host_port(&ports), None);
    }
}
