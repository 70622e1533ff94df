//! The mutable deployment record and its state machine.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::catalog::ResourceLimits;
use crate::error::ErrorCode;

/// Agent-unique deployment identifier. Never reused after a terminal status.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeploymentId(pub String);

impl fmt::Display for DeploymentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl DeploymentId {
    /// Generate a new agent-unique id. Not a UUID library dependency, since
    /// none of this workspace's crates pull one in; a timestamp-free random
    /// suffix is sufficient for uniqueness within one agent process.
    pub fn generate(rng_suffix: &str) -> Self {
        Self(format!("dep-{rng_suffix}"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Pending,
    Fetching,
    Building,
    Deploying,
    Running,
    Stopping,
    Stopped,
    Failed,
    Terminated,
}

impl DeploymentStatus {
    /// Terminal statuses admit no further transitions (beyond retention eviction).
    pub fn is_terminal(self) -> bool {
        matches!(self, DeploymentStatus::Failed | DeploymentStatus::Terminated)
    }

    /// Validate an edge against the deployment lifecycle graph.
    pub fn can_transition_to(self, to: DeploymentStatus) -> bool {
        use DeploymentStatus::*;
        if self.is_terminal() {
            return false;
        }
        match (self, to) {
            (Pending, Fetching) => true,
            (Fetching, Building) => true,
            (Building, Deploying) => true,
            (Deploying, Running) => true,
            (Running, Stopping) => true,
            (Stopping, Stopped) => true,
            (Stopped, Deploying) => true,
            // Any non-terminal state may fail.
            (_, Failed) => true,
            // Any state (including already-terminal, handled by delete's
            // idempotence at the engine layer) may terminate on operator delete.
            (_, Terminated) => true,
            _ => false,
        }
    }
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeploymentStatus::Pending => "pending",
            DeploymentStatus::Fetching => "fetching",
            DeploymentStatus::Building => "building",
            DeploymentStatus::Deploying => "deploying",
            DeploymentStatus::Running => "running",
            DeploymentStatus::Stopping => "stopping",
            DeploymentStatus::Stopped => "stopped",
            DeploymentStatus::Failed => "failed",
            DeploymentStatus::Terminated => "terminated",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Health {
    Healthy,
    Unhealthy,
    #[default]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    pub hostname: String,
    pub port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct MetricsSnapshot {
    pub cpu_ratio: f64,
    pub memory_bytes: u64,
    #[serde(default)]
    pub sampled_at: Option<DateTime<Utc>>,
}

/// A runtime instance of an application version, owned exclusively by the
/// Deployment Registry and mutated only through the Deployment Engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deployment {
    pub id: DeploymentId,
    pub app_id: String,
    pub version: String,
    pub source_snapshot: Option<String>,
    pub status: DeploymentStatus,
    pub container_ref: Option<String>,
    pub route: Option<Route>,
    pub limits: ResourceLimits,
    pub env: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_status_at: DateTime<Utc>,
    pub health: Health,
    pub metrics_snapshot: Option<MetricsSnapshot>,
    pub build_log_ref: String,
    pub runtime_log_ref: String,
    pub metadata: BTreeMap<String, String>,
    pub failure_reason: Option<ErrorCode>,
    pub failure_message: Option<String>,
    /// Number of restart attempts the reconciliation loop has made in the
    /// current rolling hour window, used for crash-loop detection.
    #[serde(default)]
    pub restart_attempts_this_hour: u32,
    #[serde(default)]
    pub last_deployed_at: Option<DateTime<Utc>>,
}

impl Deployment {
    pub fn new(
        id: DeploymentId,
        app_id: String,
        version: String,
        limits: ResourceLimits,
        env: BTreeMap<String, String>,
        metadata: BTreeMap<String, String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.clone(),
            app_id,
            version,
            source_snapshot: None,
            status: DeploymentStatus::Pending,
            container_ref: None,
            route: None,
            limits,
            env,
            created_at: now,
            updated_at: now,
            last_status_at: now,
            health: Health::Unknown,
            metrics_snapshot: None,
            build_log_ref: format!("{id}/build"),
            runtime_log_ref: format!("{id}/runtime"),
            metadata,
            failure_reason: None,
            failure_message: None,
            restart_attempts_this_hour: 0,
            last_deployed_at: None,
        }
    }

    /// Apply a validated transition, stamping timestamps. Callers are
    /// responsible for checking `can_transition_to` first; this only panics
    /// in debug builds to catch programming errors, not operator input.
    pub fn transition(&mut self, to: DeploymentStatus, now: DateTime<Utc>) {
        debug_assert!(
            self.status.can_transition_to(to),
            "illegal transition {} -> {}",
            self.status,
            to
        );
        self.status = to;
        self.updated_at = now;
        self.last_status_at = now;
    }

    pub fn is_published(&self) -> bool {
        self.status == DeploymentStatus::Running && self.route.is_some()
    }
}

/// One transition record, written to both the Registry event log and the
/// Audit Log whenever a deployment's status changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub deployment_id: DeploymentId,
    pub from: DeploymentStatus,
    pub to: DeploymentStatus,
    pub reason: Option<String>,
    pub timestamp: DateTime<Utc>,
}
