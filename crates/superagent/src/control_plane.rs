//! Control-plane sync client: periodic heartbeats to the admin panel's
//! backend.
//!
//! A builder-with-timeout-and-user-agent client shape, async rather than
//! blocking since it posts heartbeats from inside the daemon's own
//! runtime. The heartbeat body stays minimal (agent id and a deployment
//! count) rather than a full deployment-snapshot schema; this loop only
//! needs to prove liveness and rough load to the control plane.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::warn;

use superagent_audit::AuditLog;
use superagent_registry::Registry;
use superagent_retry::{RetryExecutor, RetryStrategyConfig};

const USER_AGENT: &str = concat!("superagent/", env!("CARGO_PKG_VERSION"));
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Serialize)]
struct Heartbeat {
    agent_id: String,
    deployments_total: usize,
    deployments_active: usize,
}

/// Posts a heartbeat to `base_url` on an interval, retrying transient
/// failures with the control-plane backoff preset (base 5s, cap 5m, ±20%
/// jitter).
pub struct ControlPlaneClient {
    base_url: String,
    agent_id: String,
    http: reqwest::Client,
    registry: Arc<Registry>,
    audit: Arc<AuditLog>,
}

impl ControlPlaneClient {
    pub fn new(base_url: impl Into<String>, agent_id: impl Into<String>, registry: Arc<Registry>, audit: Arc<AuditLog>) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).user_agent(USER_AGENT).build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            agent_id: agent_id.into(),
            http,
            registry,
            audit,
        })
    }

    async fn sync_once(&self) -> anyhow::Result<()> {
        let deployments = self.registry.list();
        let active = deployments.iter().filter(|d| !d.status.is_terminal()).count();
        let body = Heartbeat {
            agent_id: self.agent_id.clone(),
            deployments_total: deployments.len(),
            deployments_active: active,
        };

        let url = format!("{}/api/v1/agents/{}/heartbeat", self.base_url, self.agent_id);
        self.http.post(&url).json(&body).send().await?.error_for_status()?;
        Ok(())
    }

    /// Spawn the heartbeat loop on its own task; it runs until `shutdown` fires.
    pub fn spawn_loop(self: Arc<Self>, interval: Duration, mut shutdown: tokio::sync::watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let executor = RetryExecutor::new(RetryStrategyConfig::control_plane_sync());
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let outcome = executor.run(|_attempt| self.sync_once()).await;
                        let success = outcome.is_ok();
                        if let Err(e) = &outcome {
                            warn!(error = %e, "control-plane heartbeat did not succeed");
                        }
                        let _ = self.audit.emit("CONTROL_PLANE_HEARTBEAT", success, &[("agent_id", &self.agent_id)]).await;
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }
}
