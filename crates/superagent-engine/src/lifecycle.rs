//! Stop, start, and delete. Stop and delete are idempotent:
//! calling stop on an already-stopped deployment, or delete on an
//! already-terminated one, succeeds without touching the container runtime
//! a second time.

use chrono::Utc;
use tracing::warn;

use superagent_process::ContainerDriver;
use superagent_types::{AgentError, DeploymentId, DeploymentStatus, ErrorCode};

use crate::redeploy::RedeployOutcome;
use crate::Engine;

impl Engine {
    /// Bring a `stopped` deployment back to `running` on the catalog entry
    /// it already has (no version change). Implemented as a redeploy onto
    /// the deployment's own `(app_id, version)`, since both share the same
    /// "stage, health-gate, go live" mechanics.
    pub async fn start(&self, id: &DeploymentId, auth_token: Option<&str>) -> Result<RedeployOutcome, AgentError> {
        let deployment = self.registry.get(id).ok_or_else(|| AgentError::new(ErrorCode::NotFound, format!("no such deployment: {id}")))?;
        if deployment.status != DeploymentStatus::Stopped {
            return Err(AgentError::new(ErrorCode::Conflict, format!("cannot start a deployment in status {}", deployment.status)));
        }
        let catalog_entry = self
            .catalog
            .lookup(&deployment.app_id, &deployment.version)
            .ok_or_else(|| AgentError::new(ErrorCode::CatalogUnknown, format!("no catalog entry for {}@{}", deployment.app_id, deployment.version)))?;
        self.redeploy(id, &catalog_entry, auth_token).await
    }

    /// `running | deploying -> stopping -> stopped`. Idempotent: a
    /// deployment already `stopped` returns its current record unchanged.
    pub async fn stop(&self, id: &DeploymentId) -> Result<(), AgentError> {
        let deployment = self.registry.get(id).ok_or_else(|| AgentError::new(ErrorCode::NotFound, format!("no such deployment: {id}")))?;
        if deployment.status == DeploymentStatus::Stopped {
            return Ok(());
        }
        if !matches!(deployment.status, DeploymentStatus::Running | DeploymentStatus::Deploying) {
            return Err(AgentError::new(ErrorCode::Conflict, format!("cannot stop a deployment in status {}", deployment.status)));
        }

        self.registry
            .update_with(id, |d| {
                d.transition(DeploymentStatus::Stopping, Utc::now());
                Ok(())
            })
            .await
            .map_err(|e| AgentError::new(ErrorCode::Internal, e.to_string()))?;
        self.audit_transition(id, "stopping").await?;

        if let Some(container_ref) = &deployment.container_ref {
            self.driver
                .stop(container_ref, self.config.stop_timeout)
                .await
                .map_err(|e| AgentError::new(ErrorCode::Internal, e.to_string()))?;
            let _ = self.driver.remove(container_ref).await;
        }
        self.proxy.retract(id);

        self.registry
            .update_with(id, |d| {
                d.transition(DeploymentStatus::Stopped, Utc::now());
                Ok(())
            })
            .await
            .map_err(|e| AgentError::new(ErrorCode::Internal, e.to_string()))?;
        self.audit_transition(id, "stopped").await?;
        Ok(())
    }

    /// From any state: stop if needed, remove the container, retract the
    /// route, purge the workspace, terminate. A retention timer (not this
    /// function) evicts the record from the registry after the default
    /// 7-day window.
    pub async fn delete(&self, id: &DeploymentId) -> Result<(), AgentError> {
        let deployment = self.registry.get(id).ok_or_else(|| AgentError::new(ErrorCode::NotFound, format!("no such deployment: {id}")))?;
        if deployment.status == DeploymentStatus::Terminated {
            return Ok(());
        }

        if matches!(deployment.status, DeploymentStatus::Running | DeploymentStatus::Deploying | DeploymentStatus::Stopping) {
            if let Some(container_ref) = &deployment.container_ref {
                let _ = self.driver.stop(container_ref, self.config.stop_timeout).await;
                let _ = self.driver.remove(container_ref).await;
            }
        }
        self.proxy.retract(id);

        let workspace = self.workspace_dir(id);
        if workspace.exists() {
            let _ = tokio::fs::remove_dir_all(&workspace).await;
        }

        self.registry
            .update_with(id, |d| {
                d.transition(DeploymentStatus::Terminated, Utc::now());
                Ok(())
            })
            .await
            .map_err(|e| AgentError::new(ErrorCode::Internal, e.to_string()))?;
        self.audit_transition(id, "terminated").await?;
        self.audit.emit("DEPLOYMENT_DELETED", true, &[("deployment_id", id.0.as_str())]).await.map_err(|e| {
            self.health.mark_degraded();
            AgentError::new(ErrorCode::Internal, format!("audit write failed: {e}"))
        })?;
        Ok(())
    }

    /// Permanently evict every `terminated`/`failed` record whose
    /// `updated_at` is older than `retention`, the default being a 7-day
    /// eviction window.
    pub async fn evict_expired(&self, retention: chrono::Duration) {
        let cutoff = Utc::now() - retention;
        for deployment in self.registry.list() {
            if deployment.status.is_terminal() && deployment.updated_at < cutoff && self.registry.retract(&deployment.id).await.is_ok()
                && let Err(e) = self.audit.emit("DEPLOYMENT_EVICTED", true, &[("deployment_id", deployment.id.0.as_str())]).await
            {
                warn!(id = %deployment.id, error = %e, "failed to audit a deployment eviction");
                self.health.mark_degraded();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap as Map;
    use std::sync::Arc;

    use superagent_audit::{AuditConfig, AuditLog};
    use superagent_health::AgentMetrics;
    use superagent_process::{CliContainerDriver, ContainerDriver, RegistryPolicy};
    use superagent_proxy::{ProxyConfig, ProxyIntegrator};
    use superagent_registry::Registry;
    use superagent_types::{Deployment, DeploymentId, DeploymentStatus};

    use crate::catalog::StaticCatalog;
    use crate::{CatalogProvider, Engine, EngineConfig};

    async fn engine_with_deployment(tmp: &std::path::Path, status: DeploymentStatus) -> (Engine, DeploymentId) {
        let registry = Arc::new(Registry::open(tmp.join("registry.log")).await.expect("registry"));
        let driver: Arc<dyn ContainerDriver> = Arc::new(CliContainerDriver::new("docker", RegistryPolicy::default()));
        let git = Arc::new(superagent_git::GitFetcher::new(tmp.join("cache")));
        let proxy = ProxyIntegrator::new(ProxyConfig::new(tmp.join("routing.yaml")));
        let audit = Arc::new(AuditLog::open(AuditConfig::new(tmp.join("audit.log"))).expect("audit"));
        let metrics = Arc::new(AgentMetrics::new().expect("metrics"));
        let catalog: Arc<dyn CatalogProvider> = Arc::new(StaticCatalog::new(vec![]));
        let health = Arc::new(superagent_health::HealthState::new());
        let engine = Engine::new(registry, driver, git, proxy, audit, metrics, health, catalog, EngineConfig::new(tmp));

        let id = DeploymentId("dep-1".into());
        let mut deployment = Deployment::new(id.clone(), "react-starter".into(), "1.0.0".into(), Default::default(), Map::new(), Map::new(), chrono::Utc::now());
        deployment.status = status;
        engine.registry().create(deployment).await.expect("create");
        (engine, id)
    }

    #[tokio::test]
    async fn stop_on_an_already_stopped_deployment_is_a_no_op() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let (engine, id) = engine_with_deployment(tmp.path(), DeploymentStatus::Stopped).await;
        engine.stop(&id).await.expect("idempotent stop");
    }

    #[tokio::test]
    async fn delete_on_an_already_terminated_deployment_is_a_no_op() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let (engine, id) = engine_with_deployment(tmp.path(), DeploymentStatus::Terminated).await;
        engine.delete(&id).await.expect("idempotent delete");
    }

    #[tokio::test]
    async fn stop_rejects_a_deployment_still_pending() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let (engine, id) = engine_with_deployment(tmp.path(), DeploymentStatus::Pending).await;
        assert!(engine.stop(&id).await.is_err());
    }

    #[tokio::test]
    async fn delete_from_pending_terminates_without_a_container() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let (engine, id) = engine_with_deployment(tmp.path(), DeploymentStatus::Pending).await;
        engine.delete(&id).await.expect("delete");
        assert_eq!(engine.registry().get(&id).expect("present").status, DeploymentStatus::Terminated);
    }

    #[tokio::test]
    async fn start_rejects_a_deployment_that_is_not_stopped() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let (engine, id) = engine_with_deployment(tmp.path(), DeploymentStatus::Running).await;
        let err = engine.start(&id, None).await.expect_err("should reject");
        assert_eq!(err.code(), superagent_types::ErrorCode::Conflict);
    }

    #[tokio::test]
    async fn start_rejects_when_the_catalog_no_longer_has_the_entry() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let (engine, id) = engine_with_deployment(tmp.path(), DeploymentStatus::Stopped).await;
        let err = engine.start(&id, None).await.expect_err("should reject");
        assert_eq!(err.code(), superagent_types::ErrorCode::CatalogUnknown);
    }
}
