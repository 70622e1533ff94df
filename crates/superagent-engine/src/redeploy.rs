//! Redeploy: rolling, N=1, zero-downtime. A new container is
//! brought up alongside the old one; only once it passes the health gate
//! does the proxy route swap and the old container go away. A failed
//! attempt leaves the previous container serving traffic untouched.

use chrono::Utc;
use tracing::warn;

use superagent_process::ContainerDriver;
use superagent_types::{AgentError, CatalogEntry, DeploymentId, DeploymentStatus, ErrorCode};

use crate::Engine;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedeployOutcome {
    /// The new container passed its health gate and is now serving traffic.
    Succeeded,
    /// The new container failed to become healthy; the previous one is
    /// still running and the deployment's status is unchanged.
    FailedKeptPrevious,
}

impl Engine {
    /// Redeploy `id` onto `catalog_entry` (typically a new version of the
    /// same app). The deployment must currently be `running` or `stopped`.
    pub async fn redeploy(&self, id: &DeploymentId, catalog_entry: &CatalogEntry, auth_token: Option<&str>) -> Result<RedeployOutcome, AgentError> {
        let deployment = self.registry.get(id).ok_or_else(|| AgentError::new(ErrorCode::NotFound, format!("no such deployment: {id}")))?;
        if deployment.status != DeploymentStatus::Running && deployment.status != DeploymentStatus::Stopped {
            return Err(AgentError::new(
                ErrorCode::Conflict,
                format!("cannot redeploy a deployment in status {}", deployment.status),
            ));
        }

        // Already serving this exact version off the same resolved source:
        // a catalog entry's source is immutable once published, so a version
        // match implies the snapshot a fresh fetch would resolve to is the
        // one already running. Nothing to stage; just note the request.
        if deployment.status == DeploymentStatus::Running && deployment.version == catalog_entry.version {
            self.audit
                .emit("DEPLOYMENT_REDEPLOY_NOOP", true, &[("deployment_id", id.0.as_str()), ("version", catalog_entry.version.as_str())])
                .await
                .map_err(|e| {
                    self.health.mark_degraded();
                    AgentError::new(ErrorCode::Internal, format!("audit write failed: {e}"))
                })?;
            return Ok(RedeployOutcome::Succeeded);
        }

        let slot = self
            .governor
            .acquire(self.config.governor_deadline)
            .await
            .map_err(|reason| AgentError::new(reason, "resource governor could not admit this redeploy in time"))?;

        let previous_container = deployment.container_ref.clone();

        let (image_ref, source_snapshot) = match self.resolve_image(id, catalog_entry, auth_token).await {
            Ok(r) => r,
            Err(e) => {
                drop(slot);
                self.record_redeploy_failure(id, &e.message).await;
                return Ok(RedeployOutcome::FailedKeptPrevious);
            }
        };

        let staged_name = format!("superagent-{}-next", id.0);
        let new_container = match self.stage_new_container(&staged_name, &image_ref, catalog_entry, id).await {
            Ok(c) => c,
            Err(e) => {
                drop(slot);
                self.record_redeploy_failure(id, &e.message).await;
                return Ok(RedeployOutcome::FailedKeptPrevious);
            }
        };

        let healthy = self.wait_for_health(&new_container, catalog_entry).await;
        if !healthy {
            let _ = self.driver.stop(&new_container, self.config.stop_timeout).await;
            let _ = self.driver.remove(&new_container).await;
            drop(slot);
            self.record_redeploy_failure(id, "new container did not become healthy in time").await;
            return Ok(RedeployOutcome::FailedKeptPrevious);
        }

        let route = match self.driver.inspect(&new_container).await {
            Ok(inspect) => {
                let port = inspect.host_port.unwrap_or(catalog_entry.runtime.exposed_port);
                superagent_types::Route { hostname: format!("{}.local", deployment.app_id), port }
            }
            Err(e) => {
                let _ = self.driver.stop(&new_container, self.config.stop_timeout).await;
                let _ = self.driver.remove(&new_container).await;
                drop(slot);
                self.record_redeploy_failure(id, &e.to_string()).await;
                return Ok(RedeployOutcome::FailedKeptPrevious);
            }
        };

        self.proxy.publish(id, route.clone());

        if let Some(old_ref) = previous_container {
            let _ = self.driver.stop(&old_ref, self.config.stop_timeout).await;
            let _ = self.driver.remove(&old_ref).await;
        }

        self.registry
            .update_with(id, |d| {
                d.container_ref = Some(new_container.clone());
                d.route = Some(route.clone());
                d.source_snapshot = source_snapshot.clone();
                d.version = catalog_entry.version.clone();
                d.health = superagent_types::Health::Healthy;
                d.last_deployed_at = Some(Utc::now());
                // `stopped` only reaches `running` via `deploying`;
                // `running` redeploys stay `running` throughout.
                if d.status == DeploymentStatus::Stopped {
                    d.transition(DeploymentStatus::Deploying, Utc::now());
                    d.transition(DeploymentStatus::Running, Utc::now());
                }
                Ok(())
            })
            .await
            .map_err(|e| AgentError::new(ErrorCode::Internal, e.to_string()))?;

        drop(slot);
        self.audit.emit("DEPLOYMENT_REDEPLOYED", true, &[("deployment_id", id.0.as_str())]).await.map_err(|e| {
            self.health.mark_degraded();
            AgentError::new(ErrorCode::Internal, format!("audit write failed: {e}"))
        })?;
        Ok(RedeployOutcome::Succeeded)
    }

    async fn resolve_image(
        &self,
        id: &DeploymentId,
        catalog_entry: &CatalogEntry,
        auth_token: Option<&str>,
    ) -> Result<(String, Option<String>), AgentError> {
        match &catalog_entry.source {
            superagent_types::SourceSpec::Git { url, r#ref } => {
                let workspace = self.workspace_dir(id).join("redeploy");
                let fetch = self
                    .git
                    .fetch(url, r#ref, &workspace, auth_token)
                    .await
                    .map_err(|e| AgentError::new(ErrorCode::SourceUnavailable, e.to_string()))?;
                let tag = format!("superagent/{}:redeploy-{}", id.0, &fetch.resolved_sha[..fetch.resolved_sha.len().min(12)]);
                let dockerfile = catalog_entry.build.as_ref().and_then(|b| b.dockerfile.as_deref());
                self.driver
                    .build(&fetch.workspace, dockerfile, &tag)
                    .await
                    .map_err(|e| AgentError::new(ErrorCode::BuildFailed, e.to_string()))?;
                Ok((tag, Some(fetch.resolved_sha)))
            }
            superagent_types::SourceSpec::Image { reference } => {
                let digest = self
                    .driver
                    .pull_image(reference)
                    .await
                    .map_err(|e| AgentError::new(ErrorCode::SourceUnavailable, e.message))?;
                Ok((reference.clone(), Some(digest)))
            }
        }
    }

    async fn stage_new_container(
        &self,
        name: &str,
        image_ref: &str,
        catalog_entry: &CatalogEntry,
        id: &DeploymentId,
    ) -> Result<String, AgentError> {
        let deployment = self.registry.get(id).ok_or_else(|| AgentError::new(ErrorCode::Internal, "deployment vanished"))?;
        let container_ref = self
            .driver
            .create(image_ref, name, &deployment.env, catalog_entry.runtime.exposed_port)
            .await
            .map_err(|e| AgentError::new(ErrorCode::CreateFailed, e.to_string()))?;
        if let Err(e) = self.driver.start(&container_ref).await {
            let _ = self.driver.remove(&container_ref).await;
            return Err(AgentError::new(ErrorCode::CreateFailed, e.to_string()));
        }
        Ok(container_ref)
    }

    /// Redeploy failures are recorded as non-terminal events: the
    /// deployment stays `running` on its previous snapshot.
    async fn record_redeploy_failure(&self, id: &DeploymentId, message: &str) {
        warn!(%id, message, "redeploy attempt failed, keeping previous container");
        self.metrics.record_deploy_failure(ErrorCode::CreateFailed);
        if let Err(e) = self
            .audit
            .emit("DEPLOYMENT_REDEPLOY_FAILED", false, &[("deployment_id", id.0.as_str()), ("message", message)])
            .await
        {
            warn!(%id, error = %e, "failed to audit a redeploy failure");
            self.health.mark_degraded();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap as Map;
    use std::sync::Arc;

    use superagent_audit::{AuditConfig, AuditLog};
    use superagent_health::{AgentMetrics, HealthState};
    use superagent_process::{CliContainerDriver, ContainerDriver, RegistryPolicy};
    use superagent_proxy::{ProxyConfig, ProxyIntegrator};
    use superagent_registry::Registry;
    use superagent_types::{CatalogEntry, Deployment, ResourceLimits, RuntimeSpec, SourceSpec};

    use crate::catalog::StaticCatalog;
    use crate::{CatalogProvider, Engine, EngineConfig};

    use super::*;

    #[test]
    fn redeploy_outcome_variants_are_distinguishable() {
        assert_ne!(RedeployOutcome::Succeeded, RedeployOutcome::FailedKeptPrevious);
    }

    fn entry(version: &str) -> CatalogEntry {
        CatalogEntry {
            app_id: "react-starter".into(),
            version: version.into(),
            source: SourceSpec::Image { reference: "ghcr.io/acme/widgets:1.0".into() },
            build: None,
            runtime: RuntimeSpec { start_command: None, exposed_port: 8080, required_env: vec![], health_check_path: None },
            resource_limits: ResourceLimits::default(),
        }
    }

    #[tokio::test]
    async fn redeploying_the_same_running_version_is_a_noop() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let registry = Arc::new(Registry::open(tmp.path().join("registry.log")).await.expect("registry"));
        let driver: Arc<dyn ContainerDriver> = Arc::new(CliContainerDriver::new("docker", RegistryPolicy::default()));
        let git = Arc::new(superagent_git::GitFetcher::new(tmp.path().join("cache")));
        let proxy = ProxyIntegrator::new(ProxyConfig::new(tmp.path().join("routing.yaml")));
        let audit = Arc::new(AuditLog::open(AuditConfig::new(tmp.path().join("audit.log"))).expect("audit"));
        let metrics = Arc::new(AgentMetrics::new().expect("metrics"));
        let health = Arc::new(HealthState::new());
        let catalog: Arc<dyn CatalogProvider> = Arc::new(StaticCatalog::new(vec![]));
        let engine = Engine::new(registry.clone(), driver, git, proxy, audit.clone(), metrics, health, catalog, EngineConfig::new(tmp.path()));

        let id = DeploymentId("dep-1".into());
        let mut deployment = Deployment::new(id.clone(), "react-starter".into(), "1.0.0".into(), ResourceLimits::default(), Map::new(), Map::new(), chrono::Utc::now());
        deployment.status = DeploymentStatus::Running;
        deployment.container_ref = Some("container-1".into());
        registry.create(deployment).await.expect("seed");

        let outcome = engine.redeploy(&id, &entry("1.0.0"), None).await.expect("noop redeploy");
        assert_eq!(outcome, RedeployOutcome::Succeeded);

        // The container untouched: still the one seeded above, not staged anew.
        let stored = registry.get(&id).expect("present");
        assert_eq!(stored.container_ref.as_deref(), Some("container-1"));

        let entries = audit.read_current().expect("read audit");
        assert!(entries.iter().any(|e| e.kind.0 == "DEPLOYMENT_REDEPLOY_NOOP"));
    }
}
