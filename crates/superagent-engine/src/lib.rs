//! Deployment Engine: the state machine driver, the `create`/
//! `redeploy`/`stop`/`delete` pipelines, the resource governor, and the
//! reconciliation loop.
//!
//! Grounded on `shipper/src/engine.rs`'s `run_preflight`/`run_publish`/
//! `run_resume` shape: a linear pipeline of typed steps, each one capable of
//! failing with a specific reason, driven against an observability seam
//! (here, `tracing` and the audit log, since this agent is a long-lived
//! daemon rather than a one-shot CLI run reporting to a terminal). The
//! graph itself is generalized from that file's single
//! preflight→publish→verify sequence to the full `pending → ... → running`
//! state machine in `superagent_types::DeploymentStatus`.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use rand::Rng;
use tracing::{info, warn};

use superagent_audit::AuditLog;
use superagent_git::GitFetcher;
use superagent_health::{AgentMetrics, HealthState};
use superagent_process::ContainerDriver;
use superagent_proxy::ProxyIntegrator;
use superagent_registry::Registry;
use superagent_types::catalog::merge_env;
use superagent_types::{AgentError, CatalogEntry, Deployment, DeploymentId, DeploymentStatus, ErrorCode, Route, SourceSpec};

mod catalog;
mod governor;
mod lifecycle;
mod reconcile;
mod redeploy;

pub use catalog::{CatalogProvider, StaticCatalog};
pub use governor::{Governor, GovernorSlot};
pub use reconcile::spawn_reconciliation_loop;
pub use redeploy::RedeployOutcome;

pub struct EngineConfig {
    pub data_dir: PathBuf,
    pub max_concurrent_ops: usize,
    pub max_deployments: usize,
    pub governor_deadline: Duration,
    pub health_check_timeout: Duration,
    pub reconcile_interval: Duration,
    pub stop_timeout: Duration,
}

impl EngineConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            max_concurrent_ops: 5,
            max_deployments: 50,
            governor_deadline: Duration::from_secs(30),
            health_check_timeout: Duration::from_secs(60),
            reconcile_interval: Duration::from_secs(30),
            stop_timeout: Duration::from_secs(10),
        }
    }
}

pub struct Engine {
    pub(crate) registry: Arc<Registry>,
    pub(crate) driver: Arc<dyn ContainerDriver>,
    pub(crate) git: Arc<GitFetcher>,
    pub(crate) proxy: ProxyIntegrator,
    pub(crate) audit: Arc<AuditLog>,
    pub(crate) metrics: Arc<AgentMetrics>,
    pub(crate) health: Arc<HealthState>,
    pub(crate) catalog: Arc<dyn CatalogProvider>,
    pub(crate) governor: Governor,
    pub(crate) http: reqwest::Client,
    pub(crate) config: EngineConfig,
}

pub struct CreateRequest {
    pub app_id: String,
    pub version: String,
    pub env_overrides: BTreeMap<String, String>,
    pub metadata: BTreeMap<String, String>,
    pub auth_token: Option<String>,
}

impl Engine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<Registry>,
        driver: Arc<dyn ContainerDriver>,
        git: Arc<GitFetcher>,
        proxy: ProxyIntegrator,
        audit: Arc<AuditLog>,
        metrics: Arc<AgentMetrics>,
        health: Arc<HealthState>,
        catalog: Arc<dyn CatalogProvider>,
        config: EngineConfig,
    ) -> Self {
        let governor = Governor::new(config.max_concurrent_ops);
        Self {
            registry,
            driver,
            git,
            proxy,
            audit,
            metrics,
            health,
            catalog,
            governor,
            http: reqwest::Client::new(),
            config,
        }
    }

    pub(crate) fn workspace_dir(&self, id: &DeploymentId) -> PathBuf {
        self.config.data_dir.join("workspaces").join(&id.0)
    }

    /// Record a terminal failure: transitions the deployment to `failed`,
    /// audits it, and counts it against `deploy_failures_total`.
    pub(crate) async fn fail_deployment(&self, id: &DeploymentId, reason: ErrorCode, message: impl Into<String>) {
        let message = message.into();
        let result = self
            .registry
            .update_with(id, |d| {
                if !d.status.is_terminal() {
                    d.transition(DeploymentStatus::Failed, Utc::now());
                }
                d.failure_reason = Some(reason);
                d.failure_message = Some(message.clone());
                Ok(())
            })
            .await;
        if let Err(e) = result {
            warn!(%id, error = %e, "failed to record deployment failure in registry");
        }
        self.metrics.record_deploy_failure(reason);
        if let Err(e) = self
            .audit
            .emit(
                "DEPLOYMENT_FAILED",
                false,
                &[("deployment_id", id.0.as_str()), ("reason", reason.as_str()), ("message", message.as_str())],
            )
            .await
        {
            warn!(%id, error = %e, "failed to audit a deployment failure");
            self.health.mark_degraded();
        }
    }

    pub(crate) fn new_deployment_id() -> DeploymentId {
        let mut bytes = [0u8; 6];
        rand::rng().fill(&mut bytes);
        DeploymentId::generate(&hex::encode(bytes))
    }

    /// Pipeline for a `create` command: validate, allocate,
    /// fetch, build, deploy, health-gate, publish, running.
    pub async fn create(&self, request: CreateRequest) -> Result<Deployment, AgentError> {
        let CreateRequest { app_id, version, env_overrides, metadata, auth_token } = request;

        let catalog_entry = self
            .catalog
            .lookup(&app_id, &version)
            .ok_or_else(|| AgentError::new(ErrorCode::CatalogUnknown, format!("no catalog entry for {app_id}@{version}")))?;

        for required in &catalog_entry.runtime.required_env {
            if !env_overrides.contains_key(required) {
                return Err(AgentError::new(
                    ErrorCode::BadRequest,
                    format!("missing required env var {required} for {app_id}@{version}"),
                ));
            }
        }

        let active = self.registry.list().iter().filter(|d| !d.status.is_terminal()).count();
        if active >= self.config.max_deployments {
            return Err(AgentError::new(ErrorCode::ResourceUnavailable, "fleet is at max_deployments capacity"));
        }

        let id = Self::new_deployment_id();
        let env = merge_env(&BTreeMap::new(), &env_overrides);
        let deployment = Deployment::new(id.clone(), app_id.clone(), version.clone(), catalog_entry.resource_limits, env, metadata, Utc::now());

        self.registry
            .create(deployment.clone())
            .await
            .map_err(|e| AgentError::new(ErrorCode::Internal, e.to_string()))?;
        info!(%id, %app_id, %version, "deployment record created");

        let slot = match self.governor.acquire(self.config.governor_deadline).await {
            Ok(slot) => slot,
            Err(reason) => {
                self.fail_deployment(&id, reason, "no governor slot available before deadline").await;
                return Err(AgentError::new(reason, "resource governor could not admit this deployment in time"));
            }
        };

        let result = self.run_create_pipeline(&id, &catalog_entry, auth_token.as_deref()).await;
        drop(slot);

        match result {
            Ok(()) => self
                .registry
                .get(&id)
                .ok_or_else(|| AgentError::new(ErrorCode::Internal, "deployment vanished after creation")),
            Err(e) => Err(e),
        }
    }

    async fn run_create_pipeline(&self, id: &DeploymentId, catalog_entry: &CatalogEntry, auth_token: Option<&str>) -> Result<(), AgentError> {
        self.registry
            .update_with(id, |d| {
                d.transition(DeploymentStatus::Fetching, Utc::now());
                Ok(())
            })
            .await
            .map_err(|e| AgentError::new(ErrorCode::Internal, e.to_string()))?;
        self.audit_transition(id, "fetching").await?;

        let image_ref = match &catalog_entry.source {
            SourceSpec::Git { url, r#ref } => {
                let workspace = self.workspace_dir(id);
                let fetch = match self.git.fetch(url, r#ref, &workspace, auth_token).await {
                    Ok(f) => f,
                    Err(e) => {
                        self.fail_deployment(id, ErrorCode::SourceUnavailable, e.to_string()).await;
                        return Err(AgentError::new(ErrorCode::SourceUnavailable, e.to_string()));
                    }
                };
                self.registry
                    .update_with(id, |d| {
                        d.source_snapshot = Some(fetch.resolved_sha.clone());
                        Ok(())
                    })
                    .await
                    .map_err(|e| AgentError::new(ErrorCode::Internal, e.to_string()))?;

                self.registry
                    .update_with(id, |d| {
                        d.transition(DeploymentStatus::Building, Utc::now());
                        Ok(())
                    })
                    .await
                    .map_err(|e| AgentError::new(ErrorCode::Internal, e.to_string()))?;
                self.audit_transition(id, "building").await?;

                let tag = format!("superagent/{}:build", id.0);
                let dockerfile = catalog_entry.build.as_ref().and_then(|b| b.dockerfile.as_deref());
                let started = std::time::Instant::now();
                if let Err(e) = self.driver.build(&fetch.workspace, dockerfile, &tag).await {
                    self.fail_deployment(id, ErrorCode::BuildFailed, e.to_string()).await;
                    return Err(AgentError::new(ErrorCode::BuildFailed, e.to_string()));
                }
                self.metrics.build_duration_seconds.observe(started.elapsed().as_secs_f64());
                tag
            }
            SourceSpec::Image { reference } => {
                let digest = match self.driver.pull_image(reference).await {
                    Ok(d) => d,
                    Err(e) => {
                        let reason = if e.message.contains("block list") || e.message.contains("allow list") {
                            ErrorCode::RegistryBlocked
                        } else {
                            ErrorCode::SourceUnavailable
                        };
                        self.fail_deployment(id, reason, e.message.clone()).await;
                        return Err(AgentError::new(reason, e.message));
                    }
                };
                self.registry
                    .update_with(id, |d| {
                        d.source_snapshot = Some(digest.clone());
                        d.transition(DeploymentStatus::Building, Utc::now());
                        Ok(())
                    })
                    .await
                    .map_err(|e| AgentError::new(ErrorCode::Internal, e.to_string()))?;
                self.audit_transition(id, "building").await?;
                reference.clone()
            }
        };

        self.deploy_and_gate(id, catalog_entry, &image_ref).await
    }

    /// Shared by `create` and the redeploy pipeline's "bring up the new
    /// container" half: create → start → health-gate → publish → running.
    pub(crate) async fn deploy_and_gate(&self, id: &DeploymentId, catalog_entry: &CatalogEntry, image_ref: &str) -> Result<(), AgentError> {
        self.registry
            .update_with(id, |d| {
                d.transition(DeploymentStatus::Deploying, Utc::now());
                Ok(())
            })
            .await
            .map_err(|e| AgentError::new(ErrorCode::Internal, e.to_string()))?;
        self.audit_transition(id, "deploying").await?;

        let deployment = self.registry.get(id).ok_or_else(|| AgentError::new(ErrorCode::Internal, "deployment vanished"))?;
        let container_name = format!("superagent-{}", id.0);
        let container_ref = match self
            .driver
            .create(image_ref, &container_name, &deployment.env, catalog_entry.runtime.exposed_port)
            .await
        {
            Ok(r) => r,
            Err(e) => {
                self.fail_deployment(id, ErrorCode::CreateFailed, e.to_string()).await;
                return Err(AgentError::new(ErrorCode::CreateFailed, e.to_string()));
            }
        };

        if let Err(e) = self.driver.start(&container_ref).await {
            let _ = self.driver.remove(&container_ref).await;
            self.fail_deployment(id, ErrorCode::CreateFailed, e.to_string()).await;
            return Err(AgentError::new(ErrorCode::CreateFailed, e.to_string()));
        }

        let healthy = self.wait_for_health(&container_ref, catalog_entry).await;
        if !healthy {
            let _ = self.driver.stop(&container_ref, self.config.stop_timeout).await;
            let _ = self.driver.remove(&container_ref).await;
            self.fail_deployment(id, ErrorCode::HealthCheckFailed, "container did not become healthy in time").await;
            return Err(AgentError::new(ErrorCode::HealthCheckFailed, "container did not become healthy in time"));
        }

        let route = match self.driver.inspect(&container_ref).await {
            Ok(inspect) => {
                let port = inspect.host_port.unwrap_or(catalog_entry.runtime.exposed_port);
                Route { hostname: format!("{}.local", deployment.app_id), port }
            }
            Err(e) => {
                self.fail_deployment(id, ErrorCode::RoutePublishFailed, e.to_string()).await;
                return Err(AgentError::new(ErrorCode::RoutePublishFailed, e.to_string()));
            }
        };

        self.proxy.publish(id, route.clone());

        self.registry
            .update_with(id, |d| {
                d.container_ref = Some(container_ref.clone());
                d.route = Some(route.clone());
                d.health = superagent_types::Health::Healthy;
                d.last_deployed_at = Some(Utc::now());
                d.transition(DeploymentStatus::Running, Utc::now());
                Ok(())
            })
            .await
            .map_err(|e| AgentError::new(ErrorCode::Internal, e.to_string()))?;
        self.audit_transition(id, "running").await?;

        Ok(())
    }

    /// HTTP health check when the catalog declares one, else a liveness
    /// proxy: still `running` three seconds after start.
    pub(crate) async fn wait_for_health(&self, container_ref: &str, catalog_entry: &CatalogEntry) -> bool {
        let Some(path) = catalog_entry.runtime.health_check_path.as_deref() else {
            tokio::time::sleep(Duration::from_secs(3)).await;
            return matches!(self.driver.inspect(container_ref).await, Ok(i) if i.running);
        };

        let Ok(inspect) = self.driver.inspect(container_ref).await else {
            return false;
        };
        let Some(port) = inspect.host_port else {
            return false;
        };

        let deadline = tokio::time::Instant::now() + self.config.health_check_timeout;
        let mut backoff = Duration::from_secs(1);
        loop {
            let url = format!("http://127.0.0.1:{port}{path}");
            if let Ok(resp) = self.http.get(&url).send().await
                && resp.status().is_success()
            {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(backoff.min(Duration::from_secs(5))).await;
            backoff = (backoff * 2).min(Duration::from_secs(5));
        }
    }

    pub(crate) async fn audit_transition(&self, id: &DeploymentId, to: &str) -> Result<(), AgentError> {
        self.audit.emit("DEPLOYMENT_TRANSITIONED", true, &[("deployment_id", id.0.as_str()), ("to", to)]).await.map_err(|e| {
            self.health.mark_degraded();
            AgentError::new(ErrorCode::Internal, format!("audit write failed: {e}"))
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn driver(&self) -> &Arc<dyn ContainerDriver> {
        &self.driver
    }

    pub fn catalog_lookup(&self, app_id: &str, version: &str) -> Option<CatalogEntry> {
        self.catalog.lookup(app_id, version)
    }

    /// Deployments currently holding a governor slot (`pending` through
    /// `deploying`). Consulted by the daemon's shutdown path to know when
    /// in-flight pipeline work has drained.
    pub fn active_pipeline_count(&self) -> usize {
        self.governor.active_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap as Map;
    use superagent_process::{CliContainerDriver, RegistryPolicy};
    use superagent_types::{ResourceLimits, RuntimeSpec};

    fn entry(app_id: &str) -> CatalogEntry {
        CatalogEntry {
            app_id: app_id.into(),
            version: "1.0.0".into(),
            source: SourceSpec::Image { reference: "ghcr.io/acme/widgets:1.0".into() },
            build: None,
            runtime: RuntimeSpec {
                start_command: None,
                exposed_port: 8080,
                required_env: vec!["LOG_LEVEL".into()],
                health_check_path: None,
            },
            resource_limits: ResourceLimits::default(),
        }
    }

    async fn test_engine(tmp: &std::path::Path) -> Engine {
        let registry = Arc::new(Registry::open(tmp.join("registry.log")).await.expect("registry"));
        let driver: Arc<dyn ContainerDriver> = Arc::new(CliContainerDriver::new("docker", RegistryPolicy::default()));
        let git = Arc::new(GitFetcher::new(tmp.join("cache")));
        let proxy = ProxyIntegrator::new(superagent_proxy::ProxyConfig::new(tmp.join("routing.yaml")));
        let audit = Arc::new(AuditLog::open(superagent_audit::AuditConfig::new(tmp.join("audit.log"))).expect("audit"));
        let metrics = Arc::new(AgentMetrics::new().expect("metrics"));
        let catalog: Arc<dyn CatalogProvider> = Arc::new(StaticCatalog::new(vec![entry("react-starter")]));
        let health = Arc::new(superagent_health::HealthState::new());
        Engine::new(registry, driver, git, proxy, audit, metrics, health, catalog, EngineConfig::new(tmp))
    }

    #[tokio::test]
    async fn create_rejects_unknown_catalog_entries() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let engine = test_engine(tmp.path()).await;

        let mut env = Map::new();
        env.insert("LOG_LEVEL".to_string(), "info".to_string());
        let err = engine
            .create(CreateRequest {
                app_id: "does-not-exist".into(),
                version: "9.9.9".into(),
                env_overrides: env,
                metadata: Map::new(),
                auth_token: None,
            })
            .await
            .expect_err("should reject");
        assert_eq!(err.code(), ErrorCode::CatalogUnknown);
    }

    #[tokio::test]
    async fn create_rejects_missing_required_env() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let engine = test_engine(tmp.path()).await;

        let err = engine
            .create(CreateRequest {
                app_id: "react-starter".into(),
                version: "1.0.0".into(),
                env_overrides: Map::new(),
                metadata: Map::new(),
                auth_token: None,
            })
            .await
            .expect_err("should reject");
        assert_eq!(err.code(), ErrorCode::BadRequest);
    }

    #[tokio::test]
    async fn create_rejects_once_the_fleet_is_at_max_deployments() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mut engine = test_engine(tmp.path()).await;
        engine.config.max_deployments = 1;

        // Seed a non-terminal deployment directly, since driving it through
        // the full pipeline would immediately fail and free the slot again.
        let existing = Deployment::new(
            DeploymentId("dep-existing".into()),
            "react-starter".into(),
            "1.0.0".into(),
            Default::default(),
            Map::new(),
            Map::new(),
            Utc::now(),
        );
        engine.registry.create(existing).await.expect("seed");

        let mut env = Map::new();
        env.insert("LOG_LEVEL".to_string(), "info".to_string());
        let err = engine
            .create(CreateRequest {
                app_id: "react-starter".into(),
                version: "1.0.0".into(),
                env_overrides: env,
                metadata: Map::new(),
                auth_token: None,
            })
            .await
            .expect_err("fleet is full");
        assert_eq!(err.code(), ErrorCode::ResourceUnavailable);
    }
}
