//! Daemon wiring: assembles every subsystem crate into one running agent
//! process and owns its background tasks and graceful shutdown.
//!
//! Construct every long-lived component once, hand shared handles to the
//! HTTP routers and background loops, and keep them alive until shutdown.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::{info, warn};

use superagent_api::ApiState;
use superagent_audit::{AuditConfig, AuditLog};
use superagent_config::Config;
use superagent_engine::{Engine, EngineConfig};
use superagent_git::GitFetcher;
use superagent_health::{AgentMetrics, HealthState};
use superagent_process::{CliContainerDriver, ContainerDriver, RegistryPolicy};
use superagent_proxy::{ProxyConfig, ProxyIntegrator};
use superagent_registry::Registry;
use superagent_store::SecureStore;

mod agent_id;
pub mod catalog;
pub mod control_plane;

pub use control_plane::ControlPlaneClient;

/// Every long-lived handle the daemon needs, wired once at startup.
pub struct Agent {
    pub config: Config,
    pub agent_id: String,
    pub engine: Arc<Engine>,
    pub tokens: Arc<superagent_auth::TokenManager>,
    pub audit: Arc<AuditLog>,
    pub health: Arc<HealthState>,
    pub metrics: Arc<AgentMetrics>,
    pub registry: Arc<Registry>,
    pub git: Arc<GitFetcher>,
    pub control_plane: Option<Arc<ControlPlaneClient>>,
}

impl Agent {
    pub async fn bootstrap(config: Config) -> Result<Self> {
        let data_dir = &config.agent.data_dir;
        std::fs::create_dir_all(data_dir).with_context(|| format!("failed to create data dir {}", data_dir.display()))?;

        let agent_id = agent_id::resolve(data_dir, config.agent.id.as_deref())?;
        info!(%agent_id, data_dir = %data_dir.display(), "bootstrapping agent");

        let passphrase = superagent_config::resolve_passphrase(&config)?;
        let store = SecureStore::open(data_dir.join("secure.store"), passphrase, &agent_id)?;

        let audit = Arc::new(AuditLog::open(AuditConfig::new(data_dir.join("audit").join("audit.log")))?);
        let registry = Arc::new(Registry::open(data_dir.join("registry.log")).await.context("failed to open deployment registry")?);
        let tokens = Arc::new(superagent_auth::TokenManager::load(store, audit.clone()).await.context("failed to load token manager")?);

        let git = Arc::new(GitFetcher::with_config(
            data_dir.join("cache").join("git"),
            config.git.default_depth,
            config.git.cache_max_age_days,
        ));
        let driver: Arc<dyn ContainerDriver> = Arc::new(CliContainerDriver::new(config.docker.binary.clone(), RegistryPolicy::default()));

        let proxy = ProxyIntegrator::new(ProxyConfig {
            enabled: config.traefik.enabled,
            routing_file: config.traefik.routing_file.clone(),
            debounce: Duration::from_millis(config.traefik.debounce_ms),
        });
        proxy.reconcile_from_registry(&registry.list()).await.context("failed to reconcile proxy document on startup")?;

        let metrics = Arc::new(AgentMetrics::new()?);
        let health = Arc::new(HealthState::new());
        let catalog = Arc::new(catalog::load(&data_dir.join("catalog.yaml"))?);

        let mut engine_config = EngineConfig::new(data_dir.clone());
        engine_config.max_concurrent_ops = config.resources.max_concurrent_ops;
        engine_config.max_deployments = config.resources.max_deployments;

        let engine = Arc::new(Engine::new(
            registry.clone(),
            driver,
            git.clone(),
            proxy,
            audit.clone(),
            metrics.clone(),
            health.clone(),
            catalog,
            engine_config,
        ));

        let control_plane = if superagent_config::control_plane_disabled(&config.backend.base_url) {
            info!(base_url = %config.backend.base_url, "control plane disabled, running standalone");
            None
        } else {
            Some(Arc::new(ControlPlaneClient::new(&config.backend.base_url, &agent_id, registry.clone(), audit.clone())?))
        };

        Ok(Self {
            config,
            agent_id,
            engine,
            tokens,
            audit,
            health,
            metrics,
            registry,
            git,
            control_plane,
        })
    }

    pub fn api_state(&self) -> ApiState {
        ApiState {
            engine: self.engine.clone(),
            tokens: self.tokens.clone(),
            audit: self.audit.clone(),
            health: self.health.clone(),
        }
    }

    /// Spawn every background task (reconciliation, token refresh, control
    /// plane sync) bound to `shutdown`. Returns their handles so the caller
    /// can await them after shutdown is signalled.
    pub fn spawn_background_tasks(&self, shutdown: watch::Receiver<bool>) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles = vec![superagent_engine::spawn_reconciliation_loop(self.engine.clone(), shutdown.clone())];

        let git = self.git.clone();
        let mut git_shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(3600));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = git.prune_stale_repos().await {
                            warn!(error = %e, "git cache prune sweep failed");
                        }
                    }
                    _ = git_shutdown.changed() => {
                        if *git_shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        }));

        let (refresh_tx, mut refresh_rx) = tokio::sync::mpsc::channel(1);
        handles.push(self.tokens.clone().spawn_refresh_worker(refresh_tx, shutdown.clone()));
        handles.push(tokio::spawn(async move {
            while let Some(signal) = refresh_rx.recv().await {
                warn!(?signal, "bearer token is nearing expiry; control-plane client must rotate it");
            }
        }));

        if let Some(cp) = &self.control_plane {
            let interval = Duration::from_secs(self.config.backend.heartbeat_interval_secs.max(1));
            handles.push(cp.clone().spawn_loop(interval, shutdown));
        }

        handles
    }

    /// Give in-flight pipeline work up to `deadline` to drain before the
    /// caller forces termination. `running`
    /// deployments are untouched — only deployments still holding a
    /// governor slot (fetching/building/deploying) count here.
    pub async fn wait_for_pipelines_to_drain(&self, deadline: Duration) {
        let waited = tokio::time::timeout(deadline, async {
            while self.engine.active_pipeline_count() > 0 {
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
        })
        .await;

        if waited.is_err() {
            warn!(
                remaining = self.engine.active_pipeline_count(),
                "shutdown deadline elapsed with pipeline work still in flight; forcing termination"
            );
        }
    }
}
