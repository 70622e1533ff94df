//! Proxy Integrator: keeps the reverse proxy's file-provider
//! routing document in sync with published routes.
//!
//! `shipper` never talks to a reverse proxy, so this is grounded on two
//! things done elsewhere in that codebase: the atomic temp-file-then-rename
//! write from `shipper/src/state.rs::atomic_write_json`, and the YAML
//! serialization `shipper-cli` already depends on (`serde_yaml`) for its own
//! config file. The routing document itself follows a Traefik-style
//! file-provider schema: one router + one load-balanced service per
//! published route.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, warn};

use superagent_types::{Deployment, DeploymentId, DeploymentStatus, Route};

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub enabled: bool,
    pub routing_file: PathBuf,
    pub debounce: Duration,
}

impl ProxyConfig {
    pub fn new(routing_file: impl Into<PathBuf>) -> Self {
        Self {
            enabled: true,
            routing_file: routing_file.into(),
            debounce: Duration::from_millis(50),
        }
    }
}

#[derive(Serialize)]
struct RoutingDoc {
    http: HttpSection,
}

#[derive(Serialize)]
struct HttpSection {
    routers: BTreeMap<String, RouterEntry>,
    services: BTreeMap<String, ServiceEntry>,
}

#[derive(Serialize)]
struct RouterEntry {
    rule: String,
    service: String,
}

#[derive(Serialize)]
struct ServiceEntry {
    #[serde(rename = "loadBalancer")]
    load_balancer: LoadBalancer,
}

#[derive(Serialize)]
struct LoadBalancer {
    servers: Vec<ServerEntry>,
}

#[derive(Serialize)]
struct ServerEntry {
    url: String,
}

struct Inner {
    config: ProxyConfig,
    routes: Mutex<BTreeMap<DeploymentId, Route>>,
    write_pending: Mutex<bool>,
}

/// Cheaply cloneable handle; every clone shares the same pending-write
/// debounce state.
#[derive(Clone)]
pub struct ProxyIntegrator(Arc<Inner>);

impl ProxyIntegrator {
    pub fn new(config: ProxyConfig) -> Self {
        Self(Arc::new(Inner {
            config,
            routes: Mutex::new(BTreeMap::new()),
            write_pending: Mutex::new(false),
        }))
    }

    /// Rebuild the in-memory route table from every currently-published
    /// deployment, then write the routing document immediately. Called once
    /// at startup since the proxy has no memory of its own between restarts.
    pub async fn reconcile_from_registry(&self, deployments: &[Deployment]) -> Result<()> {
        {
            let mut routes = self.0.routes.lock().unwrap();
            routes.clear();
            for d in deployments {
                if d.status == DeploymentStatus::Running
                    && let Some(route) = &d.route
                {
                    routes.insert(d.id.clone(), route.clone());
                }
            }
        }
        self.write_now().await
    }

    /// Publish or update a route for `id`, debouncing the on-disk write.
    pub fn publish(&self, id: &DeploymentId, route: Route) {
        self.0.routes.lock().unwrap().insert(id.clone(), route);
        self.schedule_write();
    }

    /// Remove a route, debouncing the on-disk write the same as [`publish`].
    pub fn retract(&self, id: &DeploymentId) {
        self.0.routes.lock().unwrap().remove(id);
        self.schedule_write();
    }

    fn schedule_write(&self) {
        if !self.0.config.enabled {
            return;
        }
        let mut pending = self.0.write_pending.lock().unwrap();
        if *pending {
            return;
        }
        *pending = true;
        drop(pending);

        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(this.0.config.debounce).await;
            *this.0.write_pending.lock().unwrap() = false;
            if let Err(e) = this.write_now().await {
                warn!(error = %e, "failed to write proxy routing document");
            }
        });
    }

    async fn write_now(&self) -> Result<()> {
        if !self.0.config.enabled {
            return Ok(());
        }

        let doc = {
            let routes = self.0.routes.lock().unwrap();
            build_doc(&routes)
        };
        let yaml = serde_yaml::to_string(&doc).context("failed to serialize routing document")?;

        let path = &self.0.config.routing_file;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, yaml.as_bytes())
            .await
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, path)
            .await
            .with_context(|| format!("failed to rename {} to {}", tmp.display(), path.display()))?;

        debug!(routes = self.0.routes.lock().unwrap().len(), "wrote proxy routing document");
        Ok(())
    }
}

fn build_doc(routes: &BTreeMap<DeploymentId, Route>) -> RoutingDoc {
    let mut routers = BTreeMap::new();
    let mut services = BTreeMap::new();

    for (id, route) in routes {
        let name = id.0.clone();
        routers.insert(
            name.clone(),
            RouterEntry {
                rule: format!("Host(`{}`)", route.hostname),
                service: name.clone(),
            },
        );
        services.insert(
            name,
            ServiceEntry {
                load_balancer: LoadBalancer {
                    servers: vec![ServerEntry {
                        url: format!("http://127.0.0.1:{}", route.port),
                    }],
                },
            },
        );
    }

    RoutingDoc {
        http: HttpSection { routers, services },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap as Map;
    use tempfile::tempdir;

    fn route(port: u16) -> Route {
        Route {
            hostname: "app.example.com".into(),
            port,
        }
    }

    fn running_deployment(id: &str, route: Route) -> Deployment {
        let mut d = Deployment::new(
            superagent_types::DeploymentId(id.into()),
            "react-starter".into(),
            "1.0.0".into(),
            Default::default(),
            Map::new(),
            Map::new(),
            chrono::Utc::now(),
        );
        d.status = DeploymentStatus::Running;
        d.route = Some(route);
        d
    }

    #[tokio::test]
    async fn publish_then_a_debounced_write_lands_on_disk() {
        let dir = tempdir().expect("tempdir");
        let config = ProxyConfig::new(dir.path().join("dynamic.yaml"));
        let config = ProxyConfig {
            debounce: Duration::from_millis(5),
            ..config
        };
        let proxy = ProxyIntegrator::new(config.clone());

        proxy.publish(&DeploymentId("dep-1".into()), route(8080));
        tokio::time::sleep(Duration::from_millis(50)).await;

        let contents = tokio::fs::read_to_string(&config.routing_file).await.expect("read");
        assert!(contents.contains("app.example.com"));
        assert!(contents.contains("8080"));
    }

    #[tokio::test]
    async fn retract_removes_the_route_from_the_next_write() {
        let dir = tempdir().expect("tempdir");
        let config = ProxyConfig {
            debounce: Duration::from_millis(5),
            ..ProxyConfig::new(dir.path().join("dynamic.yaml"))
        };
        let proxy = ProxyIntegrator::new(config.clone());
        let id = DeploymentId("dep-1".into());

        proxy.publish(&id, route(8080));
        tokio::time::sleep(Duration::from_millis(50)).await;
        proxy.retract(&id);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let contents = tokio::fs::read_to_string(&config.routing_file).await.expect("read");
        assert!(!contents.contains("app.example.com"));
    }

    #[tokio::test]
    async fn reconcile_from_registry_rebuilds_routes_for_running_deployments_only() {
        let dir = tempdir().expect("tempdir");
        let config = ProxyConfig::new(dir.path().join("dynamic.yaml"));
        let proxy = ProxyIntegrator::new(config.clone());

        let running = running_deployment("dep-1", route(8080));
        let mut stopped = running_deployment("dep-2", route(9090));
        stopped.status = DeploymentStatus::Stopped;

        proxy.reconcile_from_registry(&[running, stopped]).await.expect("reconcile");

        let contents = tokio::fs::read_to_string(&config.routing_file).await.expect("read");
        assert!(contents.contains("8080"));
        assert!(!contents.contains("9090"));
    }

    #[tokio::test]
    async fn disabled_proxy_never_writes_anything() {
        let dir = tempdir().expect("tempdir");
        let config = ProxyConfig {
            enabled: false,
            ..ProxyConfig::new(dir.path().join("dynamic.yaml"))
        };
        let proxy = ProxyIntegrator::new(config.clone());

        proxy.publish(&DeploymentId("dep-1".into()), route(8080));
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(!config.routing_file.exists());
    }
}
