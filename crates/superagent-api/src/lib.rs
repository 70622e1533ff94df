//! Local HTTP API: the authenticated command surface operators
//! and the CLI drive the agent through.
//!
//! Grounded on `tangle-network-blueprint`'s `x402`/`auth` crates, the pack's
//! clearest precedent for an `axum` server with a custom bearer extractor
//! and a `{status, data|error}`-shaped JSON surface, generalized from their
//! payment-gateway routes to this agent's deployment CRUD.

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;

use superagent_audit::AuditLog;
use superagent_engine::Engine;
use superagent_health::HealthState;
use superagent_types::{AgentError, DeploymentId, ErrorCode};

mod auth;
mod envelope;
mod handlers;

#[derive(Clone)]
pub struct ApiState {
    pub engine: Arc<Engine>,
    pub tokens: Arc<superagent_auth::TokenManager>,
    pub audit: Arc<AuditLog>,
    pub health: Arc<HealthState>,
}

impl ApiState {
    /// Every mutation emits an audit entry tying the authenticated
    /// `token_id` to the deployment it acted on. An audit write failure
    /// degrades the agent's health and is surfaced to the caller rather
    /// than swallowed, since an unaudited mutation is a compliance gap.
    async fn audit_mutation(&self, kind: &str, token_id: &str, deployment_id: &DeploymentId) -> Result<(), AgentError> {
        self.audit.emit(kind, true, &[("token_id", token_id), ("deployment_id", deployment_id.0.as_str())]).await.map_err(|e| {
            self.health.mark_degraded();
            AgentError::new(ErrorCode::Internal, format!("audit write failed: {e}"))
        })
    }
}

/// Build the `/api/v1/...` router. Mounted separately from the
/// unauthenticated `/health`/`/metrics` surface `superagent_health::router`
/// builds.
pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/api/v1/deployments", post(handlers::create_deployment).get(handlers::list_deployments))
        .route("/api/v1/deployments/{id}", get(handlers::get_deployment).delete(handlers::delete_deployment))
        .route("/api/v1/deployments/{id}/stop", post(handlers::stop_deployment))
        .route("/api/v1/deployments/{id}/start", post(handlers::start_deployment))
        .route("/api/v1/deployments/{id}/redeploy", post(handlers::redeploy_deployment))
        .route("/api/v1/deployments/{id}/logs", get(handlers::deployment_logs))
        .route("/api/v1/status", get(handlers::agent_status))
        .fallback(handlers::not_found)
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use chrono::Utc;
    use tower::ServiceExt;

    use superagent_engine::{CatalogProvider, EngineConfig, StaticCatalog};
    use superagent_process::{CliContainerDriver, ContainerDriver, RegistryPolicy};
    use superagent_registry::Registry;
    use superagent_types::{CatalogEntry, ResourceLimits, RuntimeSpec, SourceSpec};

    use super::*;

    async fn test_state(tmp: &std::path::Path) -> (ApiState, String) {
        let registry = Arc::new(Registry::open(tmp.join("registry.log")).await.expect("registry"));
        let driver: Arc<dyn ContainerDriver> = Arc::new(CliContainerDriver::new("docker", RegistryPolicy::default()));
        let git = Arc::new(superagent_git::GitFetcher::new(tmp.join("cache")));
        let proxy = superagent_proxy::ProxyIntegrator::new(superagent_proxy::ProxyConfig::new(tmp.join("routing.yaml")));
        let audit = Arc::new(AuditLog::open(superagent_audit::AuditConfig::new(tmp.join("audit.log"))).expect("audit"));
        let metrics = Arc::new(superagent_health::AgentMetrics::new().expect("metrics"));
        let health = Arc::new(HealthState::new());
        let catalog: Arc<dyn CatalogProvider> = Arc::new(StaticCatalog::new(vec![CatalogEntry {
            app_id: "react-starter".into(),
            version: "1.0.0".into(),
            source: SourceSpec::Image { reference: "ghcr.io/acme/widgets:1.0".into() },
            build: None,
            runtime: RuntimeSpec { start_command: None, exposed_port: 8080, required_env: vec![], health_check_path: None },
            resource_limits: ResourceLimits::default(),
        }]));
        let engine = Arc::new(Engine::new(registry, driver, git, proxy, audit.clone(), metrics, health.clone(), catalog, EngineConfig::new(tmp)));

        let store = superagent_store::SecureStore::open(tmp.join("store"), "pass", "agent-1").expect("store");
        let tokens = Arc::new(superagent_auth::TokenManager::load(store, audit.clone()).await.expect("tokens"));
        let info = tokens.set("secret-1", Utc::now() + chrono::Duration::hours(1), vec!["deployments:read".into(), "deployments:write".into()]).await.expect("set token");
        let _ = info;

        (ApiState { engine, tokens, audit, health }, "secret-1".to_string())
    }

    #[tokio::test]
    async fn unauthenticated_requests_are_rejected() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let (state, _secret) = test_state(tmp.path()).await;
        let app = router(state);

        let response = app.oneshot(Request::builder().uri("/api/v1/status").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn status_reports_zero_deployments_for_a_fresh_agent() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let (state, secret) = test_state(tmp.path()).await;
        let app = router(state);

        let response = app
            .oneshot(Request::builder().uri("/api/v1/status").header("authorization", format!("Bearer {secret}")).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn create_rejects_unknown_catalog_entry_through_the_http_layer() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let (state, secret) = test_state(tmp.path()).await;
        let app = router(state);

        let body = serde_json::to_string(&serde_json::json!({
            "app_id": "does-not-exist",
            "version": "9.9.9",
            "env": BTreeMap::<String, String>::new(),
        }))
        .unwrap();

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/v1/deployments")
                    .header("authorization", format!("Bearer {secret}"))
                    .header("content-type", "application/json")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_route_yields_the_not_found_envelope() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let (state, secret) = test_state(tmp.path()).await;
        let app = router(state);

        let response = app
            .oneshot(Request::builder().uri("/nope").header("authorization", format!("Bearer {secret}")).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
