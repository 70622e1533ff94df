//! Health & Metrics: a liveness endpoint and Prometheus text
//! exposition.
//!
//! `shipper` is a one-shot CLI with no HTTP server of its own. This crate is
//! grounded on `tangle-network-blueprint`'s `blueprint-manager`/`qos`
//! crates, which pair `axum` with the `prometheus` crate for a long-lived
//! daemon's health surface.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use prometheus::{Encoder, GaugeVec, Histogram, HistogramOpts, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};

use superagent_types::ErrorCode;

/// Reflects the degraded flag: once an audit write fails, `/health` reports
/// it rather than silently staying green.
pub struct HealthState {
    degraded: AtomicBool,
}

impl HealthState {
    pub fn new() -> Self {
        Self {
            degraded: AtomicBool::new(false),
        }
    }

    pub fn mark_degraded(&self) {
        self.degraded.store(true, Ordering::SeqCst);
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

/// All metrics this agent exposes.
pub struct AgentMetrics {
    registry: Registry,
    pub deployments_total: IntGaugeVec,
    pub deployments_active: IntGauge,
    pub container_cpu_ratio: GaugeVec,
    pub container_memory_bytes: GaugeVec,
    pub build_duration_seconds: Histogram,
    pub deploy_failures_total: IntCounterVec,
}

impl AgentMetrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let deployments_total = IntGaugeVec::new(
            Opts::new("deployments_total", "Deployments by current status"),
            &["status"],
        )?;
        let deployments_active = IntGauge::new("deployments_active", "Deployments not in a terminal status")?;
        let container_cpu_ratio = GaugeVec::new(
            Opts::new("container_cpu_ratio", "Sampled CPU usage ratio per deployment"),
            &["id"],
        )?;
        let container_memory_bytes = GaugeVec::new(
            Opts::new("container_memory_bytes", "Sampled memory usage in bytes per deployment"),
            &["id"],
        )?;
        let build_duration_seconds = Histogram::with_opts(HistogramOpts::new(
            "build_duration_seconds",
            "Wall-clock time spent building a deployment's image",
        ))?;
        let deploy_failures_total = IntCounterVec::new(
            Opts::new("deploy_failures_total", "Deployment failures by reason"),
            &["reason"],
        )?;

        registry.register(Box::new(deployments_total.clone()))?;
        registry.register(Box::new(deployments_active.clone()))?;
        registry.register(Box::new(container_cpu_ratio.clone()))?;
        registry.register(Box::new(container_memory_bytes.clone()))?;
        registry.register(Box::new(build_duration_seconds.clone()))?;
        registry.register(Box::new(deploy_failures_total.clone()))?;

        Ok(Self {
            registry,
            deployments_total,
            deployments_active,
            container_cpu_ratio,
            container_memory_bytes,
            build_duration_seconds,
            deploy_failures_total,
        })
    }

    pub fn record_deploy_failure(&self, reason: ErrorCode) {
        self.deploy_failures_total.with_label_values(&[reason.as_str()]).inc();
    }

    fn render(&self) -> anyhow::Result<String> {
        let metric_families = self.registry.gather();
        let mut buf = Vec::new();
        TextEncoder::new().encode(&metric_families, &mut buf)?;
        Ok(String::from_utf8(buf)?)
    }
}

impl Default for AgentMetrics {
    fn default() -> Self {
        Self::new().expect("static metric definitions are always valid")
    }
}

#[derive(Clone)]
struct AppState {
    metrics: Arc<AgentMetrics>,
    health: Arc<HealthState>,
}

/// Build the `/health` + `/metrics` router. Mounted standalone, since this
/// surface is unauthenticated, unlike the Local HTTP API.
pub fn router(metrics: Arc<AgentMetrics>, health: Arc<HealthState>) -> Router {
    let state = AppState { metrics, health };
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    if state.health.is_degraded() {
        (StatusCode::SERVICE_UNAVAILABLE, "degraded")
    } else {
        (StatusCode::OK, "ok")
    }
}

async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    match state.metrics.render() {
        Ok(body) => (StatusCode::OK, body).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_state_starts_healthy_and_latches_degraded() {
        let health = HealthState::new();
        assert!(!health.is_degraded());
        health.mark_degraded();
        assert!(health.is_degraded());
    }

    #[test]
    fn metrics_render_includes_every_named_metric() {
        let metrics = AgentMetrics::new().expect("metrics");
        metrics.deployments_active.set(3);
        metrics.record_deploy_failure(ErrorCode::CrashLoop);

        let rendered = metrics.render().expect("render");
        assert!(rendered.contains("deployments_total"));
        assert!(rendered.contains("deployments_active"));
        assert!(rendered.contains("container_cpu_ratio"));
        assert!(rendered.contains("container_memory_bytes"));
        assert!(rendered.contains("build_duration_seconds"));
        assert!(rendered.contains("deploy_failures_total"));
        assert!(rendered.contains("CRASH_LOOP"));
    }
}
