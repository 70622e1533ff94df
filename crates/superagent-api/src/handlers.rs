//! Route handlers for the Local HTTP API.

use std::collections::BTreeMap;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::Response;
use axum::Json;
use serde::{Deserialize, Serialize};

use superagent_engine::CreateRequest;
use superagent_process::ContainerDriver;
use superagent_types::{AgentError, DeploymentId, ErrorCode};

use crate::auth::Authed;
use crate::envelope;
use crate::ApiState;

fn bearer_token(authed: &Authed) -> Option<&str> {
    let _ = authed;
    // The bearer credential itself never leaves the Token Manager; the
    // source fetcher's auth_token parameter is for upstream git/registry
    // credentials, which this daemon does not derive from the caller's
    // control-plane token.
    None
}

#[derive(Deserialize)]
pub struct CreateDeploymentBody {
    pub app_id: String,
    pub version: String,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

pub async fn create_deployment(State(state): State<ApiState>, authed: Authed, Json(body): Json<CreateDeploymentBody>) -> Response {
    if let Err(r) = authed.require("deployments:write") {
        return r;
    }

    let result = state
        .engine
        .create(CreateRequest {
            app_id: body.app_id.clone(),
            version: body.version.clone(),
            env_overrides: body.env,
            metadata: body.metadata,
            auth_token: bearer_token(&authed).map(str::to_string),
        })
        .await;

    match result {
        Ok(deployment) => match state.audit_mutation("DEPLOYMENT_CREATE_REQUESTED", &authed.0.token_id, &deployment.id).await {
            Ok(()) => envelope::ok(StatusCode::CREATED, deployment),
            Err(e) => envelope::err(e),
        },
        Err(e) => envelope::err(e),
    }
}

pub async fn list_deployments(State(state): State<ApiState>, authed: Authed) -> Response {
    if let Err(r) = authed.require("deployments:read") {
        return r;
    }
    envelope::ok(StatusCode::OK, state.engine.registry().list())
}

pub async fn get_deployment(State(state): State<ApiState>, authed: Authed, Path(id): Path<String>) -> Response {
    if let Err(r) = authed.require("deployments:read") {
        return r;
    }
    match state.engine.registry().get(&DeploymentId(id.clone())) {
        Some(deployment) => envelope::ok(StatusCode::OK, deployment),
        None => envelope::err(AgentError::new(ErrorCode::NotFound, format!("no such deployment: {id}"))),
    }
}

pub async fn delete_deployment(State(state): State<ApiState>, authed: Authed, Path(id): Path<String>) -> Response {
    if let Err(r) = authed.require("deployments:write") {
        return r;
    }
    let id = DeploymentId(id);
    match state.engine.delete(&id).await {
        Ok(()) => match state.audit_mutation("DEPLOYMENT_DELETE_REQUESTED", &authed.0.token_id, &id).await {
            Ok(()) => envelope::ok(StatusCode::OK, serde_json::json!({ "id": id.0 })),
            Err(e) => envelope::err(e),
        },
        Err(e) => envelope::err(e),
    }
}

pub async fn stop_deployment(State(state): State<ApiState>, authed: Authed, Path(id): Path<String>) -> Response {
    if let Err(r) = authed.require("deployments:write") {
        return r;
    }
    let id = DeploymentId(id);
    match state.engine.stop(&id).await {
        Ok(()) => match state.audit_mutation("DEPLOYMENT_STOP_REQUESTED", &authed.0.token_id, &id).await {
            Ok(()) => envelope::ok(StatusCode::OK, state.engine.registry().get(&id)),
            Err(e) => envelope::err(e),
        },
        Err(e) => envelope::err(e),
    }
}

pub async fn start_deployment(State(state): State<ApiState>, authed: Authed, Path(id): Path<String>) -> Response {
    if let Err(r) = authed.require("deployments:write") {
        return r;
    }
    let id = DeploymentId(id);
    match state.engine.start(&id, bearer_token(&authed)).await {
        Ok(outcome) => match state.audit_mutation("DEPLOYMENT_START_REQUESTED", &authed.0.token_id, &id).await {
            Ok(()) => envelope::ok(StatusCode::OK, serde_json::json!({ "outcome": format!("{outcome:?}") })),
            Err(e) => envelope::err(e),
        },
        Err(e) => envelope::err(e),
    }
}

#[derive(Deserialize)]
pub struct RedeployBody {
    pub version: String,
}

pub async fn redeploy_deployment(State(state): State<ApiState>, authed: Authed, Path(id): Path<String>, Json(body): Json<RedeployBody>) -> Response {
    if let Err(r) = authed.require("deployments:write") {
        return r;
    }
    let id = DeploymentId(id);
    let Some(deployment) = state.engine.registry().get(&id) else {
        return envelope::err(AgentError::new(ErrorCode::NotFound, format!("no such deployment: {id}")));
    };
    let Some(catalog_entry) = state.engine.catalog_lookup(&deployment.app_id, &body.version) else {
        return envelope::err(AgentError::new(ErrorCode::CatalogUnknown, format!("no catalog entry for {}@{}", deployment.app_id, body.version)));
    };

    match state.engine.redeploy(&id, &catalog_entry, bearer_token(&authed)).await {
        Ok(outcome) => match state.audit_mutation("DEPLOYMENT_REDEPLOY_REQUESTED", &authed.0.token_id, &id).await {
            Ok(()) => envelope::ok(StatusCode::OK, serde_json::json!({ "outcome": format!("{outcome:?}") })),
            Err(e) => envelope::err(e),
        },
        Err(e) => envelope::err(e),
    }
}

#[derive(Deserialize)]
pub struct LogsQuery {
    tail: Option<usize>,
    #[serde(default)]
    follow: bool,
    #[serde(default)]
    stream: Option<String>,
}

#[derive(Serialize)]
struct LogsResponse {
    lines: String,
    truncated_follow: bool,
}

pub async fn deployment_logs(State(state): State<ApiState>, authed: Authed, Path(id): Path<String>, Query(query): Query<LogsQuery>) -> Response {
    if let Err(r) = authed.require("deployments:read") {
        return r;
    }

    if query.stream.as_deref() == Some("build") {
        return envelope::err(AgentError::new(ErrorCode::BadRequest, "build logs are not retained past the build step; request stream=runtime"));
    }

    let Some(deployment) = state.engine.registry().get(&DeploymentId(id.clone())) else {
        return envelope::err(AgentError::new(ErrorCode::NotFound, format!("no such deployment: {id}")));
    };
    let Some(container_ref) = deployment.container_ref else {
        return envelope::err(AgentError::new(ErrorCode::NotFound, "deployment has no running container to read logs from"));
    };

    match state.engine.driver().logs(&container_ref, query.tail).await {
        // `follow` has no effect: the driver returns a point-in-time
        // snapshot, not a stream. A follow-capable tail would need a
        // streaming primitive on ContainerDriver this agent does not have.
        Ok(lines) => envelope::ok(StatusCode::OK, LogsResponse { lines, truncated_follow: query.follow }),
        Err(e) => envelope::err(AgentError::new(ErrorCode::Internal, e.to_string())),
    }
}

#[derive(Serialize)]
struct StatusResponse {
    deployments_total: usize,
    deployments_active: usize,
    degraded: bool,
}

pub async fn agent_status(State(state): State<ApiState>, authed: Authed) -> Response {
    if let Err(r) = authed.require("deployments:read") {
        return r;
    }
    let deployments = state.engine.registry().list();
    let active = deployments.iter().filter(|d| !d.status.is_terminal()).count();
    envelope::ok(
        StatusCode::OK,
        StatusResponse {
            deployments_total: deployments.len(),
            deployments_active: active,
            degraded: state.health.is_degraded(),
        },
    )
}

pub async fn not_found() -> Response {
    envelope::err(AgentError::new(ErrorCode::NotFound, "no such route"))
}
