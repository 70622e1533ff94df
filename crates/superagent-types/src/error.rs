//! Stable error codes shared by the engine, the audit log, and the HTTP API.
//!
//! The codes are the taxonomy from the deployment engine's failure model
//! plus the generic HTTP-facing codes. They are deliberately `snake_case`
//! free of punctuation so they can be used verbatim as Prometheus label
//! values and JSON envelope `error.code` fields.

use serde::{Deserialize, Serialize};

/// A stable, user-facing error with a machine-checkable `code`.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct AgentError {
    pub code: ErrorCode,
    pub message: String,
}

impl AgentError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }
}

/// Stable error/failure-reason codes covering deployment failure reasons
/// plus generic request errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    CatalogUnknown,
    SourceUnavailable,
    RegistryBlocked,
    BuildFailed,
    CreateFailed,
    HealthCheckFailed,
    CrashLoop,
    ContainerLost,
    ResourceUnavailable,
    ResourceExhausted,
    RoutePublishFailed,
    Cancelled,
    BadRequest,
    Unauthorized,
    Forbidden,
    NotFound,
    Conflict,
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::CatalogUnknown => "CATALOG_UNKNOWN",
            ErrorCode::SourceUnavailable => "SOURCE_UNAVAILABLE",
            ErrorCode::RegistryBlocked => "REGISTRY_BLOCKED",
            ErrorCode::BuildFailed => "BUILD_FAILED",
            ErrorCode::CreateFailed => "CREATE_FAILED",
            ErrorCode::HealthCheckFailed => "HEALTH_CHECK_FAILED",
            ErrorCode::CrashLoop => "CRASH_LOOP",
            ErrorCode::ContainerLost => "CONTAINER_LOST",
            ErrorCode::ResourceUnavailable => "RESOURCE_UNAVAILABLE",
            ErrorCode::ResourceExhausted => "RESOURCE_EXHAUSTED",
            ErrorCode::RoutePublishFailed => "ROUTE_PUBLISH_FAILED",
            ErrorCode::Cancelled => "CANCELLED",
            ErrorCode::BadRequest => "BAD_REQUEST",
            ErrorCode::Unauthorized => "UNAUTHORIZED",
            ErrorCode::Forbidden => "FORBIDDEN",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::Conflict => "CONFLICT",
            ErrorCode::Internal => "INTERNAL",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
