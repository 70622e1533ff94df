//! The response envelope every route returns: `{status, data | error}` on
//! success or failure.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use superagent_types::{AgentError, ErrorCode};

#[derive(Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
enum Envelope<T> {
    Success { data: T },
    Error { error: ErrorBody },
}

#[derive(Serialize)]
struct ErrorBody {
    code: ErrorCode,
    message: String,
}

/// Wrap a successful payload in the envelope with the given HTTP status.
pub fn ok<T: Serialize>(status: StatusCode, data: T) -> Response {
    (status, Json(Envelope::Success { data })).into_response()
}

/// Wrap an [`AgentError`] in the envelope, mapping its code to an HTTP status.
pub fn err(e: AgentError) -> Response {
    let status = http_status_for(e.code);
    (
        status,
        Json(Envelope::<()>::Error {
            error: ErrorBody { code: e.code, message: e.message },
        }),
    )
        .into_response()
}

fn http_status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::BadRequest | ErrorCode::CatalogUnknown => StatusCode::BAD_REQUEST,
        ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
        ErrorCode::Forbidden => StatusCode::FORBIDDEN,
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Conflict => StatusCode::CONFLICT,
        ErrorCode::ResourceUnavailable | ErrorCode::ResourceExhausted => StatusCode::SERVICE_UNAVAILABLE,
        ErrorCode::SourceUnavailable
        | ErrorCode::RegistryBlocked
        | ErrorCode::BuildFailed
        | ErrorCode::CreateFailed
        | ErrorCode::HealthCheckFailed
        | ErrorCode::CrashLoop
        | ErrorCode::ContainerLost
        | ErrorCode::RoutePublishFailed
        | ErrorCode::Cancelled
        | ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_maps_to_404() {
        assert_eq!(http_status_for(ErrorCode::NotFound), StatusCode::NOT_FOUND);
    }

    #[test]
    fn crash_loop_maps_to_500() {
        assert_eq!(http_status_for(ErrorCode::CrashLoop), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
