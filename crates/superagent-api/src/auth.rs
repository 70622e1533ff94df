//! Bearer-token extraction for every route in this API: bearer auth via the
//! token manager, with a scope check per route.
//!
//! `superagent_auth::TokenManager::validate` only checks the secret; scope
//! enforcement lives here, against the `TokenInfo` the same manager already
//! tracks, so each handler declares the scope it needs next to the route
//! rather than threading it through a generic middleware parameter.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::response::Response;

use superagent_types::{ErrorCode, TokenInfo};

use crate::envelope;
use crate::ApiState;

/// The token that authenticated this request, extracted once per handler.
pub struct Authed(pub TokenInfo);

impl FromRequestParts<ApiState> for Authed {
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, state: &ApiState) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(unauthorized)?;
        let candidate = header.strip_prefix("Bearer ").ok_or_else(unauthorized)?;

        if !state.tokens.validate(candidate).await {
            return Err(unauthorized());
        }
        let info = state.tokens.info().await.ok_or_else(unauthorized)?;
        Ok(Authed(info))
    }
}

fn unauthorized() -> Response {
    envelope::err(superagent_types::AgentError::new(ErrorCode::Unauthorized, "missing or invalid bearer token"))
}

impl Authed {
    /// Reject the request with `FORBIDDEN` unless the token carries `scope`.
    pub fn require(&self, scope: &str) -> Result<(), Response> {
        if self.0.has_scope(scope) {
            Ok(())
        } else {
            Err(envelope::err(superagent_types::AgentError::new(ErrorCode::Forbidden, format!("token lacks required scope: {scope}"))))
        }
    }
}
