//! Bearer token metadata shared between the Token Manager and the HTTP API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Token metadata without the secret value — what `TokenManager::info()` returns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenInfo {
    pub token_id: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub scope: Vec<String>,
}

impl TokenInfo {
    /// A token is treated as expired 5 minutes before its stated
    /// `expires_at`, as a safety buffer.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        let buffer = chrono::Duration::minutes(5);
        now >= self.expires_at - buffer
    }

    pub fn has_scope(&self, required: &str) -> bool {
        self.scope.iter().any(|s| s == "*" || s == required)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(expires_at: DateTime<Utc>, scope: &[&str]) -> TokenInfo {
        TokenInfo {
            token_id: "tok-1".into(),
            issued_at: expires_at - chrono::Duration::hours(2),
            expires_at,
            scope: scope.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn expires_five_minutes_early() {
        let expires_at = DateTime::parse_from_rfc3339("2026-01-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let t = info(expires_at, &["deployments:read"]);

        let four_min_before = expires_at - chrono::Duration::minutes(4);
        assert!(t.is_expired_at(four_min_before));

        let six_min_before = expires_at - chrono::Duration::minutes(6);
        assert!(!t.is_expired_at(six_min_before));
    }

    #[test]
    fn wildcard_scope_matches_anything() {
        let expires_at = Utc::now() + chrono::Duration::hours(1);
        let t = info(expires_at, &["*"]);
        assert!(t.has_scope("deployments:write"));
        assert!(t.has_scope("anything"));
    }

    #[test]
    fn missing_scope_is_rejected() {
        let expires_at = Utc::now() + chrono::Duration::hours(1);
        let t = info(expires_at, &["deployments:read"]);
        assert!(!t.has_scope("deployments:write"));
    }
}
