//! The shape of one audit-log entry. Kept in `superagent-types` (not
//! `superagent-audit`) so every component that emits audit events can depend
//! on the type without depending on the file-writing machinery, the same
//! split used for `PublishEvent` (`shipper-types`) vs. the `EventLog` writer
//! (`shipper-events`).

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Upper-snake-case event kind, e.g. `DEPLOYMENT_CREATED`, `TOKEN_SET`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditKind(pub String);

impl AuditKind {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }
}

impl std::fmt::Display for AuditKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub kind: AuditKind,
    pub success: bool,
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
}

impl AuditEntry {
    pub fn new(kind: impl Into<String>, success: bool, timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            kind: AuditKind::new(kind),
            success,
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }
}
