//! Token Manager: owns the lifecycle of the single bearer token
//! this agent uses to talk to the control plane.
//!
//! Generalized from `shipper-auth`, which only ever resolves a token from
//! the environment or a credentials file and hands it back to the caller.
//! This agent's token is longer-lived and has its own lifecycle, so the
//! crate grows from "find a token" into "own a token": persist it through
//! [`superagent_store`], audit every mutation through [`superagent_audit`],
//! and signal when it's nearing expiry. This crate never fetches a
//! replacement token itself — it only ever signals that one is needed. The
//! actual HTTP call belongs to the control-plane client which owns the
//! credentials to make it.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rand::Rng;
use subtle::ConstantTimeEq;
use tokio::sync::{RwLock, mpsc, watch};
use tracing::{info, warn};

use superagent_audit::AuditLog;
use superagent_store::SecureStore;
pub use superagent_types::TokenInfo;

const STORE_KEY: &str = "tokens/current";

/// A signal emitted by the background worker. Carries no payload: the
/// receiver decides what a refresh means — the token manager signals only,
/// it never calls out on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenSignal {
    RefreshNeeded,
}

#[derive(Clone)]
struct CurrentToken {
    secret: String,
    info: TokenInfo,
}

/// Owns the live bearer token: its secret, its metadata, and the
/// refresh-needed signal. Safe to share behind an `Arc` across the HTTP API
/// (which validates incoming tokens) and the control-plane client (which
/// rotates them).
pub struct TokenManager {
    current: RwLock<Option<CurrentToken>>,
    store: SecureStore,
    audit: Arc<AuditLog>,
}

impl TokenManager {
    /// Construct a manager, loading any token persisted from a previous run.
    pub async fn load(store: SecureStore, audit: Arc<AuditLog>) -> Result<Self> {
        let manager = Self {
            current: RwLock::new(None),
            store,
            audit,
        };
        manager.hydrate_from_store().await?;
        Ok(manager)
    }

    async fn hydrate_from_store(&self) -> Result<()> {
        let Some(raw) = self.store.load(STORE_KEY).context("failed to load token from secure store")? else {
            return Ok(());
        };
        let stored: StoredToken =
            serde_json::from_slice(&raw).context("failed to parse persisted token")?;
        *self.current.write().await = Some(CurrentToken {
            secret: stored.secret,
            info: stored.info,
        });
        Ok(())
    }

    /// Return the live token's secret and metadata, if one is set and not
    /// past its hard expiry. Callers that only need to know whether a
    /// refresh is imminent should use [`TokenManager::info`] and
    /// [`TokenInfo::is_expired_at`] instead.
    pub async fn get(&self) -> Option<(String, TokenInfo)> {
        let guard = self.current.read().await;
        guard.as_ref().map(|t| (t.secret.clone(), t.info.clone()))
    }

    /// Metadata only, never the secret — safe to expose through the HTTP API.
    pub async fn info(&self) -> Option<TokenInfo> {
        self.current.read().await.as_ref().map(|t| t.info.clone())
    }

    /// Install a new token, persisting it and auditing the rotation. Each
    /// call mints a fresh `token_id` distinct from any prior one, even if the
    /// secret happens to repeat, so audit trails can distinguish rotations.
    pub async fn set(&self, secret: impl Into<String>, expires_at: DateTime<Utc>, scope: Vec<String>) -> Result<TokenInfo> {
        let secret = secret.into();
        let info = TokenInfo {
            token_id: new_token_id(),
            issued_at: Utc::now(),
            expires_at,
            scope,
        };

        let stored = StoredToken {
            secret: secret.clone(),
            info: info.clone(),
        };
        let encoded = serde_json::to_vec(&stored).context("failed to serialize token")?;
        self.store.store(STORE_KEY, &encoded).context("failed to persist token")?;

        *self.current.write().await = Some(CurrentToken { secret, info: info.clone() });

        self.audit
            .emit("TOKEN_SET", true, &[("token_id", &info.token_id)])
            .await
            .context("failed to audit token rotation")?;

        info!(token_id = %info.token_id, "token rotated");
        Ok(info)
    }

    /// Revoke the live token. Idempotent: revoking with nothing set still
    /// audits the attempt so operators can see it happened.
    pub async fn revoke(&self) -> Result<()> {
        let had_token = {
            let mut guard = self.current.write().await;
            let had = guard.is_some();
            *guard = None;
            had
        };
        self.store.delete(STORE_KEY).context("failed to delete persisted token")?;

        self.audit
            .emit("TOKEN_REVOKED", true, &[("had_token", &had_token.to_string())])
            .await
            .context("failed to audit token revocation")?;
        Ok(())
    }

    /// Constant-time validation of a bearer credential presented to the
    /// Local HTTP API, so response timing doesn't leak how many leading
    /// bytes matched.
    pub async fn validate(&self, candidate: &str) -> bool {
        let guard = self.current.read().await;
        let Some(current) = guard.as_ref() else {
            return false;
        };
        if current.info.is_expired_at(Utc::now()) {
            return false;
        }
        bool::from(current.secret.as_bytes().ct_eq(candidate.as_bytes()))
    }

    /// Spawn the background worker that checks the live token's expiry once
    /// a minute and emits [`TokenSignal::RefreshNeeded`] through `tx` when
    /// it's within the safety buffer. The worker never fetches a
    /// replacement itself — only the control-plane client, which holds the
    /// credentials to do so, acts on the signal.
    pub fn spawn_refresh_worker(
        self: Arc<Self>,
        tx: mpsc::Sender<TokenSignal>,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(60));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Some(info) = self.info().await
                            && info.is_expired_at(Utc::now())
                            && tx.send(TokenSignal::RefreshNeeded).await.is_err()
                        {
                            warn!("refresh signal receiver dropped, stopping token refresh worker");
                            return;
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            return;
                        }
                    }
                }
            }
        })
    }
}

#[derive(Clone, serde::Serialize, serde::Deserialize)]
struct StoredToken {
    secret: String,
    info: TokenInfo,
}

fn new_token_id() -> String {
    let mut bytes = [0u8; 16];
    rand::rng().fill(&mut bytes);
    format!("tok-{}", hex::encode(bytes))
}
