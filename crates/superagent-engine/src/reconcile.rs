//! Reconciliation loop: a fixed background task that keeps the
//! registry honest against what the container runtime actually reports.
//!
//! New code; nothing in `shipper` runs a background reconciliation loop, but
//! the "spawn a background task, `select!` against a shutdown signal" shape
//! matches how `superagent_auth::TokenManager::spawn_refresh_worker` is
//! built, itself grounded on the same `tokio::time::interval` pattern.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use superagent_process::ContainerDriver;
use superagent_retry::crash_restart_delay;
use superagent_types::{DeploymentStatus, ErrorCode};

use crate::Engine;

const MAX_RESTARTS_PER_HOUR: u32 = 4;
const RESTART_WINDOW_KEY: &str = "restart_window_started_at";

/// Exit codes a crashed container plausibly produces from a transient
/// fault (OOM kill, a signal, a one-off panic) and is therefore worth an
/// automatic restart attempt. Anything else exited on purpose or in a way
/// a restart won't fix, so reconciliation leaves it alone for an operator.
const TRANSIENT_EXIT_CODES: [i32; 4] = [1, 137, 139, 143];

fn is_transient_exit(exit_code: Option<i32>) -> bool {
    exit_code.is_some_and(|code| TRANSIENT_EXIT_CODES.contains(&code))
}

/// Spawn the loop on its own task; it runs until `shutdown` fires.
pub fn spawn_reconciliation_loop(engine: Arc<Engine>, mut shutdown: tokio::sync::watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(engine.config.reconcile_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    engine.clone().reconcile_once().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    })
}

impl Engine {
    /// One sweep over every `running` deployment. Exited containers that
    /// exit with a transient-looking code get their restart dispatched onto
    /// its own task so one deployment's crash-restart backoff (up to two
    /// minutes) never delays reconciling the rest of the fleet this tick.
    pub async fn reconcile_once(self: Arc<Self>) {
        for deployment in self.registry.list() {
            if deployment.status != DeploymentStatus::Running {
                continue;
            }
            let Some(container_ref) = deployment.container_ref.clone() else {
                continue;
            };

            match self.driver.inspect(&container_ref).await {
                Ok(inspect) if inspect.running => {
                    // Healthy; nothing to reconcile.
                }
                Ok(inspect) if is_transient_exit(inspect.exit_code) => {
                    let engine = self.clone();
                    let id = deployment.id.clone();
                    let exit_code = inspect.exit_code;
                    tokio::spawn(async move {
                        engine.handle_exited_container(&id, &container_ref, exit_code).await;
                    });
                }
                Ok(inspect) => {
                    warn!(id = %deployment.id, exit_code = ?inspect.exit_code, "container exited with a non-transient code, leaving it for an operator");
                }
                Err(e) if e.kind == superagent_process::DriverErrorKind::UnknownRef => {
                    warn!(id = %deployment.id, "container lost; human confirmation required before recreating");
                    self.proxy.retract(&deployment.id);
                    self.fail_deployment(&deployment.id, ErrorCode::ContainerLost, "container no longer exists").await;
                }
                Err(e) => {
                    warn!(id = %deployment.id, error = %e, "reconciliation inspect failed, will retry next tick");
                }
            }
        }
    }

    async fn handle_exited_container(&self, id: &superagent_types::DeploymentId, container_ref: &str, exit_code: Option<i32>) {
        let deployment = match self.registry.get(id) {
            Some(d) => d,
            None => return,
        };

        let now = Utc::now();
        let window_started: DateTime<Utc> = deployment
            .metadata
            .get(RESTART_WINDOW_KEY)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or(now);
        let window_expired = now.signed_duration_since(window_started) > chrono::Duration::hours(1);

        let attempt = if window_expired { 1 } else { deployment.restart_attempts_this_hour + 1 };

        if attempt > MAX_RESTARTS_PER_HOUR {
            warn!(%id, "crash loop detected, giving up on automatic restart");
            self.proxy.retract(id);
            self.fail_deployment(id, ErrorCode::CrashLoop, format!("exceeded {MAX_RESTARTS_PER_HOUR} restarts within one hour")).await;
            return;
        }

        let _ = self
            .registry
            .update_with(id, |d| {
                d.restart_attempts_this_hour = attempt;
                d.metadata.insert(RESTART_WINDOW_KEY.to_string(), window_started.to_rfc3339());
                Ok(())
            })
            .await;

        let delay = crash_restart_delay(attempt);
        info!(%id, attempt, ?exit_code, ?delay, "restarting exited container");
        if let Err(e) = self
            .audit
            .emit(
                "DEPLOYMENT_RESTART_ATTEMPTED",
                true,
                &[("deployment_id", id.0.as_str()), ("attempt", attempt.to_string().as_str())],
            )
            .await
        {
            warn!(%id, error = %e, "failed to audit a restart attempt");
            self.health.mark_degraded();
        }
        tokio::time::sleep(delay).await;

        if let Err(e) = self.driver.start(container_ref).await {
            warn!(%id, error = %e, "restart attempt failed, will retry next tick");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restart_budget_allows_four_restarts_per_hour() {
        assert_eq!(MAX_RESTARTS_PER_HOUR, 4);
    }

    #[test]
    fn oom_kill_and_signal_exits_are_transient() {
        assert!(is_transient_exit(Some(137)));
        assert!(is_transient_exit(Some(139)));
        assert!(is_transient_exit(Some(143)));
        assert!(is_transient_exit(Some(1)));
    }

    #[test]
    fn a_clean_exit_or_unknown_code_is_not_transient() {
        assert!(!is_transient_exit(Some(0)));
        assert!(!is_transient_exit(Some(255)));
        assert!(!is_transient_exit(None));
    }
}
