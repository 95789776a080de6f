// ABOUTME: Rollback of reversible failover steps and operator remediation text
// ABOUTME: Undo runs in reverse order and only ever before the standby is promoted

use super::orchestrator::{FailoverOrchestrator, FailoverPlan, Progress};
use super::run::{FailoverRun, Step, StepResult};
use super::state::FailoverState;
use crate::error::{FailoverError, Result};
use crate::replication::ChannelState;
use crate::utils::retry_with_backoff;

impl FailoverOrchestrator {
    /// Undo completed reversible steps, newest first. Returns false when any
    /// undo failed; the manual fix is added to the run's remediation.
    pub(super) async fn rollback(&self, run: &mut FailoverRun, progress: &Progress) -> bool {
        if run.state().is_past_point_of_no_return() {
            tracing::error!("Refusing to roll back from {}", run.state());
            return false;
        }
        tracing::warn!("Rolling back from {}", run.state());
        let mut clean = true;
        // Set when clients must stay held: the proxy may point at the
        // standby or the primary may still be read-only.
        let mut hold_proxy: Vec<String> = Vec::new();

        if progress.proxy_paused {
            if let Some((host, port)) = &progress.original_upstream {
                let restored = match self.proxy.routes_to(host, Some(*port)).await {
                    Ok(true) => None,
                    Ok(false) => Some(self.restore_upstream(host, *port).await),
                    Err(e) => Some(Err(e)),
                };
                if let Some(result) = restored {
                    if !self.undo(run, Step::RestoreUpstream, result).await {
                        clean = false;
                        hold_proxy.push(format!("point the proxy back at {}:{}", host, port));
                    }
                }
            }
        }

        if progress.promote_attempted {
            let resumed = match self.replication.state().await {
                Ok(ChannelState::Disabled) => {
                    Some(self.replication.resume().await.map(|snapshot| {
                        tracing::info!(
                            "Replication channel resumed; lag {:?} bytes",
                            snapshot.lag_bytes
                        );
                    }))
                }
                Ok(_) => None,
                Err(e) => Some(Err(e)),
            };
            if let Some(result) = resumed {
                clean &= self.undo(run, Step::ResumeChannel, result).await;
            }
        }

        let frozen_states = [FailoverState::SequencesSynced, FailoverState::PrimaryFrozen];
        if progress.primary_frozen {
            let result = retry_with_backoff(
                || self.primary.set_read_only(false),
                self.plan.retry,
                "unfreeze primary",
            )
            .await;
            if !self.undo(run, Step::UnfreezePrimary, result).await {
                clean = false;
                hold_proxy.push(format!("clear read-only on {}", self.plan.primary.name));
            }
        } else if frozen_states.contains(&run.state()) {
            let state = FailoverState::ProxyPaused;
            self.record(
                run,
                StepResult::skipped(Step::UnfreezePrimary, state, "primary was not frozen"),
            )
            .await;
        }

        if progress.proxy_paused {
            if hold_proxy.is_empty() {
                let result = self.proxy.resume().await;
                clean &= self.undo(run, Step::ReleaseProxy, result).await;
            } else {
                let pending = hold_proxy.join(" and ");
                tracing::error!("Leaving {} paused; first {}", self.proxy.target(), pending);
                let state = run.state();
                self.record(
                    run,
                    StepResult::skipped(
                        Step::ReleaseProxy,
                        state,
                        format!("clients held; first {}", pending),
                    ),
                )
                .await;
                if let Err(e) = run.add_remediation(vec![format!(
                    "{}, then let clients through: pg-failover proxy resume",
                    capitalize(&pending)
                )]) {
                    tracing::error!("Run record rejected remediation: {}", e);
                }
            }
        }

        clean
    }

    async fn restore_upstream(&self, host: &str, port: u16) -> Result<()> {
        self.proxy.set_upstream(host, Some(port)).await?;
        self.proxy.reload().await
    }

    async fn undo(&self, run: &mut FailoverRun, step: Step, result: Result<()>) -> bool {
        match result {
            Ok(()) => {
                let state = undo_target(step, run.state());
                self.record(run, StepResult::success(step, state)).await;
                true
            }
            Err(e) => {
                self.fail(run, step, &e).await;
                let manual = undo_remediation(&self.plan, step, run.original_upstream());
                if let Err(e) = run.add_remediation(manual) {
                    tracing::error!("Run record rejected remediation: {}", e);
                }
                false
            }
        }
    }
}

/// State the machine steps back to when `step` is undone from `current`.
fn undo_target(step: Step, current: FailoverState) -> FailoverState {
    match (step, current) {
        (Step::UnfreezePrimary, FailoverState::SequencesSynced | FailoverState::PrimaryFrozen) => {
            FailoverState::ProxyPaused
        }
        (Step::ReleaseProxy, FailoverState::ProxyPaused) => FailoverState::Idle,
        _ => current,
    }
}

fn undo_remediation(plan: &FailoverPlan, step: Step, original_upstream: Option<&str>) -> Vec<String> {
    match step {
        Step::RestoreUpstream => {
            let primary_port = plan.primary.port.to_string();
            let (host, port) = original_upstream
                .and_then(|upstream| upstream.rsplit_once(':'))
                .unwrap_or((plan.primary.host.as_str(), primary_port.as_str()));
            vec![format!(
                "Point the proxy back at the original primary: pg-failover proxy set-upstream {} --port {} && pg-failover proxy reload",
                host, port
            )]
        }
        Step::ResumeChannel => vec![format!(
            "Re-enable replication to {}: pg-failover channel resume",
            plan.standby.name
        )],
        Step::UnfreezePrimary => vec![format!(
            "Make {} writable again: ALTER SYSTEM SET default_transaction_read_only = off; SELECT pg_reload_conf();",
            plan.primary.name
        )],
        Step::ReleaseProxy => {
            vec!["Let clients through: pg-failover proxy resume".to_string()]
        }
        _ => Vec::new(),
    }
}

/// Next actions for a run rejected before anything was changed.
pub(super) fn abort_remediation(plan: &FailoverPlan, error: &FailoverError) -> Vec<String> {
    let mut steps = vec!["Nothing was changed.".to_string()];
    match error {
        FailoverError::Precondition { remediation, .. } => steps.push(capitalize(remediation)),
        FailoverError::AlreadyRunning { .. } => steps.push(
            "Wait for the other failover to finish; check `pg-failover runs list`".to_string(),
        ),
        FailoverError::Connectivity { target, .. } => steps.push(format!(
            "Restore connectivity to {} and re-run `pg-failover failover`",
            target
        )),
        _ => steps.push(format!(
            "Inspect `pg-failover status` for {} and {}, then re-run `pg-failover failover`",
            plan.primary.name, plan.standby.name
        )),
    }
    steps
}

/// Summary after a rollback. `cause` is `None` for an operator cancellation.
pub(super) fn rollback_remediation(
    plan: &FailoverPlan,
    state: FailoverState,
    cause: Option<&FailoverError>,
    clean: bool,
) -> Vec<String> {
    let mut steps = Vec::new();
    if clean {
        steps.push(format!(
            "Rolled back to {}: {} is writable and the proxy routes to it.",
            state, plan.primary.name
        ));
    } else {
        steps.push(format!(
            "Rollback incomplete at {}: apply the steps above before serving traffic.",
            state
        ));
    }
    steps.push(format!(
        "Standby sequences on {} stay advanced; this is harmless.",
        plan.standby.name
    ));
    match cause {
        Some(FailoverError::Precondition { remediation, .. }) => {
            steps.push(capitalize(remediation))
        }
        Some(e) => steps.push(format!(
            "Fix the cause ({}) and re-run `pg-failover failover`",
            e
        )),
        None => steps.push("Cancelled by operator; re-run `pg-failover failover` when ready".to_string()),
    }
    steps
}

/// Manual steps to finish a failover that stopped after the standby was promoted.
pub(super) fn forward_remediation(
    plan: &FailoverPlan,
    progress: &Progress,
    error: &FailoverError,
) -> Vec<String> {
    let mut steps = vec![format!(
        "{} has been promoted; do not roll back to {}.",
        plan.standby.name, plan.primary.name
    )];
    if let FailoverError::IrreversibleStep { remediation, .. } = error {
        steps.extend(remediation.iter().cloned());
    }
    steps.push(format!(
        "Point the proxy at the new primary: pg-failover proxy set-upstream {} --port {} && pg-failover proxy reload",
        plan.standby.host, plan.standby.port
    ));
    steps.push("Let clients through: pg-failover proxy resume".to_string());
    if progress.slot_left_on_primary {
        steps.push(orphaned_slot_remediation(plan));
    }
    if progress.primary_frozen {
        steps.push(format!(
            "Keep {} read-only and out of the proxy; it no longer receives replicated writes.",
            plan.primary.name
        ));
    }
    steps
}

/// The replication slot was detached from the subscription and still holds WAL on the old primary.
pub(super) fn orphaned_slot_remediation(plan: &FailoverPlan) -> String {
    format!(
        "Once {} is reachable, drop the orphaned slot: SELECT pg_drop_replication_slot('{}');",
        plan.primary.name,
        plan.channel.slot_name()
    )
}

fn capitalize(text: &str) -> String {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ChannelConfig, RetryPolicy, Thresholds};
    use crate::health::{Node, Role};

    fn plan() -> FailoverPlan {
        let node = |name: &str, role| Node {
            name: name.to_string(),
            role,
            host: format!("{}.internal", name),
            port: 5432,
        };
        FailoverPlan {
            primary: node("db-a", Role::Primary),
            standby: node("db-b", Role::Standby),
            channel: ChannelConfig {
                publication: "failover_pub".to_string(),
                subscription: "failover_sub".to_string(),
                slot: None,
            },
            thresholds: Thresholds::default(),
            retry: RetryPolicy::none(),
        }
    }

    #[test]
    fn test_undo_target_steps_back() {
        assert_eq!(
            undo_target(Step::UnfreezePrimary, FailoverState::SequencesSynced),
            FailoverState::ProxyPaused
        );
        assert_eq!(
            undo_target(Step::ReleaseProxy, FailoverState::ProxyPaused),
            FailoverState::Idle
        );
        assert_eq!(
            undo_target(Step::ResumeChannel, FailoverState::SequencesSynced),
            FailoverState::SequencesSynced
        );
    }

    #[test]
    fn test_forward_remediation_mentions_orphaned_slot() {
        let progress = Progress {
            slot_left_on_primary: true,
            ..Progress::default()
        };
        let error = FailoverError::command("pgbouncer", "RELOAD failed");
        let steps = forward_remediation(&plan(), &progress, &error);
        assert!(steps.iter().any(|s| s.contains("pg_drop_replication_slot('failover_sub')")));
        assert!(steps
            .iter()
            .any(|s| s.contains("proxy set-upstream db-b.internal --port 5432")));
    }

    #[test]
    fn test_abort_remediation_uses_precondition_hint() {
        let error = FailoverError::precondition("lag too high", "wait for the standby");
        let steps = abort_remediation(&plan(), &error);
        assert_eq!(steps[0], "Nothing was changed.");
        assert_eq!(steps[1], "Wait for the standby");
    }
}
