// ABOUTME: FailoverRun - the auditable record of one failover invocation
// ABOUTME: Append-only; every mutation after the outcome is recorded returns an error

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::state::{self, FailoverState};
use crate::error::{ErrorKind, FailoverError, Result};
use crate::health::{HealthReport, Node};
use crate::sequences::SequenceOutcome;

/// A unit of work the orchestrator performs, in the order it performs them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    Preflight,
    AcquireLock,
    PauseProxy,
    FreezePrimary,
    SyncSequences,
    PromoteStandby,
    SwapUpstream,
    ResumeProxy,
    Complete,
    RestoreUpstream,
    ResumeChannel,
    UnfreezePrimary,
    ReleaseProxy,
}

impl Step {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Preflight => "preflight",
            Self::AcquireLock => "acquire_lock",
            Self::PauseProxy => "pause_proxy",
            Self::FreezePrimary => "freeze_primary",
            Self::SyncSequences => "sync_sequences",
            Self::PromoteStandby => "promote_standby",
            Self::SwapUpstream => "swap_upstream",
            Self::ResumeProxy => "resume_proxy",
            Self::Complete => "complete",
            Self::RestoreUpstream => "rollback_restore_upstream",
            Self::ResumeChannel => "rollback_resume_channel",
            Self::UnfreezePrimary => "rollback_unfreeze_primary",
            Self::ReleaseProxy => "rollback_resume_proxy",
        }
    }

    /// State reached when this forward step succeeds.
    pub fn target_state(&self) -> Option<FailoverState> {
        match self {
            Self::PauseProxy => Some(FailoverState::ProxyPaused),
            Self::FreezePrimary => Some(FailoverState::PrimaryFrozen),
            Self::SyncSequences => Some(FailoverState::SequencesSynced),
            Self::PromoteStandby => Some(FailoverState::StandbyPromoted),
            Self::SwapUpstream => Some(FailoverState::UpstreamSwapped),
            Self::ResumeProxy => Some(FailoverState::ProxyResumed),
            Self::Complete => Some(FailoverState::Complete),
            _ => None,
        }
    }

    pub fn is_rollback(&self) -> bool {
        matches!(
            self,
            Self::RestoreUpstream | Self::ResumeChannel | Self::UnfreezePrimary | Self::ReleaseProxy
        )
    }
}

impl std::fmt::Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Success,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub step: Step,
    pub status: StepStatus,
    pub timestamp: DateTime<Utc>,
    /// Machine state after the step
    pub state: FailoverState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

impl StepResult {
    pub fn success(step: Step, state: FailoverState) -> Self {
        Self {
            step,
            status: StepStatus::Success,
            timestamp: Utc::now(),
            state,
            detail: None,
            error: None,
            error_kind: None,
        }
    }

    pub fn skipped(step: Step, state: FailoverState, detail: impl Into<String>) -> Self {
        Self {
            status: StepStatus::Skipped,
            detail: Some(detail.into()),
            ..Self::success(step, state)
        }
    }

    pub fn failed(step: Step, state: FailoverState, error: &FailoverError) -> Self {
        Self {
            status: StepStatus::Failed,
            error: Some(error.to_string()),
            error_kind: Some(error.kind()),
            ..Self::success(step, state)
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Success,
    RolledBack,
    Aborted,
}

impl RunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::RolledBack => "rolled_back",
            Self::Aborted => "aborted",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunOptions {
    /// Proceed without freezing the primary when it is unreachable
    pub skip_freeze: bool,
    pub dry_run: bool,
    /// Promote even when lag exceeds the threshold or is unknown
    pub force: bool,
}

/// What an operator needs after a run that did not complete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbortReport {
    pub last_state: FailoverState,
    pub failed_step: Option<Step>,
    pub error: Option<String>,
    pub remediation: Vec<String>,
}

/// Record of a single failover invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailoverRun {
    id: Uuid,
    started_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    primary: Node,
    standby: Node,
    options: RunOptions,
    state: FailoverState,
    steps: Vec<StepResult>,
    outcome: Option<RunOutcome>,
    degraded: bool,
    original_upstream: Option<String>,
    lag_at_freeze: Option<u64>,
    health: Vec<HealthReport>,
    sequences: Vec<SequenceOutcome>,
    failed_step: Option<Step>,
    error: Option<String>,
    remediation: Vec<String>,
}

impl FailoverRun {
    pub fn new(primary: Node, standby: Node, options: RunOptions) -> Self {
        Self {
            id: Uuid::new_v4(),
            started_at: Utc::now(),
            completed_at: None,
            primary,
            standby,
            options,
            state: FailoverState::Idle,
            steps: Vec::new(),
            outcome: None,
            degraded: false,
            original_upstream: None,
            lag_at_freeze: None,
            health: Vec::new(),
            sequences: Vec::new(),
            failed_step: None,
            error: None,
            remediation: Vec::new(),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        match self.outcome {
            Some(outcome) => Err(FailoverError::conflict(format!(
                "run {} already finished ({})",
                self.id,
                outcome.as_str()
            ))),
            None => Ok(()),
        }
    }

    /// Append a step. Successful forward steps advance the machine through
    /// the transition table.
    pub fn record(&mut self, step: StepResult) -> Result<()> {
        self.ensure_open()?;
        if step.state != self.state {
            state::transition(self.state, step.state)?;
            self.state = step.state;
        }
        if step.status == StepStatus::Failed && !step.step.is_rollback() && self.failed_step.is_none() {
            self.failed_step = Some(step.step);
            self.error = step.error.clone();
        }
        self.steps.push(step);
        Ok(())
    }

    pub fn set_original_upstream(&mut self, upstream: impl Into<String>) -> Result<()> {
        self.ensure_open()?;
        self.original_upstream = Some(upstream.into());
        Ok(())
    }

    pub fn set_lag_at_freeze(&mut self, lag: Option<u64>) -> Result<()> {
        self.ensure_open()?;
        self.lag_at_freeze = lag;
        Ok(())
    }

    pub fn add_health(&mut self, report: HealthReport) -> Result<()> {
        self.ensure_open()?;
        self.health.push(report);
        Ok(())
    }

    pub fn set_sequences(&mut self, ledger: Vec<SequenceOutcome>) -> Result<()> {
        self.ensure_open()?;
        self.sequences = ledger;
        Ok(())
    }

    pub fn add_remediation(&mut self, steps: impl IntoIterator<Item = String>) -> Result<()> {
        self.ensure_open()?;
        self.remediation.extend(steps);
        Ok(())
    }

    /// Record the outcome. The run is read-only afterwards.
    pub fn finish(&mut self, outcome: RunOutcome, degraded: bool) -> Result<()> {
        self.ensure_open()?;
        self.outcome = Some(outcome);
        self.degraded = degraded;
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    pub fn primary(&self) -> &Node {
        &self.primary
    }

    pub fn standby(&self) -> &Node {
        &self.standby
    }

    pub fn options(&self) -> RunOptions {
        self.options
    }

    pub fn state(&self) -> FailoverState {
        self.state
    }

    pub fn steps(&self) -> &[StepResult] {
        &self.steps
    }

    pub fn outcome(&self) -> Option<RunOutcome> {
        self.outcome
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    pub fn original_upstream(&self) -> Option<&str> {
        self.original_upstream.as_deref()
    }

    /// Slot lag observed at the freeze point; the data-loss estimate.
    pub fn lag_at_freeze(&self) -> Option<u64> {
        self.lag_at_freeze
    }

    pub fn health(&self) -> &[HealthReport] {
        &self.health
    }

    pub fn sequences(&self) -> &[SequenceOutcome] {
        &self.sequences
    }

    pub fn remediation(&self) -> &[String] {
        &self.remediation
    }

    pub fn step(&self, step: Step) -> Option<&StepResult> {
        self.steps.iter().find(|s| s.step == step)
    }

    fn succeeded_at(&self, step: Step) -> Option<DateTime<Utc>> {
        self.steps
            .iter()
            .find(|s| s.step == step && s.status == StepStatus::Success)
            .map(|s| s.timestamp)
    }

    /// Client-visible downtime: from the proxy pause to the proxy resume.
    pub fn rto(&self) -> Option<chrono::Duration> {
        let paused = self.succeeded_at(Step::PauseProxy)?;
        let resumed = self.succeeded_at(Step::ResumeProxy)?;
        Some(resumed - paused)
    }

    /// `None` while running and for completed runs.
    pub fn abort_report(&self) -> Option<AbortReport> {
        match self.outcome? {
            RunOutcome::Success => None,
            RunOutcome::RolledBack | RunOutcome::Aborted => Some(AbortReport {
                last_state: self.state,
                failed_step: self.failed_step,
                error: self.error.clone(),
                remediation: self.remediation.clone(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::Role;

    fn run() -> FailoverRun {
        let node = |name: &str, role| Node {
            name: name.to_string(),
            role,
            host: format!("{}.internal", name),
            port: 5432,
        };
        FailoverRun::new(
            node("db-a", Role::Primary),
            node("db-b", Role::Standby),
            RunOptions {
                skip_freeze: false,
                dry_run: false,
                force: false,
            },
        )
    }

    #[test]
    fn test_record_advances_state() {
        let mut run = run();
        run.record(StepResult::success(Step::Preflight, FailoverState::Idle))
            .unwrap();
        run.record(StepResult::success(Step::PauseProxy, FailoverState::ProxyPaused))
            .unwrap();
        assert_eq!(run.state(), FailoverState::ProxyPaused);
        assert_eq!(run.steps().len(), 2);
    }

    #[test]
    fn test_record_rejects_illegal_transition() {
        let mut run = run();
        let err = run
            .record(StepResult::success(
                Step::PromoteStandby,
                FailoverState::StandbyPromoted,
            ))
            .unwrap_err();
        assert!(matches!(err, FailoverError::StateConflict { .. }));
        assert!(run.steps().is_empty());
    }

    #[test]
    fn test_finished_run_is_immutable() {
        let mut run = run();
        run.finish(RunOutcome::Success, false).unwrap();
        assert!(run
            .record(StepResult::success(Step::Preflight, FailoverState::Idle))
            .is_err());
        assert!(run.set_lag_at_freeze(Some(1)).is_err());
        assert!(run.finish(RunOutcome::Aborted, true).is_err());
        assert_eq!(run.outcome(), Some(RunOutcome::Success));
    }

    #[test]
    fn test_first_forward_failure_is_reported() {
        let mut run = run();
        let err = FailoverError::connectivity("pgbouncer", "connection refused");
        run.record(StepResult::failed(Step::PauseProxy, FailoverState::Idle, &err))
            .unwrap();
        run.record(StepResult::failed(Step::ReleaseProxy, FailoverState::Idle, &err))
            .unwrap();
        run.finish(RunOutcome::Aborted, true).unwrap();

        let report = run.abort_report().unwrap();
        assert_eq!(report.failed_step, Some(Step::PauseProxy));
        assert_eq!(report.last_state, FailoverState::Idle);
    }

    #[test]
    fn test_rto_spans_pause_to_resume() {
        let mut run = run();
        assert!(run.rto().is_none());
        run.record(StepResult::success(Step::PauseProxy, FailoverState::ProxyPaused))
            .unwrap();
        run.record(StepResult::success(Step::SyncSequences, FailoverState::SequencesSynced))
            .unwrap();
        run.record(StepResult::success(Step::PromoteStandby, FailoverState::StandbyPromoted))
            .unwrap();
        run.record(StepResult::success(Step::SwapUpstream, FailoverState::UpstreamSwapped))
            .unwrap();
        run.record(StepResult::success(Step::ResumeProxy, FailoverState::ProxyResumed))
            .unwrap();
        assert!(run.rto().unwrap() >= chrono::Duration::zero());
    }
}
