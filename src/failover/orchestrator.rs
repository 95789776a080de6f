// ABOUTME: Failover orchestrator - drives the state machine across the four components
// ABOUTME: Rolls back before the point of no return, finishes forward or degrades after it

use std::sync::Arc;

use tokio::sync::broadcast::{self, error::TryRecvError};

use super::lock::FailoverLock;
use super::log::{RunEvent, RunLog};
use super::rollback;
use super::run::{FailoverRun, RunOptions, RunOutcome, Step, StepResult, StepStatus};
use super::state::FailoverState;
use crate::admin::{DatabaseAdmin, ProxyAdmin};
use crate::config::{ChannelConfig, FailoverConfig, NodeConfig, RetryPolicy, Thresholds};
use crate::error::{FailoverError, Result};
use crate::health::{HealthProber, HealthReport, Node, Role};
use crate::proxy::ProxyController;
use crate::replication::{check_lag, PromoteOptions, ReplicationController};
use crate::sequences::{SequenceSummary, SequenceSynchronizer};
use crate::utils::retry_with_backoff;

/// Everything the orchestrator needs to know about the pair it fails over.
#[derive(Debug, Clone)]
pub struct FailoverPlan {
    pub primary: Node,
    pub standby: Node,
    pub channel: ChannelConfig,
    pub thresholds: Thresholds,
    pub retry: RetryPolicy,
}

impl FailoverPlan {
    pub fn from_config(config: &FailoverConfig) -> Result<Self> {
        Ok(Self {
            primary: node(&config.primary, Role::Primary)?,
            standby: node(&config.standby, Role::Standby)?,
            channel: config.channel.clone(),
            thresholds: config.thresholds.clone(),
            retry: config.retry,
        })
    }
}

fn node(config: &NodeConfig, role: Role) -> Result<Node> {
    let as_config_error = |e: anyhow::Error| FailoverError::Config(format!("{:#}", e));
    Ok(Node {
        name: config.name.clone(),
        role,
        host: config.host().map_err(as_config_error)?,
        port: config.port().map_err(as_config_error)?,
    })
}

/// How far a run got; drives rollback and remediation.
#[derive(Default)]
pub(super) struct Progress {
    pub primary_reachable: bool,
    pub proxy_paused: bool,
    pub primary_frozen: bool,
    pub promote_attempted: bool,
    pub slot_left_on_primary: bool,
    pub original_upstream: Option<(String, u16)>,
    pub cancelled: bool,
    pub lock: Option<FailoverLock>,
}

/// Why the forward path stopped.
enum Halt {
    /// Nothing was mutated
    Abort(FailoverError),
    /// Before the point of no return; undo what was done
    Rollback(FailoverError),
    /// Operator cancelled before the point of no return
    Cancelled,
    /// After the point of no return; manual remediation required
    Degraded(FailoverError),
}

/// Sequences a controlled failover from the primary to the standby.
pub struct FailoverOrchestrator {
    pub(super) plan: FailoverPlan,
    pub(super) primary: Arc<dyn DatabaseAdmin>,
    pub(super) standby: Arc<dyn DatabaseAdmin>,
    pub(super) prober: HealthProber,
    pub(super) replication: ReplicationController,
    pub(super) sequences: SequenceSynchronizer,
    pub(super) proxy: ProxyController,
    run_log: Option<RunLog>,
}

impl FailoverOrchestrator {
    pub fn new(
        plan: FailoverPlan,
        primary: Arc<dyn DatabaseAdmin>,
        standby: Arc<dyn DatabaseAdmin>,
        proxy: Arc<dyn ProxyAdmin>,
    ) -> Self {
        Self {
            prober: HealthProber::new(plan.channel.clone()),
            replication: ReplicationController::new(
                plan.channel.clone(),
                Arc::clone(&primary),
                Arc::clone(&standby),
                plan.retry,
            ),
            sequences: SequenceSynchronizer::new(
                Arc::clone(&primary),
                Arc::clone(&standby),
                plan.thresholds.sequence_workers,
                plan.retry,
            ),
            proxy: ProxyController::new(proxy, plan.retry),
            plan,
            primary,
            standby,
            run_log: None,
        }
    }

    /// Record every step to `log` as the run progresses.
    pub fn with_run_log(mut self, log: RunLog) -> Self {
        self.run_log = Some(log);
        self
    }

    pub fn plan(&self) -> &FailoverPlan {
        &self.plan
    }

    /// Execute one failover run and return its record.
    ///
    /// A message on `shutdown` requests cancellation; it is honoured between
    /// steps. The run always ends with an outcome; inspect
    /// [`FailoverRun::outcome`] and [`FailoverRun::abort_report`].
    pub async fn run(
        &self,
        options: RunOptions,
        mut shutdown: broadcast::Receiver<()>,
    ) -> FailoverRun {
        let mut run = FailoverRun::new(
            self.plan.primary.clone(),
            self.plan.standby.clone(),
            options,
        );
        tracing::info!(
            "Starting failover run {}: {} -> {}{}",
            run.id(),
            self.plan.primary.name,
            self.plan.standby.name,
            if options.dry_run { " (dry run)" } else { "" }
        );
        self.log_event(&run, RunEvent::started(&run)).await;

        let mut progress = Progress::default();
        let halt = self
            .drive(&mut run, &mut progress, options, &mut shutdown)
            .await;

        let (outcome, degraded) = match halt {
            Ok(()) => {
                if progress.slot_left_on_primary {
                    self.remediate(&mut run, vec![rollback::orphaned_slot_remediation(&self.plan)]);
                }
                (RunOutcome::Success, false)
            }
            Err(Halt::Abort(e)) => {
                self.remediate(&mut run, rollback::abort_remediation(&self.plan, &e));
                (RunOutcome::Aborted, false)
            }
            Err(Halt::Rollback(e)) => {
                tracing::error!("Failover failed at {}: {}", run.state(), e);
                self.finish_rollback(&mut run, &progress, Some(&e)).await
            }
            Err(Halt::Cancelled) => {
                tracing::warn!("Failover cancelled at {}", run.state());
                self.finish_rollback(&mut run, &progress, None).await
            }
            Err(Halt::Degraded(e)) => {
                tracing::error!(
                    "Failover failed after the point of no return at {}: {}",
                    run.state(),
                    e
                );
                let steps = rollback::forward_remediation(&self.plan, &progress, &e);
                self.remediate(&mut run, steps);
                (RunOutcome::Aborted, true)
            }
        };

        if let Some(lock) = progress.lock.take() {
            if let Err(e) = lock.release().await {
                tracing::warn!("Failed to release failover lock: {}", e);
            }
        }

        if let Err(e) = run.finish(outcome, degraded) {
            tracing::error!("Could not finish run {}: {}", run.id(), e);
        }
        if let Some(event) = RunEvent::finished(&run) {
            self.log_event(&run, event).await;
        }

        match outcome {
            RunOutcome::Success => {
                match run.rto() {
                    Some(rto) => tracing::info!(
                        "Failover complete in state {}; clients paused for {} ms",
                        run.state(),
                        rto.num_milliseconds()
                    ),
                    None => tracing::info!("Run {} finished: {}", run.id(), outcome.as_str()),
                }
                for step in run.remediation() {
                    tracing::warn!("  -> {}", step);
                }
            }
            _ => {
                tracing::warn!(
                    "Run {} finished: {}{}",
                    run.id(),
                    outcome.as_str(),
                    if degraded { " (degraded)" } else { "" }
                );
                for step in run.remediation() {
                    tracing::warn!("  -> {}", step);
                }
            }
        }
        run
    }

    async fn finish_rollback(
        &self,
        run: &mut FailoverRun,
        progress: &Progress,
        cause: Option<&FailoverError>,
    ) -> (RunOutcome, bool) {
        let clean = self.rollback(run, progress).await;
        let steps = rollback::rollback_remediation(&self.plan, run.state(), cause, clean);
        self.remediate(run, steps);
        if clean {
            (RunOutcome::RolledBack, false)
        } else {
            (RunOutcome::Aborted, true)
        }
    }

    async fn drive(
        &self,
        run: &mut FailoverRun,
        progress: &mut Progress,
        options: RunOptions,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> std::result::Result<(), Halt> {
        // Idle
        progress.primary_reachable = self.preflight(run, options).await?;
        if options.dry_run {
            return self.rehearse(run, progress, options).await;
        }

        match FailoverLock::acquire(
            Arc::clone(&self.standby),
            &self.plan.primary,
            &self.plan.standby,
        )
        .await
        {
            Ok(lock) => {
                let detail = format!("advisory lock {}", lock.key());
                progress.lock = Some(lock);
                self.succeed(run, Step::AcquireLock, Some(detail)).await;
            }
            Err(e) => {
                self.fail(run, Step::AcquireLock, &e).await;
                return Err(Halt::Abort(e));
            }
        }

        let original = self.capture_upstream(run).await;
        if original.0.eq_ignore_ascii_case(&self.plan.standby.host)
            && original.1 == self.plan.standby.port
        {
            let e = FailoverError::precondition(
                format!(
                    "{} already routes to the standby {}:{}",
                    self.proxy.target(),
                    original.0,
                    original.1
                ),
                "check `pg-failover proxy status`; a previous failover may have completed",
            );
            self.fail(run, Step::Preflight, &e).await;
            return Err(Halt::Abort(e));
        }
        progress.original_upstream = Some(original);

        // Idle -> ProxyPaused
        self.checkpoint(run, progress, shutdown)?;
        progress.proxy_paused = true;
        match self.proxy.pause().await {
            Ok(()) => self.succeed(run, Step::PauseProxy, None).await,
            Err(e) => {
                self.fail(run, Step::PauseProxy, &e).await;
                return Err(Halt::Rollback(e));
            }
        }

        // ProxyPaused -> PrimaryFrozen (optional)
        self.checkpoint(run, progress, shutdown)?;
        if progress.primary_reachable {
            progress.primary_frozen = true;
            match self.freeze_primary().await {
                Ok(lag) => {
                    self.note(run.set_lag_at_freeze(lag));
                    let detail = match lag {
                        Some(lag) => format!("lag at freeze: {} bytes", lag),
                        None => "lag at freeze: unknown".to_string(),
                    };
                    self.succeed(run, Step::FreezePrimary, Some(detail)).await;
                }
                Err(e) if e.is_connectivity() && options.skip_freeze => {
                    progress.primary_reachable = false;
                    progress.primary_frozen = false;
                    self.skip_freeze(run, &e.to_string()).await;
                }
                Err(e) => {
                    self.fail(run, Step::FreezePrimary, &e).await;
                    return Err(Halt::Rollback(e));
                }
            }
        } else {
            self.skip_freeze(run, "unreachable at pre-flight").await;
        }

        // -> SequencesSynced
        self.checkpoint(run, progress, shutdown)?;
        let sync = self
            .sequences
            .sync(self.plan.thresholds.sequence_buffer, progress.primary_reachable)
            .await;
        match sync {
            Ok(ledger) => {
                let summary = SequenceSummary::of(&ledger);
                let total = ledger.len();
                self.note(run.set_sequences(ledger.clone()));
                self.log_event(run, RunEvent::Sequences { ledger }).await;
                if summary.errors > 0 {
                    let e = FailoverError::command(
                        self.standby.target(),
                        format!(
                            "{} of {} sequence(s) could not be reconciled",
                            summary.errors, total
                        ),
                    );
                    self.fail(run, Step::SyncSequences, &e).await;
                    return Err(Halt::Rollback(e));
                }
                let detail = format!(
                    "{} updated, {} already ahead",
                    summary.updated, summary.skipped
                );
                self.succeed(run, Step::SyncSequences, Some(detail)).await;
            }
            Err(e) => {
                self.fail(run, Step::SyncSequences, &e).await;
                return Err(Halt::Rollback(e));
            }
        }

        // SequencesSynced -> StandbyPromoted (point of no return)
        self.checkpoint(run, progress, shutdown)?;
        self.promote(run, progress, options).await?;

        // StandbyPromoted -> UpstreamSwapped
        self.checkpoint(run, progress, shutdown)?;
        match self.swap_upstream().await {
            Ok(()) => {
                let detail = format!(
                    "routing to {}:{}",
                    self.plan.standby.host, self.plan.standby.port
                );
                self.succeed(run, Step::SwapUpstream, Some(detail)).await;
            }
            Err(e) => {
                self.fail(run, Step::SwapUpstream, &e).await;
                return Err(Halt::Degraded(e));
            }
        }

        // UpstreamSwapped -> ProxyResumed
        self.checkpoint(run, progress, shutdown)?;
        if let Err(e) = self.resume_traffic(progress).await {
            self.fail(run, Step::ResumeProxy, &e).await;
            return Err(Halt::Degraded(e));
        }
        self.succeed(run, Step::ResumeProxy, None).await;

        self.succeed(run, Step::Complete, None).await;
        Ok(())
    }

    /// Probe both nodes and check the channel before anything is touched.
    /// Returns whether the primary is reachable.
    async fn preflight(
        &self,
        run: &mut FailoverRun,
        options: RunOptions,
    ) -> std::result::Result<bool, Halt> {
        let retry = self.plan.retry;

        let primary_reachable = match retry_with_backoff(
            || self.prober.probe(&self.plan.primary, self.primary.as_ref()),
            retry,
            "probe primary",
        )
        .await
        {
            Ok(report) => {
                if report.read_only {
                    tracing::warn!(
                        "Primary {} is already read-only; a previous run may have frozen it",
                        self.plan.primary.name
                    );
                }
                self.note_health(run, report).await;
                true
            }
            Err(e) if e.is_connectivity() => {
                self.note_health(run, HealthReport::unreachable(&self.plan.primary, &e))
                    .await;
                if !options.skip_freeze {
                    let err = FailoverError::precondition(
                        format!("primary {} is unreachable: {}", self.plan.primary.name, e),
                        "restore connectivity, or re-run with --skip-freeze to fail over without freezing it (potential data loss)",
                    );
                    self.fail(run, Step::Preflight, &err).await;
                    return Err(Halt::Abort(err));
                }
                tracing::warn!(
                    "Primary {} is unreachable; continuing because --skip-freeze was given",
                    self.plan.primary.name
                );
                false
            }
            Err(e) => {
                self.fail(run, Step::Preflight, &e).await;
                return Err(Halt::Abort(e));
            }
        };

        let standby = match retry_with_backoff(
            || self.prober.probe(&self.plan.standby, self.standby.as_ref()),
            retry,
            "probe standby",
        )
        .await
        {
            Ok(report) => report,
            Err(e) => {
                self.note_health(run, HealthReport::unreachable(&self.plan.standby, &e))
                    .await;
                self.fail(run, Step::Preflight, &e).await;
                return Err(Halt::Abort(e));
            }
        };
        let subscription = standby.standby.clone();
        let ready = standby.standby_ready();
        self.note_health(run, standby).await;

        let Some(subscription) = subscription.filter(|s| s.subscription_exists) else {
            let e = FailoverError::precondition(
                format!(
                    "subscription {} does not exist on {}",
                    self.plan.channel.subscription, self.plan.standby.name
                ),
                "check `pg-failover channel verify`; a previous failover may already have promoted this standby",
            );
            self.fail(run, Step::Preflight, &e).await;
            return Err(Halt::Abort(e));
        };
        if !ready {
            if !options.force {
                let e = FailoverError::precondition(
                    format!(
                        "{} of {} subscribed tables are not ready on {}",
                        subscription.tables_total.saturating_sub(subscription.tables_ready),
                        subscription.tables_total,
                        self.plan.standby.name
                    ),
                    "wait for the initial copy to finish (`pg-failover channel verify`), or re-run with --force",
                );
                self.fail(run, Step::Preflight, &e).await;
                return Err(Halt::Abort(e));
            }
            tracing::warn!("Proceeding with tables still synchronizing because --force was given");
        }

        let detail = format!(
            "primary {}, standby subscription {} ({}/{} tables ready)",
            if primary_reachable { "reachable" } else { "unreachable" },
            if subscription.subscription_enabled { "enabled" } else { "disabled" },
            subscription.tables_ready,
            subscription.tables_total
        );
        self.succeed(run, Step::Preflight, Some(detail)).await;
        Ok(primary_reachable)
    }

    /// Dry run: check what a real run would check, change nothing.
    async fn rehearse(
        &self,
        run: &mut FailoverRun,
        progress: &Progress,
        options: RunOptions,
    ) -> std::result::Result<(), Halt> {
        let state = run.state();
        for step in [Step::AcquireLock, Step::PauseProxy] {
            self.record(run, StepResult::skipped(step, state, "dry run")).await;
        }
        let freeze = if progress.primary_reachable {
            "dry run".to_string()
        } else {
            "dry run; primary unreachable, potential data loss acknowledged".to_string()
        };
        self.record(run, StepResult::skipped(Step::FreezePrimary, state, freeze))
            .await;
        self.record(run, StepResult::skipped(Step::SyncSequences, state, "dry run"))
            .await;

        let promote = if progress.primary_reachable {
            let checked = match self.replication.lag_bytes().await {
                Ok(lag) => check_lag(lag, self.plan.thresholds.max_lag_bytes, options.force)
                    .map(|()| lag),
                Err(e) => Err(e),
            };
            match checked {
                Ok(Some(lag)) => format!(
                    "dry run; lag {} bytes (threshold {})",
                    lag, self.plan.thresholds.max_lag_bytes
                ),
                Ok(None) => "dry run; lag unknown, forced".to_string(),
                Err(e) => {
                    self.fail(run, Step::PromoteStandby, &e).await;
                    return Err(Halt::Abort(e));
                }
            }
        } else {
            "dry run; lag unknown with the primary unreachable".to_string()
        };
        self.record(run, StepResult::skipped(Step::PromoteStandby, state, promote))
            .await;

        let swap = format!(
            "dry run; would route to {}:{}",
            self.plan.standby.host, self.plan.standby.port
        );
        self.record(run, StepResult::skipped(Step::SwapUpstream, state, swap))
            .await;
        self.record(run, StepResult::skipped(Step::ResumeProxy, state, "dry run"))
            .await;
        tracing::info!("Dry run passed; nothing was changed");
        Ok(())
    }

    async fn capture_upstream(&self, run: &mut FailoverRun) -> (String, u16) {
        let fallback = (self.plan.primary.host.clone(), self.plan.primary.port);
        let original = match self.proxy.managed_upstreams().await {
            Ok(dbs) => match dbs.first() {
                Some(first) => {
                    if dbs.iter().any(|db| db.host != first.host || db.port != first.port) {
                        tracing::warn!(
                            "Managed databases on {} route to different hosts; treating {}:{} as the original upstream",
                            self.proxy.target(),
                            first.host,
                            first.port
                        );
                    }
                    (first.host.clone(), first.port)
                }
                None => fallback,
            },
            Err(e) => {
                tracing::warn!(
                    "Could not read upstreams from {}: {}; assuming the primary",
                    self.proxy.target(),
                    e
                );
                fallback
            }
        };
        self.note(run.set_original_upstream(format!("{}:{}", original.0, original.1)));
        original
    }

    async fn freeze_primary(&self) -> Result<Option<u64>> {
        retry_with_backoff(
            || self.primary.set_read_only(true),
            self.plan.retry,
            "freeze primary",
        )
        .await?;
        tracing::info!("Primary {} is read-only", self.plan.primary.name);

        let thresholds = &self.plan.thresholds;
        if thresholds.catchup_timeout_secs == 0 {
            return self.replication.lag_bytes().await;
        }
        Ok(self
            .replication
            .wait_for_catchup(
                thresholds.catchup_timeout(),
                thresholds.catchup_poll(),
                thresholds.catchup_tolerance_bytes,
            )
            .await)
    }

    async fn skip_freeze(&self, run: &mut FailoverRun, reason: &str) {
        tracing::warn!(
            "Primary {} unreachable ({}); skipping freeze, potential data loss acknowledged",
            self.plan.primary.name,
            reason
        );
        self.note(run.set_lag_at_freeze(None));
        let state = run.state();
        self.record(
            run,
            StepResult::skipped(
                Step::FreezePrimary,
                state,
                format!("primary unreachable ({}); potential data loss acknowledged", reason),
            ),
        )
        .await;
    }

    async fn promote(
        &self,
        run: &mut FailoverRun,
        progress: &mut Progress,
        options: RunOptions,
    ) -> std::result::Result<(), Halt> {
        progress.promote_attempted = true;
        let force = options.force || !progress.primary_reachable;
        let promote_options = PromoteOptions {
            lag_threshold: self.plan.thresholds.max_lag_bytes,
            force,
            primary_reachable: progress.primary_reachable,
        };

        let outcome = match self.replication.promote(promote_options).await {
            Ok(outcome) => outcome,
            Err(e @ FailoverError::IrreversibleStep { .. }) => {
                // drop outcome unknown; assume it happened
                self.fail_at(run, Step::PromoteStandby, FailoverState::StandbyPromoted, &e)
                    .await;
                return Err(Halt::Degraded(e));
            }
            Err(e) => {
                self.fail(run, Step::PromoteStandby, &e).await;
                return Err(Halt::Rollback(e));
            }
        };
        progress.slot_left_on_primary = outcome.slot_left_on_primary;

        if let Err(e) = self.clear_standby_read_only().await {
            let e = FailoverError::irreversible(
                format!(
                    "subscription dropped but {} is still read-only: {}",
                    self.plan.standby.name, e
                ),
                vec![format!(
                    "On {}: ALTER SYSTEM SET default_transaction_read_only = off; SELECT pg_reload_conf();",
                    self.plan.standby.name
                )],
            );
            self.fail_at(run, Step::PromoteStandby, FailoverState::StandbyPromoted, &e)
                .await;
            return Err(Halt::Degraded(e));
        }

        let mut detail = match outcome.lag_bytes {
            Some(lag) => format!("lag {} bytes", lag),
            None => "lag unknown".to_string(),
        };
        if outcome.forced {
            detail.push_str("; lag check forced");
        }
        if outcome.already_absent {
            detail.push_str("; subscription was already absent");
        }
        if outcome.slot_left_on_primary {
            detail.push_str("; slot left on the old primary");
        }
        self.succeed(run, Step::PromoteStandby, Some(detail)).await;
        Ok(())
    }

    async fn clear_standby_read_only(&self) -> Result<()> {
        let status = retry_with_backoff(
            || self.standby.node_status(),
            self.plan.retry,
            "standby status",
        )
        .await?;
        if status.read_only {
            retry_with_backoff(
                || self.standby.set_read_only(false),
                self.plan.retry,
                "clear standby read-only",
            )
            .await?;
            tracing::info!("Cleared read-only on {}", self.plan.standby.name);
        }
        Ok(())
    }

    async fn swap_upstream(&self) -> Result<()> {
        let standby = &self.plan.standby;
        self.proxy
            .set_upstream(&standby.host, Some(standby.port))
            .await?;
        self.proxy.reload().await?;
        if !self.proxy.routes_to(&standby.host, Some(standby.port)).await? {
            return Err(FailoverError::command(
                self.proxy.target(),
                format!(
                    "after RELOAD not every managed database routes to {}:{}",
                    standby.host, standby.port
                ),
            ));
        }
        Ok(())
    }

    /// Resume only once no managed database routes to the original upstream.
    async fn resume_traffic(&self, progress: &Progress) -> Result<()> {
        if let Some((host, port)) = &progress.original_upstream {
            if self.proxy.any_routes_to(host, Some(*port)).await? {
                return Err(FailoverError::conflict(format!(
                    "{} still routes to the original upstream {}:{}; refusing to resume",
                    self.proxy.target(),
                    host,
                    port
                )));
            }
        }
        self.proxy.resume().await
    }

    /// Between steps: honour a cancellation request. Before the point of no
    /// return it stops the run; after it the run finishes forward.
    fn checkpoint(
        &self,
        run: &FailoverRun,
        progress: &mut Progress,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> std::result::Result<(), Halt> {
        if progress.cancelled {
            return Ok(());
        }
        match shutdown.try_recv() {
            Ok(()) | Err(TryRecvError::Lagged(_)) => {}
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return Ok(()),
        }
        progress.cancelled = true;
        if run.state().is_past_point_of_no_return() {
            tracing::warn!(
                "Cancellation requested at {}, past the point of no return; finishing forward",
                run.state()
            );
            return Ok(());
        }
        Err(Halt::Cancelled)
    }

    pub(super) async fn record(&self, run: &mut FailoverRun, step: StepResult) {
        match step.status {
            StepStatus::Failed => tracing::error!(
                "{} failed: {}",
                step.step,
                step.error.as_deref().unwrap_or("unknown error")
            ),
            StepStatus::Skipped => tracing::warn!(
                "{} skipped: {}",
                step.step,
                step.detail.as_deref().unwrap_or_default()
            ),
            StepStatus::Success | StepStatus::Pending => match &step.detail {
                Some(detail) => tracing::info!("{} -> {} ({})", step.step, step.state, detail),
                None => tracing::info!("{} -> {}", step.step, step.state),
            },
        }
        if let Err(e) = run.record(step.clone()) {
            tracing::error!("Could not record {} in run {}: {}", step.step, run.id(), e);
        }
        self.log_event(run, RunEvent::Step(step)).await;
    }

    async fn succeed(&self, run: &mut FailoverRun, step: Step, detail: Option<String>) {
        let state = step.target_state().unwrap_or_else(|| run.state());
        let result = StepResult::success(step, state);
        let result = match detail {
            Some(detail) => result.with_detail(detail),
            None => result,
        };
        self.record(run, result).await;
    }

    pub(super) async fn fail(&self, run: &mut FailoverRun, step: Step, error: &FailoverError) {
        let state = run.state();
        self.fail_at(run, step, state, error).await;
    }

    /// Record a failure that nonetheless moved the machine to `state`.
    async fn fail_at(
        &self,
        run: &mut FailoverRun,
        step: Step,
        state: FailoverState,
        error: &FailoverError,
    ) {
        self.record(run, StepResult::failed(step, state, error)).await;
    }

    async fn note_health(&self, run: &mut FailoverRun, report: HealthReport) {
        self.note(run.add_health(report.clone()));
        self.log_event(run, RunEvent::Health { report }).await;
    }

    fn remediate(&self, run: &mut FailoverRun, steps: Vec<String>) {
        self.note(run.add_remediation(steps));
    }

    fn note(&self, result: Result<()>) {
        if let Err(e) = result {
            tracing::error!("Run record rejected an update: {}", e);
        }
    }

    async fn log_event(&self, run: &FailoverRun, event: RunEvent) {
        if let Some(log) = &self.run_log {
            if let Err(e) = log.append(run.id(), &event).await {
                tracing::warn!("Failed to write run log: {:#}", e);
            }
        }
    }
}
