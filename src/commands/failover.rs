// ABOUTME: `failover` command - confirm, run the orchestrator and print the run report
// ABOUTME: Ctrl-C is forwarded to the orchestrator as a cancellation request

use anyhow::{bail, Result};
use dialoguer::{theme::ColorfulTheme, Confirm};
use tokio::sync::broadcast;

use super::{format_lag, Session};
use crate::failover::{FailoverOrchestrator, FailoverRun, RunOptions, RunOutcome, StepStatus};
use crate::sequences::SequenceSummary;

pub struct FailoverOptions {
    pub skip_freeze: bool,
    pub dry_run: bool,
    pub force: bool,
    /// Skip the confirmation prompt
    pub yes: bool,
}

/// Process exit code for a finished run.
pub fn exit_code(run: &FailoverRun) -> i32 {
    match run.outcome() {
        Some(RunOutcome::Success) => 0,
        Some(RunOutcome::RolledBack) => 2,
        Some(RunOutcome::Aborted) | None => 3,
    }
}

pub async fn run(session: &Session, opts: FailoverOptions) -> Result<i32> {
    let plan = session.plan()?;

    if !opts.dry_run && !opts.yes {
        println!();
        println!(
            "Failing over {} ({}:{}) -> {} ({}:{})",
            plan.primary.name,
            plan.primary.host,
            plan.primary.port,
            plan.standby.name,
            plan.standby.host,
            plan.standby.port
        );
        println!("  Clients are paused at {} while the standby is promoted.", session.proxy().target());
        println!("  Once promoted the standby cannot be demoted by this tool.");
        if opts.skip_freeze {
            println!("  --skip-freeze: an unreachable primary is not frozen; writes not yet replicated are lost.");
        }
        if opts.force {
            println!("  --force: the replication lag check is bypassed.");
        }
        println!();

        let confirm = Confirm::with_theme(&ColorfulTheme::default())
            .with_prompt("Proceed with the failover?")
            .default(false)
            .interact()?;
        if !confirm {
            bail!("Failover cancelled; nothing was changed");
        }
    }

    let run_log = session.run_log()?;
    let orchestrator = FailoverOrchestrator::new(
        plan,
        session.primary(),
        session.standby(),
        session.proxy_admin(),
    )
    .with_run_log(run_log.clone());

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let signal = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received; stopping at the next step boundary");
            let _ = shutdown_tx.send(());
        }
    });

    let options = RunOptions {
        skip_freeze: opts.skip_freeze,
        dry_run: opts.dry_run,
        force: opts.force,
    };
    let run = orchestrator.run(options, shutdown_rx).await;
    signal.abort();

    print_report(&run);
    println!("Run log: {}", run_log.path_for(run.id()).display());
    Ok(exit_code(&run))
}

fn print_report(run: &FailoverRun) {
    println!();
    println!("Run {}", run.id());
    for step in run.steps() {
        let marker = match step.status {
            StepStatus::Success => "ok",
            StepStatus::Skipped => "skip",
            StepStatus::Failed => "FAIL",
            StepStatus::Pending => "..",
        };
        let note = step
            .error
            .as_deref()
            .or(step.detail.as_deref())
            .unwrap_or_default();
        println!(
            "  [{:>4}] {:<22} {:<18} {}",
            marker,
            step.step.as_str(),
            step.state.as_str(),
            note
        );
    }

    if !run.sequences().is_empty() {
        let summary = SequenceSummary::of(run.sequences());
        println!(
            "  sequences: {} updated, {} already ahead, {} errors",
            summary.updated, summary.skipped, summary.errors
        );
    }
    println!("  lag at freeze: {}", format_lag(run.lag_at_freeze()));

    let outcome = run.outcome().map(|o| o.as_str()).unwrap_or("unfinished");
    println!();
    match run.rto() {
        Some(rto) if run.outcome() == Some(RunOutcome::Success) => println!(
            "Outcome: {} (clients paused for {} ms)",
            outcome,
            rto.num_milliseconds()
        ),
        _ => println!(
            "Outcome: {}{} at {}",
            outcome,
            if run.is_degraded() { ", degraded" } else { "" },
            run.state()
        ),
    }

    if run.outcome() == Some(RunOutcome::Success) && !run.remediation().is_empty() {
        println!("Follow-up:");
        for action in run.remediation() {
            println!("  - {}", action);
        }
    }

    if let Some(report) = run.abort_report() {
        if let Some(step) = report.failed_step {
            println!("Failed step: {}", step);
        }
        if let Some(error) = &report.error {
            println!("Error: {}", error);
        }
        if !report.remediation.is_empty() {
            println!("Next steps:");
            for (i, action) in report.remediation.iter().enumerate() {
                println!("  {}. {}", i + 1, action);
            }
        }
    }
}
