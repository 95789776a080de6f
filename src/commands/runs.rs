// ABOUTME: `runs` command - list past failover runs and replay one run's log
// ABOUTME: Reads the JSON-lines files written by the orchestrator

use anyhow::Result;
use clap::{Args, Subcommand};

use super::{format_lag, Session};
use crate::failover::{RunEvent, RunLog};

#[derive(Args)]
pub struct RunsArgs {
    #[command(subcommand)]
    command: RunsCommands,
}

#[derive(Subcommand)]
enum RunsCommands {
    /// List recorded runs, newest first
    List,
    /// Show every recorded event of one run
    Show {
        /// Run id or a unique prefix of it
        id: String,
        /// Print the raw JSON events
        #[arg(long)]
        json: bool,
    },
}

pub async fn command(session: &Session, args: RunsArgs) -> Result<()> {
    let log = session.run_log()?;
    match args.command {
        RunsCommands::List => list(&log).await,
        RunsCommands::Show { id, json } => show(&log, &id, json).await,
    }
}

async fn list(log: &RunLog) -> Result<()> {
    let runs = log.list().await?;
    if runs.is_empty() {
        println!("No runs recorded in {}", log.dir().display());
        return Ok(());
    }
    for run in runs {
        let outcome = run.outcome.map(|o| o.as_str()).unwrap_or("unfinished");
        println!(
            "{}  {}  {} -> {}  {}{}{}",
            run.run_id,
            run.started_at.format("%Y-%m-%d %H:%M:%S"),
            run.primary,
            run.standby,
            outcome,
            if run.degraded { " (degraded)" } else { "" },
            if run.dry_run { " [dry run]" } else { "" }
        );
    }
    Ok(())
}

async fn show(log: &RunLog, id: &str, json: bool) -> Result<()> {
    let events = log.read(id).await?;
    for event in &events {
        if json {
            println!("{}", serde_json::to_string(event)?);
            continue;
        }
        match event {
            RunEvent::Started {
                run_id,
                started_at,
                primary,
                standby,
                options,
            } => println!(
                "{} started {}: {} -> {} (skip_freeze={}, dry_run={}, force={})",
                run_id,
                started_at.to_rfc3339(),
                primary,
                standby,
                options.skip_freeze,
                options.dry_run,
                options.force
            ),
            RunEvent::Health { report } => println!(
                "  health {}: {}",
                report.node,
                if report.reachable {
                    format!("reachable, lag {}", format_lag(report.lag_bytes))
                } else {
                    format!(
                        "unreachable ({})",
                        report.error.as_deref().unwrap_or("unknown error")
                    )
                }
            ),
            RunEvent::Step(step) => println!(
                "  {} {:<22} {:<8} -> {}{}",
                step.timestamp.format("%H:%M:%S%.3f"),
                step.step.as_str(),
                step.status.as_str(),
                step.state.as_str(),
                step.error
                    .as_deref()
                    .or(step.detail.as_deref())
                    .map(|note| format!(" ({})", note))
                    .unwrap_or_default()
            ),
            RunEvent::Sequences { ledger } => {
                println!("  sequences: {} reconciled", ledger.len())
            }
            RunEvent::Finished {
                outcome,
                degraded,
                final_state,
                rto_ms,
                remediation,
                ..
            } => {
                println!(
                    "  finished: {}{} at {}{}",
                    outcome.as_str(),
                    if *degraded { " (degraded)" } else { "" },
                    final_state,
                    rto_ms
                        .map(|ms| format!(", clients paused {} ms", ms))
                        .unwrap_or_default()
                );
                for action in remediation {
                    println!("    -> {}", action);
                }
            }
        }
    }
    Ok(())
}
