// ABOUTME: `sequences sync` command - advance standby sequences past the primary's values
// ABOUTME: Prints the per-sequence ledger and fails when any sequence could not be reconciled

use anyhow::{bail, Context, Result};
use clap::{Args, Subcommand};

use super::Session;
use crate::sequences::{SequenceStatus, SequenceSummary, SequenceSynchronizer};

#[derive(Args)]
pub struct SequencesArgs {
    #[command(subcommand)]
    command: SequencesCommands,
}

#[derive(Subcommand)]
enum SequencesCommands {
    /// Set each standby sequence to primary value + buffer
    Sync {
        /// Override the configured safety buffer
        #[arg(long)]
        buffer: Option<i64>,
        /// The primary is down: advance standby sequences by the buffer alone
        #[arg(long)]
        primary_unreachable: bool,
    },
}

pub async fn command(session: &Session, args: SequencesArgs) -> Result<()> {
    match args.command {
        SequencesCommands::Sync {
            buffer,
            primary_unreachable,
        } => sync(session, buffer, primary_unreachable).await,
    }
}

async fn sync(session: &Session, buffer: Option<i64>, primary_unreachable: bool) -> Result<()> {
    let thresholds = &session.config().thresholds;
    let buffer = buffer.unwrap_or(thresholds.sequence_buffer);
    if buffer < 0 {
        bail!("--buffer cannot be negative");
    }

    let synchronizer = SequenceSynchronizer::new(
        session.primary(),
        session.standby(),
        thresholds.sequence_workers,
        session.config().retry,
    );
    let ledger = synchronizer
        .sync(buffer, !primary_unreachable)
        .await
        .context("Failed to list sequences")?;

    let show = |value: Option<i64>| value.map(|v| v.to_string()).unwrap_or_else(|| "-".into());
    for entry in &ledger {
        println!(
            "{:<40} primary={:<12} standby={:<12} result={:<12} {}",
            entry.sequence_name,
            show(entry.primary_value),
            show(entry.standby_value),
            show(entry.resulting_value),
            match (&entry.status, &entry.error) {
                (SequenceStatus::Error, Some(error)) => format!("error: {}", error),
                (status, _) => status.as_str().to_string(),
            }
        );
    }

    let summary = SequenceSummary::of(&ledger);
    println!(
        "{} updated, {} already ahead, {} errors",
        summary.updated, summary.skipped, summary.errors
    );
    if summary.errors > 0 {
        bail!("{} sequence(s) could not be reconciled", summary.errors);
    }
    Ok(())
}
