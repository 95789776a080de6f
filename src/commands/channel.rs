// ABOUTME: `channel` command - pause, resume and verify the logical replication channel
// ABOUTME: Promotion is deliberately absent; it only happens inside a failover run

use anyhow::{Context, Result};
use clap::{Args, Subcommand};

use super::{format_lag, Session};

#[derive(Args)]
pub struct ChannelArgs {
    #[command(subcommand)]
    command: ChannelCommands,
}

#[derive(Subcommand)]
enum ChannelCommands {
    /// Disable the subscription so the standby stops applying changes
    Pause,
    /// Re-enable the subscription
    Resume,
    /// Show the channel state and per-table synchronization
    Verify {
        /// Print the verification as JSON
        #[arg(long)]
        json: bool,
    },
}

pub async fn command(session: &Session, args: ChannelArgs) -> Result<()> {
    let channel = session.replication();
    let subscription = &session.config().channel.subscription;
    match args.command {
        ChannelCommands::Pause => {
            let state = channel
                .pause()
                .await
                .with_context(|| format!("Failed to pause subscription {}", subscription))?;
            println!("Subscription {} is {}", subscription, state.as_str());
        }
        ChannelCommands::Resume => {
            let snapshot = channel
                .resume()
                .await
                .with_context(|| format!("Failed to resume subscription {}", subscription))?;
            println!(
                "Subscription {} resumed; lag {}",
                subscription,
                format_lag(snapshot.lag_bytes)
            );
        }
        ChannelCommands::Verify { json } => {
            let verification = channel
                .verify()
                .await
                .context("Failed to verify the replication channel")?;
            if json {
                println!("{}", serde_json::to_string_pretty(&verification)?);
                return Ok(());
            }
            let ch = &verification.channel;
            println!("Publication:  {}", ch.publication);
            println!("Subscription: {} ({})", ch.subscription, ch.state.as_str());
            println!("Slot:         {}", ch.slot);
            println!("Lag:          {}", format_lag(ch.lag_bytes));
            if !verification.present() {
                println!("The subscription does not exist on the standby.");
            }
            for table in &verification.tables {
                println!("  {:<40} {}", table.table, table.state.as_str());
            }
        }
    }
    Ok(())
}
