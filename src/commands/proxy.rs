// ABOUTME: `proxy` command - manual PgBouncer control for operators and remediation
// ABOUTME: Covers pause, resume, reload, pool status and upstream rewrites

use anyhow::{Context, Result};
use clap::{Args, Subcommand};

use super::Session;

#[derive(Args)]
pub struct ProxyArgs {
    #[command(subcommand)]
    command: ProxyCommands,
}

#[derive(Subcommand)]
enum ProxyCommands {
    /// Hold new client queries; waits for in-flight transactions
    Pause,
    /// Release held clients
    Resume,
    /// Reload the PgBouncer configuration
    Reload,
    /// Show pools and the upstream each database routes to
    Status,
    /// Point the managed databases at a new upstream (takes effect on reload)
    SetUpstream {
        host: String,
        #[arg(long)]
        port: Option<u16>,
        /// Reload immediately after rewriting the configuration
        #[arg(long)]
        reload: bool,
    },
}

pub async fn command(session: &Session, args: ProxyArgs) -> Result<()> {
    let proxy = session.proxy();
    let target = proxy.target().to_string();
    match args.command {
        ProxyCommands::Pause => {
            proxy
                .pause()
                .await
                .with_context(|| format!("Failed to pause {}", target))?;
            println!("{} paused", target);
        }
        ProxyCommands::Resume => {
            proxy
                .resume()
                .await
                .with_context(|| format!("Failed to resume {}", target))?;
            println!("{} resumed", target);
        }
        ProxyCommands::Reload => {
            proxy
                .reload()
                .await
                .with_context(|| format!("Failed to reload {}", target))?;
            println!("{} reloaded", target);
        }
        ProxyCommands::Status => {
            let databases = proxy.upstreams().await.context("SHOW DATABASES failed")?;
            let pools = proxy.status().await.context("SHOW POOLS failed")?;
            for db in &databases {
                println!(
                    "{:<16} -> {}:{}{}{}",
                    db.name,
                    db.host,
                    db.port,
                    if db.paused { " (paused)" } else { "" },
                    if proxy.is_managed(&db.name) { "" } else { " (not managed)" }
                );
            }
            match proxy.current_upstream().await.context("SHOW DATABASES failed")? {
                Some((host, port)) => println!("Managed upstream: {}:{}", host, port),
                None => println!("Managed upstream: none (databases disagree or none configured)"),
            }
            for pool in &pools {
                println!(
                    "  {:<16} {:<12} queued={} active_client={} active_server={}",
                    pool.database, pool.user, pool.queued, pool.active_client, pool.active_server
                );
            }
        }
        ProxyCommands::SetUpstream { host, port, reload } => {
            proxy
                .set_upstream(&host, port)
                .await
                .with_context(|| format!("Failed to rewrite the upstream of {}", target))?;
            if reload {
                proxy
                    .reload()
                    .await
                    .with_context(|| format!("Failed to reload {}", target))?;
                println!("{} now routes to {}", target, host);
            } else {
                println!(
                    "{} will route to {} after `pg-failover proxy reload`",
                    target, host
                );
            }
        }
    }
    Ok(())
}
