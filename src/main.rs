// ABOUTME: CLI entry point for pg-failover
// ABOUTME: Parses commands, loads the config once and routes to the command handlers

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use pg_failover::commands::{self, channel, proxy, runs, sequences, Session};
use pg_failover::config::{FailoverConfig, Overrides};

#[derive(Parser)]
#[command(name = "pg-failover")]
#[command(about = "Controlled PostgreSQL failover behind PgBouncer", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to the failover configuration
    #[arg(
        long,
        global = true,
        env = "PG_FAILOVER_CONFIG",
        default_value = "failover.toml"
    )]
    config: PathBuf,
    /// Set the log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log: String,
    /// Allow self-signed TLS certificates (insecure - use only for testing)
    #[arg(
        long = "allow-self-signed-certs",
        global = true,
        default_value_t = false
    )]
    allow_self_signed_certs: bool,
    /// Override the primary connection string from the config
    #[arg(long, global = true, env = "PG_FAILOVER_PRIMARY_URL", hide_env_values = true)]
    primary_url: Option<String>,
    /// Override the standby connection string from the config
    #[arg(long, global = true, env = "PG_FAILOVER_STANDBY_URL", hide_env_values = true)]
    standby_url: Option<String>,
    /// Override the directory run logs are written to
    #[arg(long, global = true, env = "PG_FAILOVER_RUN_LOG_DIR")]
    run_log_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fail over from the primary to the standby
    ///
    /// Pauses clients at PgBouncer, freezes the primary, advances standby
    /// sequences, promotes the standby, swaps the upstream and resumes clients.
    /// Any failure before promotion is rolled back.
    Failover {
        /// Proceed when the primary is unreachable instead of freezing it (potential data loss)
        #[arg(long)]
        skip_freeze: bool,
        /// Run pre-flight checks and print the plan without changing anything
        #[arg(long)]
        dry_run: bool,
        /// Promote even if replication lag exceeds the threshold or tables are still syncing
        #[arg(long)]
        force: bool,
        /// Skip confirmation prompt
        #[arg(short = 'y', long)]
        yes: bool,
    },
    /// Show health of both nodes, the replication channel and the proxy
    Status {
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Manage the logical replication channel
    Channel(channel::ChannelArgs),
    /// Manage the PgBouncer proxy
    Proxy(proxy::ProxyArgs),
    /// Reconcile sequences from the primary onto the standby
    Sequences(sequences::SequencesArgs),
    /// Inspect recorded failover runs
    Runs(runs::RunsArgs),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    // 1. RUST_LOG environment variable has highest precedence
    // 2. --log flag is used if RUST_LOG is not set
    // 3. Default to "info" if neither are provided
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log.clone()));

    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let mut config = FailoverConfig::load(&cli.config).context(
        "Could not load configuration (use --config or PG_FAILOVER_CONFIG; see failover.example.toml)",
    )?;
    config
        .apply_overrides(Overrides {
            primary_url: cli.primary_url,
            standby_url: cli.standby_url,
            run_log_dir: cli.run_log_dir,
            allow_self_signed_certs: cli.allow_self_signed_certs,
        })
        .context("Invalid command-line override")?;

    let session = Session::new(config);

    match cli.command {
        Commands::Failover {
            skip_freeze,
            dry_run,
            force,
            yes,
        } => {
            let code = commands::failover::run(
                &session,
                commands::failover::FailoverOptions {
                    skip_freeze,
                    dry_run,
                    force,
                    yes,
                },
            )
            .await?;
            if code != 0 {
                std::process::exit(code);
            }
            Ok(())
        }
        Commands::Status { json } => commands::status::run(&session, json).await,
        Commands::Channel(args) => channel::command(&session, args).await,
        Commands::Proxy(args) => proxy::command(&session, args).await,
        Commands::Sequences(args) => sequences::command(&session, args).await,
        Commands::Runs(args) => runs::command(&session, args).await,
    }
}
