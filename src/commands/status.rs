// ABOUTME: `status` command - health of both nodes, the channel and the proxy pools
// ABOUTME: Read-only; unreachable components are reported rather than failing the command

use anyhow::Result;
use serde::Serialize;

use super::{format_lag, Session};
use crate::admin::{PoolStatus, ProxyDatabase};
use crate::health::{HealthProber, HealthReport};
use crate::replication::ChannelState;

#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub nodes: Vec<HealthReport>,
    pub channel: Option<ChannelState>,
    pub proxy_databases: Vec<ProxyDatabase>,
    pub pools: Vec<PoolStatus>,
    /// Components that could not be queried
    pub errors: Vec<String>,
}

pub async fn collect(session: &Session) -> Result<StatusReport> {
    let plan = session.plan()?;
    let prober = HealthProber::new(plan.channel.clone());
    let mut errors = Vec::new();

    let primary = session.primary();
    let standby = session.standby();
    let nodes = vec![
        prober
            .probe_or_unreachable(&plan.primary, primary.as_ref())
            .await?,
        prober
            .probe_or_unreachable(&plan.standby, standby.as_ref())
            .await?,
    ];

    let channel = match session.replication().state().await {
        Ok(state) => Some(state),
        Err(e) => {
            errors.push(format!("channel: {}", e));
            None
        }
    };

    let proxy = session.proxy();
    let proxy_databases = proxy.upstreams().await.unwrap_or_else(|e| {
        errors.push(format!("{} databases: {}", proxy.target(), e));
        Vec::new()
    });
    let pools = proxy.status().await.unwrap_or_else(|e| {
        errors.push(format!("{} pools: {}", proxy.target(), e));
        Vec::new()
    });

    Ok(StatusReport {
        nodes,
        channel,
        proxy_databases,
        pools,
        errors,
    })
}

pub async fn run(session: &Session, json: bool) -> Result<()> {
    let report = collect(session).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("Nodes:");
    for node in &report.nodes {
        if !node.reachable {
            println!(
                "  {:<12} {:<8} UNREACHABLE ({})",
                node.node,
                node.role.to_string(),
                node.error.as_deref().unwrap_or("unknown error")
            );
            continue;
        }
        println!(
            "  {:<12} {:<8} {} connections={} slot_active={} lag={}",
            node.node,
            node.role.to_string(),
            if node.read_only { "read-only" } else { "read-write" },
            node.active_connection_count,
            node.replication_slot_active,
            format_lag(node.lag_bytes)
        );
        if let Some(sub) = &node.standby {
            println!(
                "  {:<12} {:<8} subscription exists={} enabled={} tables ready {}/{}",
                "",
                "",
                sub.subscription_exists,
                sub.subscription_enabled,
                sub.tables_ready,
                sub.tables_total
            );
        }
    }

    match report.channel {
        Some(state) => println!("Channel: {}", state.as_str()),
        None => println!("Channel: unknown"),
    }

    println!("Proxy databases:");
    for db in &report.proxy_databases {
        println!(
            "  {:<16} -> {}:{}{}",
            db.name,
            db.host,
            db.port,
            if db.paused { " (paused)" } else { "" }
        );
    }
    println!("Proxy pools:");
    for pool in &report.pools {
        println!(
            "  {:<16} {:<12} queued={} active_client={} active_server={}",
            pool.database, pool.user, pool.queued, pool.active_client, pool.active_server
        );
    }

    for error in &report.errors {
        tracing::warn!("{}", error);
    }
    Ok(())
}
