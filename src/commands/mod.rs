// ABOUTME: Operator command handlers for the pg-failover CLI
// ABOUTME: Builds admin adapters from the loaded config and hands them to each command

pub mod channel;
pub mod failover;
pub mod proxy;
pub mod runs;
pub mod sequences;
pub mod status;

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::admin::{DatabaseAdmin, ProxyAdmin};
use crate::config::FailoverConfig;
use crate::failover::{FailoverPlan, RunLog};
use crate::pgbouncer::PgBouncerAdmin;
use crate::postgres::{ConnectOptions, PgAdmin};
use crate::proxy::ProxyController;
use crate::replication::ReplicationController;

/// Connections and settings shared by every command of one invocation.
///
/// Adapters connect lazily, so building a session never touches the network.
pub struct Session {
    config: FailoverConfig,
    primary: Arc<dyn DatabaseAdmin>,
    standby: Arc<dyn DatabaseAdmin>,
    proxy: Arc<dyn ProxyAdmin>,
}

impl Session {
    pub fn new(config: FailoverConfig) -> Self {
        let timeouts = &config.timeouts;
        let options = ConnectOptions {
            connect_timeout: timeouts.connect(),
            allow_self_signed_certs: config.allow_self_signed_certs,
            no_tls: false,
        };
        let primary = PgAdmin::new(
            config.primary.name.clone(),
            config.primary.url.clone(),
            options,
            timeouts.statement(),
        );
        let standby = PgAdmin::new(
            config.standby.name.clone(),
            config.standby.url.clone(),
            options,
            timeouts.statement(),
        );
        let proxy = PgBouncerAdmin::new(
            config.proxy.admin_url.clone(),
            config.proxy.config_path.clone(),
            config.proxy.databases.clone(),
            timeouts.connect(),
            timeouts.statement(),
            timeouts.proxy_pause(),
        );
        Self::with_adapters(config, Arc::new(primary), Arc::new(standby), Arc::new(proxy))
    }

    /// Session over caller-supplied adapters, e.g. the in-memory fakes.
    pub fn with_adapters(
        config: FailoverConfig,
        primary: Arc<dyn DatabaseAdmin>,
        standby: Arc<dyn DatabaseAdmin>,
        proxy: Arc<dyn ProxyAdmin>,
    ) -> Self {
        Self {
            config,
            primary,
            standby,
            proxy,
        }
    }

    pub fn config(&self) -> &FailoverConfig {
        &self.config
    }

    pub fn primary(&self) -> Arc<dyn DatabaseAdmin> {
        Arc::clone(&self.primary)
    }

    pub fn standby(&self) -> Arc<dyn DatabaseAdmin> {
        Arc::clone(&self.standby)
    }

    pub fn proxy_admin(&self) -> Arc<dyn ProxyAdmin> {
        Arc::clone(&self.proxy)
    }

    pub fn plan(&self) -> Result<FailoverPlan> {
        FailoverPlan::from_config(&self.config).context("Failed to resolve node addresses")
    }

    pub fn proxy(&self) -> ProxyController {
        ProxyController::new(self.proxy_admin(), self.config.retry)
    }

    pub fn replication(&self) -> ReplicationController {
        ReplicationController::new(
            self.config.channel.clone(),
            self.primary(),
            self.standby(),
            self.config.retry,
        )
    }

    pub fn run_log(&self) -> Result<RunLog> {
        Ok(RunLog::new(self.config.resolved_run_log_dir()?))
    }
}

pub(crate) fn format_lag(lag: Option<u64>) -> String {
    match lag {
        Some(bytes) => format!("{} bytes", bytes),
        None => "unknown".to_string(),
    }
}
