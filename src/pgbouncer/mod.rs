// ABOUTME: ProxyAdmin implementation for PgBouncer's admin console
// ABOUTME: Sends PAUSE/RESUME/RELOAD/SHOW over simple-query protocol and rewrites pgbouncer.ini

pub mod ini;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_postgres::{Client, SimpleQueryMessage, SimpleQueryRow};

use crate::admin::{PoolStatus, ProxyAdmin, ProxyDatabase};
use crate::error::{classify_pg_error, FailoverError, Result};
use crate::postgres::{connect, ConnectOptions};
use crate::utils::with_timeout;

/// Admin console session on a PgBouncer instance.
pub struct PgBouncerAdmin {
    target: String,
    admin_url: String,
    config_path: PathBuf,
    databases: Vec<String>,
    options: ConnectOptions,
    statement_timeout: Duration,
    pause_timeout: Duration,
    client: Mutex<Option<Arc<Client>>>,
}

impl PgBouncerAdmin {
    pub fn new(
        admin_url: impl Into<String>,
        config_path: impl Into<PathBuf>,
        databases: Vec<String>,
        connect_timeout: Duration,
        statement_timeout: Duration,
        pause_timeout: Duration,
    ) -> Self {
        Self {
            target: "pgbouncer".to_string(),
            admin_url: admin_url.into(),
            config_path: config_path.into(),
            databases,
            options: ConnectOptions {
                connect_timeout,
                allow_self_signed_certs: false,
                no_tls: true,
            },
            statement_timeout,
            pause_timeout,
            client: Mutex::new(None),
        }
    }

    async fn client(&self) -> Result<Arc<Client>> {
        let mut slot = self.client.lock().await;
        if let Some(client) = slot.as_ref() {
            if !client.is_closed() {
                return Ok(Arc::clone(client));
            }
        }
        let client = Arc::new(connect(&self.target, &self.admin_url, self.options).await?);
        *slot = Some(Arc::clone(&client));
        Ok(client)
    }

    /// Send one admin console command and collect the returned rows.
    async fn command(&self, command: &str, limit: Duration) -> Result<Vec<SimpleQueryRow>> {
        tracing::debug!("{}: {}", self.target, command);
        with_timeout(&self.target, command, limit, async {
            let client = self.client().await?;
            let messages = client
                .simple_query(command)
                .await
                .map_err(|e| self.classify(&e))?;
            Ok(messages
                .into_iter()
                .filter_map(|message| match message {
                    SimpleQueryMessage::Row(row) => Some(row),
                    _ => None,
                })
                .collect())
        })
        .await
    }

    /// PgBouncer reports redundant PAUSE/RESUME as errors; surface those as
    /// state conflicts so callers can converge.
    fn classify(&self, err: &tokio_postgres::Error) -> FailoverError {
        if let Some(db) = err.as_db_error() {
            let message = db.message();
            if message.contains("already suspended/paused") || message.contains("not paused") {
                return FailoverError::conflict(message);
            }
            return FailoverError::command(&self.target, message);
        }
        classify_pg_error(&self.target, err)
    }
}

fn column<'a>(row: &'a SimpleQueryRow, name: &str) -> Option<&'a str> {
    row.try_get(name).ok().flatten()
}

fn int_column(row: &SimpleQueryRow, name: &str) -> i64 {
    column(row, name)
        .and_then(|v| v.parse().ok())
        .unwrap_or_default()
}

#[async_trait]
impl ProxyAdmin for PgBouncerAdmin {
    fn target(&self) -> &str {
        &self.target
    }

    async fn pause(&self) -> Result<()> {
        self.command("PAUSE", self.pause_timeout).await?;
        Ok(())
    }

    async fn resume(&self) -> Result<()> {
        self.command("RESUME", self.statement_timeout).await?;
        Ok(())
    }

    async fn reload(&self) -> Result<()> {
        self.command("RELOAD", self.statement_timeout).await?;
        Ok(())
    }

    async fn show_pools(&self) -> Result<Vec<PoolStatus>> {
        let rows = self.command("SHOW POOLS", self.statement_timeout).await?;
        Ok(rows
            .iter()
            .map(|row| PoolStatus {
                database: column(row, "database").unwrap_or_default().to_string(),
                user: column(row, "user").unwrap_or_default().to_string(),
                queued: int_column(row, "cl_waiting"),
                active_server: int_column(row, "sv_active"),
                active_client: int_column(row, "cl_active"),
            })
            .collect())
    }

    async fn show_databases(&self) -> Result<Vec<ProxyDatabase>> {
        let rows = self.command("SHOW DATABASES", self.statement_timeout).await?;
        Ok(rows
            .iter()
            .filter(|row| column(row, "name") != Some("pgbouncer"))
            .map(|row| ProxyDatabase {
                name: column(row, "name").unwrap_or_default().to_string(),
                host: column(row, "host").unwrap_or_default().to_lowercase(),
                port: column(row, "port")
                    .and_then(|p| p.parse().ok())
                    .unwrap_or(5432),
                paused: int_column(row, "paused") != 0,
            })
            .collect())
    }

    fn managed_databases(&self) -> &[String] {
        &self.databases
    }

    async fn set_upstream(&self, host: &str, port: Option<u16>) -> Result<()> {
        let path = &self.config_path;
        let original = tokio::fs::read_to_string(path).await.map_err(|e| {
            FailoverError::command(
                &self.target,
                format!("failed to read {}: {}", path.display(), e),
            )
        })?;

        let rewrite = ini::rewrite_upstream(&original, host, port, &self.databases);
        if rewrite.rewritten.is_empty() {
            return Err(FailoverError::command(
                &self.target,
                format!(
                    "no [databases] entries in {} matched {:?}",
                    path.display(),
                    self.databases
                ),
            ));
        }

        // Write next to the original and rename so a crash never leaves a
        // half-written config behind.
        let staging = path.with_extension("ini.pg-failover");
        tokio::fs::write(&staging, rewrite.contents.as_bytes())
            .await
            .map_err(|e| {
                FailoverError::command(
                    &self.target,
                    format!("failed to write {}: {}", staging.display(), e),
                )
            })?;
        tokio::fs::rename(&staging, path).await.map_err(|e| {
            FailoverError::command(
                &self.target,
                format!("failed to replace {}: {}", path.display(), e),
            )
        })?;

        tracing::info!(
            "Rewrote upstream for {} to {} in {}",
            rewrite.rewritten.join(", "),
            host,
            path.display()
        );
        Ok(())
    }
}
