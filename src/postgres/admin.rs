// ABOUTME: DatabaseAdmin implementation over tokio-postgres
// ABOUTME: Issues subscription, read-only, sequence and advisory-lock commands against one node

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_postgres::Client;

use super::connection::{connect, ConnectOptions};
use crate::admin::{
    DatabaseAdmin, NodeStatus, SlotStatus, SubscriptionStatus, SubscriptionTable, TableSyncState,
};
use crate::error::{classify_pg_error, FailoverError, Result};
use crate::utils::{quote_ident, quote_qualified, split_qualified_name, with_timeout};

/// A lazily connected administrative session on one PostgreSQL node.
///
/// The session is opened on first use and reopened if the server closes it,
/// so a node that is down at startup can still be probed later. Advisory
/// locks are session-scoped and are lost if the session is reopened.
pub struct PgAdmin {
    target: String,
    url: String,
    options: ConnectOptions,
    statement_timeout: Duration,
    client: Mutex<Option<Arc<Client>>>,
}

impl PgAdmin {
    pub fn new(
        target: impl Into<String>,
        url: impl Into<String>,
        options: ConnectOptions,
        statement_timeout: Duration,
    ) -> Self {
        Self {
            target: target.into(),
            url: url.into(),
            options,
            statement_timeout,
            client: Mutex::new(None),
        }
    }

    async fn client(&self) -> Result<Arc<Client>> {
        let mut slot = self.client.lock().await;
        if let Some(client) = slot.as_ref() {
            if !client.is_closed() {
                return Ok(Arc::clone(client));
            }
            tracing::debug!("Session to {} was closed, reconnecting", self.target);
        }
        let client = Arc::new(connect(&self.target, &self.url, self.options).await?);
        *slot = Some(Arc::clone(&client));
        Ok(client)
    }

    /// Run one statement with the statement timeout applied.
    async fn run<T, F, Fut>(&self, what: &str, op: F) -> Result<T>
    where
        F: FnOnce(Arc<Client>) -> Fut + Send,
        Fut: Future<Output = std::result::Result<T, tokio_postgres::Error>> + Send,
        T: Send,
    {
        with_timeout(&self.target, what, self.statement_timeout, async {
            let client = self.client().await?;
            op(client)
                .await
                .map_err(|e| classify_pg_error(&self.target, &e))
        })
        .await
    }

    async fn execute(&self, sql: String) -> Result<()> {
        tracing::debug!("{}: {}", self.target, sql);
        self.run("command", move |client| async move {
            client.batch_execute(&sql).await
        })
        .await
    }
}

#[async_trait]
impl DatabaseAdmin for PgAdmin {
    fn target(&self) -> &str {
        &self.target
    }

    async fn node_status(&self) -> Result<NodeStatus> {
        let row = self
            .run("node status", |client| async move {
                client
                    .query_one(
                        "SELECT pg_is_in_recovery(),
                                current_setting('default_transaction_read_only') = 'on',
                                (SELECT count(*)
                                   FROM pg_stat_activity
                                  WHERE state = 'active'
                                    AND backend_type = 'client backend'
                                    AND pid <> pg_backend_pid())",
                        &[],
                    )
                    .await
            })
            .await?;

        Ok(NodeStatus {
            in_recovery: row.get(0),
            read_only: row.get(1),
            active_connections: row.get(2),
        })
    }

    async fn slot_status(&self, slot: &str) -> Result<Option<SlotStatus>> {
        let row = self
            .run("slot status", |client| async move {
                client
                    .query_opt(
                        "SELECT active,
                                CASE WHEN pg_is_in_recovery() THEN NULL
                                     ELSE pg_wal_lsn_diff(pg_current_wal_lsn(), confirmed_flush_lsn)::bigint
                                END
                           FROM pg_replication_slots
                          WHERE slot_name = $1",
                        &[&slot],
                    )
                    .await
            })
            .await?;

        Ok(row.map(|row| {
            let lag: Option<i64> = row.get(1);
            SlotStatus {
                active: row.get(0),
                lag_bytes: lag.map(|l| l.max(0) as u64),
            }
        }))
    }

    async fn subscription_status(&self, subscription: &str) -> Result<Option<SubscriptionStatus>> {
        let row = self
            .run("subscription status", |client| async move {
                client
                    .query_opt(
                        "SELECT s.subenabled,
                                st.pid IS NOT NULL,
                                EXTRACT(EPOCH FROM (now() - st.last_msg_receipt_time))::float8
                           FROM pg_subscription s
                           LEFT JOIN pg_stat_subscription st
                                  ON st.subid = s.oid AND st.relid IS NULL
                          WHERE s.subname = $1
                            AND s.subdbid = (SELECT oid FROM pg_database
                                              WHERE datname = current_database())",
                        &[&subscription],
                    )
                    .await
            })
            .await?;

        Ok(row.map(|row| {
            let age: Option<f64> = row.get(2);
            SubscriptionStatus {
                enabled: row.get(0),
                worker_running: row.get(1),
                last_message_age: age.map(|secs| Duration::from_secs_f64(secs.max(0.0))),
            }
        }))
    }

    async fn subscription_tables(&self, subscription: &str) -> Result<Vec<SubscriptionTable>> {
        let rows = self
            .run("subscription tables", |client| async move {
                client
                    .query(
                        "SELECT n.nspname || '.' || c.relname, sr.srsubstate::text
                           FROM pg_subscription_rel sr
                           JOIN pg_subscription s ON s.oid = sr.srsubid
                           JOIN pg_class c ON c.oid = sr.srrelid
                           JOIN pg_namespace n ON n.oid = c.relnamespace
                          WHERE s.subname = $1
                          ORDER BY 1",
                        &[&subscription],
                    )
                    .await
            })
            .await?;

        let mut tables = Vec::with_capacity(rows.len());
        for row in rows {
            let table: String = row.get(0);
            let code: String = row.get(1);
            let state = TableSyncState::from_code(&code).ok_or_else(|| {
                FailoverError::command(
                    &self.target,
                    format!("unknown srsubstate '{}' for {}", code, table),
                )
            })?;
            tables.push(SubscriptionTable { table, state });
        }
        Ok(tables)
    }

    async fn set_subscription_enabled(&self, subscription: &str, enabled: bool) -> Result<()> {
        let verb = if enabled { "ENABLE" } else { "DISABLE" };
        self.execute(format!(
            "ALTER SUBSCRIPTION {} {}",
            quote_ident(subscription),
            verb
        ))
        .await
    }

    async fn drop_subscription(&self, subscription: &str, detach_slot: bool) -> Result<()> {
        let name = quote_ident(subscription);
        // DROP SUBSCRIPTION and slot changes cannot share a transaction block,
        // so each statement goes out on its own.
        if detach_slot {
            self.execute(format!("ALTER SUBSCRIPTION {} DISABLE", name))
                .await?;
            self.execute(format!("ALTER SUBSCRIPTION {} SET (slot_name = NONE)", name))
                .await?;
        }
        self.execute(format!("DROP SUBSCRIPTION {}", name)).await
    }

    async fn set_read_only(&self, read_only: bool) -> Result<()> {
        let value = if read_only { "on" } else { "off" };
        self.execute(format!(
            "ALTER SYSTEM SET default_transaction_read_only = {}",
            value
        ))
        .await?;
        self.run("reload configuration", |client| async move {
            client.query_one("SELECT pg_reload_conf()", &[]).await
        })
        .await?;
        Ok(())
    }

    async fn list_sequences(&self) -> Result<Vec<String>> {
        let rows = self
            .run("list sequences", |client| async move {
                client
                    .query(
                        "SELECT schemaname || '.' || sequencename
                           FROM pg_sequences
                          WHERE schemaname NOT IN ('pg_catalog', 'information_schema')
                            AND schemaname NOT LIKE 'pg\\_%'
                          ORDER BY 1",
                        &[],
                    )
                    .await
            })
            .await?;
        Ok(rows.iter().map(|row| row.get(0)).collect())
    }

    async fn sequence_value(&self, sequence: &str) -> Result<Option<i64>> {
        let (schema, name) = split_qualified_name(sequence);
        let row = self
            .run("read sequence", |client| async move {
                client
                    .query_opt(
                        "SELECT last_value FROM pg_sequences
                          WHERE schemaname = $1 AND sequencename = $2",
                        &[&schema, &name],
                    )
                    .await
            })
            .await?;

        match row {
            Some(row) => Ok(row.get(0)),
            None => Err(FailoverError::command(
                &self.target,
                format!("sequence {} does not exist", sequence),
            )),
        }
    }

    async fn set_sequence_value(&self, sequence: &str, value: i64) -> Result<()> {
        let regclass = quote_qualified(sequence);
        self.run("set sequence", |client| async move {
            client
                .query_one("SELECT setval($1::text::regclass, $2, true)", &[&regclass, &value])
                .await
        })
        .await?;
        Ok(())
    }

    async fn try_advisory_lock(&self, key: i64) -> Result<bool> {
        let row = self
            .run("advisory lock", |client| async move {
                client
                    .query_one("SELECT pg_try_advisory_lock($1)", &[&key])
                    .await
            })
            .await?;
        Ok(row.get(0))
    }

    async fn advisory_unlock(&self, key: i64) -> Result<()> {
        self.run("advisory unlock", |client| async move {
            client
                .query_one("SELECT pg_advisory_unlock($1)", &[&key])
                .await
        })
        .await?;
        Ok(())
    }
}
