// ABOUTME: Health prober - one-shot liveness and replication state of a node
// ABOUTME: Never retries and never reports an unreachable node as healthy

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::admin::{DatabaseAdmin, TableSyncState};
use crate::config::ChannelConfig;
use crate::error::{FailoverError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Primary,
    Standby,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Primary => write!(f, "primary"),
            Role::Standby => write!(f, "standby"),
        }
    }
}

/// A database node taking part in the failover.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    pub role: Role,
    pub host: String,
    pub port: u16,
}

/// Subscription details only a standby reports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StandbyHealth {
    pub subscription_exists: bool,
    pub subscription_enabled: bool,
    pub last_message_age: Option<Duration>,
    pub tables_ready: usize,
    pub tables_total: usize,
}

/// Point-in-time health snapshot of one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub node: String,
    pub role: Role,
    pub reachable: bool,
    pub read_only: bool,
    pub active_connection_count: i64,
    pub replication_slot_active: bool,
    pub lag_bytes: Option<u64>,
    pub standby: Option<StandbyHealth>,
    /// Why the node could not be probed, when `reachable` is false
    pub error: Option<String>,
}

impl HealthReport {
    /// Report for a node that could not be reached.
    pub fn unreachable(node: &Node, error: &FailoverError) -> Self {
        Self {
            node: node.name.clone(),
            role: node.role,
            reachable: false,
            read_only: false,
            active_connection_count: 0,
            replication_slot_active: false,
            lag_bytes: None,
            standby: None,
            error: Some(error.to_string()),
        }
    }

    /// A standby is ready for promotion when its subscription exists and every
    /// table has reached the ready state.
    pub fn standby_ready(&self) -> bool {
        match &self.standby {
            Some(s) => s.subscription_exists && s.tables_ready == s.tables_total,
            None => false,
        }
    }
}

/// Queries a node for liveness and replication state.
#[derive(Debug, Clone)]
pub struct HealthProber {
    channel: ChannelConfig,
}

impl HealthProber {
    pub fn new(channel: ChannelConfig) -> Self {
        Self { channel }
    }

    /// Probe `node` once.
    ///
    /// For a primary the slot status is read; for a standby the subscription
    /// and its per-table states. Connectivity failures are returned as errors.
    pub async fn probe(&self, node: &Node, admin: &dyn DatabaseAdmin) -> Result<HealthReport> {
        let status = admin.node_status().await?;

        let mut report = HealthReport {
            node: node.name.clone(),
            role: node.role,
            reachable: true,
            read_only: status.read_only,
            active_connection_count: status.active_connections,
            replication_slot_active: false,
            lag_bytes: None,
            standby: None,
            error: None,
        };

        match node.role {
            Role::Primary => {
                if let Some(slot) = admin.slot_status(self.channel.slot_name()).await? {
                    report.replication_slot_active = slot.active;
                    report.lag_bytes = slot.lag_bytes;
                }
            }
            Role::Standby => {
                let subscription = admin
                    .subscription_status(&self.channel.subscription)
                    .await?;
                let tables = admin.subscription_tables(&self.channel.subscription).await?;
                let ready = tables
                    .iter()
                    .filter(|t| t.state == TableSyncState::Ready)
                    .count();
                report.replication_slot_active = subscription
                    .as_ref()
                    .map(|s| s.worker_running)
                    .unwrap_or(false);
                report.standby = Some(StandbyHealth {
                    subscription_exists: subscription.is_some(),
                    subscription_enabled: subscription.as_ref().map(|s| s.enabled).unwrap_or(false),
                    last_message_age: subscription.and_then(|s| s.last_message_age),
                    tables_ready: ready,
                    tables_total: tables.len(),
                });
            }
        }

        tracing::debug!(
            "Probed {} ({}): read_only={}, connections={}, lag={:?}",
            node.name,
            node.role,
            report.read_only,
            report.active_connection_count,
            report.lag_bytes
        );
        Ok(report)
    }

    /// Probe for display: connectivity failures become `reachable = false`
    /// with the error kept. Other errors still propagate.
    pub async fn probe_or_unreachable(
        &self,
        node: &Node,
        admin: &dyn DatabaseAdmin,
    ) -> Result<HealthReport> {
        match self.probe(node, admin).await {
            Ok(report) => Ok(report),
            Err(e) if e.is_connectivity() => Ok(HealthReport::unreachable(node, &e)),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admin::memory::InMemoryDatabase;

    fn channel() -> ChannelConfig {
        ChannelConfig {
            publication: "failover_pub".to_string(),
            subscription: "failover_sub".to_string(),
            slot: None,
        }
    }

    fn node(role: Role) -> Node {
        Node {
            name: role.to_string(),
            role,
            host: format!("{}.internal", role),
            port: 5432,
        }
    }

    #[tokio::test]
    async fn test_probe_primary_reports_slot_lag() {
        let primary = InMemoryDatabase::new("primary")
            .with_slot("failover_sub", true, 4096)
            .with_active_connections(7);
        let report = HealthProber::new(channel())
            .probe(&node(Role::Primary), &primary)
            .await
            .unwrap();

        assert!(report.reachable);
        assert!(report.replication_slot_active);
        assert_eq!(report.lag_bytes, Some(4096));
        assert_eq!(report.active_connection_count, 7);
        assert!(report.standby.is_none());
    }

    #[tokio::test]
    async fn test_probe_standby_counts_ready_tables() {
        let standby = InMemoryDatabase::new("standby")
            .with_subscription("failover_sub", &["public.orders", "public.users"]);
        standby.set_table_state("failover_sub", "public.users", TableSyncState::CopyingData);

        let report = HealthProber::new(channel())
            .probe(&node(Role::Standby), &standby)
            .await
            .unwrap();

        let sub = report.standby.clone().unwrap();
        assert!(sub.subscription_exists);
        assert!(sub.subscription_enabled);
        assert_eq!(sub.tables_ready, 1);
        assert_eq!(sub.tables_total, 2);
        assert!(!report.standby_ready());
    }

    #[tokio::test]
    async fn test_unreachable_node_is_an_error_not_healthy() {
        let primary = InMemoryDatabase::new("primary");
        primary.set_reachable(false);
        let prober = HealthProber::new(channel());

        let err = prober
            .probe(&node(Role::Primary), &primary)
            .await
            .unwrap_err();
        assert!(err.is_connectivity());

        let report = prober
            .probe_or_unreachable(&node(Role::Primary), &primary)
            .await
            .unwrap();
        assert!(!report.reachable);
        assert!(report.error.unwrap().contains("connection refused"));
    }
}
