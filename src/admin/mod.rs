// ABOUTME: Narrow administrative interfaces to the database nodes and the connection proxy
// ABOUTME: Production adapters live in postgres/ and pgbouncer/; in-memory fakes in memory.rs

pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Point-in-time status of a database node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeStatus {
    /// `default_transaction_read_only` is on
    pub read_only: bool,
    /// Node is a physical standby (`pg_is_in_recovery()`)
    pub in_recovery: bool,
    /// Backends currently executing a statement, excluding our own session
    pub active_connections: i64,
}

/// Primary-side view of a logical replication slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotStatus {
    pub active: bool,
    /// Bytes of WAL the subscriber has not confirmed; `None` when the slot
    /// has never confirmed a position
    pub lag_bytes: Option<u64>,
}

/// Standby-side view of a subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionStatus {
    pub enabled: bool,
    /// An apply worker is attached
    pub worker_running: bool,
    pub last_message_age: Option<Duration>,
}

/// Per-table synchronization state reported by `pg_subscription_rel`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableSyncState {
    Initializing,
    CopyingData,
    FinishedCopy,
    Syncing,
    Ready,
}

impl TableSyncState {
    /// Map the single-character `srsubstate` code.
    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "i" => Some(Self::Initializing),
            "d" => Some(Self::CopyingData),
            "f" => Some(Self::FinishedCopy),
            "s" => Some(Self::Syncing),
            "r" => Some(Self::Ready),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::CopyingData => "copying_data",
            Self::FinishedCopy => "finished_copy",
            Self::Syncing => "syncing",
            Self::Ready => "ready",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionTable {
    pub table: String,
    pub state: TableSyncState,
}

/// One row of PgBouncer's `SHOW POOLS`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStatus {
    pub database: String,
    pub user: String,
    /// Clients waiting for a server connection (`cl_waiting`)
    pub queued: i64,
    pub active_server: i64,
    pub active_client: i64,
}

/// One row of PgBouncer's `SHOW DATABASES`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyDatabase {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub paused: bool,
}

/// Administrative access to a single PostgreSQL node.
///
/// Implementations hold no failover state; every method reflects what the
/// node reports at call time. Methods never retry internally.
#[async_trait]
pub trait DatabaseAdmin: Send + Sync {
    /// Label used in logs and error messages (e.g. "primary").
    fn target(&self) -> &str;

    async fn node_status(&self) -> Result<NodeStatus>;

    /// `None` when the slot does not exist.
    async fn slot_status(&self, slot: &str) -> Result<Option<SlotStatus>>;

    /// `None` when the subscription does not exist.
    async fn subscription_status(&self, subscription: &str) -> Result<Option<SubscriptionStatus>>;

    async fn subscription_tables(&self, subscription: &str) -> Result<Vec<SubscriptionTable>>;

    async fn set_subscription_enabled(&self, subscription: &str, enabled: bool) -> Result<()>;

    /// Drop the subscription. With `detach_slot` the remote slot is
    /// disassociated first so the drop does not contact the publisher.
    async fn drop_subscription(&self, subscription: &str, detach_slot: bool) -> Result<()>;

    async fn set_read_only(&self, read_only: bool) -> Result<()>;

    /// Schema-qualified names of user sequences.
    async fn list_sequences(&self) -> Result<Vec<String>>;

    /// `Ok(None)` when the sequence exists but has never been advanced.
    async fn sequence_value(&self, sequence: &str) -> Result<Option<i64>>;

    async fn set_sequence_value(&self, sequence: &str, value: i64) -> Result<()>;

    async fn try_advisory_lock(&self, key: i64) -> Result<bool>;

    async fn advisory_unlock(&self, key: i64) -> Result<()>;
}

/// Administrative access to the connection-pooling proxy.
#[async_trait]
pub trait ProxyAdmin: Send + Sync {
    fn target(&self) -> &str;

    async fn pause(&self) -> Result<()>;

    async fn resume(&self) -> Result<()>;

    async fn reload(&self) -> Result<()>;

    async fn show_pools(&self) -> Result<Vec<PoolStatus>>;

    async fn show_databases(&self) -> Result<Vec<ProxyDatabase>>;

    /// Databases `set_upstream` rewrites. Empty means every entry.
    fn managed_databases(&self) -> &[String];

    /// Point future server connections at `host`. Takes effect after `reload`.
    async fn set_upstream(&self, host: &str, port: Option<u16>) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_sync_state_codes() {
        assert_eq!(TableSyncState::from_code("r"), Some(TableSyncState::Ready));
        assert_eq!(
            TableSyncState::from_code("d"),
            Some(TableSyncState::CopyingData)
        );
        assert_eq!(TableSyncState::from_code("x"), None);
        assert_eq!(TableSyncState::FinishedCopy.as_str(), "finished_copy");
    }
}
