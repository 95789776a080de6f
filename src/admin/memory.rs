// ABOUTME: In-memory DatabaseAdmin and ProxyAdmin implementations
// ABOUTME: Used by tests to drive the orchestrator through failure scenarios without real servers

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use super::{
    DatabaseAdmin, NodeStatus, PoolStatus, ProxyAdmin, ProxyDatabase, SlotStatus,
    SubscriptionStatus, SubscriptionTable, TableSyncState,
};
use crate::error::{FailoverError, Result};

/// Operations on [`InMemoryDatabase`] that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DbOp {
    NodeStatus,
    SlotStatus,
    SubscriptionStatus,
    SubscriptionTables,
    SetSubscriptionEnabled,
    DropSubscription,
    SetReadOnly,
    ListSequences,
    SequenceValue,
    SetSequenceValue,
    AdvisoryLock,
}

/// Operations on [`InMemoryProxy`] that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProxyOp {
    Pause,
    Resume,
    Reload,
    ShowPools,
    ShowDatabases,
    SetUpstream,
}

#[derive(Debug, Clone)]
struct InjectedFailure {
    error: FailoverError,
    /// `None` fails forever
    remaining: Option<u32>,
}

fn take_failure<K: std::hash::Hash + Eq>(
    failures: &mut HashMap<K, InjectedFailure>,
    op: K,
) -> Option<FailoverError> {
    let failure = failures.get_mut(&op)?;
    let error = failure.error.clone();
    match failure.remaining {
        None => Some(error),
        Some(0) => {
            failures.remove(&op);
            None
        }
        Some(n) => {
            if n == 1 {
                failures.remove(&op);
            } else {
                failure.remaining = Some(n - 1);
            }
            Some(error)
        }
    }
}

/// Snapshot of a fake subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct FakeSubscription {
    pub enabled: bool,
    pub worker_running: bool,
    pub slot_detached: bool,
    pub tables: Vec<SubscriptionTable>,
}

#[derive(Debug)]
struct DbState {
    reachable: bool,
    read_only: bool,
    in_recovery: bool,
    active_connections: i64,
    slots: HashMap<String, SlotStatus>,
    subscriptions: HashMap<String, FakeSubscription>,
    sequences: BTreeMap<String, Option<i64>>,
    broken_sequences: HashSet<String>,
    locks: HashSet<i64>,
    failures: HashMap<DbOp, InjectedFailure>,
    drop_reports_timeout: bool,
    journal: Vec<String>,
}

/// A PostgreSQL node kept entirely in memory.
#[derive(Debug)]
pub struct InMemoryDatabase {
    target: String,
    state: Mutex<DbState>,
}

impl InMemoryDatabase {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            state: Mutex::new(DbState {
                reachable: true,
                read_only: false,
                in_recovery: false,
                active_connections: 0,
                slots: HashMap::new(),
                subscriptions: HashMap::new(),
                sequences: BTreeMap::new(),
                broken_sequences: HashSet::new(),
                locks: HashSet::new(),
                failures: HashMap::new(),
                drop_reports_timeout: false,
                journal: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, DbState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn with_slot(self, slot: &str, active: bool, lag_bytes: u64) -> Self {
        self.lock().slots.insert(
            slot.to_string(),
            SlotStatus {
                active,
                lag_bytes: Some(lag_bytes),
            },
        );
        self
    }

    /// Add an enabled subscription with a running worker and all tables ready.
    pub fn with_subscription(self, subscription: &str, tables: &[&str]) -> Self {
        let tables = tables
            .iter()
            .map(|t| SubscriptionTable {
                table: t.to_string(),
                state: TableSyncState::Ready,
            })
            .collect();
        self.lock().subscriptions.insert(
            subscription.to_string(),
            FakeSubscription {
                enabled: true,
                worker_running: true,
                slot_detached: false,
                tables,
            },
        );
        self
    }

    pub fn with_sequence(self, sequence: &str, value: Option<i64>) -> Self {
        self.lock().sequences.insert(sequence.to_string(), value);
        self
    }

    pub fn with_read_only(self, read_only: bool) -> Self {
        self.lock().read_only = read_only;
        self
    }

    pub fn with_active_connections(self, count: i64) -> Self {
        self.lock().active_connections = count;
        self
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.lock().reachable = reachable;
    }

    pub fn set_slot_lag(&self, slot: &str, lag_bytes: u64) {
        if let Some(status) = self.lock().slots.get_mut(slot) {
            status.lag_bytes = Some(lag_bytes);
        }
    }

    pub fn set_table_state(&self, subscription: &str, table: &str, state: TableSyncState) {
        if let Some(sub) = self.lock().subscriptions.get_mut(subscription) {
            for entry in sub.tables.iter_mut().filter(|e| e.table == table) {
                entry.state = state;
            }
        }
    }

    /// Remove a subscription behind the controller's back.
    pub fn remove_subscription(&self, subscription: &str) {
        self.lock().subscriptions.remove(subscription);
    }

    /// Fail `op` for the next `times` calls.
    pub fn fail_next(&self, op: DbOp, error: FailoverError, times: u32) {
        self.lock().failures.insert(
            op,
            InjectedFailure {
                error,
                remaining: Some(times),
            },
        );
    }

    pub fn fail_always(&self, op: DbOp, error: FailoverError) {
        self.lock().failures.insert(
            op,
            InjectedFailure {
                error,
                remaining: None,
            },
        );
    }

    pub fn clear_failures(&self) {
        self.lock().failures.clear();
    }

    /// Reads and writes of `sequence` fail with a command error.
    pub fn break_sequence(&self, sequence: &str) {
        self.lock().broken_sequences.insert(sequence.to_string());
    }

    /// The next drop is applied but reported to the caller as a timeout.
    pub fn drop_reports_timeout(&self) {
        self.lock().drop_reports_timeout = true;
    }

    pub fn read_only(&self) -> bool {
        self.lock().read_only
    }

    pub fn subscription(&self, subscription: &str) -> Option<FakeSubscription> {
        self.lock().subscriptions.get(subscription).cloned()
    }

    pub fn sequence(&self, sequence: &str) -> Option<i64> {
        self.lock().sequences.get(sequence).copied().flatten()
    }

    pub fn held_locks(&self) -> Vec<i64> {
        self.lock().locks.iter().copied().collect()
    }

    /// Mutating commands applied so far, in order.
    pub fn journal(&self) -> Vec<String> {
        self.lock().journal.clone()
    }

    fn guard(&self, op: DbOp) -> Result<MutexGuard<'_, DbState>> {
        let mut state = self.lock();
        if !state.reachable {
            return Err(FailoverError::connectivity(
                &self.target,
                "connection refused",
            ));
        }
        if let Some(err) = take_failure(&mut state.failures, op) {
            return Err(err);
        }
        Ok(state)
    }

    fn missing_subscription(&self, subscription: &str) -> FailoverError {
        FailoverError::command(
            &self.target,
            format!("subscription \"{}\" does not exist", subscription),
        )
    }
}

#[async_trait]
impl DatabaseAdmin for InMemoryDatabase {
    fn target(&self) -> &str {
        &self.target
    }

    async fn node_status(&self) -> Result<NodeStatus> {
        let state = self.guard(DbOp::NodeStatus)?;
        Ok(NodeStatus {
            read_only: state.read_only,
            in_recovery: state.in_recovery,
            active_connections: state.active_connections,
        })
    }

    async fn slot_status(&self, slot: &str) -> Result<Option<SlotStatus>> {
        let state = self.guard(DbOp::SlotStatus)?;
        Ok(state.slots.get(slot).cloned())
    }

    async fn subscription_status(&self, subscription: &str) -> Result<Option<SubscriptionStatus>> {
        let state = self.guard(DbOp::SubscriptionStatus)?;
        Ok(state
            .subscriptions
            .get(subscription)
            .map(|sub| SubscriptionStatus {
                enabled: sub.enabled,
                worker_running: sub.enabled && sub.worker_running,
                last_message_age: sub
                    .worker_running
                    .then(|| Duration::from_millis(250)),
            }))
    }

    async fn subscription_tables(&self, subscription: &str) -> Result<Vec<SubscriptionTable>> {
        let state = self.guard(DbOp::SubscriptionTables)?;
        match state.subscriptions.get(subscription) {
            Some(sub) => Ok(sub.tables.clone()),
            None => Ok(Vec::new()),
        }
    }

    async fn set_subscription_enabled(&self, subscription: &str, enabled: bool) -> Result<()> {
        let mut state = self.guard(DbOp::SetSubscriptionEnabled)?;
        let Some(sub) = state.subscriptions.get_mut(subscription) else {
            return Err(self.missing_subscription(subscription));
        };
        sub.enabled = enabled;
        let verb = if enabled { "ENABLE" } else { "DISABLE" };
        state
            .journal
            .push(format!("ALTER SUBSCRIPTION {} {}", subscription, verb));
        Ok(())
    }

    async fn drop_subscription(&self, subscription: &str, detach_slot: bool) -> Result<()> {
        let mut state = self.guard(DbOp::DropSubscription)?;
        if state.subscriptions.remove(subscription).is_none() {
            return Err(self.missing_subscription(subscription));
        }
        if detach_slot {
            state
                .journal
                .push(format!("ALTER SUBSCRIPTION {} SET (slot_name = NONE)", subscription));
        }
        state.journal.push(format!("DROP SUBSCRIPTION {}", subscription));
        if std::mem::take(&mut state.drop_reports_timeout) {
            return Err(FailoverError::connectivity(
                &self.target,
                "statement timed out",
            ));
        }
        Ok(())
    }

    async fn set_read_only(&self, read_only: bool) -> Result<()> {
        let mut state = self.guard(DbOp::SetReadOnly)?;
        state.read_only = read_only;
        state.journal.push(format!(
            "ALTER SYSTEM SET default_transaction_read_only = {}",
            if read_only { "on" } else { "off" }
        ));
        Ok(())
    }

    async fn list_sequences(&self) -> Result<Vec<String>> {
        let state = self.guard(DbOp::ListSequences)?;
        Ok(state.sequences.keys().cloned().collect())
    }

    async fn sequence_value(&self, sequence: &str) -> Result<Option<i64>> {
        let state = self.guard(DbOp::SequenceValue)?;
        if state.broken_sequences.contains(sequence) {
            return Err(FailoverError::command(
                &self.target,
                format!("permission denied for sequence {}", sequence),
            ));
        }
        match state.sequences.get(sequence) {
            Some(value) => Ok(*value),
            None => Err(FailoverError::command(
                &self.target,
                format!("relation \"{}\" does not exist", sequence),
            )),
        }
    }

    async fn set_sequence_value(&self, sequence: &str, value: i64) -> Result<()> {
        let mut state = self.guard(DbOp::SetSequenceValue)?;
        if state.broken_sequences.contains(sequence) {
            return Err(FailoverError::command(
                &self.target,
                format!("permission denied for sequence {}", sequence),
            ));
        }
        state.sequences.insert(sequence.to_string(), Some(value));
        state
            .journal
            .push(format!("SELECT setval('{}', {})", sequence, value));
        Ok(())
    }

    async fn try_advisory_lock(&self, key: i64) -> Result<bool> {
        let mut state = self.guard(DbOp::AdvisoryLock)?;
        Ok(state.locks.insert(key))
    }

    async fn advisory_unlock(&self, key: i64) -> Result<()> {
        let mut state = self.guard(DbOp::AdvisoryLock)?;
        state.locks.remove(&key);
        Ok(())
    }
}

#[derive(Debug)]
struct ProxyState {
    reachable: bool,
    paused: bool,
    databases: Vec<ProxyDatabase>,
    pending_upstream: Option<(String, Option<u16>)>,
    pools: Vec<PoolStatus>,
    failures: HashMap<ProxyOp, InjectedFailure>,
    journal: Vec<String>,
}

/// A PgBouncer instance kept entirely in memory.
#[derive(Debug)]
pub struct InMemoryProxy {
    target: String,
    managed: Vec<String>,
    state: Mutex<ProxyState>,
}

impl InMemoryProxy {
    /// A proxy whose `databases` all point at `host:5432`.
    pub fn new(target: impl Into<String>, host: &str, databases: &[&str]) -> Self {
        let databases = databases
            .iter()
            .map(|name| ProxyDatabase {
                name: name.to_string(),
                host: host.to_string(),
                port: 5432,
                paused: false,
            })
            .collect::<Vec<_>>();
        let pools = databases
            .iter()
            .map(|db| PoolStatus {
                database: db.name.clone(),
                user: "app".to_string(),
                queued: 0,
                active_server: 1,
                active_client: 1,
            })
            .collect();
        Self {
            target: target.into(),
            managed: databases.iter().map(|db| db.name.clone()).collect(),
            state: Mutex::new(ProxyState {
                reachable: true,
                paused: false,
                databases,
                pending_upstream: None,
                pools,
                failures: HashMap::new(),
                journal: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ProxyState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Add a `[databases]` entry the upstream rewrite leaves alone. Entries
    /// are listed by name.
    pub fn with_unmanaged_database(self, name: &str, host: &str) -> Self {
        {
            let mut state = self.lock();
            state.databases.push(ProxyDatabase {
                name: name.to_string(),
                host: host.to_string(),
                port: 5432,
                paused: false,
            });
            state.databases.sort_by(|a, b| a.name.cmp(&b.name));
        }
        self
    }

    fn is_managed(&self, name: &str) -> bool {
        self.managed.is_empty() || self.managed.iter().any(|m| m == name)
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.lock().reachable = reachable;
    }

    pub fn fail_next(&self, op: ProxyOp, error: FailoverError, times: u32) {
        self.lock().failures.insert(
            op,
            InjectedFailure {
                error,
                remaining: Some(times),
            },
        );
    }

    pub fn fail_always(&self, op: ProxyOp, error: FailoverError) {
        self.lock().failures.insert(
            op,
            InjectedFailure {
                error,
                remaining: None,
            },
        );
    }

    pub fn is_paused(&self) -> bool {
        self.lock().paused
    }

    /// Host every managed database currently routes to, if they agree.
    pub fn upstream_host(&self) -> Option<String> {
        let state = self.lock();
        let mut managed = state.databases.iter().filter(|db| self.is_managed(&db.name));
        let first = managed.next()?.host.clone();
        managed.all(|db| db.host == first).then_some(first)
    }

    /// Host the named database currently routes to.
    pub fn database_host(&self, name: &str) -> Option<String> {
        self.lock()
            .databases
            .iter()
            .find(|db| db.name == name)
            .map(|db| db.host.clone())
    }

    pub fn journal(&self) -> Vec<String> {
        self.lock().journal.clone()
    }

    fn guard(&self, op: ProxyOp) -> Result<MutexGuard<'_, ProxyState>> {
        let mut state = self.lock();
        if !state.reachable {
            return Err(FailoverError::connectivity(
                &self.target,
                "connection refused",
            ));
        }
        if let Some(err) = take_failure(&mut state.failures, op) {
            return Err(err);
        }
        Ok(state)
    }
}

#[async_trait]
impl ProxyAdmin for InMemoryProxy {
    fn target(&self) -> &str {
        &self.target
    }

    async fn pause(&self) -> Result<()> {
        let mut state = self.guard(ProxyOp::Pause)?;
        if state.paused {
            return Err(FailoverError::conflict("already suspended/paused"));
        }
        state.paused = true;
        state.journal.push("PAUSE".to_string());
        Ok(())
    }

    async fn resume(&self) -> Result<()> {
        let mut state = self.guard(ProxyOp::Resume)?;
        if !state.paused {
            return Err(FailoverError::conflict("pooler is not paused/suspended"));
        }
        state.paused = false;
        state.journal.push("RESUME".to_string());
        Ok(())
    }

    async fn reload(&self) -> Result<()> {
        let mut state = self.guard(ProxyOp::Reload)?;
        if let Some((host, port)) = state.pending_upstream.take() {
            for db in state
                .databases
                .iter_mut()
                .filter(|db| self.is_managed(&db.name))
            {
                db.host = host.clone();
                if let Some(port) = port {
                    db.port = port;
                }
            }
        }
        state.journal.push("RELOAD".to_string());
        Ok(())
    }

    async fn show_pools(&self) -> Result<Vec<PoolStatus>> {
        let state = self.guard(ProxyOp::ShowPools)?;
        Ok(state.pools.clone())
    }

    async fn show_databases(&self) -> Result<Vec<ProxyDatabase>> {
        let state = self.guard(ProxyOp::ShowDatabases)?;
        let paused = state.paused;
        Ok(state
            .databases
            .iter()
            .cloned()
            .map(|mut db| {
                db.paused = paused;
                db
            })
            .collect())
    }

    fn managed_databases(&self) -> &[String] {
        &self.managed
    }

    async fn set_upstream(&self, host: &str, port: Option<u16>) -> Result<()> {
        let mut state = self.guard(ProxyOp::SetUpstream)?;
        state.pending_upstream = Some((host.to_string(), port));
        state.journal.push(format!("SET UPSTREAM {}", host));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_injected_failure_expires() {
        let db = InMemoryDatabase::new("primary");
        db.fail_next(
            DbOp::NodeStatus,
            FailoverError::connectivity("primary", "reset"),
            1,
        );
        assert!(db.node_status().await.is_err());
        assert!(db.node_status().await.is_ok());
    }

    #[tokio::test]
    async fn test_unreachable_node_reports_connectivity() {
        let db = InMemoryDatabase::new("primary");
        db.set_reachable(false);
        let err = db.node_status().await.unwrap_err();
        assert!(err.is_connectivity());
    }

    #[tokio::test]
    async fn test_proxy_upstream_applies_on_reload() {
        let proxy = InMemoryProxy::new("pgbouncer", "10.0.0.1", &["app"]);
        proxy.set_upstream("10.0.0.2", None).await.unwrap();
        assert_eq!(proxy.upstream_host().as_deref(), Some("10.0.0.1"));
        proxy.reload().await.unwrap();
        assert_eq!(proxy.upstream_host().as_deref(), Some("10.0.0.2"));
    }

    #[tokio::test]
    async fn test_reload_leaves_unmanaged_databases_alone() {
        let proxy = InMemoryProxy::new("pgbouncer", "10.0.0.1", &["app"])
            .with_unmanaged_database("analytics", "warehouse");
        proxy.set_upstream("10.0.0.2", None).await.unwrap();
        proxy.reload().await.unwrap();
        assert_eq!(proxy.database_host("app").as_deref(), Some("10.0.0.2"));
        assert_eq!(proxy.database_host("analytics").as_deref(), Some("warehouse"));
        assert_eq!(proxy.upstream_host().as_deref(), Some("10.0.0.2"));
        assert_eq!(proxy.managed_databases(), ["app".to_string()]);
    }
}
