// ABOUTME: Per-pair run lock held as a PostgreSQL advisory lock on the standby
// ABOUTME: A second invocation for the same primary/standby pair is rejected with AlreadyRunning

use std::sync::Arc;

use sha2::{Digest, Sha256};

use crate::admin::DatabaseAdmin;
use crate::error::{FailoverError, Result};
use crate::health::Node;

/// Stable advisory-lock key for a node pair.
pub fn pair_key(primary: &Node, standby: &Node) -> i64 {
    let mut hasher = Sha256::new();
    hasher.update(
        format!(
            "pg-failover:{}:{}:{}:{}",
            primary.host, primary.port, standby.host, standby.port
        )
        .as_bytes(),
    );
    let digest = hasher.finalize();
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    i64::from_be_bytes(bytes)
}

pub fn pair_label(primary: &Node, standby: &Node) -> String {
    format!(
        "{}:{} -> {}:{}",
        primary.host, primary.port, standby.host, standby.port
    )
}

/// Held advisory lock. Release explicitly with [`FailoverLock::release`];
/// the server drops it when the admin session ends.
pub struct FailoverLock {
    admin: Arc<dyn DatabaseAdmin>,
    key: i64,
    pair: String,
}

impl FailoverLock {
    pub async fn acquire(
        admin: Arc<dyn DatabaseAdmin>,
        primary: &Node,
        standby: &Node,
    ) -> Result<Self> {
        let key = pair_key(primary, standby);
        let pair = pair_label(primary, standby);
        if !admin.try_advisory_lock(key).await? {
            return Err(FailoverError::AlreadyRunning { pair });
        }
        tracing::debug!("Acquired failover lock {} for {}", key, pair);
        Ok(Self { admin, key, pair })
    }

    pub fn key(&self) -> i64 {
        self.key
    }

    pub async fn release(self) -> Result<()> {
        self.admin.advisory_unlock(self.key).await?;
        tracing::debug!("Released failover lock for {}", self.pair);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admin::memory::InMemoryDatabase;
    use crate::health::Role;

    fn node(host: &str, role: Role) -> Node {
        Node {
            name: host.to_string(),
            role,
            host: host.to_string(),
            port: 5432,
        }
    }

    #[test]
    fn test_pair_key_is_stable_and_ordered() {
        let a = node("db-a", Role::Primary);
        let b = node("db-b", Role::Standby);
        assert_eq!(pair_key(&a, &b), pair_key(&a, &b));
        assert_ne!(pair_key(&a, &b), pair_key(&b, &a));
    }

    #[tokio::test]
    async fn test_second_acquire_is_rejected() {
        let standby = Arc::new(InMemoryDatabase::new("standby"));
        let a = node("db-a", Role::Primary);
        let b = node("db-b", Role::Standby);

        let lock = FailoverLock::acquire(standby.clone(), &a, &b).await.unwrap();
        let err = FailoverLock::acquire(standby.clone(), &a, &b)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, FailoverError::AlreadyRunning { .. }));

        lock.release().await.unwrap();
        assert!(standby.held_locks().is_empty());
        FailoverLock::acquire(standby, &a, &b).await.unwrap();
    }
}
