// ABOUTME: Proxy controller - pauses/resumes client traffic and redirects the upstream
// ABOUTME: Redundant PAUSE/RESUME converge to success instead of failing the run

use std::sync::Arc;

use crate::admin::{PoolStatus, ProxyAdmin, ProxyDatabase};
use crate::config::RetryPolicy;
use crate::error::{FailoverError, Result};
use crate::utils::retry_with_backoff;

pub struct ProxyController {
    proxy: Arc<dyn ProxyAdmin>,
    retry: RetryPolicy,
}

impl ProxyController {
    pub fn new(proxy: Arc<dyn ProxyAdmin>, retry: RetryPolicy) -> Self {
        Self { proxy, retry }
    }

    pub fn target(&self) -> &str {
        self.proxy.target()
    }

    /// Stop handing out server connections. In-flight transactions finish and
    /// new clients queue.
    pub async fn pause(&self) -> Result<()> {
        match self.proxy.pause().await {
            Ok(()) => {
                tracing::info!("Paused {}", self.proxy.target());
                Ok(())
            }
            Err(FailoverError::StateConflict { message }) => {
                tracing::info!("{} already paused ({})", self.proxy.target(), message);
                Ok(())
            }
            Err(e) if e.is_connectivity() => {
                // PAUSE may have landed even though we never saw the reply
                tracing::warn!("PAUSE on {} did not confirm: {}", self.proxy.target(), e);
                match self.upstreams().await {
                    Ok(dbs) if !dbs.is_empty() && dbs.iter().all(|db| db.paused) => {
                        tracing::info!("{} reports every database paused", self.proxy.target());
                        Ok(())
                    }
                    _ => Err(e),
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Let queued clients through again.
    pub async fn resume(&self) -> Result<()> {
        retry_with_backoff(
            || async {
                match self.proxy.resume().await {
                    Err(FailoverError::StateConflict { message }) => {
                        tracing::info!("{} not paused ({})", self.proxy.target(), message);
                        Ok(())
                    }
                    other => other,
                }
            },
            self.retry,
            "proxy resume",
        )
        .await?;
        tracing::info!("Resumed {}", self.proxy.target());
        Ok(())
    }

    /// Point the managed databases at `host`. Call [`Self::reload`] to apply.
    pub async fn set_upstream(&self, host: &str, port: Option<u16>) -> Result<()> {
        retry_with_backoff(
            || self.proxy.set_upstream(host, port),
            self.retry,
            "set upstream",
        )
        .await
    }

    pub async fn reload(&self) -> Result<()> {
        retry_with_backoff(|| self.proxy.reload(), self.retry, "proxy reload").await?;
        tracing::info!("Reloaded {}", self.proxy.target());
        Ok(())
    }

    /// Per-pool traffic counters.
    pub async fn status(&self) -> Result<Vec<PoolStatus>> {
        retry_with_backoff(|| self.proxy.show_pools(), self.retry, "show pools").await
    }

    /// Per-database upstream routing.
    pub async fn upstreams(&self) -> Result<Vec<ProxyDatabase>> {
        retry_with_backoff(|| self.proxy.show_databases(), self.retry, "show databases").await
    }

    /// Whether an upstream swap rewrites `database`.
    pub fn is_managed(&self, database: &str) -> bool {
        let managed = self.proxy.managed_databases();
        managed.is_empty() || managed.iter().any(|m| m == database)
    }

    /// Upstream routing of the databases a swap rewrites.
    pub async fn managed_upstreams(&self) -> Result<Vec<ProxyDatabase>> {
        let dbs = self.upstreams().await?;
        Ok(dbs.into_iter().filter(|db| self.is_managed(&db.name)).collect())
    }

    /// The single `host:port` every managed database routes to, or `None` if
    /// they disagree or nothing is configured.
    pub async fn current_upstream(&self) -> Result<Option<(String, u16)>> {
        let dbs = self.managed_upstreams().await?;
        let Some(first) = dbs.first() else {
            return Ok(None);
        };
        Ok(dbs
            .iter()
            .all(|db| db.host.eq_ignore_ascii_case(&first.host) && db.port == first.port)
            .then(|| (first.host.clone(), first.port)))
    }

    /// True when every managed database routes to `host` (and `port`, if given).
    pub async fn routes_to(&self, host: &str, port: Option<u16>) -> Result<bool> {
        let dbs = self.managed_upstreams().await?;
        Ok(!dbs.is_empty() && dbs.iter().all(|db| points_at(db, host, port)))
    }

    /// True when any managed database still routes to `host` (and `port`, if given).
    pub async fn any_routes_to(&self, host: &str, port: Option<u16>) -> Result<bool> {
        let dbs = self.managed_upstreams().await?;
        Ok(dbs.iter().any(|db| points_at(db, host, port)))
    }
}

fn points_at(db: &ProxyDatabase, host: &str, port: Option<u16>) -> bool {
    db.host.eq_ignore_ascii_case(host) && port.map_or(true, |p| db.port == p)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admin::memory::{InMemoryProxy, ProxyOp};

    fn controller(proxy: Arc<InMemoryProxy>) -> ProxyController {
        ProxyController::new(
            proxy,
            RetryPolicy {
                max_retries: 2,
                initial_delay_ms: 1,
            },
        )
    }

    #[tokio::test]
    async fn test_pause_twice_converges() {
        let proxy = Arc::new(InMemoryProxy::new("pgbouncer", "db-a", &["app"]));
        let ctl = controller(proxy.clone());
        ctl.pause().await.unwrap();
        ctl.pause().await.unwrap();
        assert!(proxy.is_paused());
        assert_eq!(proxy.journal(), vec!["PAUSE".to_string()]);
    }

    #[tokio::test]
    async fn test_resume_when_not_paused_converges() {
        let proxy = Arc::new(InMemoryProxy::new("pgbouncer", "db-a", &["app"]));
        controller(proxy.clone()).resume().await.unwrap();
        assert!(!proxy.is_paused());
        assert!(proxy.journal().is_empty());
    }

    #[tokio::test]
    async fn test_resume_retries_connectivity() {
        let proxy = Arc::new(InMemoryProxy::new("pgbouncer", "db-a", &["app"]));
        let ctl = controller(proxy.clone());
        ctl.pause().await.unwrap();
        proxy.fail_next(
            ProxyOp::Resume,
            FailoverError::connectivity("pgbouncer", "connection reset"),
            1,
        );
        ctl.resume().await.unwrap();
        assert!(!proxy.is_paused());
    }

    #[tokio::test]
    async fn test_upstream_swap_requires_reload() {
        let proxy = Arc::new(InMemoryProxy::new("pgbouncer", "db-a", &["app", "reports"]));
        let ctl = controller(proxy);
        ctl.set_upstream("db-b", None).await.unwrap();
        assert!(ctl.routes_to("db-a", None).await.unwrap());
        ctl.reload().await.unwrap();
        assert!(ctl.routes_to("db-b", Some(5432)).await.unwrap());
        assert!(!ctl.any_routes_to("db-a", None).await.unwrap());
        assert_eq!(
            ctl.current_upstream().await.unwrap(),
            Some(("db-b".to_string(), 5432))
        );
    }

    #[tokio::test]
    async fn test_routing_checks_ignore_unmanaged_databases() {
        let proxy = Arc::new(
            InMemoryProxy::new("pgbouncer", "db-a", &["app"])
                .with_unmanaged_database("analytics", "warehouse"),
        );
        let ctl = controller(proxy);
        assert!(!ctl.is_managed("analytics"));
        assert_eq!(ctl.managed_upstreams().await.unwrap().len(), 1);
        assert_eq!(ctl.upstreams().await.unwrap().len(), 2);
        assert_eq!(
            ctl.current_upstream().await.unwrap(),
            Some(("db-a".to_string(), 5432))
        );

        ctl.set_upstream("db-b", Some(5432)).await.unwrap();
        ctl.reload().await.unwrap();
        assert!(ctl.routes_to("db-b", Some(5432)).await.unwrap());
        assert!(!ctl.any_routes_to("warehouse", None).await.unwrap());
    }
}
