// ABOUTME: Replication controller - lifecycle of the logical replication channel
// ABOUTME: Pause/resume/verify are idempotent; promote drops the subscription exactly once

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::admin::{DatabaseAdmin, SubscriptionTable};
use crate::config::{ChannelConfig, RetryPolicy};
use crate::error::{FailoverError, Result};
use crate::utils::retry_with_backoff;

/// Observable state of the replication channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelState {
    /// Subscription enabled with an apply worker attached
    Active,
    /// Subscription enabled but no apply worker is running
    Paused,
    /// Subscription exists and is disabled
    Disabled,
    /// Subscription no longer exists
    Dropped,
}

impl ChannelState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Disabled => "disabled",
            Self::Dropped => "dropped",
        }
    }
}

/// The channel as observed right now.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationChannel {
    pub publication: String,
    pub subscription: String,
    pub slot: String,
    pub lag_bytes: Option<u64>,
    pub state: ChannelState,
}

/// Result of [`ReplicationController::verify`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelVerification {
    pub channel: ReplicationChannel,
    pub tables: Vec<SubscriptionTable>,
}

impl ChannelVerification {
    pub fn present(&self) -> bool {
        self.channel.state != ChannelState::Dropped
    }
}

/// Lag observed immediately after a resume; the controller does not wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LagSnapshot {
    pub lag_bytes: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PromoteOptions {
    pub lag_threshold: u64,
    pub force: bool,
    /// When false the slot is detached before the drop and lag is unknown
    pub primary_reachable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromoteOutcome {
    /// Lag observed right before the drop
    pub lag_bytes: Option<u64>,
    /// The lag check was bypassed
    pub forced: bool,
    /// The subscription was already gone before we touched it
    pub already_absent: bool,
    /// The replication slot still exists on the old primary
    pub slot_left_on_primary: bool,
}

/// Lag precondition for promotion. Unknown lag is only accepted with `force`.
pub fn check_lag(lag_bytes: Option<u64>, threshold: u64, force: bool) -> Result<()> {
    match lag_bytes {
        Some(lag) if lag > threshold && !force => Err(FailoverError::precondition(
            format!(
                "replication lag {} bytes exceeds threshold {} bytes",
                lag, threshold
            ),
            "wait for the standby to catch up, or re-run with --force to proceed despite lag",
        )),
        None if !force => Err(FailoverError::precondition(
            "replication lag could not be determined",
            "re-run with --force to proceed despite unknown lag",
        )),
        Some(lag) if lag > threshold => {
            tracing::warn!(
                "Forcing promotion with lag {} bytes over threshold {} bytes",
                lag,
                threshold
            );
            Ok(())
        }
        None => {
            tracing::warn!("Forcing promotion with unknown replication lag");
            Ok(())
        }
        Some(_) => Ok(()),
    }
}

/// Manages pause/resume/promote/verify of the logical replication channel.
pub struct ReplicationController {
    channel: ChannelConfig,
    primary: Arc<dyn DatabaseAdmin>,
    standby: Arc<dyn DatabaseAdmin>,
    retry: RetryPolicy,
}

impl ReplicationController {
    pub fn new(
        channel: ChannelConfig,
        primary: Arc<dyn DatabaseAdmin>,
        standby: Arc<dyn DatabaseAdmin>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            channel,
            primary,
            standby,
            retry,
        }
    }

    async fn state_once(&self) -> Result<ChannelState> {
        let status = self
            .standby
            .subscription_status(&self.channel.subscription)
            .await?;
        Ok(match status {
            None => ChannelState::Dropped,
            Some(s) if !s.enabled => ChannelState::Disabled,
            Some(s) if s.worker_running => ChannelState::Active,
            Some(_) => ChannelState::Paused,
        })
    }

    /// Current channel state, retried on connectivity errors.
    pub async fn state(&self) -> Result<ChannelState> {
        retry_with_backoff(|| self.state_once(), self.retry, "channel state").await
    }

    /// Current slot lag on the primary; `None` when the slot is missing or
    /// has not confirmed a position.
    pub async fn lag_bytes(&self) -> Result<Option<u64>> {
        let slot = retry_with_backoff(
            || self.primary.slot_status(self.channel.slot_name()),
            self.retry,
            "slot lag",
        )
        .await?;
        Ok(slot.and_then(|s| s.lag_bytes))
    }

    /// Disable the subscription. Already disabled converges to success.
    pub async fn pause(&self) -> Result<ChannelState> {
        match self.state().await? {
            ChannelState::Dropped => {
                return Err(FailoverError::precondition(
                    format!(
                        "subscription {} does not exist on {}",
                        self.channel.subscription,
                        self.standby.target()
                    ),
                    "check the channel with `pg-failover channel verify`",
                ))
            }
            ChannelState::Disabled => {
                tracing::info!(
                    "Subscription {} is already disabled",
                    self.channel.subscription
                );
                return Ok(ChannelState::Disabled);
            }
            ChannelState::Active | ChannelState::Paused => {}
        }

        self.standby
            .set_subscription_enabled(&self.channel.subscription, false)
            .await?;
        let state = self.state().await?;
        if state != ChannelState::Disabled {
            return Err(FailoverError::conflict(format!(
                "subscription {} is {} after DISABLE",
                self.channel.subscription,
                state.as_str()
            )));
        }
        tracing::info!("Paused replication channel {}", self.channel.subscription);
        Ok(state)
    }

    /// Re-enable the subscription and return the lag as it stands now.
    pub async fn resume(&self) -> Result<LagSnapshot> {
        match self.state().await? {
            ChannelState::Dropped => {
                return Err(FailoverError::precondition(
                    format!(
                        "subscription {} does not exist on {}",
                        self.channel.subscription,
                        self.standby.target()
                    ),
                    "the channel was dropped; it cannot be resumed",
                ))
            }
            ChannelState::Disabled => {
                self.standby
                    .set_subscription_enabled(&self.channel.subscription, true)
                    .await?;
                tracing::info!("Resumed replication channel {}", self.channel.subscription);
            }
            ChannelState::Active | ChannelState::Paused => {
                tracing::info!(
                    "Subscription {} is already enabled",
                    self.channel.subscription
                );
            }
        }

        let lag_bytes = match self.lag_bytes().await {
            Ok(lag) => lag,
            Err(e) => {
                tracing::warn!("Could not read slot lag after resume: {}", e);
                None
            }
        };
        Ok(LagSnapshot { lag_bytes })
    }

    /// Irreversibly drop the subscription so the standby stops applying
    /// changes and can take writes.
    ///
    /// Nothing is mutated when the lag precondition fails. The drop itself is
    /// issued at most once; an ambiguous result is resolved by re-querying.
    pub async fn promote(&self, options: PromoteOptions) -> Result<PromoteOutcome> {
        if self.state().await? == ChannelState::Dropped {
            tracing::warn!(
                "Subscription {} is already absent on {}; treating promotion as done",
                self.channel.subscription,
                self.standby.target()
            );
            return Ok(PromoteOutcome {
                lag_bytes: None,
                forced: options.force,
                already_absent: true,
                slot_left_on_primary: false,
            });
        }

        let lag_bytes = if options.primary_reachable {
            self.lag_bytes().await?
        } else {
            None
        };

        check_lag(lag_bytes, options.lag_threshold, options.force)?;

        // apply worker must be stopped before the drop
        self.pause().await?;

        let detach_slot = !options.primary_reachable;
        tracing::info!(
            "Dropping subscription {} on {} (lag: {:?} bytes)",
            self.channel.subscription,
            self.standby.target(),
            lag_bytes
        );

        if let Err(e) = self
            .standby
            .drop_subscription(&self.channel.subscription, detach_slot)
            .await
        {
            if !e.is_connectivity() {
                return Err(e);
            }
            tracing::warn!("Drop of {} returned an ambiguous result: {}", self.channel.subscription, e);
            match self.state().await {
                Ok(ChannelState::Dropped) => {
                    tracing::info!("Subscription {} is gone; drop took effect", self.channel.subscription);
                }
                Ok(state) => {
                    tracing::warn!(
                        "Subscription {} is still {}; drop did not take effect",
                        self.channel.subscription,
                        state.as_str()
                    );
                    return Err(e);
                }
                Err(query_err) => {
                    return Err(FailoverError::irreversible(
                        format!(
                            "drop of subscription {} may or may not have been applied: {}",
                            self.channel.subscription, query_err
                        ),
                        vec![
                            format!(
                                "Check on {}: SELECT subname FROM pg_subscription WHERE subname = '{}'",
                                self.standby.target(),
                                self.channel.subscription
                            ),
                            "If the row is gone, continue with `pg-failover proxy set-upstream` and `pg-failover proxy resume`".to_string(),
                            "If the row exists, re-run the failover".to_string(),
                        ],
                    ));
                }
            }
        } else {
            match self.state().await {
                Ok(ChannelState::Dropped) => {}
                Ok(state) => {
                    return Err(FailoverError::irreversible(
                        format!(
                            "subscription {} is still {} after DROP SUBSCRIPTION succeeded",
                            self.channel.subscription,
                            state.as_str()
                        ),
                        vec![format!(
                            "Inspect pg_subscription on {} for a concurrently created subscription",
                            self.standby.target()
                        )],
                    ));
                }
                Err(e) => {
                    return Err(FailoverError::irreversible(
                        format!("could not verify the subscription was dropped: {}", e),
                        vec![format!(
                            "Confirm on {} that {} no longer appears in pg_subscription",
                            self.standby.target(),
                            self.channel.subscription
                        )],
                    ));
                }
            }
        }

        Ok(PromoteOutcome {
            lag_bytes,
            forced: options.force,
            already_absent: false,
            slot_left_on_primary: detach_slot,
        })
    }

    /// Observe the channel and the per-table synchronization states.
    pub async fn verify(&self) -> Result<ChannelVerification> {
        let state = self.state().await?;
        let tables = retry_with_backoff(
            || self.standby.subscription_tables(&self.channel.subscription),
            self.retry,
            "subscription tables",
        )
        .await?;
        let lag_bytes = match self.lag_bytes().await {
            Ok(lag) => lag,
            Err(e) if e.is_connectivity() => {
                tracing::debug!("Slot lag unavailable during verify: {}", e);
                None
            }
            Err(e) => return Err(e),
        };

        Ok(ChannelVerification {
            channel: ReplicationChannel {
                publication: self.channel.publication.clone(),
                subscription: self.channel.subscription.clone(),
                slot: self.channel.slot_name().to_string(),
                lag_bytes,
                state,
            },
            tables,
        })
    }

    /// Poll slot lag until it drops to `tolerance` bytes or `timeout` passes.
    /// Returns the last lag observed. Errors are logged and end the wait early.
    ///
    /// A frozen primary still writes a little WAL of its own (checkpoints,
    /// running-xacts records), so the slot seldom reads exactly zero.
    pub async fn wait_for_catchup(
        &self,
        timeout: Duration,
        poll: Duration,
        tolerance: u64,
    ) -> Option<u64> {
        let started = Instant::now();
        let mut last = None;
        loop {
            match self.primary.slot_status(self.channel.slot_name()).await {
                Ok(slot) => last = slot.and_then(|s| s.lag_bytes),
                Err(e) => {
                    tracing::warn!("Stopped waiting for catch-up: {}", e);
                    return last;
                }
            }
            if let Some(lag) = last.filter(|lag| *lag <= tolerance) {
                tracing::info!("Standby caught up (lag {} bytes)", lag);
                return last;
            }
            if started.elapsed() >= timeout {
                tracing::warn!(
                    "Standby still {:?} bytes behind after {:?}",
                    last,
                    timeout
                );
                return last;
            }
            tokio::time::sleep(poll).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admin::memory::InMemoryDatabase;

    fn controller(
        primary: Arc<InMemoryDatabase>,
        standby: Arc<InMemoryDatabase>,
    ) -> ReplicationController {
        ReplicationController::new(
            ChannelConfig {
                publication: "failover_pub".to_string(),
                subscription: "failover_sub".to_string(),
                slot: None,
            },
            primary,
            standby,
            RetryPolicy {
                max_retries: 2,
                initial_delay_ms: 1,
            },
        )
    }

    #[test]
    fn test_check_lag() {
        assert!(check_lag(Some(50_000_000), 100_000_000, false).is_ok());
        assert!(check_lag(Some(50_000_000), 10_000_000, true).is_ok());
        assert!(check_lag(None, 10, true).is_ok());

        let err = check_lag(Some(50_000_000), 10_000_000, false).unwrap_err();
        assert!(matches!(err, FailoverError::Precondition { .. }));
        assert!(check_lag(None, 10, false).is_err());
    }

    #[tokio::test]
    async fn test_state_mapping() {
        let primary = Arc::new(InMemoryDatabase::new("primary").with_slot("failover_sub", true, 0));
        let standby =
            Arc::new(InMemoryDatabase::new("standby").with_subscription("failover_sub", &[]));
        let ctl = controller(primary, standby.clone());

        assert_eq!(ctl.state().await.unwrap(), ChannelState::Active);
        ctl.pause().await.unwrap();
        assert_eq!(ctl.state().await.unwrap(), ChannelState::Disabled);
        standby.remove_subscription("failover_sub");
        assert_eq!(ctl.state().await.unwrap(), ChannelState::Dropped);
    }

    #[tokio::test]
    async fn test_resume_returns_lag_without_waiting() {
        let primary =
            Arc::new(InMemoryDatabase::new("primary").with_slot("failover_sub", false, 123_456));
        let standby =
            Arc::new(InMemoryDatabase::new("standby").with_subscription("failover_sub", &[]));
        let ctl = controller(primary, standby.clone());

        ctl.pause().await.unwrap();
        let snapshot = ctl.resume().await.unwrap();
        assert_eq!(snapshot.lag_bytes, Some(123_456));
        assert!(standby.subscription("failover_sub").unwrap().enabled);
    }

    #[tokio::test]
    async fn test_wait_for_catchup_returns_zero_when_drained() {
        let primary = Arc::new(InMemoryDatabase::new("primary").with_slot("failover_sub", true, 0));
        let standby =
            Arc::new(InMemoryDatabase::new("standby").with_subscription("failover_sub", &[]));
        let ctl = controller(primary, standby);

        let lag = ctl
            .wait_for_catchup(Duration::from_secs(1), Duration::from_millis(1), 0)
            .await;
        assert_eq!(lag, Some(0));
    }

    #[tokio::test]
    async fn test_wait_for_catchup_accepts_residual_within_tolerance() {
        let primary =
            Arc::new(InMemoryDatabase::new("primary").with_slot("failover_sub", true, 152));
        let standby =
            Arc::new(InMemoryDatabase::new("standby").with_subscription("failover_sub", &[]));
        let ctl = controller(primary, standby);

        let lag = tokio::time::timeout(
            Duration::from_secs(5),
            ctl.wait_for_catchup(Duration::from_secs(60), Duration::from_millis(1), 8192),
        )
        .await
        .expect("a residual within tolerance should end the wait");
        assert_eq!(lag, Some(152));
    }

    #[tokio::test]
    async fn test_wait_for_catchup_gives_up_after_timeout() {
        let primary =
            Arc::new(InMemoryDatabase::new("primary").with_slot("failover_sub", true, 512));
        let standby =
            Arc::new(InMemoryDatabase::new("standby").with_subscription("failover_sub", &[]));
        let ctl = controller(primary, standby);

        let lag = ctl
            .wait_for_catchup(Duration::from_millis(5), Duration::from_millis(1), 256)
            .await;
        assert_eq!(lag, Some(512));
    }
}
