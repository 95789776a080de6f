// ABOUTME: Replication channel behaviour against the in-memory fakes
// ABOUTME: Lag-gated promotion, idempotent pause/resume and ambiguous drop results

use std::sync::Arc;

use pg_failover::admin::memory::{DbOp, InMemoryDatabase};
use pg_failover::admin::TableSyncState;
use pg_failover::config::{ChannelConfig, RetryPolicy};
use pg_failover::error::{ErrorKind, FailoverError};
use pg_failover::replication::{ChannelState, PromoteOptions, ReplicationController};

const SUB: &str = "failover_sub";

fn pair(lag_bytes: u64) -> (Arc<InMemoryDatabase>, Arc<InMemoryDatabase>) {
    let primary = InMemoryDatabase::new("primary").with_slot(SUB, true, lag_bytes);
    let standby = InMemoryDatabase::new("standby").with_subscription(SUB, &["public.orders"]);
    (Arc::new(primary), Arc::new(standby))
}

fn controller(primary: &Arc<InMemoryDatabase>, standby: &Arc<InMemoryDatabase>) -> ReplicationController {
    ReplicationController::new(
        ChannelConfig {
            publication: "failover_pub".to_string(),
            subscription: SUB.to_string(),
            slot: None,
        },
        primary.clone(),
        standby.clone(),
        RetryPolicy {
            max_retries: 2,
            initial_delay_ms: 1,
        },
    )
}

fn promote_options(lag_threshold: u64) -> PromoteOptions {
    PromoteOptions {
        lag_threshold,
        force: false,
        primary_reachable: true,
    }
}

#[tokio::test]
async fn test_promote_within_threshold_drops_subscription() {
    let (primary, standby) = pair(50_000_000);
    let channel = controller(&primary, &standby);

    let outcome = channel.promote(promote_options(100_000_000)).await.unwrap();
    assert_eq!(outcome.lag_bytes, Some(50_000_000));
    assert!(!outcome.forced);
    assert!(!outcome.slot_left_on_primary);
    assert_eq!(channel.state().await.unwrap(), ChannelState::Dropped);

    // disabled before the drop, and no detach while the primary is reachable
    let journal = standby.journal();
    assert_eq!(
        journal,
        vec![
            format!("ALTER SUBSCRIPTION {} DISABLE", SUB),
            format!("DROP SUBSCRIPTION {}", SUB),
        ]
    );
}

#[tokio::test]
async fn test_promote_over_threshold_leaves_channel_untouched() {
    let (primary, standby) = pair(50_000_000);
    let channel = controller(&primary, &standby);

    let err = channel.promote(promote_options(10_000_000)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Precondition);

    let verification = channel.verify().await.unwrap();
    assert!(verification.present());
    assert_eq!(verification.channel.state, ChannelState::Active);
    assert_eq!(verification.channel.lag_bytes, Some(50_000_000));
    assert!(standby.journal().is_empty());
}

#[tokio::test]
async fn test_forced_promote_ignores_lag() {
    let (primary, standby) = pair(50_000_000);
    let channel = controller(&primary, &standby);

    let outcome = channel
        .promote(PromoteOptions {
            force: true,
            ..promote_options(10_000_000)
        })
        .await
        .unwrap();
    assert!(outcome.forced);
    assert!(standby.subscription(SUB).is_none());
}

#[tokio::test]
async fn test_promote_without_primary_detaches_slot() {
    let (primary, standby) = pair(0);
    primary.set_reachable(false);
    let channel = controller(&primary, &standby);

    let outcome = channel
        .promote(PromoteOptions {
            lag_threshold: 0,
            force: true,
            primary_reachable: false,
        })
        .await
        .unwrap();
    assert_eq!(outcome.lag_bytes, None);
    assert!(outcome.slot_left_on_primary);
    assert!(standby
        .journal()
        .contains(&format!("ALTER SUBSCRIPTION {} SET (slot_name = NONE)", SUB)));
}

#[tokio::test]
async fn test_promote_twice_reports_already_absent() {
    let (primary, standby) = pair(0);
    let channel = controller(&primary, &standby);

    channel.promote(promote_options(1024)).await.unwrap();
    let second = channel.promote(promote_options(1024)).await.unwrap();
    assert!(second.already_absent);
    assert_eq!(
        standby
            .journal()
            .iter()
            .filter(|c| c.starts_with("DROP SUBSCRIPTION"))
            .count(),
        1
    );
}

#[tokio::test]
async fn test_pause_is_idempotent() {
    let (primary, standby) = pair(0);
    let channel = controller(&primary, &standby);

    let first = channel.pause().await.unwrap();
    let second = channel.pause().await.unwrap();
    assert_eq!(first, ChannelState::Disabled);
    assert_eq!(first, second);
    assert_eq!(standby.journal().len(), 1);

    let sub = standby.subscription(SUB).unwrap();
    assert!(!sub.enabled);
}

#[tokio::test]
async fn test_resume_after_pause_reenables() {
    let (primary, standby) = pair(4096);
    let channel = controller(&primary, &standby);

    channel.pause().await.unwrap();
    let snapshot = channel.resume().await.unwrap();
    assert_eq!(snapshot.lag_bytes, Some(4096));
    assert_eq!(channel.state().await.unwrap(), ChannelState::Active);

    // already enabled: no second ENABLE
    channel.resume().await.unwrap();
    assert_eq!(
        standby
            .journal()
            .iter()
            .filter(|c| c.ends_with("ENABLE") && !c.ends_with("DISABLE"))
            .count(),
        1
    );
}

#[tokio::test]
async fn test_pause_of_missing_subscription_is_precondition() {
    let (primary, standby) = pair(0);
    standby.remove_subscription(SUB);
    let channel = controller(&primary, &standby);

    let err = channel.pause().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Precondition);
}

#[tokio::test]
async fn test_ambiguous_drop_that_took_effect_succeeds() {
    let (primary, standby) = pair(0);
    standby.drop_reports_timeout();
    let channel = controller(&primary, &standby);

    let outcome = channel.promote(promote_options(1024)).await.unwrap();
    assert!(!outcome.already_absent);
    assert_eq!(channel.state().await.unwrap(), ChannelState::Dropped);
}

#[tokio::test]
async fn test_ambiguous_drop_that_did_not_apply_returns_error() {
    let (primary, standby) = pair(0);
    standby.fail_next(
        DbOp::DropSubscription,
        FailoverError::connectivity("standby", "connection reset by peer"),
        1,
    );
    let channel = controller(&primary, &standby);

    let err = channel.promote(promote_options(1024)).await.unwrap_err();
    assert!(err.is_connectivity());
    assert_eq!(channel.state().await.unwrap(), ChannelState::Disabled);
}

#[tokio::test]
async fn test_verify_reports_table_states() {
    let (primary, standby) = pair(0);
    standby.set_table_state(SUB, "public.orders", TableSyncState::CopyingData);
    let channel = controller(&primary, &standby);

    let verification = channel.verify().await.unwrap();
    assert_eq!(verification.tables.len(), 1);
    assert_eq!(verification.tables[0].state, TableSyncState::CopyingData);
    assert_eq!(verification.channel.slot, SUB);
}

#[tokio::test]
async fn test_state_retries_transient_connectivity() {
    let (primary, standby) = pair(0);
    standby.fail_next(
        DbOp::SubscriptionStatus,
        FailoverError::connectivity("standby", "timeout"),
        2,
    );
    let channel = controller(&primary, &standby);
    assert_eq!(channel.state().await.unwrap(), ChannelState::Active);
}
