// ABOUTME: Sequence reconciliation against the in-memory fakes
// ABOUTME: Skip-when-ahead, monotonicity, per-sequence independence and the primary-down path

use std::sync::Arc;

use pg_failover::admin::memory::{DbOp, InMemoryDatabase};
use pg_failover::config::RetryPolicy;
use pg_failover::error::FailoverError;
use pg_failover::sequences::{SequenceStatus, SequenceSummary, SequenceSynchronizer};

fn synchronizer(
    primary: &Arc<InMemoryDatabase>,
    standby: &Arc<InMemoryDatabase>,
    workers: usize,
) -> SequenceSynchronizer {
    SequenceSynchronizer::new(
        primary.clone(),
        standby.clone(),
        workers,
        RetryPolicy {
            max_retries: 1,
            initial_delay_ms: 1,
        },
    )
}

#[tokio::test]
async fn test_standby_ahead_is_left_alone() {
    let primary = Arc::new(InMemoryDatabase::new("primary").with_sequence("public.s", Some(500)));
    let standby = Arc::new(InMemoryDatabase::new("standby").with_sequence("public.s", Some(600)));

    let ledger = synchronizer(&primary, &standby, 1)
        .sync(10_000, true)
        .await
        .unwrap();

    assert_eq!(ledger.len(), 1);
    let entry = &ledger[0];
    assert_eq!(entry.status, SequenceStatus::SkippedAlreadyAhead);
    assert_eq!(entry.primary_value, Some(500));
    assert_eq!(entry.standby_value, Some(600));
    assert_eq!(entry.resulting_value, Some(600));
    assert_eq!(standby.sequence("public.s"), Some(600));
    assert!(standby.journal().is_empty());
}

#[tokio::test]
async fn test_standby_behind_gets_primary_plus_buffer() {
    let primary = Arc::new(InMemoryDatabase::new("primary").with_sequence("public.s", Some(500)));
    let standby = Arc::new(InMemoryDatabase::new("standby").with_sequence("public.s", Some(3)));

    let ledger = synchronizer(&primary, &standby, 1)
        .sync(10_000, true)
        .await
        .unwrap();

    assert_eq!(ledger[0].status, SequenceStatus::Updated);
    assert_eq!(ledger[0].resulting_value, Some(10_500));
    assert_eq!(standby.sequence("public.s"), Some(10_500));
}

#[tokio::test]
async fn test_resulting_value_never_below_standby() {
    let cases = [
        (Some(0), Some(0)),
        (Some(10), None),
        (Some(100), Some(99)),
        (Some(100), Some(100)),
        (Some(100), Some(1_000_000)),
        (None, Some(7)),
        (Some(i64::MAX - 5), Some(1)),
    ];
    let mut primary = InMemoryDatabase::new("primary");
    let mut standby = InMemoryDatabase::new("standby");
    for (i, (p, s)) in cases.iter().enumerate() {
        let name = format!("public.seq_{}", i);
        primary = primary.with_sequence(&name, *p);
        standby = standby.with_sequence(&name, *s);
    }
    let primary = Arc::new(primary);
    let standby = Arc::new(standby);

    let ledger = synchronizer(&primary, &standby, 3)
        .sync(1_000, true)
        .await
        .unwrap();

    assert_eq!(ledger.len(), cases.len());
    for entry in &ledger {
        assert_ne!(entry.status, SequenceStatus::Error, "{:?}", entry);
        let before = entry.standby_value.unwrap_or(i64::MIN);
        let after = entry.resulting_value.unwrap_or(i64::MIN);
        assert!(after >= before, "{:?}", entry);
        if let (Some(p), Some(r)) = (entry.primary_value, entry.resulting_value) {
            assert!(r >= p, "{:?}", entry);
        }
    }
}

#[tokio::test]
async fn test_one_failure_does_not_stop_the_rest() {
    let names = ["public.a_seq", "public.b_seq", "public.c_seq"];
    let mut primary = InMemoryDatabase::new("primary");
    let mut standby = InMemoryDatabase::new("standby");
    for name in names {
        primary = primary.with_sequence(name, Some(100));
        standby = standby.with_sequence(name, Some(1));
    }
    let primary = Arc::new(primary);
    let standby = Arc::new(standby);
    standby.break_sequence("public.b_seq");

    let ledger = synchronizer(&primary, &standby, 2)
        .sync(50, true)
        .await
        .unwrap();

    let summary = SequenceSummary::of(&ledger);
    assert_eq!(summary.updated, 2);
    assert_eq!(summary.errors, 1);
    assert_eq!(ledger[1].sequence_name, "public.b_seq");
    assert_eq!(ledger[1].status, SequenceStatus::Error);
    assert!(ledger[1].error.as_deref().unwrap().contains("permission denied"));
    assert_eq!(standby.sequence("public.a_seq"), Some(150));
    assert_eq!(standby.sequence("public.c_seq"), Some(150));
}

#[tokio::test]
async fn test_primary_unreachable_advances_from_standby() {
    let primary = Arc::new(InMemoryDatabase::new("primary").with_sequence("public.s", Some(900)));
    primary.set_reachable(false);
    let standby = Arc::new(
        InMemoryDatabase::new("standby")
            .with_sequence("public.s", Some(400))
            .with_sequence("public.fresh", None),
    );

    let ledger = synchronizer(&primary, &standby, 2)
        .sync(10_000, false)
        .await
        .unwrap();

    assert_eq!(ledger.len(), 2);
    assert_eq!(standby.sequence("public.s"), Some(10_400));
    assert_eq!(standby.sequence("public.fresh"), Some(10_000));
    assert!(ledger.iter().all(|e| e.primary_value.is_none()));
}

#[tokio::test]
async fn test_system_schemas_are_ignored() {
    let primary = Arc::new(
        InMemoryDatabase::new("primary")
            .with_sequence("public.s", Some(1))
            .with_sequence("pg_catalog.internal_seq", Some(1))
            .with_sequence("information_schema.x_seq", Some(1)),
    );
    let standby = Arc::new(InMemoryDatabase::new("standby").with_sequence("public.s", Some(0)));

    let ledger = synchronizer(&primary, &standby, 1)
        .sync(10, true)
        .await
        .unwrap();
    assert_eq!(ledger.len(), 1);
    assert_eq!(ledger[0].sequence_name, "public.s");
}

#[tokio::test]
async fn test_listing_failure_fails_the_sync() {
    let primary = Arc::new(InMemoryDatabase::new("primary"));
    primary.fail_always(
        DbOp::ListSequences,
        FailoverError::command("primary", "permission denied for pg_sequences"),
    );
    let standby = Arc::new(InMemoryDatabase::new("standby"));

    let err = synchronizer(&primary, &standby, 1)
        .sync(10, true)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("permission denied"));
}

#[tokio::test]
async fn test_many_sequences_are_all_reconciled_in_order() {
    let mut primary = InMemoryDatabase::new("primary");
    let mut standby = InMemoryDatabase::new("standby");
    for i in 0..40 {
        let name = format!("app.seq_{:02}", i);
        primary = primary.with_sequence(&name, Some(i * 10));
        standby = standby.with_sequence(&name, Some(0));
    }
    let primary = Arc::new(primary);
    let standby = Arc::new(standby);

    let ledger = synchronizer(&primary, &standby, 4)
        .sync(5, true)
        .await
        .unwrap();

    assert_eq!(ledger.len(), 40);
    let names = ledger.iter().map(|e| e.sequence_name.clone()).collect::<Vec<_>>();
    let mut sorted = names.clone();
    sorted.sort();
    assert_eq!(names, sorted);
    // seq_00 has primary 0 == standby 0, so it is skipped
    assert_eq!(SequenceSummary::of(&ledger).updated, 39);
    assert_eq!(standby.sequence("app.seq_39"), Some(395));
}
