// ABOUTME: Sequence synchronizer - advances standby sequences past the primary before promotion
// ABOUTME: Never decreases a sequence; each sequence is reconciled independently with bounded parallelism

use std::sync::Arc;

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};

use crate::admin::DatabaseAdmin;
use crate::config::RetryPolicy;
use crate::error::Result;
use crate::utils::{retry_with_backoff, split_qualified_name};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SequenceStatus {
    Updated,
    SkippedAlreadyAhead,
    Error,
}

impl SequenceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Updated => "updated",
            Self::SkippedAlreadyAhead => "skipped_already_ahead",
            Self::Error => "error",
        }
    }
}

/// Ledger entry for one sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceOutcome {
    pub sequence_name: String,
    pub primary_value: Option<i64>,
    pub standby_value: Option<i64>,
    pub resulting_value: Option<i64>,
    pub status: SequenceStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SequenceOutcome {
    fn failed(sequence_name: &str, error: String) -> Self {
        Self {
            sequence_name: sequence_name.to_string(),
            primary_value: None,
            standby_value: None,
            resulting_value: None,
            status: SequenceStatus::Error,
            error: Some(error),
        }
    }
}

/// Summary counts over a ledger.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceSummary {
    pub updated: usize,
    pub skipped: usize,
    pub errors: usize,
}

impl SequenceSummary {
    pub fn of(ledger: &[SequenceOutcome]) -> Self {
        let mut summary = Self::default();
        for outcome in ledger {
            match outcome.status {
                SequenceStatus::Updated => summary.updated += 1,
                SequenceStatus::SkippedAlreadyAhead => summary.skipped += 1,
                SequenceStatus::Error => summary.errors += 1,
            }
        }
        summary
    }
}

fn is_system_schema(schema: &str) -> bool {
    schema == "information_schema" || schema.starts_with("pg_")
}

/// Decide the value the standby should end up at.
///
/// `primary` is `None` both when the primary has never advanced the sequence
/// and when it could not be read at all; `primary_reachable` tells the two
/// apart. Returns `None` when the standby should be left alone.
fn target_value(
    primary: Option<i64>,
    standby: Option<i64>,
    buffer: i64,
    primary_reachable: bool,
) -> Option<i64> {
    if !primary_reachable {
        return Some(standby.unwrap_or(0).saturating_add(buffer));
    }
    let primary = primary?;
    match standby {
        Some(current) if current >= primary => None,
        _ => Some(primary.saturating_add(buffer)),
    }
}

/// Reconciles sequence values from the primary onto the standby.
pub struct SequenceSynchronizer {
    primary: Arc<dyn DatabaseAdmin>,
    standby: Arc<dyn DatabaseAdmin>,
    workers: usize,
    retry: RetryPolicy,
}

impl SequenceSynchronizer {
    pub fn new(
        primary: Arc<dyn DatabaseAdmin>,
        standby: Arc<dyn DatabaseAdmin>,
        workers: usize,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            primary,
            standby,
            workers: workers.max(1),
            retry,
        }
    }

    /// Reconcile every user sequence and return the ledger sorted by name.
    ///
    /// With `primary_reachable = false` the sequences are enumerated on the
    /// standby and each is advanced by `buffer` from its own value. Only the
    /// enumeration can fail the call; per-sequence failures are ledger entries.
    pub async fn sync(&self, buffer: i64, primary_reachable: bool) -> Result<Vec<SequenceOutcome>> {
        let source: &dyn DatabaseAdmin = if primary_reachable {
            self.primary.as_ref()
        } else {
            self.standby.as_ref()
        };

        let names = retry_with_backoff(|| source.list_sequences(), self.retry, "list sequences")
            .await?
            .into_iter()
            .filter(|name| !is_system_schema(split_qualified_name(name).0))
            .collect::<Vec<_>>();

        tracing::info!(
            "Reconciling {} sequence(s) from {} with buffer {} ({} workers)",
            names.len(),
            source.target(),
            buffer,
            self.workers
        );

        let mut ledger = stream::iter(names)
            .map(|name| async move { self.sync_one(name, buffer, primary_reachable).await })
            .buffer_unordered(self.workers)
            .collect::<Vec<_>>()
            .await;
        ledger.sort_by(|a, b| a.sequence_name.cmp(&b.sequence_name));

        let summary = SequenceSummary::of(&ledger);
        tracing::info!(
            "Sequences: {} updated, {} already ahead, {} errors",
            summary.updated,
            summary.skipped,
            summary.errors
        );
        Ok(ledger)
    }

    async fn sync_one(&self, name: String, buffer: i64, primary_reachable: bool) -> SequenceOutcome {
        let primary_value = if primary_reachable {
            match retry_with_backoff(
                || self.primary.sequence_value(&name),
                self.retry,
                "read primary sequence",
            )
            .await
            {
                Ok(value) => value,
                Err(e) => return SequenceOutcome::failed(&name, e.to_string()),
            }
        } else {
            None
        };

        let standby_value = match retry_with_backoff(
            || self.standby.sequence_value(&name),
            self.retry,
            "read standby sequence",
        )
        .await
        {
            Ok(value) => value,
            Err(e) => {
                let mut outcome = SequenceOutcome::failed(&name, e.to_string());
                outcome.primary_value = primary_value;
                return outcome;
            }
        };

        let Some(target) = target_value(primary_value, standby_value, buffer, primary_reachable)
        else {
            tracing::debug!(
                "{}: standby {:?} already at or ahead of primary {:?}",
                name,
                standby_value,
                primary_value
            );
            return SequenceOutcome {
                sequence_name: name,
                primary_value,
                standby_value,
                resulting_value: standby_value,
                status: SequenceStatus::SkippedAlreadyAhead,
                error: None,
            };
        };

        // setval is idempotent for a fixed target, so retrying is safe
        match retry_with_backoff(
            || self.standby.set_sequence_value(&name, target),
            self.retry,
            "set standby sequence",
        )
        .await
        {
            Ok(()) => {
                tracing::debug!("{}: {:?} -> {}", name, standby_value, target);
                SequenceOutcome {
                    sequence_name: name,
                    primary_value,
                    standby_value,
                    resulting_value: Some(target),
                    status: SequenceStatus::Updated,
                    error: None,
                }
            }
            Err(e) => {
                tracing::warn!("{}: failed to advance sequence: {}", name, e);
                SequenceOutcome {
                    sequence_name: name,
                    primary_value,
                    standby_value,
                    resulting_value: standby_value,
                    status: SequenceStatus::Error,
                    error: Some(e.to_string()),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_value_skips_when_standby_ahead() {
        assert_eq!(target_value(Some(500), Some(600), 10_000, true), None);
        assert_eq!(target_value(Some(600), Some(600), 10_000, true), None);
    }

    #[test]
    fn test_target_value_advances_past_primary() {
        assert_eq!(target_value(Some(700), Some(600), 10_000, true), Some(10_700));
        assert_eq!(target_value(Some(42), None, 100, true), Some(142));
    }

    #[test]
    fn test_target_value_leaves_unused_primary_sequence_alone() {
        assert_eq!(target_value(None, Some(5), 100, true), None);
        assert_eq!(target_value(None, None, 100, true), None);
    }

    #[test]
    fn test_target_value_uses_standby_baseline_without_primary() {
        assert_eq!(target_value(None, Some(600), 10_000, false), Some(10_600));
        assert_eq!(target_value(None, None, 10_000, false), Some(10_000));
    }

    #[test]
    fn test_system_schemas_filtered() {
        assert!(is_system_schema("pg_catalog"));
        assert!(is_system_schema("pg_toast"));
        assert!(is_system_schema("information_schema"));
        assert!(!is_system_schema("public"));
        assert!(!is_system_schema("billing"));
    }

    #[test]
    fn test_summary_counts() {
        let ledger = vec![
            SequenceOutcome::failed("public.a", "boom".to_string()),
            SequenceOutcome {
                sequence_name: "public.b".to_string(),
                primary_value: Some(1),
                standby_value: Some(2),
                resulting_value: Some(2),
                status: SequenceStatus::SkippedAlreadyAhead,
                error: None,
            },
        ];
        let summary = SequenceSummary::of(&ledger);
        assert_eq!(summary.errors, 1);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.updated, 0);
    }
}
