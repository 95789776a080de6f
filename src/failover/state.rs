// ABOUTME: Failover state machine - states and the explicit transition table
// ABOUTME: StandbyPromoted is the point of no return; no rollback edge leaves it or any later state

use serde::{Deserialize, Serialize};

use crate::error::{FailoverError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailoverState {
    Idle,
    ProxyPaused,
    PrimaryFrozen,
    SequencesSynced,
    StandbyPromoted,
    UpstreamSwapped,
    ProxyResumed,
    Complete,
}

impl FailoverState {
    pub const ALL: [FailoverState; 8] = [
        Self::Idle,
        Self::ProxyPaused,
        Self::PrimaryFrozen,
        Self::SequencesSynced,
        Self::StandbyPromoted,
        Self::UpstreamSwapped,
        Self::ProxyResumed,
        Self::Complete,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::ProxyPaused => "proxy_paused",
            Self::PrimaryFrozen => "primary_frozen",
            Self::SequencesSynced => "sequences_synced",
            Self::StandbyPromoted => "standby_promoted",
            Self::UpstreamSwapped => "upstream_swapped",
            Self::ProxyResumed => "proxy_resumed",
            Self::Complete => "complete",
        }
    }

    /// Once the standby is promoted the old primary can no longer be
    /// restored as the write target.
    pub fn is_past_point_of_no_return(&self) -> bool {
        *self >= Self::StandbyPromoted
    }
}

impl std::fmt::Display for FailoverState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Edge {
    Forward,
    Rollback,
}

/// Every allowed transition. Anything not listed is rejected.
pub const TRANSITIONS: &[(FailoverState, FailoverState, Edge)] = &[
    (FailoverState::Idle, FailoverState::ProxyPaused, Edge::Forward),
    (FailoverState::ProxyPaused, FailoverState::PrimaryFrozen, Edge::Forward),
    // freeze skipped: primary unreachable
    (FailoverState::ProxyPaused, FailoverState::SequencesSynced, Edge::Forward),
    (FailoverState::PrimaryFrozen, FailoverState::SequencesSynced, Edge::Forward),
    (FailoverState::SequencesSynced, FailoverState::StandbyPromoted, Edge::Forward),
    (FailoverState::StandbyPromoted, FailoverState::UpstreamSwapped, Edge::Forward),
    (FailoverState::UpstreamSwapped, FailoverState::ProxyResumed, Edge::Forward),
    (FailoverState::ProxyResumed, FailoverState::Complete, Edge::Forward),
    // sequence advances are kept; stepping back only undoes the freeze
    (FailoverState::SequencesSynced, FailoverState::ProxyPaused, Edge::Rollback),
    (FailoverState::PrimaryFrozen, FailoverState::ProxyPaused, Edge::Rollback),
    (FailoverState::ProxyPaused, FailoverState::Idle, Edge::Rollback),
];

/// Look up the edge from `from` to `to`.
pub fn edge(from: FailoverState, to: FailoverState) -> Option<Edge> {
    TRANSITIONS
        .iter()
        .find(|(f, t, _)| *f == from && *t == to)
        .map(|(_, _, e)| *e)
}

/// Validate a transition, returning its edge kind.
pub fn transition(from: FailoverState, to: FailoverState) -> Result<Edge> {
    edge(from, to).ok_or_else(|| {
        FailoverError::conflict(format!("no transition from {} to {}", from, to))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_path_is_connected() {
        use FailoverState::*;
        let path = [
            Idle,
            ProxyPaused,
            PrimaryFrozen,
            SequencesSynced,
            StandbyPromoted,
            UpstreamSwapped,
            ProxyResumed,
            Complete,
        ];
        for pair in path.windows(2) {
            assert_eq!(transition(pair[0], pair[1]).unwrap(), Edge::Forward);
        }
        assert_eq!(transition(ProxyPaused, SequencesSynced).unwrap(), Edge::Forward);
    }

    #[test]
    fn test_no_edge_leaves_promoted_backward() {
        for (from, to, kind) in TRANSITIONS {
            if from.is_past_point_of_no_return() {
                assert_eq!(*kind, Edge::Forward, "{} -> {}", from, to);
                assert!(to > from, "{} -> {}", from, to);
            }
            if *kind == Edge::Rollback {
                assert!(!from.is_past_point_of_no_return());
                assert!(!to.is_past_point_of_no_return());
            }
        }
    }

    #[test]
    fn test_no_edge_crosses_point_of_no_return_backward() {
        for from in FailoverState::ALL {
            for to in FailoverState::ALL {
                if from.is_past_point_of_no_return() && !to.is_past_point_of_no_return() {
                    assert!(edge(from, to).is_none(), "{} -> {}", from, to);
                }
            }
        }
    }

    #[test]
    fn test_unlisted_transition_rejected() {
        let err = transition(FailoverState::Idle, FailoverState::Complete).unwrap_err();
        assert!(err.to_string().contains("no transition from idle to complete"));
        assert!(edge(FailoverState::Complete, FailoverState::Idle).is_none());
    }
}
