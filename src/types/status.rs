//! Lifecycle states of the persisted entities.
//!
//! Each enum is stored as its snake_case name in SQLite, so every type has an
//! `as_str`/`parse` pair that must stay in sync with the serde representation.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Declares `as_str`, `parse` and `Display` for a fieldless status enum.
macro_rules! string_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            /// Every variant, in declaration order.
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            /// Returns the storage representation.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }

            /// Parses the storage representation.
            pub fn parse(s: &str) -> Option<Self> {
                match s {
                    $($text => Some($name::$variant),)+
                    _ => None,
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

/// Processing state of an [`Event`](super::Event).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    /// Admitted, no job has picked it up yet.
    Pending,
    /// A job bound to this event has been claimed.
    Processing,
    /// All work for the event completed.
    Done,
    /// Work for the event ended in a terminal failure.
    Failed,
    /// The event was irrelevant (not a merge, not a bounty claim).
    Discarded,
}

string_enum!(EventStatus {
    Pending => "pending",
    Processing => "processing",
    Done => "done",
    Failed => "failed",
    Discarded => "discarded",
});

/// Kind of asynchronous work; each kind has its own worker group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Cheap inspection of an inbound webhook; never calls upstream.
    Classify,
    /// Authoritative verification of a merged pull request.
    Verify,
    /// Settlement of a verified submission.
    Payout,
    /// Reconciliation of a project's issues and pull requests.
    Sync,
}

string_enum!(JobKind {
    Classify => "classify",
    Verify => "verify",
    Payout => "payout",
    Sync => "sync",
});

/// Lifecycle state of a [`Job`](super::Job).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    /// Permanent failure; needs a human before it can run again.
    Failed,
    /// Retry budget exhausted.
    Dead,
}

string_enum!(JobStatus {
    Queued => "queued",
    Running => "running",
    Succeeded => "succeeded",
    Failed => "failed",
    Dead => "dead",
});

impl JobStatus {
    /// Returns true for states the bus never leaves on its own.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Dead
        )
    }
}

/// Escrow state of a [`Bounty`](super::Bounty).
///
/// ```text
/// open ──lock──▶ locked ──payout confirmed──▶ released
///   │               └────refund after deadline──▶ refunded
///   └──cancel──▶ cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BountyStatus {
    Open,
    Locked,
    Released,
    Refunded,
    Cancelled,
}

string_enum!(BountyStatus {
    Open => "open",
    Locked => "locked",
    Released => "released",
    Refunded => "refunded",
    Cancelled => "cancelled",
});

/// State of a [`Payout`](super::Payout).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayoutStatus {
    /// Row created, transaction not yet acknowledged by the chain adapter.
    Pending,
    Submitted,
    Confirmed,
    Failed,
}

string_enum!(PayoutStatus {
    Pending => "pending",
    Submitted => "submitted",
    Confirmed => "confirmed",
    Failed => "failed",
});

/// Kind of a mirrored upstream item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    Issue,
    PullRequest,
}

string_enum!(ItemKind {
    Issue => "issue",
    PullRequest => "pull_request",
});

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrips<T: Copy + PartialEq + fmt::Debug + Serialize>(
        all: &[T],
        as_str: fn(&T) -> &'static str,
        parse: fn(&str) -> Option<T>,
    ) {
        for v in all {
            assert_eq!(parse(as_str(v)), Some(*v));
            let json = serde_json::to_string(v).unwrap();
            assert_eq!(json, format!("\"{}\"", as_str(v)));
        }
    }

    #[test]
    fn storage_names_match_serde() {
        roundtrips(EventStatus::ALL, EventStatus::as_str, EventStatus::parse);
        roundtrips(JobKind::ALL, JobKind::as_str, JobKind::parse);
        roundtrips(JobStatus::ALL, JobStatus::as_str, JobStatus::parse);
        roundtrips(BountyStatus::ALL, BountyStatus::as_str, BountyStatus::parse);
        roundtrips(PayoutStatus::ALL, PayoutStatus::as_str, PayoutStatus::parse);
        roundtrips(ItemKind::ALL, ItemKind::as_str, ItemKind::parse);
    }

    #[test]
    fn unknown_names_do_not_parse() {
        assert_eq!(JobStatus::parse("paused"), None);
        assert_eq!(BountyStatus::parse("LOCKED"), None);
    }

    #[test]
    fn terminal_job_states() {
        assert!(!JobStatus::Queued.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Succeeded.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Dead.is_terminal());
    }
}
