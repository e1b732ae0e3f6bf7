//! What a job handler asks the bus to record.

use std::fmt;
use std::time::Duration;

use crate::credentials::TokenLookupError;
use crate::github::GitHubApiError;
use crate::store::StoreError;
use crate::types::EventStatus;

/// Result of one execution of a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// Side effects are durable; the job is done. `event` optionally moves
    /// the job's event to a final status.
    Succeeded { event: Option<EventStatus> },

    /// Not done yet but nothing went wrong (waiting on chain finality).
    /// Requeued after `after` without charging an attempt.
    Deferred { after: Duration },

    /// Transient failure; charged against the retry budget.
    Retry {
        error: String,
        retry_after: Option<Duration>,
    },

    /// Permanent failure; not retried automatically.
    Failed { reason: String },
}

impl JobOutcome {
    pub fn done() -> Self {
        JobOutcome::Succeeded {
            event: Some(EventStatus::Done),
        }
    }

    pub fn discarded() -> Self {
        JobOutcome::Succeeded {
            event: Some(EventStatus::Discarded),
        }
    }

    /// Success that leaves the event to a follow-up job.
    pub fn handed_off() -> Self {
        JobOutcome::Succeeded { event: None }
    }

    pub fn retry(error: impl fmt::Display) -> Self {
        JobOutcome::Retry {
            error: error.to_string(),
            retry_after: None,
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        JobOutcome::Failed {
            reason: reason.into(),
        }
    }
}

impl From<GitHubApiError> for JobOutcome {
    fn from(err: GitHubApiError) -> Self {
        if err.is_transient() {
            JobOutcome::Retry {
                retry_after: err.retry_after,
                error: err.to_string(),
            }
        } else {
            JobOutcome::failed(err.to_string())
        }
    }
}

impl From<StoreError> for JobOutcome {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Escrow(e) => JobOutcome::failed(e.to_string()),
            StoreError::Corrupt { .. } | StoreError::Payload(_) => {
                JobOutcome::failed(err.to_string())
            }
            other => JobOutcome::retry(other),
        }
    }
}

impl From<TokenLookupError> for JobOutcome {
    fn from(err: TokenLookupError) -> Self {
        match err {
            TokenLookupError::Store(e) => e.into(),
            other => JobOutcome::failed(other.to_string()),
        }
    }
}
