//! Typed pull request lifecycle events.

use serde::{Deserialize, Serialize};

use crate::types::{PrNumber, RepoId, Sha};

/// Pull request actions the pipeline distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrAction {
    Opened,
    /// New commits were pushed (`synchronize` on the wire).
    Synchronize,
    Reopened,
    Edited,
    /// Closed, merged or not; see [`PullRequestEvent::merged`].
    Closed,
}

/// A pull request state change as reported by the webhook.
///
/// Only a hint: workers re-fetch the PR before acting on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequestEvent {
    pub repo: RepoId,
    pub action: PrAction,
    pub pr_number: PrNumber,
    /// Only meaningful for `closed`.
    pub merged: bool,
    pub merge_commit_sha: Option<Sha>,
    pub author_login: String,
    pub body: Option<String>,
}

impl PullRequestEvent {
    /// True when this event reports the PR being merged.
    pub fn is_merge(&self) -> bool {
        self.action == PrAction::Closed && self.merged
    }
}
