//! Webhook payload parser.
//!
//! Stored event payloads are parsed into typed events when a job picks them
//! up. Unknown fields are ignored; unknown event types and actions yield
//! `Ok(None)` rather than an error.

use serde::Deserialize;
use thiserror::Error;

use super::events::{PrAction, PullRequestEvent};
use crate::types::{PrNumber, RepoId, Sha};

#[derive(Debug, Error)]
pub enum ParseError {
    /// JSON deserialization failed (includes missing required fields).
    #[error("JSON parse error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("invalid field value for {field}: {value}")]
    InvalidField { field: &'static str, value: String },
}

#[derive(Debug, Deserialize)]
struct RawRepository {
    owner: RawOwner,
    name: String,
}

#[derive(Debug, Deserialize)]
struct RawOwner {
    login: String,
}

#[derive(Debug, Deserialize)]
struct RawUser {
    login: String,
}

#[derive(Debug, Deserialize)]
struct RawPullRequestPayload {
    action: String,
    pull_request: RawPullRequest,
    repository: RawRepository,
}

#[derive(Debug, Deserialize)]
struct RawPullRequest {
    number: u64,
    merged: Option<bool>,
    merge_commit_sha: Option<String>,
    user: RawUser,
    #[serde(default)]
    body: Option<String>,
}

/// Parses a stored payload of the given event type.
///
/// Returns `Ok(None)` for event types and actions the pipeline ignores.
pub fn parse_event(
    event_type: &str,
    payload: &serde_json::Value,
) -> Result<Option<PullRequestEvent>, ParseError> {
    match event_type {
        "pull_request" => parse_pull_request(payload),
        _ => Ok(None),
    }
}

fn parse_pull_request(
    payload: &serde_json::Value,
) -> Result<Option<PullRequestEvent>, ParseError> {
    let raw = RawPullRequestPayload::deserialize(payload)?;

    let action = match raw.action.as_str() {
        "opened" => PrAction::Opened,
        "synchronize" => PrAction::Synchronize,
        "reopened" => PrAction::Reopened,
        "edited" => PrAction::Edited,
        "closed" => PrAction::Closed,
        _ => return Ok(None),
    };

    let merged = raw.pull_request.merged.unwrap_or(false);
    // Unmerged PRs report a test-merge commit here; it means nothing to us.
    let merge_commit_sha = match raw.pull_request.merge_commit_sha {
        Some(sha) if merged => Some(Sha::parse(&sha).map_err(|_| ParseError::InvalidField {
            field: "pull_request.merge_commit_sha",
            value: sha.clone(),
        })?),
        _ => None,
    };

    Ok(Some(PullRequestEvent {
        repo: RepoId::new(raw.repository.owner.login, raw.repository.name),
        action,
        pr_number: PrNumber(raw.pull_request.number),
        merged,
        merge_commit_sha,
        author_login: raw.pull_request.user.login,
        body: raw.pull_request.body,
    }))
}
