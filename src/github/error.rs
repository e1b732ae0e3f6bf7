//! GitHub API error types.
//!
//! Errors are split into transient and permanent so that job handlers can
//! decide between backing off and failing outright:
//!
//! - **Transient**: 5xx, 429, 403 caused by rate limiting, network failures
//! - **Permanent**: every other 4xx, including 404 for a missing PR
//!
//! Rate-limit errors additionally carry how long to wait before the next call,
//! when the API told us.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// The kind of GitHub API error, categorized for retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GitHubErrorKind {
    /// Safe to retry with backoff.
    Transient,

    /// Retrying will not help (not found, bad credentials, forbidden).
    Permanent,
}

impl GitHubErrorKind {
    pub fn is_retriable(&self) -> bool {
        matches!(self, GitHubErrorKind::Transient)
    }
}

/// A GitHub API error with categorization for retry decisions.
#[derive(Debug, Error)]
pub struct GitHubApiError {
    pub kind: GitHubErrorKind,

    /// The HTTP status code, if available.
    pub status_code: Option<u16>,

    pub message: String,

    /// Set for rate-limit errors when the reset time is known.
    pub retry_after: Option<Duration>,

    #[source]
    pub source: Option<octocrab::Error>,
}

impl fmt::Display for GitHubApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status_code {
            Some(code) => write!(f, "GitHub API error (HTTP {}): {}", code, self.message),
            None => write!(f, "GitHub API error: {}", self.message),
        }
    }
}

impl GitHubApiError {
    /// Creates a permanent error without an octocrab source.
    pub fn permanent_without_source(message: impl Into<String>) -> Self {
        Self {
            kind: GitHubErrorKind::Permanent,
            status_code: None,
            message: message.into(),
            retry_after: None,
            source: None,
        }
    }

    /// Creates a transient error without an octocrab source.
    pub fn transient_without_source(message: impl Into<String>) -> Self {
        Self {
            kind: GitHubErrorKind::Transient,
            status_code: None,
            message: message.into(),
            retry_after: None,
            source: None,
        }
    }

    /// Categorizes a response by status code and message.
    pub fn from_status(status_code: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            kind: classify(Some(status_code), &message),
            status_code: Some(status_code),
            message,
            retry_after: None,
            source: None,
        }
    }

    /// Categorizes an octocrab error.
    pub fn from_octocrab(err: octocrab::Error) -> Self {
        let status_code = Self::extract_status_code(&err);
        let message = match &err {
            octocrab::Error::GitHub { source, .. } => source.message.clone(),
            other => other.to_string(),
        };
        Self {
            kind: classify(status_code, &message),
            status_code,
            message,
            retry_after: None,
            source: Some(err),
        }
    }

    /// Sets the status of a response whose body carried none, and
    /// reclassifies.
    pub fn with_status(mut self, status_code: u16) -> Self {
        self.kind = classify(Some(status_code), &self.message);
        self.status_code = Some(status_code);
        self
    }

    /// Attaches the wait advised by the API.
    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    pub fn is_transient(&self) -> bool {
        self.kind.is_retriable()
    }

    pub fn is_not_found(&self) -> bool {
        self.status_code == Some(404)
    }

    /// True for primary and secondary rate limiting.
    pub fn is_rate_limited(&self) -> bool {
        match self.status_code {
            Some(429) => true,
            Some(403) => is_rate_limit_error(&self.message),
            _ => false,
        }
    }

    /// The HTTP status of an API error. Transport errors have none.
    fn extract_status_code(err: &octocrab::Error) -> Option<u16> {
        match err {
            octocrab::Error::GitHub { source, .. } => Some(source.status_code.as_u16()),
            _ => None,
        }
    }
}

fn classify(status_code: Option<u16>, message: &str) -> GitHubErrorKind {
    if is_transient_message(message) {
        return GitHubErrorKind::Transient;
    }
    match status_code {
        Some(429) => GitHubErrorKind::Transient,
        Some(403) if is_rate_limit_error(message) => GitHubErrorKind::Transient,
        Some(code) if (500..600).contains(&code) => GitHubErrorKind::Transient,
        Some(_) => GitHubErrorKind::Permanent,
        None if is_network_error(message) => GitHubErrorKind::Transient,
        None => GitHubErrorKind::Permanent,
    }
}

/// GitHub's own hints that the same request will succeed later.
fn is_transient_message(message: &str) -> bool {
    let message_lower = message.to_lowercase();
    message_lower.contains("try again") || message_lower.contains("temporarily unavailable")
}

/// Checks if an error message indicates a rate limit.
fn is_rate_limit_error(message: &str) -> bool {
    let message_lower = message.to_lowercase();
    message_lower.contains("rate limit")
        || message_lower.contains("api rate")
        || message_lower.contains("secondary rate")
        || message_lower.contains("abuse detection")
}

/// Checks if an error message indicates a network-level error.
fn is_network_error(message: &str) -> bool {
    let message_lower = message.to_lowercase();
    message_lower.contains("timeout")
        || message_lower.contains("connection")
        || message_lower.contains("network")
        || message_lower.contains("dns")
        || message_lower.contains("timed out")
}
