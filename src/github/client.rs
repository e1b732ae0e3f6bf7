//! Octocrab client wrapper scoped to a specific repository.
//!
//! `OctocrabClient` performs the REST calls for one repository under one
//! delegated token. `OctocrabSource` builds a client per call so that every
//! project's requests go out under its owner's credential.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use http::StatusCode;
use http::header::{AsHeaderName, HeaderMap, RETRY_AFTER};
use octocrab::Octocrab;
use octocrab::service::middleware::retry::RetryConfig;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::warn;

use super::GitHubApiError;
use super::source::{ItemsPage, PullDetails, RemoteItem, Result, SourceApi};
use crate::credentials::AccessToken;
use crate::types::{ItemKind, PrNumber, RepoId, Sha};

/// Page size requested when listing items (GitHub's maximum).
pub const ITEMS_PER_PAGE: u8 = 100;

/// A GitHub API client scoped to a specific repository.
#[derive(Clone)]
pub struct OctocrabClient {
    client: Octocrab,
    repo: RepoId,
}

impl OctocrabClient {
    pub fn new(client: Octocrab, repo: RepoId) -> Self {
        Self { client, repo }
    }

    /// Creates a client authenticated with a delegated token. `base_uri`
    /// overrides `https://api.github.com`.
    ///
    /// Octocrab's own retries are disabled: failed calls go back to the job
    /// bus, which waits as long as the response headers ask.
    pub fn from_token(token: &AccessToken, repo: RepoId, base_uri: Option<&str>) -> Result<Self> {
        let mut builder = Octocrab::builder()
            .personal_token(token.expose().to_string())
            .add_retry_config(RetryConfig::None);
        if let Some(base) = base_uri {
            builder = builder
                .base_uri(base)
                .map_err(GitHubApiError::from_octocrab)?;
        }
        let client = builder.build().map_err(GitHubApiError::from_octocrab)?;
        Ok(Self::new(client, repo))
    }

    pub fn repo(&self) -> &RepoId {
        &self.repo
    }

    pub fn owner(&self) -> &str {
        &self.repo.owner
    }

    pub fn repo_name(&self) -> &str {
        &self.repo.repo
    }

    pub async fn get_pull(&self, number: PrNumber) -> Result<PullDetails> {
        let route = format!("/repos/{}/{}/pulls/{}", self.owner(), self.repo_name(), number.0);
        let raw: RawPull = self.fetch(route).await?;
        raw.into_details(self.repo.clone())
    }

    pub async fn list_items_page(&self, page: u32, per_page: u8) -> Result<ItemsPage> {
        let query = format!("state=all&sort=updated&direction=asc&per_page={per_page}&page={page}");
        let route = format!("/repos/{}/{}/issues?{query}", self.owner(), self.repo_name());
        let raw: Vec<RawIssue> = self.fetch(route).await?;

        let has_more = raw.len() >= usize::from(per_page);
        let items = raw.into_iter().map(RawIssue::into_item).collect();
        Ok(ItemsPage { items, has_more })
    }

    /// GETs `route` and decodes the JSON body.
    ///
    /// Works on the raw response so that the rate-limit headers are still
    /// in hand when the call fails.
    async fn fetch<T: DeserializeOwned>(&self, route: String) -> Result<T> {
        let response = self
            .client
            ._get(route)
            .await
            .map_err(GitHubApiError::from_octocrab)?;
        let status = response.status();
        let wait = advised_wait(response.headers(), Utc::now());
        let response = match octocrab::map_github_error(response).await {
            Ok(response) => response,
            Err(e) => return Err(self.rejected(status, wait, e)),
        };
        let body = self
            .client
            .body_to_string(response)
            .await
            .map_err(GitHubApiError::from_octocrab)?;
        serde_json::from_str(&body).map_err(|e| {
            GitHubApiError::permanent_without_source(format!("unexpected response body: {e}"))
        })
    }

    /// Classifies a failed response, attaching the wait its headers advise.
    fn rejected(
        &self,
        status: StatusCode,
        wait: Option<Duration>,
        err: octocrab::Error,
    ) -> GitHubApiError {
        let mut err = GitHubApiError::from_octocrab(err);
        if err.status_code.is_none() {
            // The body was not GitHub's JSON error shape.
            err = err.with_status(status.as_u16());
        }
        if err.is_rate_limited() {
            warn!(
                repo = %self.repo,
                wait_secs = wait.map(|w| w.as_secs()),
                "GitHub rate limit hit"
            );
        }
        match wait {
            Some(wait) if err.is_transient() => err.with_retry_after(wait),
            _ => err,
        }
    }
}

/// Wait advised by a response's headers.
///
/// `Retry-After` (in seconds) wins. Otherwise an exhausted quota waits until
/// `x-ratelimit-reset`, an epoch second.
fn advised_wait(headers: &HeaderMap, now: DateTime<Utc>) -> Option<Duration> {
    if let Some(secs) = header_number::<u64>(headers, RETRY_AFTER) {
        return Some(Duration::from_secs(secs));
    }
    if header_number::<u64>(headers, "x-ratelimit-remaining")? > 0 {
        return None;
    }
    let reset = DateTime::from_timestamp(header_number(headers, "x-ratelimit-reset")?, 0)?;
    let wait = (reset - now).to_std().unwrap_or_default();
    Some(wait.max(Duration::from_secs(1)))
}

fn header_number<T: FromStr>(headers: &HeaderMap, name: impl AsHeaderName) -> Option<T> {
    headers.get(name)?.to_str().ok()?.trim().parse().ok()
}

impl std::fmt::Debug for OctocrabClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OctocrabClient")
            .field("repo", &self.repo)
            .finish_non_exhaustive()
    }
}

/// [`SourceApi`] over the GitHub REST API.
#[derive(Debug, Clone, Default)]
pub struct OctocrabSource {
    base_uri: Option<String>,
}

impl OctocrabSource {
    pub fn new(base_uri: Option<String>) -> Self {
        OctocrabSource { base_uri }
    }

    fn client(&self, token: &AccessToken, repo: &RepoId) -> Result<OctocrabClient> {
        OctocrabClient::from_token(token, repo.clone(), self.base_uri.as_deref())
    }
}

impl SourceApi for OctocrabSource {
    async fn get_pull(
        &self,
        token: &AccessToken,
        repo: &RepoId,
        number: PrNumber,
    ) -> Result<PullDetails> {
        self.client(token, repo)?.get_pull(number).await
    }

    async fn list_items_page(
        &self,
        token: &AccessToken,
        repo: &RepoId,
        page: u32,
    ) -> Result<ItemsPage> {
        self.client(token, repo)?
            .list_items_page(page, ITEMS_PER_PAGE)
            .await
    }
}

// ─── Wire shapes ───

#[derive(Debug, Deserialize)]
struct RawUser {
    login: String,
}

#[derive(Debug, Deserialize)]
struct RawPull {
    number: u64,
    #[serde(default)]
    merged: Option<bool>,
    #[serde(default)]
    merge_commit_sha: Option<String>,
    #[serde(default)]
    user: Option<RawUser>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    body: Option<String>,
}

impl RawPull {
    fn into_details(self, repo: RepoId) -> Result<PullDetails> {
        let merged = self.merged.unwrap_or(false);
        // The sha field holds a test-merge commit for open PRs; only trust it once merged.
        let merge_commit_sha = match (merged, self.merge_commit_sha) {
            (true, Some(raw)) => Some(Sha::parse(&raw).map_err(|e| {
                GitHubApiError::permanent_without_source(format!("bad merge_commit_sha: {e}"))
            })?),
            _ => None,
        };
        Ok(PullDetails {
            repo,
            number: PrNumber(self.number),
            merged,
            merge_commit_sha,
            author_login: self.user.map(|u| u.login).unwrap_or_default(),
            title: self.title.unwrap_or_default(),
            body: self.body,
        })
    }
}

#[derive(Debug, Deserialize)]
struct RawIssue {
    id: u64,
    number: u64,
    state: String,
    #[serde(default)]
    title: String,
    updated_at: DateTime<Utc>,
    /// Present (with links) when the item is a pull request.
    #[serde(default)]
    pull_request: Option<serde_json::Value>,
}

impl RawIssue {
    fn into_item(self) -> RemoteItem {
        RemoteItem {
            remote_id: self.id,
            number: self.number,
            kind: if self.pull_request.is_some() {
                ItemKind::PullRequest
            } else {
                ItemKind::Issue
            },
            state: self.state,
            title: self.title,
            updated_at: self.updated_at,
        }
    }
}
