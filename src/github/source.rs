//! The source-of-truth API as seen by the workers.
//!
//! Workers only depend on [`SourceApi`]; production uses
//! [`OctocrabSource`](super::OctocrabSource) and tests use a scripted fake.

use std::future::Future;

use chrono::{DateTime, Utc};

use super::GitHubApiError;
use crate::credentials::AccessToken;
use crate::types::{ItemKind, PrNumber, RepoId, Sha};

pub type Result<T> = std::result::Result<T, GitHubApiError>;

/// Authoritative state of a pull request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullDetails {
    pub repo: RepoId,
    pub number: PrNumber,
    pub merged: bool,
    /// Present once the PR is merged and GitHub has computed the commit.
    pub merge_commit_sha: Option<Sha>,
    pub author_login: String,
    pub title: String,
    pub body: Option<String>,
}

/// An issue or pull request as listed by the issues endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteItem {
    pub remote_id: u64,
    pub number: u64,
    pub kind: ItemKind,
    pub state: String,
    pub title: String,
    pub updated_at: DateTime<Utc>,
}

/// One page of listed items.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ItemsPage {
    pub items: Vec<RemoteItem>,
    /// False once a short page has been returned.
    pub has_more: bool,
}

/// Read access to repositories on behalf of a delegated credential.
pub trait SourceApi: Send + Sync + 'static {
    fn get_pull(
        &self,
        token: &AccessToken,
        repo: &RepoId,
        number: PrNumber,
    ) -> impl Future<Output = Result<PullDetails>> + Send;

    /// Lists issues and pull requests, oldest update first. Pages start at 1.
    fn list_items_page(
        &self,
        token: &AccessToken,
        repo: &RepoId,
        page: u32,
    ) -> impl Future<Output = Result<ItemsPage>> + Send;
}
