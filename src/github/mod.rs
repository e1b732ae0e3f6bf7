//! GitHub REST access under delegated credentials.
//!
//! Errors are split into transient and permanent so that the job bus can
//! decide between backing off and failing a job outright.

mod client;
mod error;
mod source;

pub use client::{ITEMS_PER_PAGE, OctocrabClient, OctocrabSource};
pub use error::{GitHubApiError, GitHubErrorKind};
pub use source::{ItemsPage, PullDetails, RemoteItem, SourceApi};
