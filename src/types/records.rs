//! Persisted records, one struct per relational table.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{
    BountyId, ContentHash, DedupeKey, EventId, JobId, PayoutId, PrNumber, ProjectId, Sha,
    SubmissionId, TxRef, UserId,
};
use super::status::{BountyStatus, EventStatus, ItemKind, JobKind, JobStatus, PayoutStatus};

/// Token amount in the smallest denomination of the bounty's currency.
pub type Amount = i64;

/// Source name used for events the pipeline emits itself.
pub const INTERNAL_SOURCE: &str = "internal";

/// An admitted external event or an internal state transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub source: String,
    /// Source-specific type, e.g. `pull_request` or `verified_submission`.
    #[serde(rename = "type")]
    pub event_type: String,
    pub dedupe_key: DedupeKey,
    pub payload: serde_json::Value,
    pub received_at: DateTime<Utc>,
    pub status: EventStatus,
}

/// An event that has not been stored yet.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    pub source: String,
    pub event_type: String,
    pub dedupe_key: DedupeKey,
    pub payload: serde_json::Value,
}

/// One unit of asynchronous work bound to an event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub event_id: EventId,
    pub kind: JobKind,
    /// Number of failed executions so far (including expired leases).
    pub attempts: u32,
    pub max_attempts: u32,
    pub next_attempt_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub status: JobStatus,
    /// Set for sync jobs so they can be listed per project.
    pub project_id: Option<ProjectId>,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A candidate contribution: one merged pull request claiming one bounty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Submission {
    pub id: SubmissionId,
    pub bounty_id: BountyId,
    pub repo_full_name: String,
    pub pr_number: PrNumber,
    /// GitHub login of the pull request author.
    pub author_identity: String,
    pub merge_commit_sha: Sha,
    pub verified_at: Option<DateTime<Utc>>,
}

/// Content-addressed attestation that a merge satisfies a bounty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proof {
    pub submission_id: SubmissionId,
    pub content_hash: ContentHash,
    pub storage_uri: String,
    /// Hex HMAC-SHA256 of the artifact bytes.
    pub signature: String,
    pub generated_at: DateTime<Utc>,
}

/// A bounty and the escrow that funds it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bounty {
    pub bounty_id: BountyId,
    pub project_id: ProjectId,
    /// Issue whose resolution the bounty rewards.
    pub issue_number: u64,
    pub chain: String,
    /// Amount originally locked.
    pub amount: Amount,
    pub currency: String,
    /// Amount still held; decremented only by confirmed payouts.
    pub locked_amount: Amount,
    pub status: BountyStatus,
    /// Allows one confirmed payout per submission instead of per bounty.
    pub split_rewards: bool,
    /// Per-submission reward when `split_rewards` is set.
    pub split_amount: Option<Amount>,
    /// Refunds are allowed once this has passed.
    pub deadline: Option<DateTime<Utc>>,
}

impl Bounty {
    /// Amount the next payout for this bounty transfers.
    pub fn payout_amount(&self) -> Amount {
        match (self.split_rewards, self.split_amount) {
            (true, Some(split)) => split.min(self.locked_amount),
            _ => self.locked_amount,
        }
    }
}

/// A reward transfer attempt for one submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payout {
    pub id: PayoutId,
    pub submission_id: SubmissionId,
    pub bounty_id: BountyId,
    pub chain: String,
    pub amount: Amount,
    pub recipient: String,
    pub tx_ref: Option<TxRef>,
    pub status: PayoutStatus,
    /// The payout job driving this transfer.
    pub job_id: JobId,
    pub submitted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// A registered repository, owned by the user whose credential is used for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub id: ProjectId,
    pub owner_user_id: UserId,
    pub repo_full_name: String,
}

/// An upstream issue or pull request as last observed by the sync worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirroredItem {
    pub project_id: ProjectId,
    pub remote_id: u64,
    pub number: u64,
    pub kind: ItemKind,
    pub state: String,
    pub title: String,
    pub updated_at: DateTime<Utc>,
}
