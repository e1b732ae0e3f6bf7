//! Shared test utilities: seed helpers, scripted collaborators and
//! arbitrary generators for property-based testing.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use chrono::Utc;
use proptest::prelude::*;
use serde_json::json;

use crate::credentials::{AccessToken, TokenCipher};
use crate::github::{GitHubApiError, ItemsPage, PullDetails, SourceApi};
use crate::payout::{ChainAdapter, ChainError, ConfirmStatus, Transfer};
use crate::store::{Admission, LinkedAccount, NewBounty, NewSubmission, Store};
use crate::types::{
    Amount, Bounty, BountyId, DedupeKey, INTERNAL_SOURCE, JobId, JobKind, NewEvent, PrNumber,
    ProjectId, RepoId, Sha, Submission, SubmissionId, TxRef, UserId,
};

pub const OWNER_TOKEN: &str = "gho_owner";

pub fn arb_pr_number() -> impl Strategy<Value = PrNumber> {
    (1u64..100_000).prop_map(PrNumber)
}

pub fn arb_sha() -> impl Strategy<Value = Sha> {
    "[0-9a-f]{40}".prop_map(|s| Sha::parse(s).unwrap())
}

/// A SHA made of one repeated hex digit.
pub fn sha(c: char) -> Sha {
    Sha::parse(c.to_string().repeat(40)).unwrap()
}

// ─── Seeds ───

pub fn test_cipher() -> TokenCipher {
    TokenCipher::new(&[7u8; 32])
}

/// Links a GitHub account holding [`OWNER_TOKEN`] to `user`.
pub fn link_owner(store: &Store, user: UserId) {
    store
        .link_account(&LinkedAccount {
            user_id: user,
            github_login: "owner".to_string(),
            access_token_enc: test_cipher().encrypt(OWNER_TOKEN).unwrap(),
            scopes: "repo".to_string(),
            linked_at: Utc::now(),
        })
        .unwrap();
}

/// Registers `repo` for user 1.
pub fn seed_project(store: &Store, repo: &str) -> ProjectId {
    store.create_project(UserId(1), repo).unwrap().id
}

/// A locked bounty on issue 7 of `acme/widgets`, paid in USDC on stellar,
/// refundable after thirty days.
pub fn seed_locked_bounty(store: &Store, id: &str, amount: Amount) -> Bounty {
    let project_id = seed_project(store, "acme/widgets");
    store
        .create_bounty(&NewBounty {
            bounty_id: BountyId::new(id),
            project_id,
            issue_number: 7,
            chain: "stellar".to_string(),
            amount,
            currency: "USDC".to_string(),
            split_rewards: false,
            split_amount: None,
            deadline: Some(Utc::now() + chrono::Duration::days(30)),
        })
        .unwrap();
    store.lock_bounty(&BountyId::new(id), Utc::now()).unwrap()
}

/// A submission by `alice` of PR `pr` in `acme/widgets`.
pub fn seed_submission(store: &Store, bounty: &str, pr: u64) -> Submission {
    store
        .upsert_submission(&NewSubmission {
            bounty_id: BountyId::new(bounty),
            repo_full_name: "acme/widgets".to_string(),
            pr_number: PrNumber(pr),
            author_identity: "alice".to_string(),
            merge_commit_sha: sha('a'),
        })
        .unwrap()
}

/// Admits the `verified_submission` event of `submission` and returns its
/// payout job.
pub fn seed_payout_job(store: &Store, submission: SubmissionId) -> JobId {
    let event = NewEvent {
        source: INTERNAL_SOURCE.to_string(),
        event_type: "verified_submission".to_string(),
        dedupe_key: DedupeKey::verified_submission(submission),
        payload: json!({ "submission_id": submission }),
    };
    match store
        .admit_event(&event, JobKind::Payout, None, Utc::now())
        .unwrap()
    {
        Admission::Admitted { job_id, .. } => job_id,
        other => panic!("payout job already seeded: {other:?}"),
    }
}

// ─── Fixtures ───

/// A GitHub `pull_request` webhook body for `acme/widgets`.
pub fn pull_request_payload(
    action: &str,
    merged: bool,
    number: u64,
    body: &str,
) -> serde_json::Value {
    json!({
        "action": action,
        "number": number,
        "pull_request": {
            "number": number,
            "merged": merged,
            "merge_commit_sha": "c".repeat(40),
            "user": { "login": "alice" },
            "title": format!("Change {number}"),
            "body": body,
        },
        "repository": {
            "name": "widgets",
            "full_name": "acme/widgets",
            "owner": { "login": "acme" }
        },
        "sender": { "login": "alice" }
    })
}

/// Authoritative state of a merged PR by `alice` in `acme/widgets`.
pub fn merged_pull(number: u64, body: &str) -> PullDetails {
    PullDetails {
        repo: RepoId::new("acme", "widgets"),
        number: PrNumber(number),
        merged: true,
        merge_commit_sha: Some(sha('c')),
        author_login: "alice".to_string(),
        title: format!("Change {number}"),
        body: Some(body.to_string()),
    }
}

// ─── Scripted source API ───

#[derive(Default)]
struct SourceScript {
    pulls: HashMap<(String, u64), PullDetails>,
    pull_failures: VecDeque<GitHubApiError>,
    pages: VecDeque<Result<ItemsPage, GitHubApiError>>,
    pull_calls: usize,
    page_calls: Vec<u32>,
    tokens_seen: Vec<String>,
}

/// A [`SourceApi`] that answers from a script and records its calls.
///
/// Unknown pull requests are a 404; an exhausted page script is an empty
/// last page.
#[derive(Default)]
pub struct ScriptedSource {
    script: Mutex<SourceScript>,
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_pull(&self, pull: PullDetails) {
        let key = (pull.repo.full_name(), pull.number.0);
        self.script.lock().unwrap().pulls.insert(key, pull);
    }

    pub fn fail_next_pull(&self, err: GitHubApiError) {
        self.script.lock().unwrap().pull_failures.push_back(err);
    }

    pub fn push_page(&self, page: Result<ItemsPage, GitHubApiError>) {
        self.script.lock().unwrap().pages.push_back(page);
    }

    pub fn pull_calls(&self) -> usize {
        self.script.lock().unwrap().pull_calls
    }

    pub fn page_calls(&self) -> Vec<u32> {
        self.script.lock().unwrap().page_calls.clone()
    }

    pub fn tokens_seen(&self) -> Vec<String> {
        self.script.lock().unwrap().tokens_seen.clone()
    }
}

impl SourceApi for ScriptedSource {
    async fn get_pull(
        &self,
        token: &AccessToken,
        repo: &RepoId,
        number: PrNumber,
    ) -> Result<PullDetails, GitHubApiError> {
        let mut script = self.script.lock().unwrap();
        script.pull_calls += 1;
        script.tokens_seen.push(token.expose().to_string());
        if let Some(err) = script.pull_failures.pop_front() {
            return Err(err);
        }
        script
            .pulls
            .get(&(repo.full_name(), number.0))
            .cloned()
            .ok_or_else(|| GitHubApiError::from_status(404, "Not Found"))
    }

    async fn list_items_page(
        &self,
        token: &AccessToken,
        _repo: &RepoId,
        page: u32,
    ) -> Result<ItemsPage, GitHubApiError> {
        let mut script = self.script.lock().unwrap();
        script.page_calls.push(page);
        script.tokens_seen.push(token.expose().to_string());
        script.pages.pop_front().unwrap_or_else(|| Ok(ItemsPage::default()))
    }
}

// ─── Scripted chain ───

#[derive(Default)]
struct ChainScript {
    confirms: VecDeque<ConfirmStatus>,
    submit_failures: VecDeque<ChainError>,
    submissions: Vec<Transfer>,
}

/// A [`ChainAdapter`] whose `confirm` answers come from a script.
///
/// Submissions are idempotent on the transfer's key, like a real relayer.
/// Once the script runs out every transaction is confirmed.
#[derive(Default)]
pub struct ScriptedChain {
    script: Mutex<ChainScript>,
}

impl ScriptedChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_confirms(statuses: impl IntoIterator<Item = ConfirmStatus>) -> Self {
        let chain = Self::default();
        chain.script.lock().unwrap().confirms.extend(statuses);
        chain
    }

    pub fn fail_next_submit(&self, err: ChainError) {
        self.script.lock().unwrap().submit_failures.push_back(err);
    }

    /// Every accepted submission, including repeats of the same key.
    pub fn submissions(&self) -> Vec<Transfer> {
        self.script.lock().unwrap().submissions.clone()
    }

    /// Distinct transactions sent.
    pub fn transactions(&self) -> usize {
        let script = self.script.lock().unwrap();
        let mut keys: Vec<_> = script
            .submissions
            .iter()
            .map(|t| t.idempotency_key.as_str())
            .collect();
        keys.sort_unstable();
        keys.dedup();
        keys.len()
    }
}

impl ChainAdapter for ScriptedChain {
    async fn submit(&self, transfer: &Transfer) -> Result<TxRef, ChainError> {
        let mut script = self.script.lock().unwrap();
        if let Some(err) = script.submit_failures.pop_front() {
            return Err(err);
        }
        script.submissions.push(transfer.clone());
        Ok(TxRef::new(format!("tx-{}", transfer.idempotency_key)))
    }

    async fn confirm(&self, _chain: &str, _tx: &TxRef) -> Result<ConfirmStatus, ChainError> {
        let mut script = self.script.lock().unwrap();
        Ok(script.confirms.pop_front().unwrap_or(ConfirmStatus::Confirmed))
    }
}
