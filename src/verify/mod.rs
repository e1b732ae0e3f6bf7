//! Verification worker.
//!
//! `classify` jobs look at an admitted pull request event and hand merges on
//! to a `verify` job on the same event. `verify` jobs re-fetch the pull
//! request with the project owner's delegated credential, link it to a
//! bounty, record the submission and its signed proof, and emit the
//! `verified_submission` event that drives the payout worker.

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use crate::artifact::ArtifactStore;
use crate::bus::{JobHandler, JobOutcome, Wakeup};
use crate::credentials::{TokenCipher, owner_token};
use crate::github::SourceApi;
use crate::store::{Admission, NewSubmission, Store};
use crate::types::{
    Bounty, DedupeKey, INTERNAL_SOURCE, Job, JobKind, NewEvent, Project, Proof, Submission,
};
use crate::webhooks::{PullRequestEvent, parse_event};

pub mod linkage;
pub mod proof;

pub use linkage::linked_issues;
pub use proof::{ProofDocument, ProofError, SignedProof};

/// Event type emitted once a submission has a proof.
pub const VERIFIED_SUBMISSION: &str = "verified_submission";

/// Loads and parses the pull request event a job refers to.
fn load_pull_request(store: &Store, job: &Job) -> Result<Option<PullRequestEvent>, JobOutcome> {
    let event = store.require_event(job.event_id)?;
    parse_event(&event.event_type, &event.payload)
        .map_err(|e| JobOutcome::failed(format!("malformed payload: {e}")))
}

// ─── Classify ───

/// Decides whether an admitted event needs verification.
pub struct ClassifyHandler {
    store: Store,
    wakeup: Wakeup,
}

impl ClassifyHandler {
    pub fn new(store: Store, wakeup: Wakeup) -> Self {
        ClassifyHandler { store, wakeup }
    }

    fn classify(&self, job: &Job) -> Result<JobOutcome, JobOutcome> {
        let Some(pr) = load_pull_request(&self.store, job)? else {
            debug!(event_id = %job.event_id, "Event type not relevant");
            return Ok(JobOutcome::discarded());
        };
        if !pr.is_merge() {
            debug!(repo = %pr.repo, pr = %pr.pr_number, action = ?pr.action, "Not a merge");
            return Ok(JobOutcome::discarded());
        }

        let verify_job = self
            .store
            .enqueue_job(job.event_id, JobKind::Verify, Utc::now())?;
        self.wakeup.notify();
        info!(
            repo = %pr.repo,
            pr = %pr.pr_number,
            job_id = %verify_job,
            "Merge queued for verification"
        );
        Ok(JobOutcome::handed_off())
    }
}

impl JobHandler for ClassifyHandler {
    fn kind(&self) -> JobKind {
        JobKind::Classify
    }

    async fn handle(&self, job: &Job) -> JobOutcome {
        self.classify(job).unwrap_or_else(|outcome| outcome)
    }
}

// ─── Verify ───

/// Turns a merged pull request into a proved submission.
pub struct VerifyHandler<S, A> {
    store: Store,
    source: Arc<S>,
    artifacts: Arc<A>,
    cipher: TokenCipher,
    proof_key: Vec<u8>,
    wakeup: Wakeup,
}

impl<S: SourceApi, A: ArtifactStore> VerifyHandler<S, A> {
    pub fn new(
        store: Store,
        source: Arc<S>,
        artifacts: Arc<A>,
        cipher: TokenCipher,
        proof_key: Vec<u8>,
        wakeup: Wakeup,
    ) -> Self {
        VerifyHandler {
            store,
            source,
            artifacts,
            cipher,
            proof_key,
            wakeup,
        }
    }

    #[instrument(skip(self, job), fields(job_id = %job.id, event_id = %job.event_id))]
    async fn verify(&self, job: &Job) -> Result<JobOutcome, JobOutcome> {
        let Some(pr) = load_pull_request(&self.store, job)?.filter(PullRequestEvent::is_merge)
        else {
            return Ok(JobOutcome::discarded());
        };

        let Some(project) = self.store.project_by_repo(&pr.repo.full_name())? else {
            debug!(repo = %pr.repo, "Repository is not a registered project");
            return Ok(JobOutcome::discarded());
        };
        let token = owner_token(&self.store, &self.cipher, &project)?;

        let pull = self
            .source
            .get_pull(&token, &pr.repo, pr.pr_number)
            .await?;
        if !pull.merged {
            return Err(JobOutcome::failed("pr_not_merged"));
        }
        let Some(merge_commit_sha) = pull.merge_commit_sha.clone() else {
            return Err(JobOutcome::retry("merge commit not yet available"));
        };

        let text = format!(
            "{}\n{}",
            pull.body.as_deref().unwrap_or_default(),
            pull.title
        );
        let Some(bounty) = self.find_bounty(&project, &text, &pr)? else {
            info!(repo = %pr.repo, pr = %pr.pr_number, "No claimable bounty linked");
            return Ok(JobOutcome::discarded());
        };

        let submission = self.store.upsert_submission(&NewSubmission {
            bounty_id: bounty.bounty_id.clone(),
            repo_full_name: project.repo_full_name.clone(),
            pr_number: pr.pr_number,
            author_identity: pull.author_login.clone(),
            merge_commit_sha,
        })?;

        let proof = self.prove(&submission).await?;
        let verified = NewEvent {
            source: INTERNAL_SOURCE.to_string(),
            event_type: VERIFIED_SUBMISSION.to_string(),
            dedupe_key: DedupeKey::verified_submission(submission.id),
            payload: json!({
                "submission_id": submission.id,
                "bounty_id": submission.bounty_id,
            }),
        };
        let admission = self
            .store
            .complete_verification(&proof, &verified, Utc::now())?;
        if let Admission::Admitted { job_id, .. } = admission {
            self.wakeup.notify();
            info!(
                submission_id = %submission.id,
                bounty_id = %submission.bounty_id,
                content_hash = %proof.content_hash,
                payout_job = %job_id,
                "Submission verified"
            );
        }
        Ok(JobOutcome::done())
    }

    /// First linked issue that carries a claimable bounty.
    fn find_bounty(
        &self,
        project: &Project,
        text: &str,
        pr: &PullRequestEvent,
    ) -> Result<Option<Bounty>, JobOutcome> {
        for issue in linked_issues(text, &pr.repo) {
            if let Some(bounty) = self.store.claimable_bounty_for_issue(project.id, issue)? {
                debug!(issue, bounty_id = %bounty.bounty_id, "Linked bounty");
                return Ok(Some(bounty));
            }
        }
        Ok(None)
    }

    async fn prove(&self, submission: &Submission) -> Result<Proof, JobOutcome> {
        let signed = proof::sign(&ProofDocument::for_submission(submission), &self.proof_key)
            .map_err(|e| JobOutcome::failed(e.to_string()))?;
        let stored = self
            .artifacts
            .put(signed.bytes)
            .await
            .map_err(|e| JobOutcome::retry(ProofError::from(e)))?;
        if stored.hash != signed.content_hash {
            let err = ProofError::HashMismatch {
                expected: signed.content_hash,
                actual: stored.hash,
            };
            warn!(error = %err, "Artifact store disagrees on content hash");
            return Err(JobOutcome::failed(err.to_string()));
        }
        Ok(Proof {
            submission_id: submission.id,
            content_hash: stored.hash,
            storage_uri: stored.uri,
            signature: signed.signature,
            generated_at: Utc::now(),
        })
    }
}

impl<S: SourceApi, A: ArtifactStore> JobHandler for VerifyHandler<S, A> {
    fn kind(&self) -> JobKind {
        JobKind::Verify
    }

    async fn handle(&self, job: &Job) -> JobOutcome {
        self.verify(job).await.unwrap_or_else(|outcome| outcome)
    }
}
