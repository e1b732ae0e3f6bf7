//! Submissions and their proofs.

use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, Row, params};

use super::events::admit_tx;
use super::{Admission, Result, Store, StoreError, from_millis, to_millis};
use crate::types::{
    BountyId, ContentHash, JobKind, NewEvent, PrNumber, Proof, Sha, Submission, SubmissionId,
};

const SUBMISSION_COLUMNS: &str =
    "id, bounty_id, repo_full_name, pr_number, author_identity, merge_commit_sha, verified_at";

fn submission_from_row(row: &Row<'_>) -> rusqlite::Result<Submission> {
    let sha: String = row.get(5)?;
    Ok(Submission {
        id: SubmissionId(row.get(0)?),
        bounty_id: BountyId(row.get(1)?),
        repo_full_name: row.get(2)?,
        pr_number: PrNumber(row.get(3)?),
        author_identity: row.get(4)?,
        merge_commit_sha: Sha::parse(&sha).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, e.into())
        })?,
        verified_at: row.get::<_, Option<i64>>(6)?.map(from_millis),
    })
}

fn proof_from_row(row: &Row<'_>) -> rusqlite::Result<Proof> {
    let hash: String = row.get(1)?;
    Ok(Proof {
        submission_id: SubmissionId(row.get(0)?),
        content_hash: ContentHash::parse(&hash).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                1,
                rusqlite::types::Type::Text,
                format!("invalid content hash {hash:?}").into(),
            )
        })?,
        storage_uri: row.get(2)?,
        signature: row.get(3)?,
        generated_at: from_millis(row.get(4)?),
    })
}

/// Fields of a submission before it is stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSubmission {
    pub bounty_id: BountyId,
    pub repo_full_name: String,
    pub pr_number: PrNumber,
    pub author_identity: String,
    pub merge_commit_sha: Sha,
}

impl Store {
    /// Creates the submission for `(repo_full_name, pr_number)` or returns the
    /// one that already exists. An existing submission is never modified.
    pub fn upsert_submission(&self, new: &NewSubmission) -> Result<Submission> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO submissions
                 (bounty_id, repo_full_name, pr_number, author_identity, merge_commit_sha)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (repo_full_name, pr_number) DO NOTHING",
            params![
                new.bounty_id.as_str(),
                new.repo_full_name,
                new.pr_number.0,
                new.author_identity,
                new.merge_commit_sha.as_str(),
            ],
        )?;
        let submission = conn.query_row(
            &format!(
                "SELECT {SUBMISSION_COLUMNS} FROM submissions
                 WHERE repo_full_name = ?1 AND pr_number = ?2"
            ),
            params![new.repo_full_name, new.pr_number.0],
            submission_from_row,
        )?;
        Ok(submission)
    }

    pub fn get_submission(&self, id: SubmissionId) -> Result<Option<Submission>> {
        let conn = self.lock()?;
        let submission = conn
            .query_row(
                &format!("SELECT {SUBMISSION_COLUMNS} FROM submissions WHERE id = ?1"),
                params![id.0],
                submission_from_row,
            )
            .optional()?;
        Ok(submission)
    }

    pub fn count_submissions(&self) -> Result<u64> {
        let conn = self.lock()?;
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM submissions", [], |row| row.get(0))?;
        Ok(n as u64)
    }

    pub fn get_proof(&self, submission_id: SubmissionId) -> Result<Option<Proof>> {
        let conn = self.lock()?;
        let proof = conn
            .query_row(
                "SELECT submission_id, content_hash, storage_uri, signature, generated_at
                 FROM proofs WHERE submission_id = ?1",
                params![submission_id.0],
                proof_from_row,
            )
            .optional()?;
        Ok(proof)
    }

    /// Records the proof, stamps `verified_at` and emits the
    /// `verified_submission` event with its payout job, all in one transaction.
    ///
    /// Re-running for an already verified submission keeps the first proof and
    /// timestamp and reports the existing event as a duplicate.
    pub fn complete_verification(
        &self,
        proof: &Proof,
        verified: &NewEvent,
        now: DateTime<Utc>,
    ) -> Result<Admission> {
        let now_ms = to_millis(now);
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT INTO proofs (submission_id, content_hash, storage_uri, signature, generated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (submission_id) DO NOTHING",
            params![
                proof.submission_id.0,
                proof.content_hash.as_str(),
                proof.storage_uri,
                proof.signature,
                to_millis(proof.generated_at),
            ],
        )?;
        tx.execute(
            "UPDATE submissions SET verified_at = ?2 WHERE id = ?1 AND verified_at IS NULL",
            params![proof.submission_id.0, now_ms],
        )?;

        let admission = admit_tx(&tx, verified, JobKind::Payout, None, self.max_attempts, now)?;
        tx.commit()?;
        Ok(admission)
    }

    /// Loads the submission a payout job refers to.
    pub fn require_submission(&self, id: SubmissionId) -> Result<Submission> {
        self.get_submission(id)?.ok_or_else(|| StoreError::Corrupt {
            table: "submissions",
            detail: format!("submission {id} does not exist"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{seed_locked_bounty, sha};
    use crate::types::{DedupeKey, INTERNAL_SOURCE};

    fn new_submission(pr: u64) -> NewSubmission {
        NewSubmission {
            bounty_id: BountyId::new("B1"),
            repo_full_name: "acme/widgets".to_string(),
            pr_number: PrNumber(pr),
            author_identity: "alice".to_string(),
            merge_commit_sha: sha('a'),
        }
    }

    fn proof_for(id: SubmissionId) -> Proof {
        Proof {
            submission_id: id,
            content_hash: ContentHash::of(b"artifact"),
            storage_uri: "mem://x".to_string(),
            signature: "00".to_string(),
            generated_at: Utc::now(),
        }
    }

    fn verified_event(id: SubmissionId) -> NewEvent {
        NewEvent {
            source: INTERNAL_SOURCE.to_string(),
            event_type: "verified_submission".to_string(),
            dedupe_key: DedupeKey::verified_submission(id),
            payload: serde_json::json!({ "submission_id": id.0 }),
        }
    }

    #[test]
    fn upsert_is_keyed_by_repo_and_pr() {
        let store = Store::in_memory().unwrap();
        seed_locked_bounty(&store, "B1", 100);

        let first = store.upsert_submission(&new_submission(42)).unwrap();
        let mut changed = new_submission(42);
        changed.author_identity = "mallory".to_string();
        let second = store.upsert_submission(&changed).unwrap();

        assert_eq!(first, second);
        assert_eq!(second.author_identity, "alice");
        assert_eq!(store.count_submissions().unwrap(), 1);

        store.upsert_submission(&new_submission(43)).unwrap();
        assert_eq!(store.count_submissions().unwrap(), 2);
    }

    #[test]
    fn verification_emits_payout_job_once() {
        let store = Store::in_memory().unwrap();
        seed_locked_bounty(&store, "B1", 100);
        let submission = store.upsert_submission(&new_submission(42)).unwrap();
        let now = Utc::now();

        let first = store
            .complete_verification(&proof_for(submission.id), &verified_event(submission.id), now)
            .unwrap();
        let second = store
            .complete_verification(&proof_for(submission.id), &verified_event(submission.id), now)
            .unwrap();

        assert!(!first.is_duplicate());
        assert!(second.is_duplicate());
        let jobs = store.jobs_for_event(first.event_id()).unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].kind, JobKind::Payout);

        let stored = store.get_submission(submission.id).unwrap().unwrap();
        assert!(stored.verified_at.is_some());
        let proof = store.get_proof(submission.id).unwrap().unwrap();
        assert_eq!(proof.content_hash, ContentHash::of(b"artifact"));
    }
}
