//! Job leasing and lifecycle.
//!
//! A job is claimed by compare-and-set on `(status, lease)`, never by an
//! in-process lock, so any number of workers (in any number of processes
//! sharing the database) can pull from the same queue. Every acknowledgement
//! re-checks that the caller still holds the lease.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, Row, Transaction, params};
use tracing::{debug, info, warn};

use super::{Result, Store, StoreError, from_millis, parse_column, to_millis};
use crate::types::{EventId, EventStatus, Job, JobId, JobKind, JobStatus, ProjectId};

/// What happened when a failed execution was recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureRecorded {
    /// `Queued` when another attempt is scheduled, `Dead` when the budget ran out.
    pub status: JobStatus,
    pub attempts: u32,
}

const JOB_COLUMNS: &str = "id, event_id, kind, attempts, max_attempts, next_attempt_at, \
     last_error, status, project_id, lease_owner, lease_expires_at, created_at, updated_at";

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<Job> {
    let kind: String = row.get(2)?;
    let status: String = row.get(7)?;
    Ok(Job {
        id: JobId(row.get(0)?),
        event_id: EventId(row.get(1)?),
        kind: parse_column("jobs", &kind, JobKind::parse)?,
        attempts: row.get(3)?,
        max_attempts: row.get(4)?,
        next_attempt_at: from_millis(row.get(5)?),
        last_error: row.get(6)?,
        status: parse_column("jobs", &status, JobStatus::parse)?,
        project_id: row.get::<_, Option<i64>>(8)?.map(ProjectId),
        lease_owner: row.get(9)?,
        lease_expires_at: row.get::<_, Option<i64>>(10)?.map(from_millis),
        created_at: from_millis(row.get(11)?),
        updated_at: from_millis(row.get(12)?),
    })
}

fn lease_millis(lease: Duration) -> i64 {
    i64::try_from(lease.as_millis()).unwrap_or(i64::MAX)
}

/// Marks the events of the given jobs as failed.
fn fail_events(tx: &Transaction<'_>, job_ids: &[i64]) -> rusqlite::Result<()> {
    for id in job_ids {
        tx.execute(
            "UPDATE events SET status = ?2 WHERE id = (SELECT event_id FROM jobs WHERE id = ?1)",
            params![id, EventStatus::Failed.as_str()],
        )?;
    }
    Ok(())
}

impl Store {
    pub fn get_job(&self, id: JobId) -> Result<Option<Job>> {
        let conn = self.lock()?;
        let job = conn
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                params![id.0],
                job_from_row,
            )
            .optional()?;
        Ok(job)
    }

    pub fn count_jobs(&self) -> Result<u64> {
        let conn = self.lock()?;
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM jobs", [], |row| row.get(0))?;
        Ok(n as u64)
    }

    /// Every job bound to `event_id`, in creation order.
    pub fn jobs_for_event(&self, event_id: EventId) -> Result<Vec<Job>> {
        self.select_jobs("WHERE event_id = ?1 ORDER BY id", params![event_id.0])
    }

    /// Jobs of `kind` for a project, newest first.
    pub fn jobs_for_project(&self, project_id: ProjectId, kind: JobKind) -> Result<Vec<Job>> {
        self.select_jobs(
            "WHERE project_id = ?1 AND kind = ?2 ORDER BY id DESC",
            params![project_id.0, kind.as_str()],
        )
    }

    /// Jobs that ended in a terminal failure (`failed` or `dead`).
    pub fn terminal_failures(&self) -> Result<Vec<Job>> {
        self.select_jobs(
            "WHERE status IN (?1, ?2) ORDER BY updated_at DESC, id DESC",
            params![JobStatus::Failed.as_str(), JobStatus::Dead.as_str()],
        )
    }

    fn select_jobs(&self, clause: &str, params: impl rusqlite::Params) -> Result<Vec<Job>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!("SELECT {JOB_COLUMNS} FROM jobs {clause}"))?;
        let jobs = stmt
            .query_map(params, job_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(jobs)
    }

    /// Returns every running job whose lease has expired to the queue.
    ///
    /// An expired lease counts as a failed execution: `attempts` is
    /// incremented and a job that exhausts its budget goes `dead`.
    pub fn reap_expired_leases(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let reaped = reap_tx(&tx, now)?;
        tx.commit()?;
        Ok(reaped)
    }

    /// Leases the next ready job of `kind` to `owner`.
    ///
    /// Ready means queued with `next_attempt_at <= now`; jobs are handed out in
    /// `(next_attempt_at, id)` order. The claimed job's event moves to
    /// `processing`.
    pub fn claim_next(
        &self,
        kind: JobKind,
        owner: &str,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>> {
        let now_ms = to_millis(now);
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        reap_tx(&tx, now)?;

        let candidate: Option<i64> = tx
            .query_row(
                "SELECT id FROM jobs
                 WHERE kind = ?1 AND status = ?2 AND next_attempt_at <= ?3
                 ORDER BY next_attempt_at, id LIMIT 1",
                params![kind.as_str(), JobStatus::Queued.as_str(), now_ms],
                |row| row.get(0),
            )
            .optional()?;
        let Some(id) = candidate else {
            tx.commit()?;
            return Ok(None);
        };

        let claimed = tx.execute(
            "UPDATE jobs
             SET status = ?2, lease_owner = ?3, lease_expires_at = ?4, updated_at = ?5
             WHERE id = ?1 AND status = ?6",
            params![
                id,
                JobStatus::Running.as_str(),
                owner,
                now_ms.saturating_add(lease_millis(lease)),
                now_ms,
                JobStatus::Queued.as_str(),
            ],
        )?;
        if claimed == 0 {
            tx.commit()?;
            return Ok(None);
        }

        tx.execute(
            "UPDATE events SET status = ?2
             WHERE id = (SELECT event_id FROM jobs WHERE id = ?1) AND status = ?3",
            params![
                id,
                EventStatus::Processing.as_str(),
                EventStatus::Pending.as_str()
            ],
        )?;

        let job = tx.query_row(
            &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
            params![id],
            job_from_row,
        )?;
        tx.commit()?;

        debug!(job_id = %job.id, kind = %kind, owner, attempts = job.attempts, "Claimed job");
        Ok(Some(job))
    }

    /// Pushes the lease expiry of a running job forward.
    pub fn extend_lease(
        &self,
        job_id: JobId,
        owner: &str,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let now_ms = to_millis(now);
        let conn = self.lock()?;
        let updated = conn.execute(
            "UPDATE jobs SET lease_expires_at = ?3, updated_at = ?4
             WHERE id = ?1 AND lease_owner = ?2 AND status = ?5",
            params![
                job_id.0,
                owner,
                now_ms.saturating_add(lease_millis(lease)),
                now_ms,
                JobStatus::Running.as_str()
            ],
        )?;
        check_lease(updated, job_id, owner)
    }

    /// Marks a job succeeded and optionally moves its event to `event_status`.
    pub fn ack_succeeded(
        &self,
        job_id: JobId,
        owner: &str,
        event_status: Option<EventStatus>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let updated = tx.execute(
            "UPDATE jobs
             SET status = ?3, lease_owner = NULL, lease_expires_at = NULL, updated_at = ?4
             WHERE id = ?1 AND lease_owner = ?2 AND status = ?5",
            params![
                job_id.0,
                owner,
                JobStatus::Succeeded.as_str(),
                to_millis(now),
                JobStatus::Running.as_str()
            ],
        )?;
        check_lease(updated, job_id, owner)?;
        if let Some(status) = event_status {
            tx.execute(
                "UPDATE events SET status = ?2
                 WHERE id = (SELECT event_id FROM jobs WHERE id = ?1)",
                params![job_id.0, status.as_str()],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Releases a job back to the queue without charging an attempt.
    ///
    /// Used while waiting on an external process that has not failed, such as
    /// a chain transaction that is still pending.
    pub fn defer_job(
        &self,
        job_id: JobId,
        owner: &str,
        until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.lock()?;
        let updated = conn.execute(
            "UPDATE jobs
             SET status = ?3, next_attempt_at = ?4, lease_owner = NULL,
                 lease_expires_at = NULL, updated_at = ?5
             WHERE id = ?1 AND lease_owner = ?2 AND status = ?6",
            params![
                job_id.0,
                owner,
                JobStatus::Queued.as_str(),
                to_millis(until),
                to_millis(now),
                JobStatus::Running.as_str()
            ],
        )?;
        check_lease(updated, job_id, owner)
    }

    /// Records a failed execution that may be retried.
    ///
    /// The job is requeued at `retry_at`, unless this failure exhausts the
    /// retry budget, in which case it goes `dead` and its event `failed`.
    pub fn record_failure(
        &self,
        job_id: JobId,
        owner: &str,
        error: &str,
        retry_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<FailureRecorded> {
        let now_ms = to_millis(now);
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let updated = tx.execute(
            "UPDATE jobs
             SET attempts = attempts + 1,
                 status = CASE WHEN attempts + 1 >= max_attempts THEN ?4 ELSE ?5 END,
                 next_attempt_at = ?6, last_error = ?3, lease_owner = NULL,
                 lease_expires_at = NULL, updated_at = ?7
             WHERE id = ?1 AND lease_owner = ?2 AND status = ?8",
            params![
                job_id.0,
                owner,
                error,
                JobStatus::Dead.as_str(),
                JobStatus::Queued.as_str(),
                to_millis(retry_at),
                now_ms,
                JobStatus::Running.as_str(),
            ],
        )?;
        check_lease(updated, job_id, owner)?;
        let (status, attempts): (String, u32) = tx.query_row(
            "SELECT status, attempts FROM jobs WHERE id = ?1",
            params![job_id.0],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        let status = parse_column("jobs", &status, JobStatus::parse)?;
        if status == JobStatus::Dead {
            fail_events(&tx, &[job_id.0])?;
        }
        tx.commit()?;

        if status == JobStatus::Dead {
            warn!(job_id = %job_id, attempts, error, "Job exhausted its retry budget");
        }
        Ok(FailureRecorded { status, attempts })
    }

    /// Marks a job permanently failed; it will not run again without a manual retry.
    pub fn fail_job(
        &self,
        job_id: JobId,
        owner: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let updated = tx.execute(
            "UPDATE jobs
             SET status = ?4, last_error = ?3, lease_owner = NULL, lease_expires_at = NULL,
                 updated_at = ?5
             WHERE id = ?1 AND lease_owner = ?2 AND status = ?6",
            params![
                job_id.0,
                owner,
                reason,
                JobStatus::Failed.as_str(),
                to_millis(now),
                JobStatus::Running.as_str()
            ],
        )?;
        check_lease(updated, job_id, owner)?;
        tx.execute(
            "UPDATE events SET status = ?2 WHERE id = (SELECT event_id FROM jobs WHERE id = ?1)",
            params![job_id.0, EventStatus::Failed.as_str()],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Requeues a `failed` or `dead` job for another run.
    ///
    /// `attempts` is kept and `max_attempts` raised by one, so the job gets
    /// exactly one more execution before it can go dead again.
    pub fn retry_job(&self, job_id: JobId, now: DateTime<Utc>) -> Result<Job> {
        let now_ms = to_millis(now);
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let job = tx
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                params![job_id.0],
                job_from_row,
            )
            .optional()?
            .ok_or(StoreError::JobNotFound(job_id))?;

        if !matches!(job.status, JobStatus::Failed | JobStatus::Dead) {
            return Err(StoreError::NotRetryable {
                job_id,
                status: job.status,
            });
        }

        tx.execute(
            "UPDATE jobs
             SET status = ?2, max_attempts = MAX(max_attempts, attempts) + 1,
                 next_attempt_at = ?3, updated_at = ?3
             WHERE id = ?1",
            params![job_id.0, JobStatus::Queued.as_str(), now_ms],
        )?;
        tx.execute(
            "UPDATE events SET status = ?2 WHERE id = ?1",
            params![job.event_id.0, EventStatus::Pending.as_str()],
        )?;
        let job = tx.query_row(
            &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
            params![job_id.0],
            job_from_row,
        )?;
        tx.commit()?;

        info!(
            job_id = %job_id,
            attempts = job.attempts,
            max_attempts = job.max_attempts,
            "Job requeued manually"
        );
        Ok(job)
    }
}

fn reap_tx(tx: &Transaction<'_>, now: DateTime<Utc>) -> rusqlite::Result<usize> {
    let now_ms = to_millis(now);
    let mut stmt = tx.prepare(
        "SELECT id, attempts + 1 >= max_attempts FROM jobs
         WHERE status = ?1 AND lease_expires_at <= ?2",
    )?;
    let expired = stmt
        .query_map(params![JobStatus::Running.as_str(), now_ms], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, bool>(1)?))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    drop(stmt);

    let mut dead = Vec::new();
    for (id, exhausted) in &expired {
        let status = if *exhausted {
            dead.push(*id);
            JobStatus::Dead
        } else {
            JobStatus::Queued
        };
        tx.execute(
            "UPDATE jobs
             SET attempts = attempts + 1, status = ?2, last_error = 'lease expired',
                 lease_owner = NULL, lease_expires_at = NULL,
                 next_attempt_at = ?3, updated_at = ?3
             WHERE id = ?1",
            params![id, status.as_str(), now_ms],
        )?;
    }
    fail_events(tx, &dead)?;

    if !expired.is_empty() {
        warn!(count = expired.len(), dead = dead.len(), "Reclaimed jobs with expired leases");
    }
    Ok(expired.len())
}

fn check_lease(updated: usize, job_id: JobId, owner: &str) -> Result<()> {
    if updated == 0 {
        return Err(StoreError::LeaseLost {
            job_id,
            owner: owner.to_string(),
        });
    }
    Ok(())
}
