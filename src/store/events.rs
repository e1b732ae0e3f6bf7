//! Event admission and lookup.

use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, Row, Transaction, params};
use tracing::debug;

use super::{Result, Store, StoreError, from_millis, parse_column, to_millis};
use crate::types::{
    DedupeKey, Event, EventId, EventStatus, JobId, JobKind, JobStatus, NewEvent, ProjectId,
};

/// Result of admitting an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// A new event row and its first job were committed together.
    Admitted { event_id: EventId, job_id: JobId },
    /// An event with the same dedupe key already exists; nothing was written.
    Duplicate { event_id: EventId },
}

impl Admission {
    pub fn event_id(&self) -> EventId {
        match self {
            Admission::Admitted { event_id, .. } | Admission::Duplicate { event_id } => *event_id,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, Admission::Duplicate { .. })
    }
}

/// Result of requesting a project sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncRequest {
    /// A sync job was already queued or running; nothing was written.
    Pending(JobId),
    /// The request event and a new sync job were committed together.
    Enqueued(JobId),
}

impl SyncRequest {
    pub fn job_id(&self) -> JobId {
        match self {
            SyncRequest::Pending(id) | SyncRequest::Enqueued(id) => *id,
        }
    }
}

const EVENT_COLUMNS: &str = "id, source, type, dedupe_key, payload, received_at, status";

fn event_from_row(row: &Row<'_>) -> rusqlite::Result<Event> {
    let payload: String = row.get(4)?;
    let status: String = row.get(6)?;
    Ok(Event {
        id: EventId(row.get(0)?),
        source: row.get(1)?,
        event_type: row.get(2)?,
        dedupe_key: DedupeKey::from(row.get::<_, String>(3)?),
        payload: serde_json::from_str(&payload).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, e.into())
        })?,
        received_at: from_millis(row.get(5)?),
        status: parse_column("events", &status, EventStatus::parse)?,
    })
}

/// Inserts a queued job inside `tx`. Returns the existing job for
/// `(event_id, kind)` if there already is one.
pub(super) fn insert_job_tx(
    tx: &Transaction<'_>,
    event_id: EventId,
    kind: JobKind,
    project_id: Option<ProjectId>,
    max_attempts: u32,
    now: DateTime<Utc>,
) -> rusqlite::Result<JobId> {
    let now_ms = to_millis(now);
    tx.execute(
        "INSERT INTO jobs
             (event_id, kind, attempts, max_attempts, next_attempt_at, status,
              project_id, created_at, updated_at)
         VALUES (?1, ?2, 0, ?3, ?4, ?5, ?6, ?4, ?4)
         ON CONFLICT (event_id, kind) DO NOTHING",
        params![
            event_id.0,
            kind.as_str(),
            max_attempts,
            now_ms,
            JobStatus::Queued.as_str(),
            project_id.map(|p| p.0),
        ],
    )?;
    tx.query_row(
        "SELECT id FROM jobs WHERE event_id = ?1 AND kind = ?2",
        params![event_id.0, kind.as_str()],
        |row| row.get(0).map(JobId),
    )
}

/// Inserts `event` and its first job inside `tx`, or reports the existing
/// event when the dedupe key is taken.
pub(super) fn admit_tx(
    tx: &Transaction<'_>,
    event: &NewEvent,
    first_job: JobKind,
    project_id: Option<ProjectId>,
    max_attempts: u32,
    now: DateTime<Utc>,
) -> Result<Admission> {
    let payload = serde_json::to_string(&event.payload)?;
    let inserted = tx.execute(
        "INSERT INTO events (source, type, dedupe_key, payload, received_at, status)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT (dedupe_key) DO NOTHING",
        params![
            event.source,
            event.event_type,
            event.dedupe_key.as_str(),
            payload,
            to_millis(now),
            EventStatus::Pending.as_str(),
        ],
    )?;

    if inserted == 0 {
        let event_id = tx.query_row(
            "SELECT id FROM events WHERE dedupe_key = ?1",
            params![event.dedupe_key.as_str()],
            |row| row.get(0).map(EventId),
        )?;
        return Ok(Admission::Duplicate { event_id });
    }

    let event_id = EventId(tx.last_insert_rowid());
    let job_id = insert_job_tx(tx, event_id, first_job, project_id, max_attempts, now)?;
    Ok(Admission::Admitted { event_id, job_id })
}

impl Store {
    /// Inserts `event` and its first job in one transaction.
    ///
    /// The dedupe key's uniqueness constraint is the only de-duplication
    /// mechanism: a second admission with the same key writes nothing and
    /// reports the existing event.
    pub fn admit_event(
        &self,
        event: &NewEvent,
        first_job: JobKind,
        project_id: Option<ProjectId>,
        now: DateTime<Utc>,
    ) -> Result<Admission> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let admission = admit_tx(&tx, event, first_job, project_id, self.max_attempts, now)?;
        tx.commit()?;

        match admission {
            Admission::Admitted { event_id, job_id } => debug!(
                dedupe_key = %event.dedupe_key,
                event_id = %event_id,
                job_id = %job_id,
                kind = %first_job,
                "Admitted event"
            ),
            Admission::Duplicate { event_id } => {
                debug!(dedupe_key = %event.dedupe_key, event_id = %event_id, "Duplicate event")
            }
        }
        Ok(admission)
    }

    /// Enqueues a follow-up job on an existing event. Idempotent per
    /// `(event_id, kind)`.
    pub fn enqueue_job(
        &self,
        event_id: EventId,
        kind: JobKind,
        now: DateTime<Utc>,
    ) -> Result<JobId> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let job_id = insert_job_tx(&tx, event_id, kind, None, self.max_attempts, now)?;
        tx.commit()?;
        Ok(job_id)
    }

    /// Admits a sync request for `project` unless a sync job is already
    /// queued or running for it. The check and the insert share one
    /// transaction, so concurrent requests leave a single active job.
    pub fn admit_sync_request(
        &self,
        project: ProjectId,
        event: &NewEvent,
        now: DateTime<Utc>,
    ) -> Result<SyncRequest> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let active = tx
            .query_row(
                "SELECT id FROM jobs
                 WHERE project_id = ?1 AND kind = ?2 AND status IN (?3, ?4)
                 ORDER BY id LIMIT 1",
                params![
                    project.0,
                    JobKind::Sync.as_str(),
                    JobStatus::Queued.as_str(),
                    JobStatus::Running.as_str()
                ],
                |row| row.get(0).map(JobId),
            )
            .optional()?;
        if let Some(job_id) = active {
            return Ok(SyncRequest::Pending(job_id));
        }

        let max_attempts = self.max_attempts;
        let job_id = match admit_tx(&tx, event, JobKind::Sync, Some(project), max_attempts, now)? {
            Admission::Admitted { job_id, .. } => job_id,
            Admission::Duplicate { event_id } => {
                insert_job_tx(&tx, event_id, JobKind::Sync, Some(project), max_attempts, now)?
            }
        };
        tx.commit()?;
        Ok(SyncRequest::Enqueued(job_id))
    }

    pub fn get_event(&self, id: EventId) -> Result<Option<Event>> {
        let conn = self.lock()?;
        let event = conn
            .query_row(
                &format!("SELECT {EVENT_COLUMNS} FROM events WHERE id = ?1"),
                params![id.0],
                event_from_row,
            )
            .optional()?;
        Ok(event)
    }

    pub fn get_event_by_key(&self, key: &DedupeKey) -> Result<Option<Event>> {
        let conn = self.lock()?;
        let event = conn
            .query_row(
                &format!("SELECT {EVENT_COLUMNS} FROM events WHERE dedupe_key = ?1"),
                params![key.as_str()],
                event_from_row,
            )
            .optional()?;
        Ok(event)
    }

    /// Loads an event that a job refers to.
    pub fn require_event(&self, id: EventId) -> Result<Event> {
        self.get_event(id)?.ok_or_else(|| StoreError::Corrupt {
            table: "jobs",
            detail: format!("job references missing event {id}"),
        })
    }

    pub fn set_event_status(&self, id: EventId, status: EventStatus) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE events SET status = ?2 WHERE id = ?1",
            params![id.0, status.as_str()],
        )?;
        Ok(())
    }

    /// Number of stored events with the given type.
    pub fn count_events_of_type(&self, event_type: &str) -> Result<u64> {
        let conn = self.lock()?;
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM events WHERE type = ?1",
            params![event_type],
            |row| row.get(0),
        )?;
        Ok(n as u64)
    }
}
