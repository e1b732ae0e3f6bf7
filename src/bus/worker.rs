//! Leasing workers that pull jobs of one kind from the store.
//!
//! A worker claims the oldest ready job of its kind, runs the handler while
//! keeping the lease alive, and records the handler's [`JobOutcome`]. Any
//! number of workers may pull the same kind concurrently; the claim is a
//! compare-and-set in the store.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::JobOutcome;
use crate::config::WorkerSettings;
use crate::store::{Result, Store};
use crate::types::{Job, JobId, JobKind, JobStatus};

/// Processes jobs of one kind.
pub trait JobHandler: Send + Sync + 'static {
    fn kind(&self) -> JobKind;

    /// Runs one attempt of `job`. Must be idempotent: the same job may run
    /// again after a crash or an expired lease.
    fn handle(&self, job: &Job) -> impl Future<Output = JobOutcome> + Send;
}

/// Wakes idle workers when new jobs are committed.
#[derive(Debug, Clone, Default)]
pub struct Wakeup(Arc<Notify>);

impl Wakeup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notify(&self) {
        self.0.notify_waiters();
    }

    async fn notified(&self) {
        self.0.notified().await;
    }
}

/// A job that was claimed and whose outcome was recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Processed {
    pub job_id: JobId,
    pub outcome: JobOutcome,
}

pub struct Worker<H> {
    store: Store,
    handler: Arc<H>,
    settings: WorkerSettings,
    wakeup: Wakeup,
    owner: String,
}

impl<H: JobHandler> Worker<H> {
    pub fn new(store: Store, handler: Arc<H>, settings: WorkerSettings, wakeup: Wakeup) -> Self {
        let owner = format!("{}:{}", handler.kind(), uuid::Uuid::new_v4().simple());
        Worker {
            store,
            handler,
            settings,
            wakeup,
            owner,
        }
    }

    /// Lease owner recorded on claimed jobs.
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Polls until `shutdown` is cancelled. A job that is running when
    /// shutdown arrives is finished and recorded first.
    #[instrument(skip(self, shutdown), fields(owner = %self.owner))]
    pub async fn run(self, shutdown: CancellationToken) {
        info!("Worker started");
        while !shutdown.is_cancelled() {
            match self.run_once().await {
                Ok(Some(_)) => continue,
                Ok(None) => {}
                Err(e) => error!(error = %e, "Error processing job"),
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.wakeup.notified() => {}
                _ = tokio::time::sleep(self.settings.poll_interval) => {}
            }
        }
        info!("Worker stopped");
    }

    /// Claims and processes at most one ready job.
    pub async fn run_once(&self) -> Result<Option<Processed>> {
        let kind = self.handler.kind();
        let Some(job) = self
            .store
            .claim_next(kind, &self.owner, self.settings.lease, Utc::now())?
        else {
            return Ok(None);
        };

        let outcome = self.execute(&job).await;
        self.record(&job, &outcome)?;
        Ok(Some(Processed {
            job_id: job.id,
            outcome,
        }))
    }

    /// Processes ready jobs until none is left. Returns how many ran.
    pub async fn drain(&self) -> Result<usize> {
        let mut processed = 0;
        while self.run_once().await?.is_some() {
            processed += 1;
        }
        Ok(processed)
    }

    /// Runs the handler, extending the lease every half lease period.
    #[instrument(
        skip(self, job),
        fields(
            job_id = %job.id,
            event_id = %job.event_id,
            kind = %job.kind,
            attempt = job.attempts + 1
        )
    )]
    async fn execute(&self, job: &Job) -> JobOutcome {
        let heartbeat_every = (self.settings.lease / 2).max(Duration::from_millis(10));
        let mut heartbeat = tokio::time::interval(heartbeat_every);
        heartbeat.tick().await;

        let handling = self.handler.handle(job);
        tokio::pin!(handling);
        loop {
            tokio::select! {
                outcome = &mut handling => return outcome,
                _ = heartbeat.tick() => {
                    let extended = self
                        .store
                        .extend_lease(job.id, &self.owner, self.settings.lease, Utc::now());
                    if let Err(e) = extended {
                        warn!(error = %e, "Could not extend lease");
                    }
                }
            }
        }
    }

    fn record(&self, job: &Job, outcome: &JobOutcome) -> Result<()> {
        let now = Utc::now();
        match outcome {
            JobOutcome::Succeeded { event } => {
                self.store.ack_succeeded(job.id, &self.owner, *event, now)?;
                debug!(job_id = %job.id, "Job succeeded");
            }
            JobOutcome::Deferred { after } => {
                let until = now + chrono_duration(*after);
                self.store.defer_job(job.id, &self.owner, until, now)?;
                debug!(job_id = %job.id, after_ms = after.as_millis() as u64, "Job deferred");
            }
            JobOutcome::Retry { error, retry_after } => {
                let backoff = self.settings.retry.delay_for_attempt(job.attempts);
                let delay = retry_after.map_or(backoff, |hint| hint.max(backoff));
                let recorded = self.store.record_failure(
                    job.id,
                    &self.owner,
                    error,
                    now + chrono_duration(delay),
                    now,
                )?;
                if recorded.status == JobStatus::Queued {
                    info!(
                        job_id = %job.id,
                        attempts = recorded.attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Job will be retried"
                    );
                } else {
                    warn!(
                        job_id = %job.id,
                        attempts = recorded.attempts,
                        error = %error,
                        "Job is dead"
                    );
                }
            }
            JobOutcome::Failed { reason } => {
                self.store.fail_job(job.id, &self.owner, reason, now)?;
                warn!(job_id = %job.id, reason = %reason, "Job failed permanently");
            }
        }
        Ok(())
    }
}

fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}

/// Spawns `settings.concurrency` workers for `handler`.
pub fn spawn_workers<H: JobHandler>(
    store: &Store,
    handler: Arc<H>,
    settings: &WorkerSettings,
    wakeup: &Wakeup,
    shutdown: &CancellationToken,
) -> Vec<JoinHandle<()>> {
    (0..settings.concurrency.max(1))
        .map(|_| {
            let worker = Worker::new(
                store.clone(),
                Arc::clone(&handler),
                settings.clone(),
                wakeup.clone(),
            );
            tokio::spawn(worker.run(shutdown.clone()))
        })
        .collect()
}
