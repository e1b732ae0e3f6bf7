//! Enqueueing sync jobs: on registration, on request and on a timer.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::bus::Wakeup;
use crate::store::{Result, Store, SyncRequest};
use crate::types::{DedupeKey, INTERNAL_SOURCE, JobId, NewEvent, Project, ProjectId, UserId};

/// Event type recorded for every sync request.
pub const SYNC_REQUESTED: &str = "sync_requested";

/// Enqueues a sync of `project`, or returns the sync job that is already
/// queued or running for it.
pub fn request_sync(store: &Store, project: ProjectId, now: DateTime<Utc>) -> Result<JobId> {
    let nonce = uuid::Uuid::new_v4().simple().to_string();
    let event = NewEvent {
        source: INTERNAL_SOURCE.to_string(),
        event_type: SYNC_REQUESTED.to_string(),
        dedupe_key: DedupeKey::sync_request(project, &nonce),
        payload: json!({ "project_id": project }),
    };
    let request = store.admit_sync_request(project, &event, now)?;
    match request {
        SyncRequest::Pending(job_id) => {
            debug!(project_id = %project, job_id = %job_id, "Sync already pending");
        }
        SyncRequest::Enqueued(job_id) => {
            info!(project_id = %project, job_id = %job_id, "Sync requested");
        }
    }
    Ok(request.job_id())
}

/// Registers a repository for `owner` and enqueues its initial sync.
pub fn register_project(
    store: &Store,
    owner: UserId,
    repo_full_name: &str,
    now: DateTime<Utc>,
) -> Result<(Project, JobId)> {
    let project = store.create_project(owner, repo_full_name)?;
    let job = request_sync(store, project.id, now)?;
    Ok((project, job))
}

/// Requests a sync of every registered project. Returns how many projects
/// were visited.
pub fn schedule_all(store: &Store, now: DateTime<Utc>) -> Result<usize> {
    let projects = store.list_projects()?;
    for project in &projects {
        request_sync(store, project.id, now)?;
    }
    Ok(projects.len())
}

/// Calls [`schedule_all`] every `interval` until `shutdown` fires.
pub async fn run_scheduler(
    store: Store,
    interval: Duration,
    wakeup: Wakeup,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately; registration already synced.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Sync scheduler stopping");
                return;
            }
            _ = ticker.tick() => {
                match schedule_all(&store, Utc::now()) {
                    Ok(count) => {
                        debug!(projects = count, "Scheduled sync");
                        wakeup.notify();
                    }
                    Err(e) => error!(error = %e, "Scheduled sync failed"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};

    use crate::types::{JobKind, JobStatus};

    #[test]
    fn registration_enqueues_initial_sync() {
        let store = Store::in_memory().unwrap();
        let (project, job_id) =
            register_project(&store, UserId(1), "acme/widgets", Utc::now()).unwrap();

        let job = store.get_job(job_id).unwrap().unwrap();
        assert_eq!(job.kind, JobKind::Sync);
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.project_id, Some(project.id));
        assert_eq!(store.count_events_of_type(SYNC_REQUESTED).unwrap(), 1);
    }

    #[test]
    fn requests_coalesce_while_a_sync_is_pending() {
        let store = Store::in_memory().unwrap();
        let (project, first) =
            register_project(&store, UserId(1), "acme/widgets", Utc::now()).unwrap();

        let second = request_sync(&store, project.id, Utc::now()).unwrap();
        assert_eq!(first, second);
        assert_eq!(
            store.jobs_for_project(project.id, JobKind::Sync).unwrap().len(),
            1
        );
    }

    #[test]
    fn concurrent_requests_enqueue_one_sync() {
        for _ in 0..20 {
            let store = Store::in_memory().unwrap();
            let project = store.create_project(UserId(1), "acme/widgets").unwrap();
            let barrier = Arc::new(Barrier::new(4));
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    let store = store.clone();
                    let barrier = Arc::clone(&barrier);
                    std::thread::spawn(move || {
                        barrier.wait();
                        request_sync(&store, project.id, Utc::now()).unwrap()
                    })
                })
                .collect();
            let job_ids: Vec<JobId> = handles.into_iter().map(|h| h.join().unwrap()).collect();

            assert!(job_ids.iter().all(|id| *id == job_ids[0]));
            assert_eq!(
                store.jobs_for_project(project.id, JobKind::Sync).unwrap().len(),
                1
            );
            assert_eq!(store.count_events_of_type(SYNC_REQUESTED).unwrap(), 1);
        }
    }

    #[test]
    fn finished_sync_allows_a_new_request() {
        let store = Store::in_memory().unwrap();
        let now = Utc::now();
        let (project, first) = register_project(&store, UserId(1), "acme/widgets", now).unwrap();
        let claimed = store
            .claim_next(JobKind::Sync, "w", Duration::from_secs(30), now)
            .unwrap()
            .unwrap();
        store.ack_succeeded(claimed.id, "w", None, now).unwrap();

        let second = request_sync(&store, project.id, now).unwrap();
        assert_ne!(first, second);
        assert_eq!(
            store.jobs_for_project(project.id, JobKind::Sync).unwrap().len(),
            2
        );
    }

    #[test]
    fn schedule_visits_every_project() {
        let store = Store::in_memory().unwrap();
        let now = Utc::now();
        store.create_project(UserId(1), "acme/widgets").unwrap();
        store.create_project(UserId(2), "acme/gadgets").unwrap();

        assert_eq!(schedule_all(&store, now).unwrap(), 2);
        assert_eq!(schedule_all(&store, now).unwrap(), 2);
        assert_eq!(store.count_events_of_type(SYNC_REQUESTED).unwrap(), 2);
    }

    #[tokio::test]
    async fn scheduler_stops_on_shutdown() {
        let store = Store::in_memory().unwrap();
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(run_scheduler(
            store,
            Duration::from_secs(3600),
            Wakeup::new(),
            shutdown.clone(),
        ));
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
