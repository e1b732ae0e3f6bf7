//! Sync worker: mirrors a project's issues and pull requests.
//!
//! Runs orthogonally to verification and payout. A sync job pages through
//! the repository's items with the owner's delegated credential and upserts
//! each one keyed by remote id. Upserts ignore stale observations, so a job
//! that is retried from the first page converges on the same rows.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, instrument};

use crate::bus::{JobHandler, JobOutcome};
use crate::credentials::{TokenCipher, owner_token};
use crate::github::SourceApi;
use crate::store::Store;
use crate::types::{Job, JobKind, MirroredItem, ProjectId, RepoId};

mod schedule;

pub use schedule::{SYNC_REQUESTED, register_project, request_sync, run_scheduler, schedule_all};

pub struct SyncHandler<S> {
    store: Store,
    source: Arc<S>,
    cipher: TokenCipher,
    max_pages: u32,
}

impl<S: SourceApi> SyncHandler<S> {
    pub fn new(store: Store, source: Arc<S>, cipher: TokenCipher, max_pages: u32) -> Self {
        SyncHandler {
            store,
            source,
            cipher,
            max_pages: max_pages.max(1),
        }
    }

    fn project_of(&self, job: &Job) -> Result<ProjectId, JobOutcome> {
        if let Some(id) = job.project_id {
            return Ok(id);
        }
        let event = self.store.require_event(job.event_id)?;
        event
            .payload
            .get("project_id")
            .and_then(serde_json::Value::as_i64)
            .map(ProjectId)
            .ok_or_else(|| JobOutcome::failed("sync job has no project"))
    }

    #[instrument(skip(self, job), fields(job_id = %job.id))]
    async fn sync(&self, job: &Job) -> Result<JobOutcome, JobOutcome> {
        let project_id = self.project_of(job)?;
        let project = self
            .store
            .get_project(project_id)?
            .ok_or_else(|| JobOutcome::failed(format!("project {project_id} not found")))?;
        let repo = RepoId::parse_full_name(&project.repo_full_name).ok_or_else(|| {
            JobOutcome::failed(format!("invalid repository name {}", project.repo_full_name))
        })?;
        let token = owner_token(&self.store, &self.cipher, &project)?;

        let mut seen = 0usize;
        let mut written = 0usize;
        for page in 1..=self.max_pages {
            let listed = self.source.list_items_page(&token, &repo, page).await?;
            let now = Utc::now();
            for item in listed.items {
                seen += 1;
                let mirrored = MirroredItem {
                    project_id,
                    remote_id: item.remote_id,
                    number: item.number,
                    kind: item.kind,
                    state: item.state,
                    title: item.title,
                    updated_at: item.updated_at,
                };
                if self.store.upsert_mirrored_item(&mirrored, now)? {
                    written += 1;
                }
            }
            if !listed.has_more {
                break;
            }
            if page == self.max_pages {
                debug!(%repo, page, "Page limit reached; remaining items wait for the next sync");
            }
        }

        info!(%repo, project_id = %project_id, seen, written, "Project synced");
        Ok(JobOutcome::done())
    }
}

impl<S: SourceApi> JobHandler for SyncHandler<S> {
    fn kind(&self) -> JobKind {
        JobKind::Sync
    }

    async fn handle(&self, job: &Job) -> JobOutcome {
        self.sync(job).await.unwrap_or_else(|outcome| outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::github::{GitHubApiError, ItemsPage, RemoteItem};
    use crate::test_utils::{ScriptedSource, link_owner, test_cipher};
    use crate::types::{ItemKind, UserId};
    use std::time::Duration;

    fn item(number: u64, state: &str) -> RemoteItem {
        RemoteItem {
            remote_id: 1000 + number,
            number,
            kind: if number % 2 == 0 {
                ItemKind::PullRequest
            } else {
                ItemKind::Issue
            },
            state: state.to_string(),
            title: format!("item {number}"),
            updated_at: Utc::now(),
        }
    }

    fn page(items: Vec<RemoteItem>, has_more: bool) -> ItemsPage {
        ItemsPage { items, has_more }
    }

    fn setup(max_pages: u32) -> (Store, Arc<ScriptedSource>, SyncHandler<ScriptedSource>, Job) {
        let store = Store::in_memory().unwrap();
        link_owner(&store, UserId(1));
        let (_, job_id) = register_project(&store, UserId(1), "acme/widgets", Utc::now()).unwrap();
        let source = Arc::new(ScriptedSource::new());
        let handler =
            SyncHandler::new(store.clone(), Arc::clone(&source), test_cipher(), max_pages);
        let job = store.get_job(job_id).unwrap().unwrap();
        (store, source, handler, job)
    }

    #[tokio::test]
    async fn pages_until_short_page() {
        let (store, source, handler, job) = setup(10);
        source.push_page(Ok(page(vec![item(1, "open"), item(2, "open")], true)));
        source.push_page(Ok(page(vec![item(3, "closed")], false)));
        source.push_page(Ok(page(vec![item(4, "open")], false)));

        assert_eq!(handler.handle(&job).await, JobOutcome::done());
        assert_eq!(source.page_calls(), vec![1, 2]);
        let items = store.mirrored_items(job.project_id.unwrap()).unwrap();
        let numbers: Vec<_> = items.iter().map(|i| i.number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
        assert_eq!(source.tokens_seen(), vec!["gho_owner", "gho_owner"]);
    }

    #[tokio::test]
    async fn page_limit_bounds_one_job() {
        let (_, source, handler, job) = setup(2);
        for n in 0..5 {
            source.push_page(Ok(page(vec![item(n, "open")], true)));
        }
        assert_eq!(handler.handle(&job).await, JobOutcome::done());
        assert_eq!(source.page_calls(), vec![1, 2]);
    }

    #[tokio::test]
    async fn rate_limit_retries_with_hint() {
        let (store, source, handler, job) = setup(10);
        source.push_page(Ok(page(vec![item(1, "open")], true)));
        source.push_page(Err(GitHubApiError::from_status(429, "rate limited")
            .with_retry_after(Duration::from_secs(30))));

        match handler.handle(&job).await {
            JobOutcome::Retry { retry_after, .. } => {
                assert_eq!(retry_after, Some(Duration::from_secs(30)));
            }
            other => panic!("expected retry, got {other:?}"),
        }
        // Rows from earlier pages are kept.
        assert_eq!(store.mirrored_items(job.project_id.unwrap()).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn retry_after_header_delays_next_attempt() {
        use crate::bus::{RetryConfig, Wakeup, Worker};
        use crate::config::WorkerSettings;
        use crate::github::OctocrabSource;
        use crate::types::JobStatus;
        use axum::Router;
        use axum::http::StatusCode;
        use axum::routing::get;

        let app = Router::new().route(
            "/repos/{owner}/{repo}/issues",
            get(|| async {
                (
                    StatusCode::TOO_MANY_REQUESTS,
                    [("retry-after", "90")],
                    r#"{"message":"You have exceeded a secondary rate limit"}"#,
                )
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let store = Store::in_memory().unwrap().with_max_attempts(5);
        link_owner(&store, UserId(1));
        let (_, job_id) = register_project(&store, UserId(1), "acme/widgets", Utc::now()).unwrap();
        let source = Arc::new(OctocrabSource::new(Some(format!("http://{addr}"))));
        let handler = SyncHandler::new(store.clone(), source, test_cipher(), 10);
        let settings = WorkerSettings {
            max_attempts: 5,
            lease: Duration::from_secs(30),
            poll_interval: Duration::ZERO,
            concurrency: 1,
            retry: RetryConfig::new(Duration::from_secs(1), Duration::from_secs(1), 2.0),
        };
        let worker = Worker::new(store.clone(), Arc::new(handler), settings, Wakeup::new());

        let before = Utc::now();
        worker.run_once().await.unwrap().unwrap();

        let job = store.get_job(job_id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.attempts, 1);
        // Stored times are whole milliseconds.
        let earliest = before + chrono::Duration::seconds(90) - chrono::Duration::milliseconds(1);
        assert!(job.next_attempt_at >= earliest);
        assert!(job.next_attempt_at <= Utc::now() + chrono::Duration::seconds(91));
        assert!(job.last_error.unwrap().contains("secondary rate limit"));
    }

    #[tokio::test]
    async fn unlinked_owner_fails_without_fetching() {
        let store = Store::in_memory().unwrap();
        let (_, job_id) = register_project(&store, UserId(9), "acme/widgets", Utc::now()).unwrap();
        let source = Arc::new(ScriptedSource::new());
        let handler = SyncHandler::new(store.clone(), Arc::clone(&source), test_cipher(), 10);
        let job = store.get_job(job_id).unwrap().unwrap();

        assert_eq!(
            handler.handle(&job).await,
            JobOutcome::failed("github_not_linked")
        );
        assert!(source.page_calls().is_empty());
    }

    #[tokio::test]
    async fn sync_never_touches_submissions() {
        let (store, source, handler, job) = setup(10);
        source.push_page(Ok(page(vec![item(2, "closed")], false)));
        handler.handle(&job).await;
        assert_eq!(store.count_submissions().unwrap(), 0);
    }
}
