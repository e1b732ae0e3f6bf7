//! Sync triggers and job inspection.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use chrono::Utc;
use serde::Serialize;

use super::{ApiError, AppState};
use crate::sync::request_sync;
use crate::types::{Job, JobId, ProjectId};

#[derive(Debug, Serialize)]
pub struct SyncAccepted {
    pub job_id: JobId,
}

/// `POST /projects/{id}/sync`: enqueues (or joins) a sync of the project.
pub async fn request_sync_handler(
    State(app_state): State<AppState>,
    Path(project_id): Path<i64>,
) -> Result<(StatusCode, Json<SyncAccepted>), ApiError> {
    let store = app_state.store();
    let project = ProjectId(project_id);
    if store.get_project(project)?.is_none() {
        return Err(ApiError::NotFound(format!("project {project} not found")));
    }
    let job_id = request_sync(store, project, Utc::now())?;
    app_state.wakeup().notify();
    Ok((StatusCode::ACCEPTED, Json(SyncAccepted { job_id })))
}

/// `GET /projects/{id}/sync/jobs`: sync jobs of the project, newest first.
pub async fn sync_jobs_handler(
    State(app_state): State<AppState>,
    Path(project_id): Path<i64>,
) -> Result<Json<Vec<Job>>, ApiError> {
    let store = app_state.store();
    let project = ProjectId(project_id);
    if store.get_project(project)?.is_none() {
        return Err(ApiError::NotFound(format!("project {project} not found")));
    }
    Ok(Json(store.jobs_for_project(project, crate::types::JobKind::Sync)?))
}

/// `GET /jobs/dead`: jobs in a terminal failure state.
pub async fn dead_jobs_handler(
    State(app_state): State<AppState>,
) -> Result<Json<Vec<Job>>, ApiError> {
    Ok(Json(app_state.store().terminal_failures()?))
}

/// `POST /jobs/{id}/retry`: requeues a failed or dead job.
pub async fn retry_job_handler(
    State(app_state): State<AppState>,
    Path(job_id): Path<i64>,
) -> Result<(StatusCode, Json<Job>), ApiError> {
    let job = app_state.store().retry_job(JobId(job_id), Utc::now())?;
    app_state.wakeup().notify();
    Ok((StatusCode::ACCEPTED, Json(job)))
}
