//! HTTP surface of the relay.
//!
//! # Endpoints
//!
//! - `POST /events/{source}` - Admits a signed webhook delivery
//! - `POST /projects/{id}/sync` - Enqueues a project sync (202)
//! - `GET /projects/{id}/sync/jobs` - Sync jobs with attempts and last error
//! - `GET /jobs/dead` - Jobs that ended in a terminal failure
//! - `POST /jobs/{id}/retry` - Requeues a failed or dead job
//! - `GET /bounties/{id}` - Escrow state and payouts of a bounty
//! - `POST /bounties/{id}/lock`, `POST /bounties/{id}/refund` - Escrow actions
//! - `GET /health` - Returns 200 while the store is reachable

use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use tracing::error;

use crate::bus::Wakeup;
use crate::store::{EscrowError, Store, StoreError};
use crate::webhooks::Gateway;

pub mod bounties;
pub mod health;
pub mod jobs;
pub mod webhook;

pub use bounties::{bounty_handler, lock_handler, refund_handler};
pub use health::health_handler;
pub use jobs::{dead_jobs_handler, request_sync_handler, retry_job_handler, sync_jobs_handler};
pub use webhook::events_handler;

/// Shared application state, passed to handlers via Axum's `State` extractor.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    store: Store,
    gateway: Gateway,
    /// Wakes idle workers after the API enqueues a job.
    wakeup: Wakeup,
}

impl AppState {
    pub fn new(store: Store, gateway: Gateway, wakeup: Wakeup) -> Self {
        AppState {
            inner: Arc::new(AppStateInner {
                store,
                gateway,
                wakeup,
            }),
        }
    }

    pub fn store(&self) -> &Store {
        &self.inner.store
    }

    pub fn gateway(&self) -> &Gateway {
        &self.inner.gateway
    }

    pub fn wakeup(&self) -> &Wakeup {
        &self.inner.wakeup
    }
}

/// Errors returned by the operator endpoints.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::JobNotFound(_) => ApiError::NotFound(err.to_string()),
            StoreError::Escrow(EscrowError::BountyNotFound(_)) => {
                ApiError::NotFound(err.to_string())
            }
            StoreError::NotRetryable { .. } | StoreError::Escrow(_) => {
                ApiError::Conflict(err.to_string())
            }
            other => ApiError::Store(other),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(m) => (StatusCode::NOT_FOUND, m),
            ApiError::Conflict(m) => (StatusCode::CONFLICT, m),
            ApiError::Store(e) => {
                error!(error = %e, "Request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
            }
        };
        (status, message).into_response()
    }
}

/// Builds the axum Router with all endpoints.
pub fn build_router(app_state: AppState) -> axum::Router {
    use axum::routing::{get, post};

    axum::Router::new()
        .route("/events/{source}", post(events_handler))
        .route("/projects/{id}/sync", post(request_sync_handler))
        .route("/projects/{id}/sync/jobs", get(sync_jobs_handler))
        .route("/jobs/dead", get(dead_jobs_handler))
        .route("/jobs/{id}/retry", post(retry_job_handler))
        .route("/bounties/{id}", get(bounty_handler))
        .route("/bounties/{id}/lock", post(lock_handler))
        .route("/bounties/{id}/refund", post(refund_handler))
        .route("/health", get(health_handler))
        .with_state(app_state)
}
