//! Health check endpoint for liveness checks.

use axum::extract::State;
use axum::http::StatusCode;
use tracing::error;

use super::AppState;

/// Returns 200 OK while the store answers queries, 503 otherwise.
pub async fn health_handler(State(app_state): State<AppState>) -> (StatusCode, &'static str) {
    match app_state.store().ping() {
        Ok(()) => (StatusCode::OK, "OK"),
        Err(e) => {
            error!(error = %e, "Health check failed");
            (StatusCode::SERVICE_UNAVAILABLE, "store unavailable")
        }
    }
}
