//! Webhook endpoint handler.
//!
//! Accepts signed deliveries from any configured source and admits them
//! through the [`Gateway`](crate::webhooks::Gateway). Processing happens
//! asynchronously in the workers; this handler never calls upstream.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use chrono::Utc;
use tracing::debug;

use super::AppState;
use crate::types::DeliveryId;
use crate::webhooks::{Envelope, WebhookError};

/// Header names a source uses for the delivery id, signature and event type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SourceHeaders {
    delivery: &'static str,
    signature: &'static str,
    event: &'static str,
}

const GITHUB_HEADERS: SourceHeaders = SourceHeaders {
    delivery: "x-github-delivery",
    signature: "x-hub-signature-256",
    event: "x-github-event",
};

const GENERIC_HEADERS: SourceHeaders = SourceHeaders {
    delivery: "x-delivery-id",
    signature: "x-signature-256",
    event: "x-event-type",
};

fn headers_for(source: &str) -> SourceHeaders {
    match source {
        "github" => GITHUB_HEADERS,
        _ => GENERIC_HEADERS,
    }
}

/// `POST /events/{source}`.
///
/// - 200: admitted, or a repeat of an admitted delivery
/// - 400: missing delivery or event header, malformed JSON, or a payload
///   that does not fit its event type
/// - 401: missing or bad signature
/// - 404: unknown source
///
/// Nothing is written unless the answer is 200.
pub async fn events_handler(
    State(app_state): State<AppState>,
    Path(source): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, &'static str), WebhookError> {
    let gateway = app_state.gateway();
    if !gateway.knows_source(&source) {
        return Err(WebhookError::UnknownSource(source));
    }

    let names = headers_for(&source);
    let delivery_id = DeliveryId::new(get_header(&headers, names.delivery)?);
    let envelope = Envelope {
        source: &source,
        event_type: get_header(&headers, names.event)?,
        signature: get_header(&headers, names.signature)
            .map_err(|_| WebhookError::InvalidSignature)?,
        delivery_id,
        raw_payload: &body,
    };

    debug!(
        source = %source,
        delivery_id = %envelope.delivery_id,
        event_type = %envelope.event_type,
        "Received webhook"
    );

    let admission = gateway.admit(&envelope, Utc::now())?;
    if admission.is_duplicate() {
        Ok((StatusCode::OK, "Accepted (duplicate)"))
    } else {
        Ok((StatusCode::OK, "Accepted"))
    }
}

fn get_header(headers: &HeaderMap, name: &'static str) -> Result<String, WebhookError> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .ok_or(WebhookError::MissingHeader(name))
}
