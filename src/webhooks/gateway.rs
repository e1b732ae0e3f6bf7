//! Ingestion gateway: the synchronous admit boundary.
//!
//! A delivery is admitted by verifying its signature and the shape of its
//! payload, then inserting its event
//! and first `classify` job in one transaction keyed by
//! `source:delivery_id`. Nothing here calls out to the network; all slow work
//! happens in workers.

use std::collections::HashMap;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::{ParseError, parse_event, verify_signature};
use crate::bus::Wakeup;
use crate::store::{Admission, Store, StoreError};
use crate::types::{DedupeKey, DeliveryId, JobKind, NewEvent};

/// Errors that can occur when admitting a delivery.
#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("unknown event source: {0}")]
    UnknownSource(String),

    #[error("missing required header: {0}")]
    MissingHeader(&'static str),

    #[error("invalid signature")]
    InvalidSignature,

    #[error("invalid JSON body: {0}")]
    InvalidJson(#[from] serde_json::Error),

    /// Well-formed JSON that does not have the shape of its event type.
    #[error("malformed payload: {0}")]
    BadPayload(#[from] ParseError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        let status = match &self {
            WebhookError::UnknownSource(_) => StatusCode::NOT_FOUND,
            WebhookError::MissingHeader(_)
            | WebhookError::InvalidJson(_)
            | WebhookError::BadPayload(_) => StatusCode::BAD_REQUEST,
            WebhookError::InvalidSignature => StatusCode::UNAUTHORIZED,
            WebhookError::Store(_) => {
                return (StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response();
            }
        };
        (status, self.to_string()).into_response()
    }
}

/// An inbound delivery as received.
#[derive(Debug, Clone)]
pub struct Envelope<'a> {
    pub source: &'a str,
    pub delivery_id: DeliveryId,
    pub event_type: String,
    pub signature: String,
    pub raw_payload: &'a [u8],
}

/// Verifies and admits deliveries.
#[derive(Debug, Clone)]
pub struct Gateway {
    store: Store,
    secrets: HashMap<String, Vec<u8>>,
    wakeup: Wakeup,
}

impl Gateway {
    pub fn new(store: Store, secrets: HashMap<String, Vec<u8>>, wakeup: Wakeup) -> Self {
        Gateway {
            store,
            secrets,
            wakeup,
        }
    }

    /// Whether deliveries from `source` are accepted at all.
    pub fn knows_source(&self, source: &str) -> bool {
        self.secrets.contains_key(source)
    }

    /// Admits one delivery. A repeated delivery reports
    /// [`Admission::Duplicate`] and changes nothing. Payloads of known event
    /// types must parse before anything is written.
    pub fn admit(
        &self,
        envelope: &Envelope<'_>,
        now: DateTime<Utc>,
    ) -> Result<Admission, WebhookError> {
        let secret = self
            .secrets
            .get(envelope.source)
            .ok_or_else(|| WebhookError::UnknownSource(envelope.source.to_string()))?;

        if !verify_signature(envelope.raw_payload, &envelope.signature, secret) {
            warn!(
                source = envelope.source,
                delivery_id = %envelope.delivery_id,
                "Invalid webhook signature"
            );
            return Err(WebhookError::InvalidSignature);
        }

        let payload: serde_json::Value = serde_json::from_slice(envelope.raw_payload)?;
        parse_event(&envelope.event_type, &payload)?;
        let event = NewEvent {
            source: envelope.source.to_string(),
            event_type: envelope.event_type.clone(),
            dedupe_key: DedupeKey::for_delivery(envelope.source, &envelope.delivery_id),
            payload,
        };

        let admission = self.store.admit_event(&event, JobKind::Classify, None, now)?;
        match admission {
            Admission::Admitted { event_id, job_id } => {
                info!(
                    source = envelope.source,
                    delivery_id = %envelope.delivery_id,
                    event_type = %envelope.event_type,
                    event_id = %event_id,
                    job_id = %job_id,
                    "Webhook admitted"
                );
                self.wakeup.notify();
            }
            Admission::Duplicate { event_id } => {
                debug!(
                    delivery_id = %envelope.delivery_id,
                    event_id = %event_id,
                    "Duplicate delivery (idempotent)"
                );
            }
        }
        Ok(admission)
    }
}
