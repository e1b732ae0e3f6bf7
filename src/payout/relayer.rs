//! Chain adapter that talks to per-chain HTTP relayers.
//!
//! Each supported chain is served by a relayer that owns the signing keys and
//! exposes two endpoints:
//!
//! - `POST {base}/transfers` with a [`Transfer`] body, answering
//!   `{"tx_ref": "..."}`. The relayer deduplicates on `idempotency_key`.
//! - `GET {base}/transfers/{tx_ref}`, answering `{"status": "pending" |
//!   "confirmed" | "failed"}`.

use std::collections::HashMap;
use std::time::Duration;

use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use tracing::debug;

use super::chain::{ChainAdapter, ChainError, ConfirmStatus, Result, Transfer};
use crate::types::TxRef;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    tx_ref: String,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    status: ConfirmStatus,
}

/// Routes transfers to the relayer configured for their chain.
#[derive(Debug, Clone)]
pub struct HttpRelayerAdapter {
    client: Client,
    relayers: HashMap<String, String>,
}

impl HttpRelayerAdapter {
    /// `relayers` maps a chain name to its relayer base URL.
    pub fn new(relayers: HashMap<String, String>) -> std::result::Result<Self, ChainError> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ChainError::unavailable(format!("failed to build http client: {e}")))?;
        let relayers = relayers
            .into_iter()
            .map(|(chain, url)| (chain, url.trim_end_matches('/').to_string()))
            .collect();
        Ok(HttpRelayerAdapter { client, relayers })
    }

    pub fn supports(&self, chain: &str) -> bool {
        self.relayers.contains_key(chain)
    }

    fn base_url(&self, chain: &str) -> Result<&str> {
        self.relayers
            .get(chain)
            .map(String::as_str)
            .ok_or_else(|| ChainError::UnknownChain(chain.to_string()))
    }
}

fn request_error(err: reqwest::Error) -> ChainError {
    ChainError::unavailable(format!("relayer request failed: {err}"))
}

fn retry_after(response: &Response) -> Option<Duration> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// Maps a non-success relayer response onto a [`ChainError`].
async fn error_from_response(response: Response) -> ChainError {
    let status = response.status();
    let hint = retry_after(&response);
    let body = response.text().await.unwrap_or_default();
    let message = if body.is_empty() {
        status.to_string()
    } else {
        format!("{status}: {body}")
    };

    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        ChainError::Unavailable {
            message,
            retry_after: hint,
        }
    } else {
        ChainError::Rejected(message)
    }
}

impl ChainAdapter for HttpRelayerAdapter {
    async fn submit(&self, transfer: &Transfer) -> Result<TxRef> {
        let url = format!("{}/transfers", self.base_url(&transfer.chain)?);
        debug!(chain = %transfer.chain, key = %transfer.idempotency_key, "Submitting transfer");

        let response = self
            .client
            .post(url)
            .json(transfer)
            .send()
            .await
            .map_err(request_error)?;
        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }
        let body: SubmitResponse = response
            .json()
            .await
            .map_err(|e| ChainError::unavailable(format!("unreadable relayer response: {e}")))?;
        Ok(TxRef::new(body.tx_ref))
    }

    async fn confirm(&self, chain: &str, tx: &TxRef) -> Result<ConfirmStatus> {
        let url = format!("{}/transfers/{}", self.base_url(chain)?, tx.as_str());
        let response = self.client.get(url).send().await.map_err(request_error)?;
        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }
        let body: StatusResponse = response
            .json()
            .await
            .map_err(|e| ChainError::unavailable(format!("unreadable relayer response: {e}")))?;
        Ok(body.status)
    }
}
