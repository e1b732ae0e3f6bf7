//! The interface the payout worker needs from a settlement chain.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{Amount, BountyId, PayoutId, TxRef};

/// Finality of a submitted transaction as reported by the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfirmStatus {
    Pending,
    Confirmed,
    Failed,
}

/// A reward transfer to submit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Transfer {
    /// Derived from the payout id. Submitting the same key twice must return
    /// the first transaction instead of sending funds again.
    pub idempotency_key: String,
    pub chain: String,
    pub recipient: String,
    pub amount: Amount,
    pub currency: String,
    pub bounty_id: BountyId,
}

impl Transfer {
    pub fn idempotency_key_for(payout: PayoutId) -> String {
        format!("payout-{payout}")
    }
}

#[derive(Debug, Error)]
pub enum ChainError {
    /// No adapter is configured for the bounty's chain.
    #[error("no relayer configured for chain {0}")]
    UnknownChain(String),

    /// Node or relayer unavailable, rate limited, or timed out.
    #[error("chain temporarily unavailable: {message}")]
    Unavailable {
        message: String,
        retry_after: Option<Duration>,
    },

    /// The chain refused the transfer outright.
    #[error("transfer rejected: {0}")]
    Rejected(String),
}

impl ChainError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        ChainError::Unavailable {
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, ChainError::Unavailable { .. })
    }
}

pub type Result<T> = std::result::Result<T, ChainError>;

/// Chain RPC collaborator.
pub trait ChainAdapter: Send + Sync + 'static {
    fn submit(&self, transfer: &Transfer) -> impl Future<Output = Result<TxRef>> + Send;

    fn confirm(&self, chain: &str, tx: &TxRef)
    -> impl Future<Output = Result<ConfirmStatus>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn confirm_status_uses_lowercase_wire_names() {
        let parsed: ConfirmStatus = serde_json::from_str("\"confirmed\"").unwrap();
        assert_eq!(parsed, ConfirmStatus::Confirmed);
        assert_eq!(
            serde_json::to_string(&ConfirmStatus::Pending).unwrap(),
            "\"pending\""
        );
    }

    #[test]
    fn idempotency_key_is_stable_per_payout() {
        assert_eq!(Transfer::idempotency_key_for(PayoutId(7)), "payout-7");
    }

    #[test]
    fn only_unavailability_is_transient() {
        assert!(ChainError::unavailable("503").is_transient());
        assert!(!ChainError::Rejected("bad address".into()).is_transient());
        assert!(!ChainError::UnknownChain("eth".into()).is_transient());
    }
}
