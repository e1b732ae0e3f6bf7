//! Deterministic, signed proof artifacts.
//!
//! A proof is the canonical JSON encoding of the facts a payout relies on.
//! Keys are emitted in lexicographic order with no whitespace, and nothing
//! time-dependent is included, so the same facts always produce the same
//! bytes, hash and signature.

use serde::Serialize;
use thiserror::Error;

use crate::artifact::ArtifactError;
use crate::types::{BountyId, ContentHash, Submission};
use crate::webhooks::compute_signature;

#[derive(Debug, Error)]
pub enum ProofError {
    #[error("could not encode proof: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("invalid proof signing key")]
    Key,

    #[error("could not store proof: {0}")]
    Artifact(#[from] ArtifactError),

    /// The artifact store addressed the bytes differently than we hashed them.
    #[error("artifact store returned hash {actual}, expected {expected}")]
    HashMismatch {
        expected: ContentHash,
        actual: ContentHash,
    },
}

/// Facts attested by a proof. Field order is the canonical key order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProofDocument {
    pub bounty_id: BountyId,
    pub merge_commit_sha: String,
    pub pr_number: u64,
    pub repo: String,
}

impl ProofDocument {
    pub fn for_submission(submission: &Submission) -> Self {
        ProofDocument {
            bounty_id: submission.bounty_id.clone(),
            merge_commit_sha: submission.merge_commit_sha.as_str().to_string(),
            pr_number: submission.pr_number.0,
            repo: submission.repo_full_name.to_ascii_lowercase(),
        }
    }

    /// Canonical bytes of the document.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>, ProofError> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// A proof ready to be stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedProof {
    pub bytes: Vec<u8>,
    pub content_hash: ContentHash,
    /// Hex HMAC-SHA256 of `bytes`.
    pub signature: String,
}

pub fn sign(document: &ProofDocument, key: &[u8]) -> Result<SignedProof, ProofError> {
    let bytes = document.canonical_bytes()?;
    let signature = compute_signature(&bytes, key).map_err(|_| ProofError::Key)?;
    Ok(SignedProof {
        content_hash: ContentHash::of(&bytes),
        signature: hex::encode(signature),
        bytes,
    })
}

/// Checks that `bytes` were signed with `key`.
pub fn verify(bytes: &[u8], signature_hex: &str, key: &[u8]) -> bool {
    crate::webhooks::verify_signature(bytes, &format!("sha256={signature_hex}"), key)
}
