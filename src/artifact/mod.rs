//! Content-addressed storage for proof artifacts.
//!
//! Artifacts are addressed by the SHA-256 of their bytes, so writing the same
//! bytes twice is a no-op that returns the same address.

use std::future::Future;

use thiserror::Error;

use crate::types::ContentHash;

mod fs;
mod memory;

pub use fs::FsArtifactStore;
pub use memory::MemoryArtifactStore;

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("artifact I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("artifact {0} not found")]
    NotFound(ContentHash),

    /// Stored bytes no longer hash to their address.
    #[error("artifact {expected} is corrupt (hashes to {actual})")]
    Corrupt {
        expected: ContentHash,
        actual: ContentHash,
    },

    #[error("artifact task failed: {0}")]
    Task(String),
}

pub type Result<T> = std::result::Result<T, ArtifactError>;

/// Address of a stored artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredArtifact {
    pub uri: String,
    pub hash: ContentHash,
}

/// A content-addressed blob store.
pub trait ArtifactStore: Send + Sync + 'static {
    /// Stores `bytes` and returns their address. Idempotent.
    fn put(&self, bytes: Vec<u8>) -> impl Future<Output = Result<StoredArtifact>> + Send;

    /// Reads the bytes stored under `hash`, checking they still match it.
    fn get(&self, hash: &ContentHash) -> impl Future<Output = Result<Vec<u8>>> + Send;
}

fn check_integrity(expected: &ContentHash, bytes: &[u8]) -> Result<()> {
    let actual = ContentHash::of(bytes);
    if &actual == expected {
        Ok(())
    } else {
        Err(ArtifactError::Corrupt {
            expected: expected.clone(),
            actual,
        })
    }
}
