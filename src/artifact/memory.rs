//! In-process artifact store for tests and local runs.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::{ArtifactError, ArtifactStore, Result, StoredArtifact, check_integrity};
use crate::types::ContentHash;

#[derive(Debug, Clone, Default)]
pub struct MemoryArtifactStore {
    blobs: Arc<Mutex<HashMap<ContentHash, Vec<u8>>>>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct artifacts stored.
    pub fn len(&self) -> usize {
        self.blobs.lock().map(|b| b.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ArtifactStore for MemoryArtifactStore {
    async fn put(&self, bytes: Vec<u8>) -> Result<StoredArtifact> {
        let hash = ContentHash::of(&bytes);
        self.blobs
            .lock()
            .map_err(|_| ArtifactError::Task("artifact map poisoned".to_string()))?
            .entry(hash.clone())
            .or_insert(bytes);
        Ok(StoredArtifact {
            uri: format!("mem://{hash}"),
            hash,
        })
    }

    async fn get(&self, hash: &ContentHash) -> Result<Vec<u8>> {
        let bytes = self
            .blobs
            .lock()
            .map_err(|_| ArtifactError::Task("artifact map poisoned".to_string()))?
            .get(hash)
            .cloned()
            .ok_or_else(|| ArtifactError::NotFound(hash.clone()))?;
        check_integrity(hash, &bytes)?;
        Ok(bytes)
    }
}
