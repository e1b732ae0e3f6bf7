//! Filesystem-backed artifact store.
//!
//! Each artifact is a file named by its hash. Writes go to a uniquely named
//! temp file which is fsynced, renamed into place, and followed by an fsync of
//! the directory so the new entry survives a crash.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use super::{ArtifactError, ArtifactStore, Result, StoredArtifact, check_integrity};
use crate::types::ContentHash;

#[derive(Debug, Clone)]
pub struct FsArtifactStore {
    dir: PathBuf,
}

impl FsArtifactStore {
    /// Creates the store, creating `dir` if needed.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(FsArtifactStore { dir })
    }

    fn path_for(&self, hash: &ContentHash) -> PathBuf {
        self.dir.join(hash.as_str())
    }
}

impl ArtifactStore for FsArtifactStore {
    async fn put(&self, bytes: Vec<u8>) -> Result<StoredArtifact> {
        let hash = ContentHash::of(&bytes);
        let dir = self.dir.clone();
        let path = self.path_for(&hash);
        let uri = format!("file://{}", path.display());

        tokio::task::spawn_blocking(move || write_atomically(&dir, &path, &bytes))
            .await
            .map_err(|e| ArtifactError::Task(e.to_string()))??;

        debug!(hash = %hash, "Stored artifact");
        Ok(StoredArtifact { uri, hash })
    }

    async fn get(&self, hash: &ContentHash) -> Result<Vec<u8>> {
        let bytes = match tokio::fs::read(self.path_for(hash)).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(ArtifactError::NotFound(hash.clone()));
            }
            Err(e) => return Err(e.into()),
        };
        check_integrity(hash, &bytes)?;
        Ok(bytes)
    }
}

fn write_atomically(dir: &Path, path: &Path, bytes: &[u8]) -> io::Result<()> {
    // Same address means same bytes.
    if path.exists() {
        return Ok(());
    }

    let temp_path = path.with_extension(format!("{}.tmp", uuid::Uuid::new_v4().simple()));
    {
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&temp_path)?;
        file.write_all(bytes)?;
        fsync_file(&file)?;
    }
    std::fs::rename(&temp_path, path)?;
    fsync_dir(dir)
}

fn fsync_file(file: &File) -> io::Result<()> {
    file.sync_all()
}

fn fsync_dir(dir: &Path) -> io::Result<()> {
    OpenOptions::new().read(true).open(dir)?.sync_all()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn put_then_get() {
        let dir = tempdir().unwrap();
        let store = FsArtifactStore::open(dir.path().join("artifacts")).unwrap();

        let stored = store.put(b"proof bytes".to_vec()).await.unwrap();
        assert_eq!(stored.hash, ContentHash::of(b"proof bytes"));
        assert!(stored.uri.starts_with("file://"));
        assert_eq!(store.get(&stored.hash).await.unwrap(), b"proof bytes");
    }

    #[tokio::test]
    async fn put_is_idempotent_and_leaves_no_temp_files() {
        let dir = tempdir().unwrap();
        let store = FsArtifactStore::open(dir.path()).unwrap();

        let a = store.put(b"same".to_vec()).await.unwrap();
        let b = store.put(b"same".to_vec()).await.unwrap();
        assert_eq!(a, b);

        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn missing_artifact_is_not_found() {
        let dir = tempdir().unwrap();
        let store = FsArtifactStore::open(dir.path()).unwrap();
        let hash = ContentHash::of(b"never stored");
        assert!(matches!(
            store.get(&hash).await,
            Err(ArtifactError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn tampered_artifact_is_detected() {
        let dir = tempdir().unwrap();
        let store = FsArtifactStore::open(dir.path()).unwrap();
        let stored = store.put(b"original".to_vec()).await.unwrap();
        std::fs::write(store.path_for(&stored.hash), b"tampered").unwrap();

        assert!(matches!(
            store.get(&stored.hash).await,
            Err(ArtifactError::Corrupt { .. })
        ));
    }
}
