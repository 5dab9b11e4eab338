//! Local filesystem session backend.
//!
//! One JSON file per key. File names are the hex SHA-256 of the namespaced
//! key, so client-influenced keys never turn into paths. Writes land in a
//! temporary file first and are renamed into place.

use crate::error::StoreError;
use crate::session::{BackendKind, SessionBackend};
use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

const ENTRY_EXTENSION: &str = "json";

#[derive(Debug, Serialize, Deserialize)]
struct Entry {
    /// Unix timestamp (seconds) after which the entry is gone.
    expires_at: i64,
    value: String,
}

impl Entry {
    fn is_expired(&self, now: i64) -> bool {
        now >= self.expires_at
    }
}

/// Filesystem-backed session storage.
#[derive(Debug, Clone)]
pub struct FilesystemBackend {
    dir: PathBuf,
}

impl FilesystemBackend {
    /// Open (creating if needed) the storage directory.
    ///
    /// # Errors
    ///
    /// Returns the I/O error if the directory cannot be created.
    pub async fn open(dir: impl AsRef<Path>) -> io::Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    /// Storage directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let digest = Sha256::digest(key.as_bytes());
        self.dir
            .join(format!("{}.{ENTRY_EXTENSION}", hex::encode(digest)))
    }

    async fn read_entry(path: &Path) -> Result<Option<Entry>, StoreError> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes).ok()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn remove_file(path: &Path) -> Result<(), StoreError> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

#[async_trait]
impl SessionBackend for FilesystemBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Filesystem
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let path = self.path_for(key);
        let Some(entry) = Self::read_entry(&path).await? else {
            return Ok(None);
        };
        if entry.is_expired(Utc::now().timestamp()) {
            Self::remove_file(&path).await?;
            return Ok(None);
        }
        Ok(Some(entry.value))
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let ttl_secs = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);
        let entry = Entry {
            expires_at: Utc::now().timestamp().saturating_add(ttl_secs),
            value: value.to_string(),
        };
        let bytes = serde_json::to_vec(&entry)?;

        let path = self.path_for(key);
        let suffix: u64 = rand::rng().random();
        let tmp = path.with_extension(format!("tmp-{suffix:016x}"));
        tokio::fs::write(&tmp, &bytes).await?;
        if let Err(err) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(err.into());
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        Self::remove_file(&self.path_for(key)).await
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let meta = tokio::fs::metadata(&self.dir).await?;
        if meta.is_dir() {
            Ok(())
        } else {
            Err(io::Error::other("session path is not a directory").into())
        }
    }

    /// Delete every expired or unreadable entry.
    async fn purge_expired(&self) -> Result<usize, StoreError> {
        let now = Utc::now().timestamp();
        let mut removed = 0;
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(dirent) = entries.next_entry().await? {
            let path = dirent.path();
            if path.extension().and_then(|e| e.to_str()) != Some(ENTRY_EXTENSION) {
                continue;
            }
            let stale = Self::read_entry(&path)
                .await?
                .is_none_or(|entry| entry.is_expired(now));
            if stale {
                Self::remove_file(&path).await?;
                removed += 1;
            }
        }
        debug!(removed, "Purged expired filesystem sessions");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_set_get_delete() {
        let dir = TempDir::new().unwrap();
        let backend = FilesystemBackend::open(dir.path()).await.unwrap();

        backend.set("chatgate:a", "1", Duration::from_secs(60)).await.unwrap();
        assert_eq!(backend.get("chatgate:a").await.unwrap().as_deref(), Some("1"));

        backend.set("chatgate:a", "2", Duration::from_secs(60)).await.unwrap();
        assert_eq!(backend.get("chatgate:a").await.unwrap().as_deref(), Some("2"));

        backend.delete("chatgate:a").await.unwrap();
        assert_eq!(backend.get("chatgate:a").await.unwrap(), None);
        backend.delete("chatgate:a").await.unwrap();
    }

    #[tokio::test]
    async fn test_expired_entries_read_as_absent() {
        let dir = TempDir::new().unwrap();
        let backend = FilesystemBackend::open(dir.path()).await.unwrap();

        backend.set("k", "v", Duration::ZERO).await.unwrap();
        assert_eq!(backend.get("k").await.unwrap(), None);
        assert!(!backend.path_for("k").exists());
    }

    #[tokio::test]
    async fn test_keys_never_become_paths() {
        let dir = TempDir::new().unwrap();
        let backend = FilesystemBackend::open(dir.path()).await.unwrap();

        backend
            .set("../../escape", "v", Duration::from_secs(60))
            .await
            .unwrap();
        let path = backend.path_for("../../escape");
        assert_eq!(path.parent(), Some(dir.path()));
        assert_eq!(backend.get("../../escape").await.unwrap().as_deref(), Some("v"));
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let dir = TempDir::new().unwrap();
        let backend = FilesystemBackend::open(dir.path()).await.unwrap();

        backend.set("old", "v", Duration::ZERO).await.unwrap();
        backend.set("fresh", "v", Duration::from_secs(60)).await.unwrap();
        tokio::fs::write(dir.path().join("garbage.json"), b"{not json")
            .await
            .unwrap();

        assert_eq!(backend.purge_expired().await.unwrap(), 2);
        assert_eq!(backend.get("fresh").await.unwrap().as_deref(), Some("v"));
    }

    #[tokio::test]
    async fn test_ping_fails_when_directory_disappears() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sessions");
        let backend = FilesystemBackend::open(&path).await.unwrap();
        assert!(backend.ping().await.is_ok());

        tokio::fs::remove_dir_all(&path).await.unwrap();
        assert!(backend.ping().await.is_err());
    }
}
