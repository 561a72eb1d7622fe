//! Object store access.
//!
//! [`ObjectStore`] is the transport seam (S3/MinIO in production, an
//! in-process map in tests). [`ObjectStoreClient`] wraps a backend with the
//! fail-soft contract the orchestrator relies on: listing errors become an
//! empty listing, download errors become `false`, hash lookups become `None`,
//! all logged here and never propagated.

use crate::metrics::SyncMetrics;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::AsyncRead;
use tracing::{debug, error, info, warn};

#[cfg(any(test, feature = "test-util"))]
pub mod memory;
pub mod s3;

#[cfg(any(test, feature = "test-util"))]
pub use memory::MemoryStore;
pub use s3::S3Store;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("object store request failed: {0}")]
    Transport(String),
    #[error("object `{0}` not found")]
    NotFound(String),
    #[error("bucket `{bucket}` not accessible: {reason}")]
    Bucket { bucket: String, reason: String },
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub key: String,
    pub size: u64,
    pub last_modified: Option<DateTime<Utc>>,
    /// Content fingerprint (ETag without quotes) when the listing carries one.
    pub hash: Option<String>,
}

pub type ObjectReader = Pin<Box<dyn AsyncRead + Send>>;

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Every object under `prefix`, across all result pages.
    async fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectInfo>, StoreError>;
    async fn open_object(&self, bucket: &str, key: &str) -> Result<ObjectReader, StoreError>;
    async fn object_hash(&self, bucket: &str, key: &str) -> Result<Option<String>, StoreError>;
    async fn check_bucket(&self, bucket: &str) -> Result<(), StoreError>;
}

pub fn normalize_etag(etag: &str) -> String { etag.trim().trim_matches('"').to_string() }

#[derive(Clone)]
pub struct ObjectStoreClient {
    backend: Arc<dyn ObjectStore>,
    metrics: Arc<SyncMetrics>,
}

impl ObjectStoreClient {
    pub fn new(backend: Arc<dyn ObjectStore>, metrics: Arc<SyncMetrics>) -> Self { Self { backend, metrics } }

    pub async fn list(&self, bucket: &str, prefix: &str) -> Vec<ObjectInfo> {
        match self.backend.list_objects(bucket, prefix).await {
            Ok(objects) => {
                debug!(bucket, prefix, objects = objects.len(), "bucket_listed");
                objects
            }
            Err(e) => {
                error!(bucket, prefix, error=%e, "bucket_list_failed");
                Vec::new()
            }
        }
    }

    /// Stream `key` into `local_path` via a hidden sibling temp file that is
    /// renamed into place only after the body is fully written and fsynced.
    pub async fn download(&self, bucket: &str, key: &str, local_path: &Path) -> bool {
        match self.try_download(bucket, key, local_path).await {
            Ok(bytes) => {
                self.metrics.downloads_total.inc();
                self.metrics.download_bytes_total.inc_by(bytes);
                info!(key, path=%local_path.display(), bytes, "artifact_downloaded");
                true
            }
            Err(e) => {
                self.metrics.download_failures_total.inc();
                error!(key, path=%local_path.display(), error=%e, "artifact_download_failed");
                false
            }
        }
    }

    pub async fn head_hash(&self, bucket: &str, key: &str) -> Option<String> {
        match self.backend.object_hash(bucket, key).await {
            Ok(hash) => hash.map(|h| normalize_etag(&h)),
            Err(e) => {
                warn!(key, error=%e, "object_hash_failed");
                None
            }
        }
    }

    /// Strict reachability probe for startup; unlike the rest it returns the error.
    pub async fn check_bucket(&self, bucket: &str) -> Result<(), StoreError> { self.backend.check_bucket(bucket).await }

    async fn try_download(&self, bucket: &str, key: &str, local_path: &Path) -> Result<u64, StoreError> {
        let parent = local_path
            .parent()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "download target has no parent directory"))?;
        tokio::fs::create_dir_all(parent).await?;
        let partial = partial_path(local_path);
        let result = async {
            let mut reader = self.backend.open_object(bucket, key).await?;
            let mut file = tokio::fs::File::create(&partial).await?;
            let bytes = tokio::io::copy(&mut reader, &mut file).await?;
            file.sync_all().await?;
            drop(file);
            tokio::fs::rename(&partial, local_path).await?;
            Ok::<u64, StoreError>(bytes)
        }
        .await;
        if result.is_err() {
            if let Err(e) = tokio::fs::remove_file(&partial).await {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!(path=%partial.display(), error=%e, "partial_cleanup_failed");
                }
            }
        }
        result
    }
}

/// `dir/.name.partial` next to the final artifact.
pub(crate) fn partial_path(local_path: &Path) -> PathBuf {
    let name = local_path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
    local_path.with_file_name(format!(".{name}.partial"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(store: Arc<MemoryStore>) -> (ObjectStoreClient, Arc<SyncMetrics>) {
        let metrics = Arc::new(SyncMetrics::new().unwrap());
        (ObjectStoreClient::new(store, metrics.clone()), metrics)
    }

    #[test]
    fn etag_quotes_are_stripped() {
        assert_eq!(normalize_etag("\"abc123\""), "abc123");
        assert_eq!(normalize_etag("abc"), "abc");
    }

    #[tokio::test]
    async fn list_failure_is_soft() {
        let store = Arc::new(MemoryStore::new());
        store.put("models", "a/1/w.bin", b"x".to_vec());
        store.fail_listing(true);
        let (c, _) = client(store);
        assert!(c.list("models", "").await.is_empty());
    }

    #[tokio::test]
    async fn download_creates_dirs_and_writes_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        store.put("models", "a/1/w.bin", b"weights".to_vec());
        let (c, metrics) = client(store);
        let target = dir.path().join("a/1/w.bin");
        assert!(c.download("models", "a/1/w.bin", &target).await);
        assert_eq!(std::fs::read(&target).unwrap(), b"weights");
        assert!(!partial_path(&target).exists());
        assert_eq!(metrics.downloads_total.get(), 1);
        assert_eq!(metrics.download_bytes_total.get(), 7);
    }

    #[tokio::test]
    async fn missing_key_returns_false() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        store.create_bucket("models");
        let (c, metrics) = client(store);
        assert!(!c.download("models", "nope/1/x", &dir.path().join("x")).await);
        assert_eq!(metrics.download_failures_total.get(), 1);
    }

    #[tokio::test]
    async fn interrupted_stream_never_exposes_partial_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        store.put("models", "a/1/w.bin", vec![7u8; 4096]);
        store.break_stream("a/1/w.bin", true);
        let (c, _) = client(store.clone());
        let target = dir.path().join("a/1/w.bin");
        std::fs::create_dir_all(target.parent().unwrap()).unwrap();
        std::fs::write(&target, b"previous").unwrap();

        assert!(!c.download("models", "a/1/w.bin", &target).await);
        assert_eq!(std::fs::read(&target).unwrap(), b"previous");
        assert!(!partial_path(&target).exists());

        store.break_stream("a/1/w.bin", false);
        assert!(c.download("models", "a/1/w.bin", &target).await);
        assert_eq!(std::fs::read(&target).unwrap().len(), 4096);
    }

    #[tokio::test]
    async fn head_hash_is_normalized_and_soft() {
        let store = Arc::new(MemoryStore::new());
        let etag = store.put("models", "a/1/w.bin", b"abc".to_vec());
        let (c, _) = client(store);
        assert_eq!(c.head_hash("models", "a/1/w.bin").await, Some(etag));
        assert_eq!(c.head_hash("models", "a/1/missing").await, None);
    }
}
