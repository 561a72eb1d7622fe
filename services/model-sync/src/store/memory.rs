//! In-process object store for tests, with switches to
//! inject listing, download and mid-stream failures.

use super::{ObjectInfo, ObjectReader, ObjectStore, StoreError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, ReadBuf};

#[derive(Debug, Clone)]
struct StoredObject {
    data: Vec<u8>,
    etag: String,
    last_modified: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Inner {
    buckets: HashMap<String, BTreeMap<String, StoredObject>>,
    failing_keys: HashSet<String>,
    broken_streams: HashSet<String>,
    list_fails: bool,
    omit_hashes: bool,
    opened: usize,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self { Self::default() }

    pub fn create_bucket(&self, bucket: &str) {
        self.inner.lock().buckets.entry(bucket.to_string()).or_default();
    }

    /// Insert or overwrite an object; returns its ETag.
    pub fn put(&self, bucket: &str, key: &str, data: Vec<u8>) -> String {
        let mut h = DefaultHasher::new();
        data.hash(&mut h);
        let etag = format!("{:016x}", h.finish());
        let obj = StoredObject { data, etag: etag.clone(), last_modified: Utc::now() };
        self.inner.lock().buckets.entry(bucket.to_string()).or_default().insert(key.to_string(), obj);
        etag
    }

    pub fn delete(&self, bucket: &str, key: &str) -> bool {
        self.inner.lock().buckets.get_mut(bucket).map_or(false, |b| b.remove(key).is_some())
    }

    pub fn fail_downloads(&self, key: &str, fail: bool) {
        let mut g = self.inner.lock();
        if fail { g.failing_keys.insert(key.to_string()); } else { g.failing_keys.remove(key); }
    }

    /// Serve half of the body, then an I/O error.
    pub fn break_stream(&self, key: &str, broken: bool) {
        let mut g = self.inner.lock();
        if broken { g.broken_streams.insert(key.to_string()); } else { g.broken_streams.remove(key); }
    }

    pub fn fail_listing(&self, fail: bool) { self.inner.lock().list_fails = fail; }

    /// List without ETags, forcing callers onto `object_hash`.
    pub fn omit_listing_hashes(&self, omit: bool) { self.inner.lock().omit_hashes = omit; }

    /// Number of successful `open_object` calls so far.
    pub fn download_count(&self) -> usize { self.inner.lock().opened }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectInfo>, StoreError> {
        let g = self.inner.lock();
        if g.list_fails { return Err(StoreError::Transport("listing disabled".into())); }
        let objects = g.buckets.get(bucket).ok_or_else(|| StoreError::Bucket { bucket: bucket.into(), reason: "no such bucket".into() })?;
        Ok(objects
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, o)| ObjectInfo {
                key: k.clone(),
                size: o.data.len() as u64,
                last_modified: Some(o.last_modified),
                hash: (!g.omit_hashes).then(|| format!("\"{}\"", o.etag)),
            })
            .collect())
    }

    async fn open_object(&self, bucket: &str, key: &str) -> Result<ObjectReader, StoreError> {
        let mut g = self.inner.lock();
        if g.failing_keys.contains(key) { return Err(StoreError::Transport(format!("injected failure for {key}"))); }
        let broken = g.broken_streams.contains(key);
        let data = g
            .buckets
            .get(bucket)
            .and_then(|b| b.get(key))
            .map(|o| o.data.clone())
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        g.opened += 1;
        if broken {
            return Ok(Box::pin(BrokenReader { data, served: false }));
        }
        Ok(Box::pin(io::Cursor::new(data)))
    }

    async fn object_hash(&self, bucket: &str, key: &str) -> Result<Option<String>, StoreError> {
        let g = self.inner.lock();
        g.buckets
            .get(bucket)
            .and_then(|b| b.get(key))
            .map(|o| Some(format!("\"{}\"", o.etag)))
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    async fn check_bucket(&self, bucket: &str) -> Result<(), StoreError> {
        let g = self.inner.lock();
        if g.list_fails || !g.buckets.contains_key(bucket) {
            return Err(StoreError::Bucket { bucket: bucket.into(), reason: "unreachable".into() });
        }
        Ok(())
    }
}

struct BrokenReader {
    data: Vec<u8>,
    served: bool,
}

impl AsyncRead for BrokenReader {
    fn poll_read(mut self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        if self.served {
            return Poll::Ready(Err(io::Error::new(io::ErrorKind::ConnectionReset, "stream interrupted")));
        }
        let half = (self.data.len() / 2).min(buf.remaining());
        buf.put_slice(&self.data[..half]);
        self.served = true;
        Poll::Ready(Ok(()))
    }
}
