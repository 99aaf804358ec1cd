//! Disk-backed content cache: a thin `ContentCache`/`StreamingCache`
//! adapter over [`crate::diskstore::DiskBlobStore`], keyed directly by
//! content hash bytes.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use super::{CacheWriter, ContentCache, StreamingCache};
use crate::diskstore::DiskBlobStore;
use crate::error::Result;

pub struct DiskContentCache {
    store: Arc<DiskBlobStore>,
}

impl DiskContentCache {
    pub fn new(store: Arc<DiskBlobStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ContentCache for DiskContentCache {
    async fn get(&self, hash: &[u8]) -> Result<Option<Bytes>> {
        Ok(self.store.get(hash).await?.map(Bytes::from))
    }

    async fn put(&self, hash: &[u8], content: Bytes) -> Result<()> {
        self.store.put(hash, &content).await
    }

    async fn contains(&self, hash: &[u8]) -> Result<bool> {
        Ok(self.store.contains(hash).await)
    }

    async fn delete(&self, hash: &[u8]) -> Result<()> {
        self.store.delete(hash).await
    }
}

struct DiskCacheWriter {
    inner: Option<crate::diskstore::BlobWriter>,
}

#[async_trait]
impl CacheWriter for DiskCacheWriter {
    async fn write(&mut self, chunk: &[u8]) -> Result<()> {
        self.inner
            .as_mut()
            .expect("writer used after commit/discard")
            .write(chunk)
            .await
    }

    async fn commit(mut self: Box<Self>) -> Result<()> {
        self.inner.take().expect("writer used after commit/discard").commit().await
    }

    async fn discard(mut self: Box<Self>) -> Result<()> {
        self.inner.take().expect("writer used after commit/discard").discard().await
    }
}

#[async_trait]
impl StreamingCache for DiskContentCache {
    async fn writer(&self, hash: &[u8]) -> Result<Box<dyn CacheWriter>> {
        let writer = self.store.writer(hash).await?;
        Ok(Box::new(DiskCacheWriter { inner: Some(writer) }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_then_get_roundtrips() {
        let tmp = tempfile::tempdir().unwrap();
        let store = DiskBlobStore::open(tmp.path(), 2, None).await.unwrap();
        let cache = DiskContentCache::new(store);

        cache.put(b"deadbeef", Bytes::from_static(b"payload")).await.unwrap();
        assert_eq!(cache.get(b"deadbeef").await.unwrap().unwrap(), Bytes::from_static(b"payload"));
        assert!(cache.contains(b"deadbeef").await.unwrap());
    }

    #[tokio::test]
    async fn streaming_writer_commits_chunks() {
        let tmp = tempfile::tempdir().unwrap();
        let store = DiskBlobStore::open(tmp.path(), 2, None).await.unwrap();
        let cache = DiskContentCache::new(store);

        let mut writer = cache.writer(b"abc123").await.unwrap();
        writer.write(b"hello ").await.unwrap();
        writer.write(b"world").await.unwrap();
        writer.commit().await.unwrap();

        assert_eq!(cache.get(b"abc123").await.unwrap().unwrap(), Bytes::from_static(b"hello world"));
    }

    #[tokio::test]
    async fn discarded_writer_leaves_no_entry() {
        let tmp = tempfile::tempdir().unwrap();
        let store = DiskBlobStore::open(tmp.path(), 2, None).await.unwrap();
        let cache = DiskContentCache::new(store);

        let mut writer = cache.writer(b"xyz").await.unwrap();
        writer.write(b"partial").await.unwrap();
        writer.discard().await.unwrap();

        assert!(cache.get(b"xyz").await.unwrap().is_none());
    }
}
