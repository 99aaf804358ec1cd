//! Content-addressed object cache.
//!
//! A cache is keyed by the content hash of the decompressed, verified bytes
//! it stores — not by archive path — so two entries with identical content
//! never get fetched or stored twice. `ContentCache` covers the simple
//! get/put surface; `StreamingCache` is the write-as-you-go protocol the
//! batch prefetcher and facade use so a large object never has to sit fully
//! buffered in memory before it's cached.

pub mod disk;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;

/// Hash bytes are used as-is as the cache key; callers are expected to pass
/// a cryptographic digest (sha256 throughout this crate).
pub type ContentHash = Vec<u8>;

#[async_trait]
pub trait ContentCache: Send + Sync {
    async fn get(&self, hash: &[u8]) -> Result<Option<Bytes>>;

    /// Idempotent: storing the same hash twice is a no-op on the second call.
    async fn put(&self, hash: &[u8], content: Bytes) -> Result<()>;

    async fn contains(&self, hash: &[u8]) -> Result<bool> {
        Ok(self.get(hash).await?.is_some())
    }

    async fn delete(&self, _hash: &[u8]) -> Result<()> {
        Ok(())
    }
}

/// A write-as-you-go handle for one object. Exactly one of `commit` /
/// `discard` should be called to resolve the entry; dropping without either
/// behaves as `discard`. When the hash is already cached, writes are
/// silently absorbed and `commit` is a no-op, matching the no-duplicate-work
/// expectation of concurrent producers racing on the same hash.
#[async_trait]
pub trait CacheWriter: Send {
    async fn write(&mut self, chunk: &[u8]) -> Result<()>;
    async fn commit(self: Box<Self>) -> Result<()>;
    async fn discard(self: Box<Self>) -> Result<()>;
}

#[async_trait]
pub trait StreamingCache: ContentCache {
    async fn writer(&self, hash: &[u8]) -> Result<Box<dyn CacheWriter>>;
}

/// In-memory content cache, used for tests and for callers who don't need
/// entries to survive process restart. Bounded by total bytes only; eviction
/// is plain LRU-by-last-access.
pub mod memory {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use bytes::Bytes;

    use super::{CacheWriter, ContentCache};
    use crate::error::Result;

    struct Inner {
        map: ahash::AHashMap<Vec<u8>, Bytes>,
        lru: VecDeque<Vec<u8>>,
        max_bytes: usize,
        current_bytes: usize,
    }

    pub struct MemoryContentCache {
        inner: Mutex<Inner>,
    }

    impl MemoryContentCache {
        pub fn new(max_bytes: usize) -> Self {
            Self {
                inner: Mutex::new(Inner {
                    map: ahash::AHashMap::new(),
                    lru: VecDeque::new(),
                    max_bytes,
                    current_bytes: 0,
                }),
            }
        }
    }

    impl Inner {
        fn touch(&mut self, key: &[u8]) {
            if let Some(pos) = self.lru.iter().position(|k| k == key) {
                self.lru.remove(pos);
            }
            self.lru.push_front(key.to_vec());
        }

        fn evict_to_limit(&mut self) {
            while self.current_bytes > self.max_bytes {
                let Some(key) = self.lru.pop_back() else {
                    break;
                };
                if let Some(data) = self.map.remove(&key) {
                    self.current_bytes = self.current_bytes.saturating_sub(data.len());
                }
            }
        }
    }

    #[async_trait]
    impl ContentCache for MemoryContentCache {
        async fn get(&self, hash: &[u8]) -> Result<Option<Bytes>> {
            let mut inner = self.inner.lock().unwrap();
            let data = inner.map.get(hash).cloned();
            if data.is_some() {
                inner.touch(hash);
            }
            Ok(data)
        }

        async fn put(&self, hash: &[u8], content: Bytes) -> Result<()> {
            let mut inner = self.inner.lock().unwrap();
            if inner.map.contains_key(hash) {
                return Ok(());
            }
            if content.len() > inner.max_bytes {
                return Ok(());
            }
            inner.current_bytes += content.len();
            inner.map.insert(hash.to_vec(), content);
            inner.touch(hash);
            inner.evict_to_limit();
            Ok(())
        }

        async fn delete(&self, hash: &[u8]) -> Result<()> {
            let mut inner = self.inner.lock().unwrap();
            if let Some(data) = inner.map.remove(hash) {
                inner.current_bytes = inner.current_bytes.saturating_sub(data.len());
                if let Some(pos) = inner.lru.iter().position(|k| k.as_slice() == hash) {
                    inner.lru.remove(pos);
                }
            }
            Ok(())
        }
    }

    struct MemoryWriter {
        hash: Vec<u8>,
        buf: Vec<u8>,
        cache: std::sync::Arc<MemoryContentCache>,
        already_present: bool,
    }

    #[async_trait]
    impl CacheWriter for MemoryWriter {
        async fn write(&mut self, chunk: &[u8]) -> Result<()> {
            if !self.already_present {
                self.buf.extend_from_slice(chunk);
            }
            Ok(())
        }

        async fn commit(self: Box<Self>) -> Result<()> {
            if self.already_present {
                return Ok(());
            }
            self.cache.put(&self.hash, Bytes::from(self.buf)).await
        }

        async fn discard(self: Box<Self>) -> Result<()> {
            Ok(())
        }
    }

    impl MemoryContentCache {
        pub async fn writer_for(
            self: &std::sync::Arc<Self>,
            hash: &[u8],
        ) -> Result<Box<dyn CacheWriter>> {
            let already_present = self.contains(hash).await?;
            Ok(Box::new(MemoryWriter {
                hash: hash.to_vec(),
                buf: Vec::new(),
                cache: self.clone(),
                already_present,
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::memory::MemoryContentCache;
    use super::*;

    #[tokio::test]
    async fn put_then_get_roundtrips() {
        let cache = MemoryContentCache::new(1024);
        cache.put(b"h1", Bytes::from_static(b"hello")).await.unwrap();
        assert_eq!(cache.get(b"h1").await.unwrap().unwrap(), Bytes::from_static(b"hello"));
        assert!(cache.get(b"missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn put_is_idempotent_for_existing_hash() {
        let cache = MemoryContentCache::new(1024);
        cache.put(b"h1", Bytes::from_static(b"first")).await.unwrap();
        cache.put(b"h1", Bytes::from_static(b"second")).await.unwrap();
        assert_eq!(cache.get(b"h1").await.unwrap().unwrap(), Bytes::from_static(b"first"));
    }

    #[tokio::test]
    async fn eviction_drops_least_recently_used() {
        let cache = MemoryContentCache::new(10);
        cache.put(b"a", Bytes::from_static(b"12345")).await.unwrap();
        cache.put(b"b", Bytes::from_static(b"12345")).await.unwrap();
        // touch "a" so "b" becomes the least recently used
        let _ = cache.get(b"a").await.unwrap();
        cache.put(b"c", Bytes::from_static(b"12345")).await.unwrap();
        assert!(cache.get(b"b").await.unwrap().is_none());
        assert!(cache.get(b"a").await.unwrap().is_some());
        assert!(cache.get(b"c").await.unwrap().is_some());
    }
}
