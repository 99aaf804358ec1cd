//! Block cache: fixed-size block caching layered over any [`ByteSource`].
//!
//! The in-memory store is a direct generalization of `RangeCache`: a hash
//! map plus an LRU deque, evicted by entry count and total bytes. Here the
//! key is a block-id hash instead of a `(url, start, end)` tuple, and dedup
//! of concurrent fetches for the same block is delegated to
//! [`crate::singleflight`].

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use bytes::Bytes;
use sha2::{Digest, Sha256};

use crate::diskstore::DiskBlobStore;
use crate::error::Result;
use crate::singleflight::Group;
use crate::source::ByteSource;

pub type BlockKey = [u8; 32];

pub fn block_key(source_id: &str, block_size: u64, block_index: u64) -> BlockKey {
    let mut hasher = Sha256::new();
    hasher.update(source_id.as_bytes());
    hasher.update(block_size.to_be_bytes());
    hasher.update(block_index.to_be_bytes());
    hasher.finalize().into()
}

#[derive(Clone, Debug)]
pub struct BlockCacheConfig {
    pub block_size: u64,
    /// A read spanning more than this many blocks bypasses the cache
    /// entirely and is served directly from the underlying source.
    pub max_blocks_per_read: usize,
    pub max_entries: usize,
    pub max_bytes: usize,
    /// Hex-prefix shard length, only used by the disk-backed store.
    pub shard_prefix_len: usize,
}

impl Default for BlockCacheConfig {
    fn default() -> Self {
        Self {
            block_size: 1024 * 1024,
            max_blocks_per_read: 4,
            max_entries: 4096,
            max_bytes: 256 * 1024 * 1024,
            shard_prefix_len: 2,
        }
    }
}

pub struct BlockCacheConfigBuilder {
    config: BlockCacheConfig,
}

impl Default for BlockCacheConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockCacheConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: BlockCacheConfig::default(),
        }
    }

    pub fn block_size(mut self, size: u64) -> Self {
        self.config.block_size = size.max(1);
        self
    }

    pub fn max_blocks_per_read(mut self, n: usize) -> Self {
        self.config.max_blocks_per_read = n.max(1);
        self
    }

    pub fn max_entries(mut self, n: usize) -> Self {
        self.config.max_entries = n;
        self
    }

    pub fn max_bytes(mut self, n: usize) -> Self {
        self.config.max_bytes = n;
        self
    }

    pub fn shard_prefix_len(mut self, n: usize) -> Self {
        self.config.shard_prefix_len = n;
        self
    }

    pub fn build(self) -> BlockCacheConfig {
        self.config
    }
}

struct MemoryEntry {
    data: Bytes,
}

/// Adapted from `RangeCache`: map + LRU deque, evicted by entry count and
/// byte budget.
struct MemoryStore {
    map: ahash::AHashMap<BlockKey, MemoryEntry>,
    lru: VecDeque<BlockKey>,
    max_entries: usize,
    max_bytes: usize,
    current_bytes: usize,
}

impl MemoryStore {
    fn new(max_entries: usize, max_bytes: usize) -> Self {
        Self {
            map: ahash::AHashMap::new(),
            lru: VecDeque::new(),
            max_entries,
            max_bytes,
            current_bytes: 0,
        }
    }

    fn get(&mut self, key: &BlockKey) -> Option<Bytes> {
        let data = self.map.get(key)?.data.clone();
        self.touch(key);
        Some(data)
    }

    fn remove(&mut self, key: &BlockKey) {
        if let Some(entry) = self.map.remove(key) {
            self.current_bytes = self.current_bytes.saturating_sub(entry.data.len());
            self.remove_lru(key);
        }
    }

    fn insert(&mut self, key: BlockKey, data: Bytes) {
        if self.max_entries == 0 || self.max_bytes == 0 {
            return;
        }
        if data.len() > self.max_bytes {
            return;
        }
        self.remove(&key);
        self.current_bytes += data.len();
        self.map.insert(key, MemoryEntry { data });
        self.lru.push_front(key);
        self.evict_to_limits();
    }

    fn touch(&mut self, key: &BlockKey) {
        self.remove_lru(key);
        self.lru.push_front(*key);
    }

    fn remove_lru(&mut self, key: &BlockKey) {
        if let Some(pos) = self.lru.iter().position(|k| k == key) {
            self.lru.remove(pos);
        }
    }

    fn evict_to_limits(&mut self) {
        while self.map.len() > self.max_entries || self.current_bytes > self.max_bytes {
            let Some(key) = self.lru.pop_back() else {
                break;
            };
            if let Some(entry) = self.map.remove(&key) {
                self.current_bytes = self.current_bytes.saturating_sub(entry.data.len());
            }
        }
    }
}

enum Store {
    Memory(StdMutex<MemoryStore>),
    Disk(Arc<DiskBlobStore>),
}

impl Store {
    async fn get(&self, key: &BlockKey) -> Option<Bytes> {
        match self {
            Store::Memory(m) => m.lock().unwrap().get(key),
            Store::Disk(d) => d.get(key).await.ok().flatten().map(Bytes::from),
        }
    }

    async fn put(&self, key: BlockKey, data: Bytes) {
        match self {
            Store::Memory(m) => m.lock().unwrap().insert(key, data),
            Store::Disk(d) => {
                if let Err(e) = d.put(&key, &data).await {
                    tracing::warn!(error = %e, "block cache disk write failed (non-fatal)");
                }
            }
        }
    }

    async fn remove(&self, key: &BlockKey) {
        match self {
            Store::Memory(m) => m.lock().unwrap().remove(key),
            Store::Disk(d) => {
                let _ = d.delete(key).await;
            }
        }
    }
}

/// Wraps a [`ByteSource`] with block-level caching. Itself implements
/// `ByteSource`, so it composes transparently wherever a source is expected
/// (file operations, the batch prefetcher).
pub struct BlockCache<S: ByteSource> {
    inner: Arc<S>,
    config: BlockCacheConfig,
    store: Store,
    inflight: Group<BlockKey, Bytes>,
}

impl<S: ByteSource + 'static> BlockCache<S> {
    pub fn wrap_memory(inner: Arc<S>, config: BlockCacheConfig) -> Arc<Self> {
        let store = Store::Memory(StdMutex::new(MemoryStore::new(
            config.max_entries,
            config.max_bytes,
        )));
        Arc::new(Self {
            inner,
            config,
            store,
            inflight: Group::new(),
        })
    }

    pub fn wrap_disk(inner: Arc<S>, config: BlockCacheConfig, disk: Arc<DiskBlobStore>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            config,
            store: Store::Disk(disk),
            inflight: Group::new(),
        })
    }

    fn block_span(&self, offset: u64, len: u64) -> (u64, u64) {
        let start_block = offset / self.config.block_size;
        let last_byte = offset + len.saturating_sub(1);
        let end_block = last_byte / self.config.block_size;
        (start_block, end_block)
    }

    async fn expected_block_len(&self, block_index: u64) -> Result<u64> {
        let block_start = block_index * self.config.block_size;
        match self.inner.size().await? {
            Some(size) if block_start < size => {
                Ok((size - block_start).min(self.config.block_size))
            }
            Some(_) => Ok(0),
            None => Ok(self.config.block_size),
        }
    }

    async fn fetch_block(&self, block_index: u64) -> Result<Bytes> {
        let key = block_key(self.inner.source_id(), self.config.block_size, block_index);

        if let Some(data) = self.store.get(&key).await {
            let expected = self.expected_block_len(block_index).await?;
            if data.len() as u64 == expected {
                return Ok(data);
            }
            tracing::warn!(block_index, "corrupt block cache entry, refetching");
            self.store.remove(&key).await;
        }

        let inner = self.inner.clone();
        let block_size = self.config.block_size;
        let data = self
            .inflight
            .work(key, move || async move {
                let start = block_index * block_size;
                inner.read_range(start, block_size).await
            })
            .await?;

        self.store.put(key, data.clone()).await;
        Ok(data)
    }
}

#[async_trait]
impl<S: ByteSource + 'static> ByteSource for BlockCache<S> {
    async fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        let (start_block, end_block) = self.block_span(offset, buf.len() as u64);
        let span = (end_block - start_block + 1) as usize;

        if span > self.config.max_blocks_per_read {
            return self.inner.read_at(buf, offset).await;
        }

        let mut total = 0usize;
        for block_index in start_block..=end_block {
            let block = self.fetch_block(block_index).await?;
            let block_start = block_index * self.config.block_size;

            let read_start = offset.max(block_start);
            let read_end_in_buf = offset + buf.len() as u64;
            let block_end = block_start + block.len() as u64;
            let read_end = read_end_in_buf.min(block_end);

            if read_start >= read_end {
                continue;
            }

            let src_off = (read_start - block_start) as usize;
            let dst_off = (read_start - offset) as usize;
            let n = (read_end - read_start) as usize;

            buf[dst_off..dst_off + n].copy_from_slice(&block[src_off..src_off + n]);
            total += n;

            if block_end < read_end_in_buf && block.len() < self.config.block_size as usize {
                // underlying source ended inside this block
                break;
            }
        }

        Ok(total)
    }

    async fn size(&self) -> Result<Option<u64>> {
        self.inner.size().await
    }

    fn source_id(&self) -> &str {
        self.inner.source_id()
    }

    fn supports_read_range(&self) -> bool {
        true
    }
}
