//! Batch prefetcher: coalesce adjacent file fetches into single range reads
//! and fan them out into a worker pool.
//!
//! Workers consume batches from a bounded channel (the producer blocks once
//! workers are saturated, giving natural backpressure) and race against a
//! shared cancellation token: the first hard error (a failed range read)
//! flips the token and every other worker stops between batches. Per-entry
//! problems — a bad decompress, a failed cache write — are logged and
//! skipped; caching here is opportunistic, so one bad entry must not sink
//! the rest of the batch.

use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::content_cache::{CacheWriter, ContentCache, StreamingCache};
use crate::error::{Error, Result};
use crate::fileops::{self, FileOpsConfig};
use crate::index::Entry;
use crate::source::ByteSource;

#[derive(Clone, Debug)]
pub struct BatchConfig {
    /// Maximum aggregate compressed-byte size of one coalesced range read.
    pub max_batch_bytes: u64,
    /// `< 0` forces serial processing, `0` auto-selects (serial for a
    /// streaming cache, CPU-parallel for a buffered one), `> 0` forces that
    /// worker count.
    pub workers: i64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_bytes: 8 * 1024 * 1024,
            workers: 0,
        }
    }
}

pub struct BatchConfigBuilder {
    config: BatchConfig,
}

impl Default for BatchConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl BatchConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: BatchConfig::default(),
        }
    }

    pub fn max_batch_bytes(mut self, n: u64) -> Self {
        self.config.max_batch_bytes = n.max(1);
        self
    }

    pub fn workers(mut self, n: i64) -> Self {
        self.config.workers = n;
        self
    }

    pub fn build(self) -> BatchConfig {
        self.config
    }
}

/// Where decompressed, hash-verified entry bytes land. A capability probe:
/// if the cache implements `StreamingCache`, bytes stream straight into a
/// writer; otherwise they are buffered and handed to `put` in one call.
#[derive(Clone)]
pub enum Sink {
    Streaming(Arc<dyn StreamingCache>),
    Buffered(Arc<dyn ContentCache>),
}

impl Sink {
    pub async fn get(&self, hash: &[u8]) -> Result<Option<Bytes>> {
        match self {
            Sink::Streaming(cache) => cache.get(hash).await,
            Sink::Buffered(cache) => cache.get(hash).await,
        }
    }

    async fn accept(&self, hash: &[u8], content: Bytes) {
        let result = match self {
            Sink::Streaming(cache) => stream_into(cache.as_ref(), hash, &content).await,
            Sink::Buffered(cache) => cache.put(hash, content).await,
        };
        if let Err(e) = result {
            tracing::warn!(error = %e, "prefetch cache write failed (non-fatal)");
        }
    }
}

async fn stream_into(cache: &dyn StreamingCache, hash: &[u8], content: &[u8]) -> Result<()> {
    let mut writer = cache.writer(hash).await?;
    writer.write(content).await?;
    writer.commit().await
}

fn effective_workers(config: &BatchConfig, sink: &Sink) -> usize {
    if config.workers < 0 {
        return 1;
    }
    if config.workers > 0 {
        return config.workers as usize;
    }
    match sink {
        Sink::Streaming(_) => 1,
        Sink::Buffered(_) => std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
    }
}

struct Batch {
    start: u64,
    entries: Vec<Entry>,
}

fn group_batches(mut entries: Vec<Entry>, max_batch_bytes: u64) -> Vec<Batch> {
    entries.sort_by_key(|e| e.data_offset);

    let mut batches = Vec::new();
    let mut current: Option<Batch> = None;
    let mut current_end = 0u64;
    let mut current_bytes = 0u64;

    for entry in entries {
        let fits_adjacently = current
            .as_ref()
            .map(|_| entry.data_offset == current_end)
            .unwrap_or(false);
        let fits_budget = current_bytes + entry.data_size <= max_batch_bytes;

        if !fits_adjacently || !fits_budget {
            if let Some(batch) = current.take() {
                batches.push(batch);
            }
            current_bytes = 0;
        }

        if current.is_none() {
            current = Some(Batch {
                start: entry.data_offset,
                entries: Vec::new(),
            });
        }

        current_end = entry.data_offset + entry.data_size;
        current_bytes += entry.data_size;
        current.as_mut().unwrap().entries.push(entry);
    }

    if let Some(batch) = current {
        batches.push(batch);
    }

    batches
}

async fn process_batch(
    source: &dyn ByteSource,
    batch: &Batch,
    sink: &Sink,
    fileops_config: &FileOpsConfig,
) -> Result<()> {
    let batch_len: u64 = batch.entries.iter().map(|e| e.data_size).sum();
    let data = source.read_range(batch.start, batch_len).await?;

    for entry in &batch.entries {
        if let Err(e) = fileops::check_size_cap(entry, fileops_config) {
            tracing::warn!(path = %entry.path, error = %e, "prefetch skipped entry (size cap)");
            continue;
        }

        let rel_start = (entry.data_offset - batch.start) as usize;
        let rel_end = rel_start + entry.data_size as usize;
        if rel_end > data.len() {
            tracing::warn!(path = %entry.path, "prefetch batch short read, skipping entry");
            continue;
        }
        let compressed = &data[rel_start..rel_end];

        let decompressed = match fileops::decompress(entry, compressed, fileops_config) {
            Ok(d) => d,
            Err(e) => {
                tracing::warn!(path = %entry.path, error = %e, "prefetch decompress failed, skipping entry");
                continue;
            }
        };
        if decompressed.len() as u64 != entry.original_size {
            tracing::warn!(path = %entry.path, "prefetch decompressed size mismatch, skipping entry");
            continue;
        }
        if let Err(e) = fileops::verify_hash(entry, &decompressed) {
            tracing::warn!(path = %entry.path, error = %e, "prefetch hash mismatch, skipping entry");
            continue;
        }

        sink.accept(&entry.hash, Bytes::from(decompressed)).await;
    }

    Ok(())
}

/// Fetch and cache every entry in `entries`, coalescing adjacent ranges and
/// fanning out across `batch_config.workers` workers. Returns the first
/// hard (network) error encountered, if any; per-entry failures are logged,
/// not returned.
pub async fn prefetch(
    source: Arc<dyn ByteSource>,
    entries: Vec<Entry>,
    sink: Sink,
    fileops_config: FileOpsConfig,
    batch_config: BatchConfig,
) -> Result<()> {
    if entries.is_empty() {
        return Ok(());
    }

    let batches = group_batches(entries, batch_config.max_batch_bytes);
    let worker_count = effective_workers(&batch_config, &sink).max(1);

    let (tx, rx) = mpsc::channel::<Batch>(worker_count * 2);
    let rx = Arc::new(tokio::sync::Mutex::new(rx));
    let cancel = CancellationToken::new();
    let first_error: Arc<StdMutex<Option<Error>>> = Arc::new(StdMutex::new(None));

    let mut workers = Vec::new();
    for _ in 0..worker_count {
        let rx = rx.clone();
        let source = source.clone();
        let sink = sink.clone();
        let fileops_config = fileops_config.clone();
        let cancel = cancel.clone();
        let first_error = first_error.clone();

        workers.push(tokio::spawn(async move {
            loop {
                if cancel.is_cancelled() {
                    break;
                }
                let batch = {
                    let mut rx = rx.lock().await;
                    rx.recv().await
                };
                let Some(batch) = batch else {
                    break;
                };
                if cancel.is_cancelled() {
                    break;
                }
                if let Err(e) = process_batch(source.as_ref(), &batch, &sink, &fileops_config).await {
                    let mut slot = first_error.lock().unwrap();
                    if slot.is_none() {
                        *slot = Some(e);
                    }
                    cancel.cancel();
                    break;
                }
            }
        }));
    }

    for batch in batches {
        if cancel.is_cancelled() {
            break;
        }
        if tx.send(batch).await.is_err() {
            break;
        }
    }
    drop(tx);

    for w in workers {
        let _ = w.await;
    }

    match Arc::try_unwrap(first_error).map(|m| m.into_inner().unwrap()) {
        Ok(Some(e)) => Err(e),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content_cache::memory::MemoryContentCache;
    use crate::index::Compression;
    use crate::source::memory::MemorySource;
    use sha2::{Digest, Sha256};

    fn hash_of(data: &[u8]) -> Vec<u8> {
        Sha256::digest(data).to_vec()
    }

    fn entry(path: &str, offset: u64, content: &[u8]) -> Entry {
        Entry {
            path: path.to_string(),
            data_offset: offset,
            data_size: content.len() as u64,
            original_size: content.len() as u64,
            hash: hash_of(content),
            mode: 0,
            uid: 0,
            gid: 0,
            mod_time_ns: 0,
            compression: Compression::None,
        }
    }

    #[tokio::test]
    async fn prefetches_subset_into_buffered_cache() {
        let data = b"content acontent bcontent c".to_vec();
        // "content a" (9) + "content b" (9) + "content c" (9)
        let a = entry("a.txt", 0, b"content a");
        let b = entry("b.txt", 9, b"content b");
        let c = entry("c.txt", 18, b"content c");

        let source: Arc<dyn ByteSource> = Arc::new(MemorySource::new("test", data));
        let cache = Arc::new(MemoryContentCache::new(1024));

        prefetch(
            source,
            vec![a.clone(), b.clone()],
            Sink::Buffered(cache.clone()),
            FileOpsConfig::default(),
            BatchConfig::default(),
        )
        .await
        .unwrap();

        assert!(cache.get(&hash_of(b"content a")).await.unwrap().is_some());
        assert!(cache.get(&hash_of(b"content b")).await.unwrap().is_some());
        assert!(cache.get(&hash_of(b"content c")).await.unwrap().is_none());
        let _ = c;
    }

    #[tokio::test]
    async fn batches_split_on_gaps_and_budget() {
        let entries = vec![
            entry("a", 0, b"aaaa"),
            entry("b", 4, b"bbbb"),
            entry("c", 100, b"cccc"),
        ];
        let batches = group_batches(entries, 1024);
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].entries.len(), 2);
        assert_eq!(batches[1].entries.len(), 1);
    }
}
