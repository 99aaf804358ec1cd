//! The reader facade: composes the archive index, a byte source, and a
//! content cache into the file-system contract (open, stat, read-file,
//! read-directory), with singleflight dedup on concurrent reads of the same
//! content.

use std::sync::Arc;

use bytes::Bytes;

use crate::content_cache::{CacheWriter, ContentCache, StreamingCache};
use crate::error::{Error, Result};
use crate::fileops::{self, FileHandle, FileInfo, FileOpsConfig};
use crate::index::Index;
use crate::prefetch::{self, BatchConfig, Sink};
use crate::singleflight::Group;

#[derive(Clone, Debug, Default)]
pub struct FacadeConfig {
    pub fileops: FileOpsConfig,
    pub batch: BatchConfig,
}

pub struct FacadeConfigBuilder {
    config: FacadeConfig,
}

impl Default for FacadeConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl FacadeConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: FacadeConfig::default(),
        }
    }

    pub fn fileops(mut self, config: FileOpsConfig) -> Self {
        self.config.fileops = config;
        self
    }

    pub fn batch(mut self, config: BatchConfig) -> Self {
        self.config.batch = config;
        self
    }

    pub fn build(self) -> FacadeConfig {
        self.config
    }
}

pub enum Opened {
    File(FileHandle),
    Dir(Vec<FileInfo>),
}

/// Composes an [`Index`], a byte source, and a content cache. Cheap to
/// clone (everything inside is already `Arc`-shared); typically held behind
/// one `Arc<Facade>` per opened archive.
pub struct Facade {
    index: Index,
    source: Arc<dyn crate::source::ByteSource>,
    cache: Sink,
    inflight: Group<Vec<u8>, Bytes>,
    config: FacadeConfig,
}

impl Facade {
    pub fn new(
        index: Index,
        source: Arc<dyn crate::source::ByteSource>,
        cache: Sink,
        config: FacadeConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            index,
            source,
            cache,
            inflight: Group::new(),
            config,
        })
    }

    pub fn index(&self) -> &Index {
        &self.index
    }

    async fn resolve(&self, path: &str) -> Result<Bytes> {
        let entry = self
            .index
            .lookup(path)
            .ok_or_else(|| Error::NotExist(path.to_string()))?;

        if let Some(hit) = self.cache.get(&entry.hash).await? {
            return Ok(hit);
        }

        let hash = entry.hash.clone();
        let source = self.source.clone();
        let cache = self.cache.clone();
        let fileops_config = self.config.fileops.clone();

        self.inflight
            .work(hash.clone(), move || async move {
                if let Some(hit) = cache.get(&hash).await? {
                    return Ok(hit);
                }
                let data = fileops::read_all(source.as_ref(), &entry, &fileops_config).await?;
                cache.accept_best_effort(&hash, data.clone()).await;
                Ok(data)
            })
            .await
    }

    /// Reject invalid paths; resolve a file entry (cache hit or miss) or a
    /// synthesized directory.
    pub async fn open(&self, path: &str) -> Result<Opened> {
        fileops::validate_path(path).or_else(|e| {
            if path == "." {
                Ok(())
            } else {
                Err(e)
            }
        })?;

        if let Some(entry) = self.index.lookup(path) {
            let data = self.resolve(path).await?;
            return Ok(Opened::File(FileHandle::new(&entry, data)));
        }

        if fileops::is_directory(&self.index, path) {
            let listing = fileops::list_dir(&self.index, path)?;
            return Ok(Opened::Dir(listing));
        }

        Err(Error::NotExist(path.to_string()))
    }

    pub async fn read_file(&self, path: &str) -> Result<Bytes> {
        fileops::validate_path(path)?;
        self.resolve(path).await
    }

    pub async fn read_dir(&self, path: &str) -> Result<Vec<FileInfo>> {
        if path != "." && !path.is_empty() {
            fileops::validate_path(path)?;
        }
        fileops::list_dir(&self.index, path)
    }

    pub async fn prefetch(&self, paths: &[&str]) -> Result<()> {
        let mut entries = Vec::with_capacity(paths.len());
        for path in paths {
            fileops::validate_path(path)?;
            let entry = self
                .index
                .lookup(path)
                .ok_or_else(|| Error::NotExist(path.to_string()))?;
            entries.push(entry);
        }
        prefetch::prefetch(
            self.source.clone(),
            entries,
            self.cache.clone(),
            self.config.fileops.clone(),
            self.config.batch.clone(),
        )
        .await
    }

    pub async fn prefetch_dir(&self, prefix: &str) -> Result<()> {
        let base = if prefix.is_empty() || prefix == "." {
            String::new()
        } else {
            format!("{}/", prefix.trim_end_matches('/'))
        };
        let entries: Vec<_> = self.index.entries_with_prefix(&base).collect();
        prefetch::prefetch(
            self.source.clone(),
            entries,
            self.cache.clone(),
            self.config.fileops.clone(),
            self.config.batch.clone(),
        )
        .await
    }
}

impl Sink {
    async fn accept_best_effort(&self, hash: &[u8], data: Bytes) {
        let result = match self {
            Sink::Streaming(cache) => {
                let write = async {
                    let mut writer = cache.writer(hash).await?;
                    writer.write(&data).await?;
                    writer.commit().await
                };
                write.await
            }
            Sink::Buffered(cache) => cache.put(hash, data).await,
        };
        if let Err(e) = result {
            tracing::warn!(error = %e, "facade cache write failed (non-fatal)");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content_cache::memory::MemoryContentCache;
    use crate::index::testutil::{encode, EntrySpec};
    use crate::index::Compression;
    use crate::source::memory::MemorySource;
    use sha2::{Digest, Sha256};
    use std::sync::{Arc as StdArc, Mutex as StdSyncMutex};

    fn hash_of(data: &[u8]) -> Vec<u8> {
        Sha256::digest(data).to_vec()
    }

    fn encode_files(files: &[(&str, &[u8])]) -> (Vec<u8>, Vec<u8>) {
        let mut data = Vec::new();
        let mut specs = Vec::new();
        for (path, content) in files {
            let offset = data.len() as u64;
            data.extend_from_slice(content);
            specs.push(EntrySpec {
                path: path.to_string(),
                data_offset: offset,
                data_size: content.len() as u64,
                original_size: content.len() as u64,
                hash: hash_of(content),
                compression: Compression::None,
            });
        }
        (encode(&specs, Some(data.len() as u64), None), data)
    }

    fn build(files: &[(&str, &[u8])]) -> StdArc<Facade> {
        let (index_bytes, data) = encode_files(files);
        let index = Index::parse(Arc::from(index_bytes)).unwrap();
        let source: Arc<dyn crate::source::ByteSource> =
            StdArc::new(MemorySource::new("test", data));
        let cache = Sink::Buffered(StdArc::new(MemoryContentCache::new(1024 * 1024)));
        Facade::new(index, source, cache, FacadeConfig::default())
    }

    fn build_with_memory_source(files: &[(&str, &[u8])]) -> (StdArc<Facade>, StdArc<MemorySource>) {
        let (index_bytes, data) = encode_files(files);
        let index = Index::parse(Arc::from(index_bytes)).unwrap();
        let source = StdArc::new(MemorySource::new("test", data));
        let cache = Sink::Buffered(StdArc::new(MemoryContentCache::new(1024 * 1024)));
        let facade = Facade::new(index, source.clone(), cache, FacadeConfig::default());
        (facade, source)
    }

    /// A byte source whose backing bytes can be mutated after construction,
    /// so a test can corrupt it out from under an already-warm cache.
    struct CorruptibleSource {
        data: StdSyncMutex<Vec<u8>>,
        id: String,
    }

    impl CorruptibleSource {
        fn new(id: impl Into<String>, data: Vec<u8>) -> StdArc<Self> {
            StdArc::new(Self {
                data: StdSyncMutex::new(data),
                id: id.into(),
            })
        }

        fn corrupt_first_byte(&self) {
            let mut data = self.data.lock().unwrap();
            if let Some(b) = data.first_mut() {
                *b ^= 0xFF;
            }
        }
    }

    #[async_trait::async_trait]
    impl crate::source::ByteSource for CorruptibleSource {
        async fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
            let data = self.data.lock().unwrap();
            let offset = offset as usize;
            if offset >= data.len() {
                return Ok(0);
            }
            let available = &data[offset..];
            let n = available.len().min(buf.len());
            buf[..n].copy_from_slice(&available[..n]);
            Ok(n)
        }

        async fn size(&self) -> Result<Option<u64>> {
            Ok(Some(self.data.lock().unwrap().len() as u64))
        }

        fn source_id(&self) -> &str {
            &self.id
        }
    }

    #[tokio::test]
    async fn read_file_then_cache_survives_source_corruption() {
        let (index_bytes, data) = encode_files(&[("test.txt", b"cached content")]);
        let index = Index::parse(Arc::from(index_bytes)).unwrap();
        let source = CorruptibleSource::new("corruptible", data);
        let cache = Sink::Buffered(StdArc::new(MemoryContentCache::new(1024 * 1024)));
        let facade = Facade::new(index, source.clone(), cache, FacadeConfig::default());

        let first = facade.read_file("test.txt").await.unwrap();
        assert_eq!(&first[..], b"cached content");

        source.corrupt_first_byte();

        let second = facade.read_file("test.txt").await.unwrap();
        assert_eq!(second, first, "cached read must survive source corruption");
    }

    #[tokio::test]
    async fn read_dir_lists_top_level() {
        let facade = build(&[("root.txt", b"root"), ("dir/a.txt", b"a")]);
        let listing = facade.read_dir(".").await.unwrap();
        let names: Vec<_> = listing.iter().map(|f| f.name.clone()).collect();
        assert_eq!(names, vec!["dir", "root.txt"]);
    }

    #[tokio::test]
    async fn open_rejects_invalid_path() {
        let facade = build(&[("a.txt", b"a")]);
        let err = facade.open("../escape").await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::PathInvalid);
    }

    #[tokio::test]
    async fn prefetch_dir_warms_cache_for_every_file_under_prefix() {
        let facade = build(&[
            ("assets/a.txt", b"asset a"),
            ("assets/nested/b.txt", b"asset b"),
            ("other/c.txt", b"not prefetched"),
        ]);
        facade.prefetch_dir("assets").await.unwrap();

        let a_entry = facade.index().lookup("assets/a.txt").unwrap();
        let b_entry = facade.index().lookup("assets/nested/b.txt").unwrap();
        assert!(facade.cache.get(&a_entry.hash).await.unwrap().is_some());
        assert!(facade.cache.get(&b_entry.hash).await.unwrap().is_some());

        let c_entry = facade.index().lookup("other/c.txt").unwrap();
        assert!(facade.cache.get(&c_entry.hash).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn concurrent_read_file_shares_one_fetch() {
        let (facade, source) = build_with_memory_source(&[("test.txt", b"singleflight test content")]);
        let mut handles = Vec::new();
        for _ in 0..10 {
            let facade = facade.clone();
            handles.push(tokio::spawn(async move { facade.read_file("test.txt").await.unwrap() }));
        }
        for h in handles {
            assert_eq!(&h.await.unwrap()[..], b"singleflight test content");
        }
        assert!(
            source.read_at_calls() <= 2,
            "10 concurrent reads of the same file must dedupe to at most one fetch, got {} source reads",
            source.read_at_calls()
        );
    }
}
