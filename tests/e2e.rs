//! End-to-end scenarios driven entirely through the public API: a cache hit
//! surviving source corruption, prefetch warming exactly the requested
//! files, block-cache reuse across distinct archive entries, singleflight
//! dedup under concurrency, and HTTP conditional-read retry.
//!
//! Archive creation is out of scope for this crate, so `build_archive` below
//! hand-encodes the same binary index envelope `Index::parse` reads — just
//! enough to build fixtures, not a general writer.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use sha2::{Digest, Sha256};

use kosha::block_cache::{BlockCache, BlockCacheConfigBuilder};
use kosha::content_cache::memory::MemoryContentCache;
use kosha::error::Result;
use kosha::facade::{Facade, FacadeConfig};
use kosha::index::{Index, CURRENT_VERSION, MAGIC};
use kosha::prefetch::Sink;
use kosha::source::http::{HttpSource, HttpSourceConfig};
use kosha::source::memory::MemorySource;
use kosha::source::ByteSource;

struct FileSpec {
    path: &'static str,
    content: &'static [u8],
}

fn hash_of(data: &[u8]) -> Vec<u8> {
    Sha256::digest(data).to_vec()
}

fn build_archive(files: &[FileSpec]) -> (Vec<u8>, Vec<u8>) {
    struct Encoded {
        path: String,
        data_offset: u64,
        data_size: u64,
        hash: Vec<u8>,
    }

    let mut sorted: Vec<&FileSpec> = files.iter().collect();
    sorted.sort_by_key(|f| f.path);

    let mut data = Vec::new();
    let mut encoded = Vec::new();
    for f in &sorted {
        let offset = data.len() as u64;
        data.extend_from_slice(f.content);
        encoded.push(Encoded {
            path: f.path.to_string(),
            data_offset: offset,
            data_size: f.content.len() as u64,
            hash: hash_of(f.content),
        });
    }

    let mut header = Vec::new();
    header.extend_from_slice(&MAGIC.to_be_bytes());
    header.extend_from_slice(&CURRENT_VERSION.to_be_bytes());
    header.push(1); // sha256
    header.push(0); // no data hash
    header.push(1); // has data size
    header.extend_from_slice(&(data.len() as u64).to_be_bytes());
    header.extend_from_slice(&(encoded.len() as u32).to_be_bytes());

    let offset_table_start = header.len();
    let offset_table_len = encoded.len() * 8;
    let mut entries_bytes = Vec::new();
    let mut offsets = Vec::with_capacity(encoded.len());

    for e in &encoded {
        offsets.push((offset_table_start + offset_table_len + entries_bytes.len()) as u64);
        let path_bytes = e.path.as_bytes();
        entries_bytes.extend_from_slice(&(path_bytes.len() as u32).to_be_bytes());
        entries_bytes.extend_from_slice(path_bytes);
        entries_bytes.extend_from_slice(&e.data_offset.to_be_bytes());
        entries_bytes.extend_from_slice(&e.data_size.to_be_bytes());
        entries_bytes.extend_from_slice(&e.data_size.to_be_bytes()); // original_size, no compression
        entries_bytes.extend_from_slice(&e.hash);
        entries_bytes.extend_from_slice(&0u32.to_be_bytes()); // mode
        entries_bytes.extend_from_slice(&0u32.to_be_bytes()); // uid
        entries_bytes.extend_from_slice(&0u32.to_be_bytes()); // gid
        entries_bytes.extend_from_slice(&0i64.to_be_bytes()); // mod_time_ns
        entries_bytes.push(0); // compression: none
    }

    let mut index_bytes = header;
    for o in offsets {
        index_bytes.extend_from_slice(&o.to_be_bytes());
    }
    index_bytes.extend_from_slice(&entries_bytes);

    (index_bytes, data)
}

/// A byte source whose backing bytes can be mutated after construction, for
/// simulating a data blob going bad underneath an already-warm cache.
struct CorruptibleSource {
    data: Mutex<Vec<u8>>,
    id: String,
}

impl CorruptibleSource {
    fn new(id: impl Into<String>, data: Vec<u8>) -> Arc<Self> {
        Arc::new(Self {
            data: Mutex::new(data),
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

#[async_trait]
impl ByteSource for CorruptibleSource {
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

    fn supports_read_range(&self) -> bool {
        true
    }

    async fn read_range(&self, offset: u64, length: u64) -> Result<Bytes> {
        let data = self.data.lock().unwrap();
        let offset = offset as usize;
        if offset >= data.len() {
            return Ok(Bytes::new());
        }
        let end = (offset + length as usize).min(data.len());
        Ok(Bytes::copy_from_slice(&data[offset..end]))
    }
}

// S1: a cached read must keep serving the original bytes even after the
// underlying data blob is corrupted.
#[tokio::test]
async fn s1_cached_read_survives_source_corruption() {
    let files = [FileSpec {
        path: "doc.txt",
        content: b"hello world",
    }];
    let (index_bytes, data) = build_archive(&files);
    let index = Index::parse(Arc::from(index_bytes)).unwrap();

    let source = CorruptibleSource::new("s1", data);
    let cache = Sink::Buffered(Arc::new(MemoryContentCache::new(1024 * 1024)));
    let facade = Facade::new(index, source.clone(), cache, FacadeConfig::default());

    let first = facade.read_file("doc.txt").await.unwrap();
    assert_eq!(&first[..], b"hello world");

    source.corrupt_first_byte();

    let second = facade.read_file("doc.txt").await.unwrap();
    assert_eq!(second, first, "cached read must survive source corruption");
}

// S2: prefetching a subset of files must warm exactly those files; anything
// else still has to hit the source on first read.
#[tokio::test]
async fn s2_prefetch_subset_warms_only_requested_files() {
    let files = [
        FileSpec {
            path: "a.txt",
            content: b"content a",
        },
        FileSpec {
            path: "b.txt",
            content: b"content b",
        },
        FileSpec {
            path: "c.txt",
            content: b"content c",
        },
    ];
    let (index_bytes, data) = build_archive(&files);
    let index = Index::parse(Arc::from(index_bytes)).unwrap();

    let source = Arc::new(MemorySource::new("s2", data));
    let cache = Sink::Buffered(Arc::new(MemoryContentCache::new(1024 * 1024)));
    let facade = Facade::new(index, source.clone(), cache, FacadeConfig::default());

    facade.prefetch(&["a.txt", "b.txt"]).await.unwrap();
    let reads_after_prefetch = source.read_at_calls();

    let a = facade.read_file("a.txt").await.unwrap();
    assert_eq!(&a[..], b"content a");
    assert_eq!(
        source.read_at_calls(),
        reads_after_prefetch,
        "a.txt was prefetched, reading it must not touch the source again"
    );

    let c = facade.read_file("c.txt").await.unwrap();
    assert_eq!(&c[..], b"content c");
    assert!(
        source.read_at_calls() > reads_after_prefetch,
        "c.txt was never prefetched, reading it must hit the source"
    );
}

// S3: PrefetchDir must warm every file under the prefix and nothing outside it.
#[tokio::test]
async fn s3_prefetch_dir_warms_every_file_under_prefix() {
    let files = [
        FileSpec {
            path: "assets/a.txt",
            content: b"asset a",
        },
        FileSpec {
            path: "assets/nested/b.txt",
            content: b"asset b",
        },
        FileSpec {
            path: "other/c.txt",
            content: b"other c",
        },
    ];
    let (index_bytes, data) = build_archive(&files);
    let index = Index::parse(Arc::from(index_bytes)).unwrap();

    let source = Arc::new(MemorySource::new("s3", data));
    let cache = Sink::Buffered(Arc::new(MemoryContentCache::new(1024 * 1024)));
    let facade = Facade::new(index, source.clone(), cache, FacadeConfig::default());

    facade.prefetch_dir("assets").await.unwrap();
    let reads_after_prefetch = source.read_at_calls();

    let _ = facade.read_file("assets/a.txt").await.unwrap();
    let _ = facade.read_file("assets/nested/b.txt").await.unwrap();
    assert_eq!(
        source.read_at_calls(),
        reads_after_prefetch,
        "every file under the prefetched prefix must be served from cache"
    );

    let _ = facade.read_file("other/c.txt").await.unwrap();
    assert!(
        source.read_at_calls() > reads_after_prefetch,
        "a file outside the prefetched prefix must still hit the source"
    );
}

// S4: two distinct archive entries that share a block must only trigger one
// underlying read of that block, even though they land in different content
// cache entries (different hashes).
#[tokio::test]
async fn s4_block_cache_reuses_one_block_across_distinct_files() {
    let files = [
        FileSpec {
            path: "x.txt",
            content: b"xxxxx",
        },
        FileSpec {
            path: "y.txt",
            content: b"yyyyy",
        },
    ];
    let (index_bytes, data) = build_archive(&files);
    let index = Index::parse(Arc::from(index_bytes)).unwrap();

    let inner = Arc::new(MemorySource::new("s4", data));
    let block_cache = BlockCache::wrap_memory(
        inner.clone(),
        BlockCacheConfigBuilder::new().block_size(64).build(),
    );
    let cache = Sink::Buffered(Arc::new(MemoryContentCache::new(1024 * 1024)));
    let facade = Facade::new(index, block_cache, cache, FacadeConfig::default());

    let x = facade.read_file("x.txt").await.unwrap();
    let y = facade.read_file("y.txt").await.unwrap();
    assert_eq!(&x[..], b"xxxxx");
    assert_eq!(&y[..], b"yyyyy");

    assert_eq!(
        inner.read_at_calls(),
        1,
        "both files live in the same cached block: one underlying read total"
    );
}

// S5: 10 concurrent reads of the same file must dedupe to at most one
// underlying fetch (the in-flight read, plus at most one straggler that
// started before the first singleflight entry was registered).
#[tokio::test]
async fn s5_concurrent_reads_of_one_file_share_a_single_fetch() {
    let files = [FileSpec {
        path: "shared.txt",
        content: b"singleflight payload",
    }];
    let (index_bytes, data) = build_archive(&files);
    let index = Index::parse(Arc::from(index_bytes)).unwrap();

    let source = Arc::new(MemorySource::new("s5", data));
    let cache = Sink::Buffered(Arc::new(MemoryContentCache::new(1024 * 1024)));
    let facade = Facade::new(index, source.clone(), cache, FacadeConfig::default());

    let mut handles = Vec::new();
    for _ in 0..10 {
        let facade = facade.clone();
        handles.push(tokio::spawn(
            async move { facade.read_file("shared.txt").await.unwrap() },
        ));
    }
    for h in handles {
        assert_eq!(&h.await.unwrap()[..], b"singleflight payload");
    }

    assert!(
        source.read_at_calls() <= 2,
        "10 concurrent reads of the same file must dedupe to at most one fetch, got {} source reads",
        source.read_at_calls()
    );
}

// S6: a range read with conditional headers that gets a 412 must retry once
// without them, rather than surfacing the precondition failure.
#[tokio::test]
async fn s6_conditional_range_read_retries_once_on_412() {
    use wiremock::matchers::{header, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    let server = MockServer::start().await;

    Mock::given(method("HEAD"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-length", "11")
                .insert_header("etag", "\"abc\""),
        )
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(header("range", "bytes=0-0"))
        .respond_with(
            ResponseTemplate::new(206)
                .insert_header("content-range", "bytes 0-0/11")
                .set_body_bytes(b"h".to_vec()),
        )
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(header("range", "bytes=6-10"))
        .and(header("if-match", "\"abc\""))
        .respond_with(ResponseTemplate::new(412))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(header("range", "bytes=6-10"))
        .respond_with(ResponseTemplate::new(206).set_body_bytes(b"world".to_vec()))
        .mount(&server)
        .await;

    let url = format!("{}/f", server.uri());
    let source = HttpSource::connect(url, HttpSourceConfig::default())
        .await
        .unwrap();

    let mut buf = [0u8; 5];
    let n = source.read_at(&mut buf, 6).await.unwrap();
    assert_eq!(n, 5);
    assert_eq!(&buf, b"world");
}
