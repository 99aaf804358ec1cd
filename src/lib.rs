//! # kosha
//!
//! kosha (कोश - "store" / "repository" in Sanskrit) is a read-only
//! file-system over an archive stored as an index blob and a data blob in
//! an OCI-compatible registry. Individual files are extracted without
//! downloading the whole archive: reads resolve against a random-access
//! byte source, typically HTTP range requests.
//!
//! ## Basic usage
//!
//! ```no_run
//! use kosha::facade::{Facade, FacadeConfig};
//! use kosha::index::Index;
//! use kosha::prefetch::Sink;
//! use kosha::content_cache::memory::MemoryContentCache;
//! use kosha::source::http;
//! use std::sync::Arc;
//!
//! # async fn run() -> kosha::error::Result<()> {
//! let index_bytes: Arc<[u8]> = Arc::from(Vec::new());
//! let index = Index::parse(index_bytes)?;
//! let source = http::connect("https://example.com/data.bin", Default::default()).await?;
//! let cache = Sink::Buffered(Arc::new(MemoryContentCache::new(64 * 1024 * 1024)));
//! let facade = Facade::new(index, source, cache, FacadeConfig::default());
//!
//! let bytes = facade.read_file("some/file.txt").await?;
//! # let _ = bytes;
//! # Ok(())
//! # }
//! ```
//!
//! ## Layering
//!
//! - [`source`]: random-access byte sources (HTTP range requests, in-memory).
//! - [`block_cache`]: fixed-size block caching over any byte source.
//! - [`index`]: the immutable, binary-searchable archive file table.
//! - [`fileops`]: per-entry decompression, hash verification, directory synthesis.
//! - [`content_cache`]: content-addressed object storage, in-memory and on-disk.
//! - [`prefetch`]: batched, concurrent range reads into a content cache.
//! - [`facade`]: the file-system-shaped entry point composing the above.
//! - [`manifest`]: resolves an OCI reference into index bytes and a data descriptor.
//!
//! ## Non-goals
//!
//! This crate does not create or write archives, push OCI manifests,
//! evaluate signature or provenance policy beyond the pluggable hooks in
//! [`manifest::Resolver`], or acquire registry credentials — those are the
//! caller's concern. It does not mutate archives or maintain directory
//! entities; directories are always synthesized from file paths.
//!
//! ## Errors
//!
//! Every fallible operation returns [`error::Result`]. [`error::ErrorKind`]
//! lets callers branch on failure category (hash mismatch, path invalid,
//! range unsupported, ...) without matching on payload-carrying variants.
//!
//! ## Concurrency
//!
//! Everything here is built on `tokio`: the facade, caches, and prefetcher
//! are safe for concurrent use by many readers, and concurrent reads for
//! the same content hash are deduplicated ([`singleflight`]) rather than
//! each issuing their own fetch.

pub mod block_cache;
pub mod content_cache;
pub mod diskstore;
pub mod error;
pub mod facade;
pub mod fileops;
pub mod index;
pub mod manifest;
pub mod prefetch;
pub mod singleflight;
pub mod source;

pub use error::{Error, ErrorKind, Result};
pub use facade::{Facade, FacadeConfig};
pub use index::{Entry, Index};
