//! Random-access byte sources.
//!
//! A [`ByteSource`] is the one abstraction every other layer in this crate is
//! built on: the block cache wraps one, file operations read through one
//! (possibly a block-cached one), and the batch prefetcher issues coalesced
//! range reads against one. Two concrete sources ship here: [`http::HttpSource`]
//! for the real remote-archive case and [`memory::MemorySource`] for tests and
//! small embedded archives.

pub mod http;
pub mod memory;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;

/// A random-access, logically-immutable byte source.
///
/// Implementations must be safe for concurrent `read_at` calls from many
/// tasks. `read_at` fills `buf` fully unless the
/// source ends before `offset + buf.len()`, in which case it returns the
/// partial count — exactly like `Read::read` returning fewer bytes than
/// requested only at EOF. Reads starting at or beyond `size()` return `Ok(0)`.
#[async_trait]
pub trait ByteSource: Send + Sync {
    /// Read starting at `offset` into `buf`, returning the number of bytes
    /// actually placed into `buf`. A return value less than `buf.len()`
    /// means the source ended before filling the buffer.
    async fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize>;

    /// Total size of the source, if known.
    async fn size(&self) -> Result<Option<u64>>;

    /// Stable, globally-unique identifier for this source, used as a
    /// cache-key component by the block cache.
    fn source_id(&self) -> &str;

    /// Whether `read_range` is a genuinely more efficient path than looping
    /// over `read_at` (e.g. a single HTTP range GET vs. repeated reads).
    fn supports_read_range(&self) -> bool {
        false
    }

    /// Read exactly `[offset, offset + length)`, returning fewer bytes only
    /// if the source ends first. The default implementation loops over
    /// `read_at`; sources that can serve a contiguous range in one
    /// round-trip (HTTP) should override this.
    async fn read_range(&self, offset: u64, length: u64) -> Result<Bytes> {
        let mut buf = vec![0u8; length as usize];
        let mut filled = 0usize;
        while filled < buf.len() {
            let n = self.read_at(&mut buf[filled..], offset + filled as u64).await?;
            if n == 0 {
                buf.truncate(filled);
                break;
            }
            filled += n;
        }
        Ok(Bytes::from(buf))
    }
}

/// Reads a fully-populated buffer or fails with an I/O-shaped protocol error,
/// for callers that need the strict "short read is an error" contract (e.g.
/// reading a file's declared byte window out of the data blob).
pub async fn read_at_exact(
    source: &dyn ByteSource,
    buf: &mut [u8],
    offset: u64,
) -> Result<()> {
    let mut filled = 0usize;
    while filled < buf.len() {
        let n = source.read_at(&mut buf[filled..], offset + filled as u64).await?;
        if n == 0 {
            return Err(crate::error::Error::Protocol(format!(
                "unexpected end of source at offset {} (wanted {} more bytes)",
                offset + filled as u64,
                buf.len() - filled
            )));
        }
        filled += n;
    }
    Ok(())
}
