//! An in-memory [`ByteSource`], used by tests and for small embedded
//! archives. Counts `read_at` calls so the singleflight and block-cache
//! reuse/bypass invariants can be asserted directly.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::Bytes;

use super::ByteSource;
use crate::error::Result;

pub struct MemorySource {
    data: Vec<u8>,
    id: String,
    read_calls: AtomicUsize,
}

impl MemorySource {
    pub fn new(id: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: data.into(),
            id: id.into(),
            read_calls: AtomicUsize::new(0),
        }
    }

    /// Number of times `read_at` has been called so far.
    pub fn read_at_calls(&self) -> usize {
        self.read_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ByteSource for MemorySource {
    async fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        self.read_calls.fetch_add(1, Ordering::SeqCst);
        let offset = offset as usize;
        if offset >= self.data.len() {
            return Ok(0);
        }
        let available = &self.data[offset..];
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        Ok(n)
    }

    async fn size(&self) -> Result<Option<u64>> {
        Ok(Some(self.data.len() as u64))
    }

    fn source_id(&self) -> &str {
        &self.id
    }

    fn supports_read_range(&self) -> bool {
        true
    }

    async fn read_range(&self, offset: u64, length: u64) -> Result<Bytes> {
        self.read_calls.fetch_add(1, Ordering::SeqCst);
        let offset = offset as usize;
        if offset >= self.data.len() {
            return Ok(Bytes::new());
        }
        let end = (offset + length as usize).min(self.data.len());
        Ok(Bytes::copy_from_slice(&self.data[offset..end]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn short_read_at_tail() {
        let src = MemorySource::new("mem-1", b"abcdefgh".to_vec());
        let mut buf = [0u8; 4];
        let n = src.read_at(&mut buf, 6).await.unwrap();
        assert_eq!(n, 2);
        assert_eq!(&buf[..2], b"gh");
    }

    #[tokio::test]
    async fn read_past_end_is_empty() {
        let src = MemorySource::new("mem-1", b"abc".to_vec());
        let mut buf = [0u8; 4];
        let n = src.read_at(&mut buf, 10).await.unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn counts_calls() {
        let src = MemorySource::new("mem-1", b"abcdefgh".to_vec());
        let mut buf = [0u8; 2];
        src.read_at(&mut buf, 0).await.unwrap();
        src.read_at(&mut buf, 2).await.unwrap();
        assert_eq!(src.read_at_calls(), 2);
    }
}
