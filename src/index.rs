//! The archive index: an immutable, once-parsed, sorted binary file table.
//!
//! The on-disk envelope is a small header followed by an offset table (one
//! `u64` byte-offset per entry) and the variable-length entry records
//! themselves. The offset table is what gives `lookup` its O(log n) bound
//! and `entry_at` its O(1) bound without deserializing every entry up
//! front: a binary search only ever decodes the *path* of the probed
//! entries, and a full `Entry` is materialized only for the match (or for
//! whichever entries a caller actually iterates).
//!
//! Nothing here mutates `bytes` after [`Index::parse`] returns — entries are
//! plain owned records copied out of the backing buffer on demand.

use std::cmp::Ordering;
use std::sync::Arc;

use byteorder::{BigEndian, ByteOrder};

use crate::error::{Error, Result};

pub const MAGIC: u32 = 0x4B53_4831; // "KSH1"
pub const CURRENT_VERSION: u32 = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HashAlgorithm {
    Sha256,
}

impl HashAlgorithm {
    fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            1 => Ok(HashAlgorithm::Sha256),
            other => Err(Error::Protocol(format!("unknown hash algorithm tag {other}"))),
        }
    }

    fn tag(self) -> u8 {
        match self {
            HashAlgorithm::Sha256 => 1,
        }
    }

    pub fn hash_len(self) -> usize {
        match self {
            HashAlgorithm::Sha256 => 32,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Compression {
    None,
    Zstd,
}

impl Compression {
    fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            0 => Ok(Compression::None),
            1 => Ok(Compression::Zstd),
            other => Err(Error::Protocol(format!("unknown compression tag {other}"))),
        }
    }

    fn tag(self) -> u8 {
        match self {
            Compression::None => 0,
            Compression::Zstd => 1,
        }
    }
}

/// One file's metadata. Unique by `path` within an [`Index`]; a plain owned
/// record copied out of the index's backing buffer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entry {
    pub path: String,
    pub data_offset: u64,
    pub data_size: u64,
    pub original_size: u64,
    pub hash: Vec<u8>,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub mod_time_ns: i64,
    pub compression: Compression,
}

impl Entry {
    pub fn name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }
}

pub struct Index {
    bytes: Arc<[u8]>,
    version: u32,
    hash_algorithm: HashAlgorithm,
    data_hash: Option<Vec<u8>>,
    data_size: Option<u64>,
    /// Byte offset of each entry record, in path-sorted order.
    offsets: Vec<u64>,
}

fn need(bytes: &[u8], at: usize, len: usize) -> Result<()> {
    if at.checked_add(len).map(|end| end <= bytes.len()) != Some(true) {
        return Err(Error::Protocol("index buffer truncated".into()));
    }
    Ok(())
}

impl Index {
    /// Parse the binary envelope once. The returned `Index` retains `bytes`
    /// and never mutates it; all views alias it.
    pub fn parse(bytes: Arc<[u8]>) -> Result<Self> {
        let b = &bytes[..];
        need(b, 0, 4 + 4 + 1)?;
        let magic = BigEndian::read_u32(&b[0..4]);
        if magic != MAGIC {
            return Err(Error::Protocol(format!("bad index magic {magic:#x}")));
        }
        let version = BigEndian::read_u32(&b[4..8]);
        let hash_algorithm = HashAlgorithm::from_tag(b[8])?;
        let mut pos = 9usize;

        need(b, pos, 1)?;
        let has_data_hash = b[pos] != 0;
        pos += 1;
        let data_hash = if has_data_hash {
            let len = hash_algorithm.hash_len();
            need(b, pos, len)?;
            let h = b[pos..pos + len].to_vec();
            pos += len;
            Some(h)
        } else {
            None
        };

        need(b, pos, 1)?;
        let has_data_size = b[pos] != 0;
        pos += 1;
        let data_size = if has_data_size {
            need(b, pos, 8)?;
            let v = BigEndian::read_u64(&b[pos..pos + 8]);
            pos += 8;
            Some(v)
        } else {
            None
        };

        need(b, pos, 4)?;
        let entry_count = BigEndian::read_u32(&b[pos..pos + 4]) as usize;
        pos += 4;

        need(b, pos, entry_count * 8)?;
        let mut offsets = Vec::with_capacity(entry_count);
        for i in 0..entry_count {
            let at = pos + i * 8;
            offsets.push(BigEndian::read_u64(&b[at..at + 8]));
        }

        let index = Self {
            bytes,
            version,
            hash_algorithm,
            data_hash,
            data_size,
            offsets,
        };

        index.validate_sorted()?;
        Ok(index)
    }

    fn validate_sorted(&self) -> Result<()> {
        let mut prev: Option<&[u8]> = None;
        for &offset in &self.offsets {
            let path = self.path_bytes_at(offset)?;
            if let Some(p) = prev
                && p >= path
            {
                return Err(Error::Protocol("index entries not strictly sorted by path".into()));
            }
            prev = Some(path);
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn hash_algorithm(&self) -> HashAlgorithm {
        self.hash_algorithm
    }

    pub fn data_hash(&self) -> Option<&[u8]> {
        self.data_hash.as_deref()
    }

    pub fn data_size(&self) -> Option<u64> {
        self.data_size
    }

    fn path_bytes_at(&self, offset: u64) -> Result<&[u8]> {
        let b = &self.bytes[..];
        let at = offset as usize;
        need(b, at, 4)?;
        let path_len = BigEndian::read_u32(&b[at..at + 4]) as usize;
        need(b, at + 4, path_len)?;
        Ok(&b[at + 4..at + 4 + path_len])
    }

    fn decode_entry_at(&self, offset: u64) -> Result<Entry> {
        let b = &self.bytes[..];
        let at = offset as usize;
        need(b, at, 4)?;
        let path_len = BigEndian::read_u32(&b[at..at + 4]) as usize;
        let mut pos = at + 4;
        need(b, pos, path_len)?;
        let path = std::str::from_utf8(&b[pos..pos + path_len])
            .map_err(|e| Error::Protocol(format!("non-utf8 path: {e}")))?
            .to_string();
        pos += path_len;

        need(b, pos, 8 + 8 + 8)?;
        let data_offset = BigEndian::read_u64(&b[pos..pos + 8]);
        pos += 8;
        let data_size = BigEndian::read_u64(&b[pos..pos + 8]);
        pos += 8;
        let original_size = BigEndian::read_u64(&b[pos..pos + 8]);
        pos += 8;

        let hash_len = self.hash_algorithm.hash_len();
        need(b, pos, hash_len)?;
        let hash = b[pos..pos + hash_len].to_vec();
        pos += hash_len;

        need(b, pos, 4 + 4 + 4 + 8 + 1)?;
        let mode = BigEndian::read_u32(&b[pos..pos + 4]);
        pos += 4;
        let uid = BigEndian::read_u32(&b[pos..pos + 4]);
        pos += 4;
        let gid = BigEndian::read_u32(&b[pos..pos + 4]);
        pos += 4;
        let mod_time_ns = BigEndian::read_i64(&b[pos..pos + 8]) as i64;
        pos += 8;
        let compression = Compression::from_tag(b[pos])?;

        if data_size > original_size && compression == Compression::None {
            return Err(Error::Protocol(format!(
                "entry {path}: data_size > original_size for uncompressed entry"
            )));
        }

        Ok(Entry {
            path,
            data_offset,
            data_size,
            original_size,
            hash,
            mode,
            uid,
            gid,
            mod_time_ns,
            compression,
        })
    }

    /// Binary search by path. O(log n) path comparisons, one entry decode
    /// on a match.
    pub fn lookup(&self, path: &str) -> Option<Entry> {
        let needle = path.as_bytes();
        let mut lo = 0usize;
        let mut hi = self.offsets.len();
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let candidate = self.path_bytes_at(self.offsets[mid]).ok()?;
            match candidate.cmp(needle) {
                Ordering::Less => lo = mid + 1,
                Ordering::Greater => hi = mid,
                Ordering::Equal => return self.decode_entry_at(self.offsets[mid]).ok(),
            }
        }
        None
    }

    /// O(1) access by sorted position.
    pub fn entry_at(&self, index: usize) -> Result<Entry> {
        let offset = *self
            .offsets
            .get(index)
            .ok_or_else(|| Error::Protocol(format!("index position {index} out of range")))?;
        self.decode_entry_at(offset)
    }

    pub fn entries(&self) -> Entries<'_> {
        Entries {
            index: self,
            next: 0,
            end: self.offsets.len(),
        }
    }

    /// Lowest position whose path is `>= prefix`.
    fn lower_bound(&self, prefix: &str) -> usize {
        let needle = prefix.as_bytes();
        let mut lo = 0usize;
        let mut hi = self.offsets.len();
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let candidate = match self.path_bytes_at(self.offsets[mid]) {
                Ok(c) => c,
                Err(_) => return hi,
            };
            if candidate < needle {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo
    }

    /// Entries whose path starts with `prefix`, in sorted order.
    pub fn entries_with_prefix<'a>(&'a self, prefix: &str) -> Entries<'a> {
        let start = self.lower_bound(prefix);
        let mut end = start;
        while end < self.offsets.len() {
            match self.path_bytes_at(self.offsets[end]) {
                Ok(p) if p.starts_with(prefix.as_bytes()) => end += 1,
                _ => break,
            }
        }
        Entries {
            index: self,
            next: start,
            end,
        }
    }
}

pub struct Entries<'a> {
    index: &'a Index,
    next: usize,
    end: usize,
}

impl Iterator for Entries<'_> {
    type Item = Entry;

    fn next(&mut self) -> Option<Entry> {
        if self.next >= self.end {
            return None;
        }
        let entry = self.index.entry_at(self.next).ok();
        self.next += 1;
        entry
    }
}


#[cfg(test)]
mod tests {
    use super::testutil::{encode, EntrySpec};
    use super::*;
    use sha2::{Digest, Sha256};

    fn hash_of(data: &[u8]) -> Vec<u8> {
        Sha256::digest(data).to_vec()
    }

    fn sample_index() -> Index {
        let specs = vec![
            EntrySpec {
                path: "b.txt".into(),
                data_offset: 5,
                data_size: 5,
                original_size: 5,
                hash: hash_of(b"world"),
                compression: Compression::None,
            },
            EntrySpec {
                path: "a.txt".into(),
                data_offset: 0,
                data_size: 5,
                original_size: 5,
                hash: hash_of(b"hello"),
                compression: Compression::None,
            },
            EntrySpec {
                path: "dir/c.txt".into(),
                data_offset: 10,
                data_size: 1,
                original_size: 1,
                hash: hash_of(b"c"),
                compression: Compression::None,
            },
        ];
        let bytes = encode(&specs, Some(11), None);
        Index::parse(Arc::from(bytes)).unwrap()
    }

    #[test]
    fn lookup_finds_every_entry_and_rejects_absent() {
        let idx = sample_index();
        assert_eq!(idx.len(), 3);
        assert_eq!(idx.lookup("a.txt").unwrap().data_offset, 0);
        assert_eq!(idx.lookup("b.txt").unwrap().data_offset, 5);
        assert_eq!(idx.lookup("dir/c.txt").unwrap().data_offset, 10);
        assert!(idx.lookup("missing.txt").is_none());
    }

    #[test]
    fn entries_are_sorted() {
        let idx = sample_index();
        let paths: Vec<_> = idx.entries().map(|e| e.path).collect();
        assert_eq!(paths, vec!["a.txt", "b.txt", "dir/c.txt"]);
    }

    #[test]
    fn entries_with_prefix() {
        let idx = sample_index();
        let paths: Vec<_> = idx.entries_with_prefix("dir/").map(|e| e.path).collect();
        assert_eq!(paths, vec!["dir/c.txt"]);

        let none: Vec<_> = idx.entries_with_prefix("zzz").collect();
        assert!(none.is_empty());
    }
}
