//! Generic sharded, size-bounded disk blob store.
//!
//! Both the content cache's disk implementation and a disk-backed block
//! cache need the same thing: write-temp-then-rename atomic writes, a
//! hex-sharded directory layout, and an LRU-by-mtime prune when a byte
//! budget is exceeded. They share this one implementation instead of each
//! duplicating it.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::error::{Error, Result};

fn io_err(e: std::io::Error) -> Error {
    Error::CacheIo(Box::new(Error::Io(e)))
}

pub struct DiskBlobStore {
    root: PathBuf,
    shard_prefix_len: usize,
    max_bytes: Option<u64>,
    current_bytes: AtomicU64,
    prune_lock: Mutex<()>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriterState {
    Open,
    Committed,
    Discarded,
}

/// Streaming writer over a pending cache entry. Exactly one of `commit` /
/// `discard` must be called; `Drop` discards as a backstop.
pub struct BlobWriter {
    store: Arc<DiskBlobStore>,
    key_hex: String,
    final_path: PathBuf,
    tmp_path: Option<PathBuf>,
    file: Option<tokio::fs::File>,
    written: u64,
    state: WriterState,
    /// When true the key already existed on open: writes are discarded and
    /// commit is a trivial success, matching the "no duplicate write" rule.
    already_present: bool,
}

impl DiskBlobStore {
    pub async fn open(
        root: impl Into<PathBuf>,
        shard_prefix_len: usize,
        max_bytes: Option<u64>,
    ) -> Result<Arc<Self>> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await.map_err(io_err)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o700);
            let _ = tokio::fs::set_permissions(&root, perms).await;
        }

        let store = Arc::new(Self {
            root,
            shard_prefix_len,
            max_bytes,
            current_bytes: AtomicU64::new(0),
            prune_lock: Mutex::new(()),
        });

        let existing = store.clone().scan_total_bytes().await?;
        store.current_bytes.store(existing, Ordering::SeqCst);
        Ok(store)
    }

    pub fn size_bytes(&self) -> u64 {
        self.current_bytes.load(Ordering::SeqCst)
    }

    fn key_hex(key: &[u8]) -> String {
        hex::encode(key)
    }

    fn path_for_hex(&self, key_hex: &str) -> PathBuf {
        if self.shard_prefix_len == 0 || key_hex.len() < self.shard_prefix_len {
            self.root.join(key_hex)
        } else {
            self.root
                .join(&key_hex[..self.shard_prefix_len])
                .join(key_hex)
        }
    }

    pub async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let path = self.path_for_hex(&Self::key_hex(key));
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_err(e)),
        }
    }

    pub async fn contains(&self, key: &[u8]) -> bool {
        let path = self.path_for_hex(&Self::key_hex(key));
        tokio::fs::metadata(&path).await.is_ok()
    }

    pub async fn delete(&self, key: &[u8]) -> Result<()> {
        let path = self.path_for_hex(&Self::key_hex(key));
        match tokio::fs::metadata(&path).await {
            Ok(meta) => {
                tokio::fs::remove_file(&path).await.map_err(io_err)?;
                self.current_bytes.fetch_sub(meta.len(), Ordering::SeqCst);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_err(e)),
        }
    }

    /// Atomic whole-value write: idempotent if the key already exists.
    pub async fn put(self: &Arc<Self>, key: &[u8], data: &[u8]) -> Result<()> {
        if self.contains(key).await {
            return Ok(());
        }
        let mut writer = self.writer(key).await?;
        writer.write(data).await?;
        writer.commit().await
    }

    /// Open a streaming writer for `key`. If `key` is already present the
    /// returned writer silently discards all writes and commits as a no-op.
    pub async fn writer(self: &Arc<Self>, key: &[u8]) -> Result<BlobWriter> {
        let key_hex = Self::key_hex(key);
        let final_path = self.path_for_hex(&key_hex);
        let already_present = tokio::fs::metadata(&final_path).await.is_ok();

        if already_present {
            return Ok(BlobWriter {
                store: self.clone(),
                key_hex,
                final_path,
                tmp_path: None,
                file: None,
                written: 0,
                state: WriterState::Open,
                already_present: true,
            });
        }

        let shard_dir = final_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        tokio::fs::create_dir_all(&shard_dir).await.map_err(io_err)?;

        let named = tempfile::Builder::new()
            .prefix("cache-")
            .tempfile_in(&shard_dir)
            .map_err(io_err)?;
        let (_std_file, temp_path) = named.into_parts();
        let tmp_path: PathBuf = temp_path.keep().map_err(|e| io_err(e.error))?;
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .open(&tmp_path)
            .await
            .map_err(io_err)?;

        Ok(BlobWriter {
            store: self.clone(),
            key_hex,
            final_path,
            tmp_path: Some(tmp_path),
            file: Some(file),
            written: 0,
            state: WriterState::Open,
            already_present: false,
        })
    }

    async fn ensure_capacity(&self, need: u64) -> Result<()> {
        let Some(max) = self.max_bytes else {
            return Ok(());
        };
        if need > max {
            return Ok(());
        }
        let current = self.current_bytes.load(Ordering::SeqCst);
        if current + need <= max {
            return Ok(());
        }
        let target = max.saturating_sub(need);
        self.prune(target).await?;
        Ok(())
    }

    /// Delete entries oldest-mtime-first (ties broken by path) until
    /// `size_bytes() <= target`. Returns bytes freed.
    pub async fn prune(&self, target: u64) -> Result<u64> {
        let _guard = self.prune_lock.lock().await;

        let current = self.current_bytes.load(Ordering::SeqCst);
        if current <= target {
            return Ok(0);
        }

        let root = self.root.clone();
        let mut entries = tokio::task::spawn_blocking(move || list_entries(&root))
            .await
            .map_err(|e| Error::Protocol(e.to_string()))?
            .map_err(io_err)?;

        entries.sort_by(|a, b| a.mtime.cmp(&b.mtime).then_with(|| a.path.cmp(&b.path)));

        let mut freed = 0u64;
        let mut remaining = current;
        for entry in entries {
            if remaining <= target {
                break;
            }
            if tokio::fs::remove_file(&entry.path).await.is_ok() {
                freed += entry.size;
                remaining = remaining.saturating_sub(entry.size);
            }
        }

        self.current_bytes.fetch_sub(freed, Ordering::SeqCst);
        Ok(freed)
    }

    async fn scan_total_bytes(self: Arc<Self>) -> Result<u64> {
        let root = self.root.clone();
        let entries = tokio::task::spawn_blocking(move || list_entries(&root))
            .await
            .map_err(|e| Error::Protocol(e.to_string()))?
            .map_err(io_err)?;
        Ok(entries.iter().map(|e| e.size).sum())
    }
}

struct Entry {
    path: PathBuf,
    size: u64,
    mtime: SystemTime,
}

fn list_entries(root: &Path) -> std::io::Result<Vec<Entry>> {
    let mut out = Vec::new();
    if !root.exists() {
        return Ok(out);
    }
    for entry in std::fs::read_dir(root)? {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            out.extend(list_entries(&path)?);
        } else if file_type.is_file() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with("cache-") {
                continue;
            }
            let meta = entry.metadata()?;
            out.push(Entry {
                path,
                size: meta.len(),
                mtime: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            });
        }
    }
    Ok(out)
}

impl BlobWriter {
    pub async fn write(&mut self, buf: &[u8]) -> Result<()> {
        if self.state != WriterState::Open {
            return Err(Error::Protocol("write after commit/discard".into()));
        }
        if self.already_present {
            return Ok(());
        }
        let file = self.file.as_mut().expect("open writer has a file");
        file.write_all(buf).await.map_err(io_err)?;
        self.written += buf.len() as u64;
        Ok(())
    }

    pub async fn commit(mut self) -> Result<()> {
        if self.state != WriterState::Open {
            return Err(Error::Protocol("commit after commit/discard".into()));
        }
        self.state = WriterState::Committed;

        if self.already_present {
            return Ok(());
        }

        if let Some(mut file) = self.file.take() {
            file.flush().await.map_err(io_err)?;
        }

        self.store.ensure_capacity(self.written).await?;

        if let Some(shard_dir) = self.final_path.parent() {
            tokio::fs::create_dir_all(shard_dir).await.map_err(io_err)?;
        }

        let tmp_path = self.tmp_path.take().expect("non-sink writer has a tmp path");
        match tokio::fs::rename(&tmp_path, &self.final_path).await {
            Ok(()) => {
                self.store
                    .current_bytes
                    .fetch_add(self.written, Ordering::SeqCst);
            }
            Err(_) => {
                // Another writer won the race; the entry is present either way.
                let _ = tokio::fs::remove_file(&tmp_path).await;
            }
        }
        Ok(())
    }

    pub async fn discard(mut self) -> Result<()> {
        if self.state != WriterState::Open {
            return Err(Error::Protocol("discard after commit/discard".into()));
        }
        self.state = WriterState::Discarded;
        self.cleanup_tmp().await;
        Ok(())
    }

    async fn cleanup_tmp(&mut self) {
        self.file.take();
        if let Some(tmp) = self.tmp_path.take() {
            let _ = tokio::fs::remove_file(&tmp).await;
        }
    }

    pub fn key_hex(&self) -> &str {
        &self.key_hex
    }
}

impl Drop for BlobWriter {
    fn drop(&mut self) {
        if self.state == WriterState::Open
            && let Some(tmp) = self.tmp_path.take()
        {
            let _ = std::fs::remove_file(&tmp);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_then_get_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskBlobStore::open(dir.path(), 2, None).await.unwrap();
        store.put(b"key-a", b"hello").await.unwrap();
        assert_eq!(store.get(b"key-a").await.unwrap(), Some(b"hello".to_vec()));
    }

    #[tokio::test]
    async fn prune_reduces_size_to_at_most_target() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskBlobStore::open(dir.path(), 2, None).await.unwrap();
        for i in 0..10u32 {
            let key = format!("key-{i}");
            let value = vec![b'x'; 100];
            store.put(key.as_bytes(), &value).await.unwrap();
            // force distinct mtimes so ordering is deterministic
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }
        assert_eq!(store.size_bytes(), 1000);

        let target = 350u64;
        store.prune(target).await.unwrap();
        assert!(
            store.size_bytes() <= target,
            "size {} exceeds target {}",
            store.size_bytes(),
            target
        );
    }

    #[tokio::test]
    async fn capacity_eviction_keeps_size_under_max_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskBlobStore::open(dir.path(), 2, Some(250)).await.unwrap();
        for i in 0..10u32 {
            let key = format!("key-{i}");
            store.put(key.as_bytes(), &vec![b'y'; 100]).await.unwrap();
        }
        assert!(store.size_bytes() <= 250);
    }
}
