//! Content-addressed blob storage.
//!
//! Blobs are keyed by the 64-bit hash the server assigns them and are never
//! rehashed. On disk they live in a two-level layout,
//! `<root>/<hex[0..2]>/<hex>`, and are written via temp file plus rename so a
//! concurrent reader sees either nothing or the complete blob.

use crate::error::{ProxyError, Result};
use bytes::Bytes;
use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::RwLock;
use tracing::{trace, warn};

/// Key/value store backing the blob cache.
pub trait BlobStore: Send + Sync {
    fn get(&self, hash: u64) -> Result<Option<Bytes>>;

    /// Store a payload. Storing an existing hash is a no-op.
    fn put(&self, hash: u64, payload: &[u8]) -> Result<()>;

    fn contains(&self, hash: u64) -> Result<bool> {
        Ok(self.get(hash)?.is_some())
    }
}

/// Blob store in a directory on disk.
#[derive(Debug, Clone)]
pub struct DiskBlobStore {
    root: PathBuf,
}

impl DiskBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn blob_path(&self, hash: u64) -> PathBuf {
        let hex = format!("{hash:016x}");
        self.root.join(&hex[0..2]).join(&hex)
    }
}

impl BlobStore for DiskBlobStore {
    fn get(&self, hash: u64) -> Result<Option<Bytes>> {
        match fs::read(self.blob_path(hash)) {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ProxyError::Io(e)),
        }
    }

    fn put(&self, hash: u64, payload: &[u8]) -> Result<()> {
        let path = self.blob_path(hash);
        if path.exists() {
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let tmp_path = path.with_extension(format!("{:08x}.tmp", rand::random::<u32>()));
        {
            let mut file = fs::File::create(&tmp_path)?;
            file.write_all(payload)?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, &path)?;

        trace!(hash, len = payload.len(), "Blob stored");
        Ok(())
    }

    fn contains(&self, hash: u64) -> Result<bool> {
        Ok(self.blob_path(hash).is_file())
    }
}

/// In-memory blob store, used when the disk store is unavailable and in tests.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<HashMap<u64, Bytes>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.read().map(|b| b.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl BlobStore for MemoryBlobStore {
    fn get(&self, hash: u64) -> Result<Option<Bytes>> {
        let blobs = self
            .blobs
            .read()
            .map_err(|_| ProxyError::Custom(crate::error::constants::ERR_LOCK_POISONED.into()))?;
        Ok(blobs.get(&hash).cloned())
    }

    fn put(&self, hash: u64, payload: &[u8]) -> Result<()> {
        let mut blobs = self
            .blobs
            .write()
            .map_err(|_| ProxyError::Custom(crate::error::constants::ERR_LOCK_POISONED.into()))?;
        blobs
            .entry(hash)
            .or_insert_with(|| Bytes::copy_from_slice(payload));
        Ok(())
    }
}

/// Open the disk store, falling back to memory if the directory is unusable.
pub fn open_blob_store(root: impl Into<PathBuf>) -> std::sync::Arc<dyn BlobStore> {
    let root = root.into();
    match DiskBlobStore::new(&root) {
        Ok(store) => std::sync::Arc::new(store),
        Err(e) => {
            warn!(path = %root.display(), error = %e, "Blob store unavailable, using memory");
            std::sync::Arc::new(MemoryBlobStore::new())
        }
    }
}
