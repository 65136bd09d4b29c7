//! Stores for complete resource packs.
//!
//! Packs are stored as `<root>/<uuid>_<version>.zip`, with the announced
//! pack type in a `<uuid>_<version>.type` sidecar. A write goes to a
//! temporary sibling first and is renamed into place on
//! [`PackWriter::commit`], so `has` never observes a partial pack.

use crate::cache::pack::{pack_type, PackId, ResourcePack};
use crate::error::{ProxyError, Result};
use bytes::Bytes;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// Pack storage consulted before downloading.
pub trait PackCache: Send + Sync {
    fn has(&self, id: &PackId) -> bool;

    fn get(&self, id: &PackId) -> Result<Option<ResourcePack>>;

    /// Open a writer for a new pack. `None` means this cache is read-only.
    fn create(&self, id: &PackId) -> Result<Option<PackWriter>>;

    /// Every pack this cache can serve.
    fn ids(&self) -> Vec<PackId>;
}

/// Pack cache in a directory on disk.
#[derive(Debug, Clone)]
pub struct DiskPackCache {
    root: PathBuf,
}

impl DiskPackCache {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn pack_path(&self, id: &PackId) -> PathBuf {
        self.root.join(format!("{id}.zip"))
    }

    fn type_path(&self, id: &PackId) -> PathBuf {
        self.root.join(format!("{id}.type"))
    }

    /// Recorded pack type; packs stored without one are resource packs.
    fn stored_type(&self, id: &PackId) -> u8 {
        fs::read_to_string(self.type_path(id))
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(pack_type::RESOURCES)
    }
}

impl PackCache for DiskPackCache {
    fn has(&self, id: &PackId) -> bool {
        self.pack_path(id).is_file()
    }

    fn get(&self, id: &PackId) -> Result<Option<ResourcePack>> {
        let path = self.pack_path(id);
        match fs::read(&path) {
            Ok(data) => Ok(Some(
                ResourcePack::new(id.clone(), data).with_pack_type(self.stored_type(id)),
            )),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ProxyError::Io(e)),
        }
    }

    fn create(&self, id: &PackId) -> Result<Option<PackWriter>> {
        let path = self.pack_path(id);
        let tmp_path = self
            .root
            .join(format!(".{id}.{:08x}.tmp", rand::random::<u32>()));
        let file = File::create(&tmp_path)?;
        debug!(pack = %id, tmp = %tmp_path.display(), "Opened pack cache writer");
        Ok(Some(PackWriter {
            file: Some(tokio::fs::File::from_std(file)),
            tmp_path,
            path,
            type_path: self.type_path(id),
            pack_type: pack_type::RESOURCES,
        }))
    }

    fn ids(&self) -> Vec<PackId> {
        let mut ids = Vec::new();
        let Ok(entries) = fs::read_dir(&self.root) else {
            return ids;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("zip") {
                continue;
            }
            if let Some(id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<PackId>().ok())
            {
                ids.push(id);
            }
        }
        ids.sort();
        ids
    }
}

/// Writer for one pack. Dropping it without committing removes the
/// temporary file.
#[derive(Debug)]
pub struct PackWriter {
    file: Option<tokio::fs::File>,
    tmp_path: PathBuf,
    path: PathBuf,
    type_path: PathBuf,
    pack_type: u8,
}

impl PackWriter {
    /// Pack type recorded alongside the pack on commit.
    pub fn set_pack_type(&mut self, pack_type: u8) {
        self.pack_type = pack_type;
    }

    pub async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| ProxyError::Io(io::Error::from(io::ErrorKind::BrokenPipe)))?;
        file.write_all(buf).await?;
        Ok(())
    }

    /// Flush, sync and atomically move the pack into place.
    pub async fn commit(mut self) -> Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
            file.sync_all().await?;
        }
        tokio::fs::write(&self.type_path, self.pack_type.to_string()).await?;
        tokio::fs::rename(&self.tmp_path, &self.path).await?;
        debug!(path = %self.path.display(), "Committed pack to cache");
        Ok(())
    }
}

impl Drop for PackWriter {
    fn drop(&mut self) {
        if self.file.take().is_some() {
            if let Err(e) = fs::remove_file(&self.tmp_path) {
                warn!(path = %self.tmp_path.display(), error = %e, "Failed to remove partial pack");
            }
        }
    }
}

/// Read-only pack cache filled from a capture's embedded archive.
#[derive(Debug, Clone, Default)]
pub struct ReplayPackCache {
    packs: HashMap<PackId, Bytes>,
}

impl ReplayPackCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: PackId, data: impl Into<Bytes>) {
        self.packs.insert(id, data.into());
    }

    pub fn len(&self) -> usize {
        self.packs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packs.is_empty()
    }
}

impl PackCache for ReplayPackCache {
    fn has(&self, id: &PackId) -> bool {
        self.packs.contains_key(id)
    }

    fn get(&self, id: &PackId) -> Result<Option<ResourcePack>> {
        Ok(self
            .packs
            .get(id)
            .map(|data| ResourcePack::new(id.clone(), data.clone())))
    }

    fn create(&self, _id: &PackId) -> Result<Option<PackWriter>> {
        Ok(None)
    }

    fn ids(&self) -> Vec<PackId> {
        let mut ids: Vec<_> = self.packs.keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn id() -> PackId {
        "5f8ac2a4-3c1b-4bd0-9d4f-0d3c2e9f1a77_2.1.0".parse().unwrap()
    }

    #[tokio::test]
    async fn test_commit_makes_pack_visible() {
        let dir = TempDir::new().unwrap();
        let cache = DiskPackCache::new(dir.path()).unwrap();
        assert!(!cache.has(&id()));

        let mut w = cache.create(&id()).unwrap().unwrap();
        w.write_all(b"pack bytes").await.unwrap();
        assert!(!cache.has(&id()), "pack visible before commit");
        w.commit().await.unwrap();

        assert!(cache.has(&id()));
        let pack = cache.get(&id()).unwrap().unwrap();
        assert_eq!(&pack.data[..], b"pack bytes");
        assert_eq!(pack.pack_type, pack_type::RESOURCES);
        assert_eq!(cache.ids(), vec![id()]);
    }

    #[tokio::test]
    async fn test_pack_type_survives_reload() {
        let dir = TempDir::new().unwrap();
        let cache = DiskPackCache::new(dir.path()).unwrap();
        let mut w = cache.create(&id()).unwrap().unwrap();
        w.set_pack_type(pack_type::BEHAVIOUR);
        w.write_all(b"behaviour").await.unwrap();
        w.commit().await.unwrap();

        let reopened = DiskPackCache::new(dir.path()).unwrap();
        let pack = reopened.get(&id()).unwrap().unwrap();
        assert_eq!(pack.pack_type, pack_type::BEHAVIOUR);
        assert!(pack.is_behaviour());
        assert_eq!(reopened.ids(), vec![id()]);
    }

    #[tokio::test]
    async fn test_dropped_writer_leaves_nothing() {
        let dir = TempDir::new().unwrap();
        let cache = DiskPackCache::new(dir.path()).unwrap();
        {
            let mut w = cache.create(&id()).unwrap().unwrap();
            w.write_all(b"partial").await.unwrap();
        }
        assert!(!cache.has(&id()));
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_replay_cache_is_read_only() {
        let mut cache = ReplayPackCache::new();
        cache.insert(id(), vec![1u8, 2, 3]);
        assert!(cache.has(&id()));
        assert!(cache.create(&id()).unwrap().is_none());
        assert_eq!(cache.get(&id()).unwrap().unwrap().len(), 3);
    }
}
