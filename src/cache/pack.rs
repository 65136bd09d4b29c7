//! Resource pack identity and contents.

use crate::error::{ProxyError, Result};
use bytes::Bytes;
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use uuid::Uuid;

/// Pack types as announced in data-info packets
pub mod pack_type {
    pub const ADDON: u8 = 1;
    pub const BEHAVIOUR: u8 = 4;
    pub const RESOURCES: u8 = 6;
    pub const SKINS: u8 = 7;
    pub const WORLD_TEMPLATE: u8 = 8;
}

/// Cache key for a pack: UUID plus version string.
///
/// Formats and parses as `<uuid>_<version>`, the form used on the wire and
/// as the cache file stem.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PackId {
    pub uuid: Uuid,
    pub version: String,
}

impl PackId {
    pub fn new(uuid: Uuid, version: impl Into<String>) -> Self {
        Self {
            uuid,
            version: version.into(),
        }
    }

    /// Build from the separate uuid/version fields of an info or stack entry.
    pub fn from_parts(uuid: &str, version: &str) -> Result<Self> {
        let uuid = Uuid::parse_str(uuid)
            .map_err(|e| ProxyError::Protocol(format!("invalid pack uuid {uuid:?}: {e}")))?;
        Ok(Self::new(uuid, version))
    }

    /// UUID part of a `<uuid>_<version>` string, which may lack the version.
    pub fn uuid_of(s: &str) -> Result<Uuid> {
        let head = s.split('_').next().unwrap_or(s);
        Uuid::parse_str(head).map_err(|e| ProxyError::Protocol(format!("invalid pack uuid {s:?}: {e}")))
    }
}

impl fmt::Display for PackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.uuid, self.version)
    }
}

impl FromStr for PackId {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self> {
        let (uuid, version) = s
            .split_once('_')
            .ok_or_else(|| ProxyError::Protocol(format!("pack id {s:?} has no version")))?;
        Self::from_parts(uuid, version)
    }
}

/// A complete pack held in memory.
#[derive(Clone, PartialEq, Eq)]
pub struct ResourcePack {
    pub id: PackId,
    pub content_key: String,
    pub sub_pack_name: String,
    pub pack_type: u8,
    pub data: Bytes,
}

impl fmt::Debug for ResourcePack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourcePack")
            .field("id", &self.id.to_string())
            .field("pack_type", &self.pack_type)
            .field("encrypted", &!self.content_key.is_empty())
            .field("len", &self.data.len())
            .finish()
    }
}

impl ResourcePack {
    pub fn new(id: PackId, data: impl Into<Bytes>) -> Self {
        Self {
            id,
            content_key: String::new(),
            sub_pack_name: String::new(),
            pack_type: pack_type::RESOURCES,
            data: data.into(),
        }
    }

    /// Load a pack file named `<uuid>_<version>.zip` (or `.mcpack`).
    pub fn from_file(path: &Path) -> Result<Self> {
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| ProxyError::ConfigError(format!("bad pack path {}", path.display())))?;
        let id: PackId = stem.parse().map_err(|_| {
            ProxyError::ConfigError(format!(
                "pack file {} is not named <uuid>_<version>",
                path.display()
            ))
        })?;
        let data = std::fs::read(path)?;
        Ok(Self::new(id, data))
    }

    pub fn with_content_key(mut self, key: impl Into<String>) -> Self {
        self.content_key = key.into();
        self
    }

    pub fn with_pack_type(mut self, pack_type: u8) -> Self {
        self.pack_type = pack_type;
        self
    }

    pub fn len(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn is_behaviour(&self) -> bool {
        self.pack_type == pack_type::BEHAVIOUR
    }

    /// SHA-256 of the pack data, as sent in data-info packets.
    pub fn checksum(&self) -> [u8; 32] {
        Sha256::digest(&self.data).into()
    }

    pub fn chunk_count(&self, chunk_size: u32) -> u32 {
        chunk_count(self.len(), chunk_size)
    }

    /// Bytes of chunk `index`, or `None` past the end.
    pub fn chunk(&self, index: u32, chunk_size: u32) -> Option<Bytes> {
        let start = u64::from(index) * u64::from(chunk_size);
        if start >= self.len() {
            return None;
        }
        let end = (start + u64::from(chunk_size)).min(self.len());
        Some(self.data.slice(start as usize..end as usize))
    }
}

/// Number of `chunk_size` chunks needed for `size` bytes.
pub fn chunk_count(size: u64, chunk_size: u32) -> u32 {
    if chunk_size == 0 {
        return 0;
    }
    size.div_ceil(u64::from(chunk_size)) as u32
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const ID: &str = "0fba4063-dba1-4281-9b89-ff9390653530_1.0.0";

    #[test]
    fn test_pack_id_parse_display() {
        let id: PackId = ID.parse().unwrap();
        assert_eq!(id.version, "1.0.0");
        assert_eq!(id.to_string(), ID);
        assert_eq!(PackId::uuid_of(ID).unwrap(), id.uuid);
        assert_eq!(PackId::uuid_of("0fba4063-dba1-4281-9b89-ff9390653530").unwrap(), id.uuid);
    }

    #[test]
    fn test_pack_id_requires_version_separator() {
        assert!("0fba4063-dba1-4281-9b89-ff9390653530".parse::<PackId>().is_err());
        assert!("not-a-uuid_1.0".parse::<PackId>().is_err());
    }

    #[test]
    fn test_chunking() {
        let pack = ResourcePack::new(ID.parse().unwrap(), vec![5u8; 300]);
        assert_eq!(pack.chunk_count(128), 3);
        assert_eq!(pack.chunk(0, 128).unwrap().len(), 128);
        assert_eq!(pack.chunk(2, 128).unwrap().len(), 44);
        assert!(pack.chunk(3, 128).is_none());
        assert_eq!(chunk_count(256, 128), 2);
        assert_eq!(chunk_count(0, 128), 0);
    }
}
