//! Pack archive embedded in capture files.
//!
//! Layout (little-endian, entries stored uncompressed):
//!
//! ```text
//! "BTPA" | entry_count:u32 | { name_len:u16 | name | data_len:u64 | data }*
//! ```
//!
//! Pack entries are named `packcache/<uuid>_<version>.zip`; entries in other
//! directories are skipped on read.

use crate::cache::pack::{PackId, ResourcePack};
use crate::cache::pack_cache::ReplayPackCache;
use crate::error::{ProxyError, Result};
use bytes::{Buf, Bytes};
use tracing::{debug, warn};

pub const ARCHIVE_MAGIC: &[u8; 4] = b"BTPA";

const PACK_DIR: &str = "packcache";

/// Serialize `packs` into an archive.
pub fn encode_archive(packs: &[ResourcePack]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    out.extend_from_slice(ARCHIVE_MAGIC);
    out.extend_from_slice(&(packs.len() as u32).to_le_bytes());
    for pack in packs {
        let name = format!("{PACK_DIR}/{}.zip", pack.id);
        let name_len = u16::try_from(name.len())
            .map_err(|_| ProxyError::Protocol(format!("archive entry name too long: {name}")))?;
        out.extend_from_slice(&name_len.to_le_bytes());
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(&pack.len().to_le_bytes());
        out.extend_from_slice(&pack.data);
    }
    Ok(out)
}

fn corrupt(msg: impl Into<String>) -> ProxyError {
    ProxyError::CorruptCapture(format!("pack archive: {}", msg.into()))
}

/// Parse an archive into a read-only pack cache. An empty slice is an empty
/// archive.
pub fn decode_archive(data: Bytes) -> Result<ReplayPackCache> {
    let mut cache = ReplayPackCache::new();
    if data.is_empty() {
        return Ok(cache);
    }

    let mut buf = data;
    if buf.remaining() < 8 || &buf[..4] != ARCHIVE_MAGIC {
        return Err(corrupt("bad magic"));
    }
    buf.advance(4);
    let count = buf.get_u32_le();

    for n in 0..count {
        if buf.remaining() < 2 {
            return Err(corrupt(format!("entry {n} truncated")));
        }
        let name_len = buf.get_u16_le() as usize;
        if buf.remaining() < name_len + 8 {
            return Err(corrupt(format!("entry {n} truncated")));
        }
        let name = String::from_utf8(buf.split_to(name_len).to_vec())
            .map_err(|_| corrupt(format!("entry {n} name is not utf-8")))?
            .replace('\\', "/");
        let data_len = buf.get_u64_le();
        if (buf.remaining() as u64) < data_len {
            return Err(corrupt(format!("entry {name} truncated")));
        }
        let data = buf.split_to(data_len as usize);

        let Some((dir, file)) = name.rsplit_once('/') else {
            debug!(entry = %name, "Skipping archive entry");
            continue;
        };
        if dir != PACK_DIR {
            debug!(entry = %name, "Skipping archive entry");
            continue;
        }
        let stem = file.strip_suffix(".zip").unwrap_or(file);
        match stem.parse::<PackId>() {
            Ok(id) => cache.insert(id, data),
            Err(e) => warn!(entry = %name, error = %e, "Archive entry is not a pack"),
        }
    }

    Ok(cache)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::cache::pack_cache::PackCache;

    fn pack(id: &str, len: usize) -> ResourcePack {
        ResourcePack::new(id.parse().unwrap(), vec![3u8; len])
    }

    #[test]
    fn test_archive_roundtrip() {
        let a = pack("5f8ac2a4-3c1b-4bd0-9d4f-0d3c2e9f1a77_1.0.0", 10);
        let b = pack("0fba4063-dba1-4281-9b89-ff9390653530_1.2.3", 0);
        let bytes = encode_archive(&[a.clone(), b.clone()]).unwrap();
        let cache = decode_archive(Bytes::from(bytes)).unwrap();
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&a.id).unwrap().unwrap().data, a.data);
        assert!(cache.has(&b.id));
    }

    #[test]
    fn test_entries_outside_pack_dir_are_skipped() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(ARCHIVE_MAGIC);
        bytes.extend_from_slice(&1u32.to_le_bytes());
        let name = b"notes/readme.txt";
        bytes.extend_from_slice(&(name.len() as u16).to_le_bytes());
        bytes.extend_from_slice(name);
        bytes.extend_from_slice(&2u64.to_le_bytes());
        bytes.extend_from_slice(b"hi");
        assert!(decode_archive(Bytes::from(bytes)).unwrap().is_empty());
    }

    #[test]
    fn test_truncated_archive_is_corrupt() {
        let a = pack("5f8ac2a4-3c1b-4bd0-9d4f-0d3c2e9f1a77_1.0.0", 10);
        let mut bytes = encode_archive(&[a]).unwrap();
        bytes.truncate(bytes.len() - 1);
        assert!(matches!(
            decode_archive(Bytes::from(bytes)),
            Err(ProxyError::CorruptCapture(_))
        ));
    }
}
