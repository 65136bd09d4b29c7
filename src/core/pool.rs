//! Packet id registry.
//!
//! The pool maps a numeric id to a decode/encode function pair. It is built
//! once, usually with [`PacketPool::standard`], and shared behind an `Arc`.

use crate::core::codec::Frame;
use crate::core::packet::{self, Packet, PacketBody};
use crate::error::{ProxyError, Result};
use bytes::Bytes;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use tracing::{debug, warn};

type DecodeFn = fn(&[u8]) -> Result<Packet>;
type EncodeFn = fn(&Packet) -> Result<Vec<u8>>;

#[derive(Clone, Copy)]
struct Entry {
    name: &'static str,
    decode: DecodeFn,
    encode: EncodeFn,
}

/// Registry of packet decoders and encoders keyed by id.
#[derive(Clone, Default)]
pub struct PacketPool {
    entries: HashMap<u32, Entry>,
}

impl std::fmt::Debug for PacketPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut ids: Vec<_> = self.entries.keys().copied().collect();
        ids.sort_unstable();
        f.debug_struct("PacketPool").field("ids", &ids).finish()
    }
}

fn decode_body<T: PacketBody>(data: &[u8]) -> Result<Packet> {
    let body: T = bincode::deserialize(data).map_err(|e| ProxyError::Decode {
        id: T::ID,
        name: T::NAME,
        reason: e.to_string(),
    })?;
    Ok(body.into())
}

fn encode_body<T: PacketBody>(packet: &Packet) -> Result<Vec<u8>> {
    let body = T::from_packet(packet).ok_or_else(|| {
        ProxyError::Protocol(format!("{} registered under id of {}", packet.name(), T::NAME))
    })?;
    Ok(bincode::serialize(body)?)
}

impl PacketPool {
    /// Empty pool; every id decodes as unknown.
    pub fn new() -> Self {
        Self::default()
    }

    /// Pool with every packet type in [`crate::core::packet`].
    pub fn standard() -> Self {
        let mut pool = Self::new();
        packet::register_all(&mut pool);
        pool
    }

    /// Register `T` under `T::ID`, replacing any previous entry.
    pub fn register<T: PacketBody>(&mut self) {
        self.entries.insert(
            T::ID,
            Entry {
                name: T::NAME,
                decode: decode_body::<T>,
                encode: encode_body::<T>,
            },
        );
    }

    pub fn contains(&self, id: u32) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn name(&self, id: u32) -> Option<&'static str> {
        self.entries.get(&id).map(|e| e.name)
    }

    /// Decode a frame into its typed packet.
    ///
    /// A panic inside a decoder is caught and returned as
    /// [`ProxyError::DecodePanic`].
    pub fn decode(&self, frame: &Frame) -> Result<Packet> {
        let entry = self
            .entries
            .get(&frame.id)
            .ok_or(ProxyError::UnknownPacket(frame.id))?;

        let payload = &frame.payload[..];
        match panic::catch_unwind(AssertUnwindSafe(|| (entry.decode)(payload))) {
            Ok(result) => result,
            Err(_) => Err(ProxyError::DecodePanic(frame.id)),
        }
    }

    /// Decode a frame, falling back to [`Packet::Unknown`] on any failure.
    pub fn decode_lossy(&self, frame: &Frame) -> Packet {
        match self.decode(frame) {
            Ok(packet) => packet,
            Err(ProxyError::UnknownPacket(_)) => unknown(frame),
            Err(e) => {
                warn!(id = frame.id, error = %e, "Falling back to raw packet");
                unknown(frame)
            }
        }
    }

    /// Encode a packet into a frame.
    pub fn encode(&self, packet: &Packet) -> Result<Frame> {
        if let Packet::Unknown { id, payload } = packet {
            return Ok(Frame {
                id: *id,
                payload: payload.clone(),
            });
        }

        let entry = self.entries.get(&packet.id()).ok_or_else(|| {
            debug!(packet = packet.name(), "Encoding packet missing from pool");
            ProxyError::UnknownPacket(packet.id())
        })?;
        let payload = (entry.encode)(packet)?;
        Ok(Frame {
            id: packet.id(),
            payload: Bytes::from(payload),
        })
    }
}

fn unknown(frame: &Frame) -> Packet {
    Packet::Unknown {
        id: frame.id,
        payload: frame.payload.clone(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::core::packet::{ids, Disconnect, Text};
    use serde::{Deserialize, Deserializer, Serialize};

    #[test]
    fn test_standard_pool_registers_all_ids() {
        let pool = PacketPool::standard();
        for id in [
            ids::LOGIN,
            ids::PLAY_STATUS,
            ids::DISCONNECT,
            ids::RESOURCE_PACKS_INFO,
            ids::RESOURCE_PACK_STACK,
            ids::RESOURCE_PACK_CLIENT_RESPONSE,
            ids::TEXT,
            ids::START_GAME,
            ids::LEVEL_CHUNK,
            ids::RESOURCE_PACK_DATA_INFO,
            ids::RESOURCE_PACK_CHUNK_DATA,
            ids::RESOURCE_PACK_CHUNK_REQUEST,
            ids::TRANSFER,
            ids::SET_LOCAL_PLAYER_AS_INITIALISED,
            ids::CLIENT_CACHE_STATUS,
            ids::CLIENT_CACHE_BLOB_STATUS,
            ids::CLIENT_CACHE_MISS_RESPONSE,
            ids::SUB_CHUNK,
        ] {
            assert!(pool.contains(id), "missing id 0x{id:02x}");
        }
    }

    #[test]
    fn test_unknown_id_passes_through() {
        let pool = PacketPool::standard();
        let frame = Frame::new(0x7f, vec![1u8, 2, 3]);
        assert!(matches!(
            pool.decode(&frame),
            Err(ProxyError::UnknownPacket(0x7f))
        ));
        let packet = pool.decode_lossy(&frame);
        assert_eq!(pool.encode(&packet).unwrap(), frame);
    }

    #[test]
    fn test_truncated_body_falls_back_lossy() {
        let pool = PacketPool::standard();
        let good = pool.encode(&Packet::from(Disconnect::new("bye"))).unwrap();
        let truncated = Frame::new(good.id, good.payload.slice(..good.payload.len() - 1));
        assert!(matches!(
            pool.decode(&truncated),
            Err(ProxyError::Decode { name: "Disconnect", .. })
        ));
        assert!(matches!(
            pool.decode_lossy(&truncated),
            Packet::Unknown { id: ids::DISCONNECT, .. }
        ));
    }

    #[derive(Debug, Serialize)]
    struct Explodes;

    impl<'de> Deserialize<'de> for Explodes {
        fn deserialize<D: Deserializer<'de>>(_: D) -> std::result::Result<Self, D::Error> {
            panic!("bad body");
        }
    }

    #[test]
    fn test_decode_panic_is_contained() {
        fn explode(_: &[u8]) -> Result<Packet> {
            let _: Explodes = bincode::deserialize(&[]).map_err(ProxyError::from)?;
            Ok(Packet::from(Text::default()))
        }

        let mut pool = PacketPool::new();
        pool.entries.insert(
            0x42,
            Entry {
                name: "Explodes",
                decode: explode,
                encode: encode_body::<Text>,
            },
        );
        let frame = Frame::new(0x42, Vec::new());
        assert!(matches!(pool.decode(&frame), Err(ProxyError::DecodePanic(0x42))));
        assert!(matches!(pool.decode_lossy(&frame), Packet::Unknown { id: 0x42, .. }));
    }
}
