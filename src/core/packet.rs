//! Typed packets.
//!
//! Every registered packet id has one body struct, serialized with `bincode`.
//! [`Packet`] is the decoded, mutable form that flows through the blob cache,
//! the resource pack handler and the handler chain. Ids the pool does not know
//! (or bodies it fails to decode in lossy mode) travel as [`Packet::Unknown`]
//! and re-encode byte-for-byte.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Numeric packet ids
pub mod ids {
    pub const LOGIN: u32 = 0x01;
    pub const PLAY_STATUS: u32 = 0x02;
    pub const DISCONNECT: u32 = 0x05;
    pub const RESOURCE_PACKS_INFO: u32 = 0x06;
    pub const RESOURCE_PACK_STACK: u32 = 0x07;
    pub const RESOURCE_PACK_CLIENT_RESPONSE: u32 = 0x08;
    pub const TEXT: u32 = 0x09;
    pub const START_GAME: u32 = 0x0b;
    pub const LEVEL_CHUNK: u32 = 0x3a;
    pub const RESOURCE_PACK_DATA_INFO: u32 = 0x52;
    pub const RESOURCE_PACK_CHUNK_DATA: u32 = 0x53;
    pub const RESOURCE_PACK_CHUNK_REQUEST: u32 = 0x54;
    pub const TRANSFER: u32 = 0x55;
    pub const SET_LOCAL_PLAYER_AS_INITIALISED: u32 = 0x71;
    pub const CLIENT_CACHE_STATUS: u32 = 0x81;
    pub const CLIENT_CACHE_BLOB_STATUS: u32 = 0x87;
    pub const CLIENT_CACHE_MISS_RESPONSE: u32 = 0x88;
    pub const SUB_CHUNK: u32 = 0xae;
}

/// A serde body bound to a fixed packet id.
pub trait PacketBody: Serialize + DeserializeOwned + Into<Packet> + Send + 'static {
    const ID: u32;
    const NAME: &'static str;

    /// Borrow the body back out of a [`Packet`] of the same kind.
    fn from_packet(packet: &Packet) -> Option<&Self>;
}

macro_rules! packets {
    ($($variant:ident = $id:path),* $(,)?) => {
        /// A decoded packet.
        #[derive(Debug, Clone, PartialEq)]
        pub enum Packet {
            $($variant($variant),)*
            /// Raw body for ids without a decoder
            Unknown { id: u32, payload: Bytes },
        }

        impl Packet {
            pub fn id(&self) -> u32 {
                match self {
                    $(Packet::$variant(_) => $id,)*
                    Packet::Unknown { id, .. } => *id,
                }
            }

            pub fn name(&self) -> &'static str {
                match self {
                    $(Packet::$variant(_) => stringify!($variant),)*
                    Packet::Unknown { .. } => "Unknown",
                }
            }
        }

        $(
            impl From<$variant> for Packet {
                fn from(body: $variant) -> Self {
                    Packet::$variant(body)
                }
            }

            impl PacketBody for $variant {
                const ID: u32 = $id;
                const NAME: &'static str = stringify!($variant);

                fn from_packet(packet: &Packet) -> Option<&Self> {
                    match packet {
                        Packet::$variant(body) => Some(body),
                        _ => None,
                    }
                }
            }
        )*

        /// Registers every typed packet with `pool`.
        pub(crate) fn register_all(pool: &mut crate::core::pool::PacketPool) {
            $(pool.register::<$variant>();)*
        }
    };
}

packets! {
    Login = ids::LOGIN,
    PlayStatus = ids::PLAY_STATUS,
    Disconnect = ids::DISCONNECT,
    ResourcePacksInfo = ids::RESOURCE_PACKS_INFO,
    ResourcePackStack = ids::RESOURCE_PACK_STACK,
    ResourcePackClientResponse = ids::RESOURCE_PACK_CLIENT_RESPONSE,
    Text = ids::TEXT,
    StartGame = ids::START_GAME,
    LevelChunk = ids::LEVEL_CHUNK,
    ResourcePackDataInfo = ids::RESOURCE_PACK_DATA_INFO,
    ResourcePackChunkData = ids::RESOURCE_PACK_CHUNK_DATA,
    ResourcePackChunkRequest = ids::RESOURCE_PACK_CHUNK_REQUEST,
    Transfer = ids::TRANSFER,
    SetLocalPlayerAsInitialised = ids::SET_LOCAL_PLAYER_AS_INITIALISED,
    ClientCacheStatus = ids::CLIENT_CACHE_STATUS,
    ClientCacheBlobStatus = ids::CLIENT_CACHE_BLOB_STATUS,
    ClientCacheMissResponse = ids::CLIENT_CACHE_MISS_RESPONSE,
    SubChunk = ids::SUB_CHUNK,
}

impl Packet {
    /// Packets the relay itself consumes while logging in.
    pub fn is_login_sequence(&self) -> bool {
        matches!(
            self,
            Packet::Login(_)
                | Packet::PlayStatus(_)
                | Packet::ResourcePacksInfo(_)
                | Packet::ResourcePackStack(_)
                | Packet::ResourcePackClientResponse(_)
                | Packet::ResourcePackDataInfo(_)
                | Packet::ResourcePackChunkData(_)
                | Packet::ResourcePackChunkRequest(_)
                | Packet::StartGame(_)
                | Packet::ClientCacheStatus(_)
                | Packet::SetLocalPlayerAsInitialised(_)
        )
    }
}

/// Client-side identity sent inside [`Login`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientData {
    /// Address the client typed in, i.e. how it reached the proxy
    pub server_address: String,
    pub display_name: String,
    pub client_cache_enabled: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Login {
    pub protocol_version: i32,
    pub client_data: ClientData,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayStatus {
    pub status: i32,
}

impl PlayStatus {
    pub const LOGIN_SUCCESS: i32 = 0;
    pub const LOGIN_FAILED_CLIENT: i32 = 1;
    pub const LOGIN_FAILED_SERVER: i32 = 2;
    pub const PLAYER_SPAWN: i32 = 3;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Disconnect {
    pub hide_screen: bool,
    pub message: String,
}

impl Disconnect {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            hide_screen: false,
            message: message.into(),
        }
    }
}

/// One pack advertised in [`ResourcePacksInfo`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TexturePackInfo {
    pub uuid: String,
    pub version: String,
    pub size: u64,
    pub content_key: String,
    pub sub_pack_name: String,
    pub content_identity: String,
    pub has_scripts: bool,
    /// Non-empty when the pack is served over HTTP instead of chunks
    pub download_url: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourcePacksInfo {
    pub texture_pack_required: bool,
    pub has_addons: bool,
    pub has_scripts: bool,
    pub texture_packs: Vec<TexturePackInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackResourcePack {
    pub uuid: String,
    pub version: String,
    pub sub_pack_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourcePackStack {
    pub texture_pack_required: bool,
    pub behaviour_packs: Vec<StackResourcePack>,
    pub texture_packs: Vec<StackResourcePack>,
    pub base_game_version: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourcePackClientResponse {
    pub response: u8,
    /// `uuid_version` strings
    pub packs_to_download: Vec<String>,
}

impl ResourcePackClientResponse {
    pub const REFUSED: u8 = 1;
    pub const SEND_PACKS: u8 = 2;
    pub const ALL_PACKS_DOWNLOADED: u8 = 3;
    pub const COMPLETED: u8 = 4;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourcePackDataInfo {
    /// `uuid_version`
    pub uuid: String,
    pub data_chunk_size: u32,
    pub chunk_count: u32,
    pub size: u64,
    pub hash: Vec<u8>,
    pub premium: bool,
    pub pack_type: u8,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourcePackChunkRequest {
    pub uuid: String,
    pub chunk_index: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourcePackChunkData {
    pub uuid: String,
    pub chunk_index: u32,
    pub data_offset: u64,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Text {
    pub text_type: u8,
    pub source_name: String,
    pub message: String,
}

/// World parameters the server sends on spawn.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GameData {
    pub entity_unique_id: i64,
    pub entity_runtime_id: u64,
    pub world_name: String,
    pub world_seed: i64,
    pub dimension: i32,
    pub player_position: [f32; 3],
    pub player_game_mode: i32,
    pub base_game_version: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StartGame {
    pub game_data: GameData,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transfer {
    pub address: String,
    pub port: u16,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetLocalPlayerAsInitialised {
    pub entity_runtime_id: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientCacheStatus {
    pub enabled: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientCacheBlobStatus {
    pub miss_hashes: Vec<u64>,
    pub hit_hashes: Vec<u64>,
}

impl ClientCacheBlobStatus {
    pub fn is_empty(&self) -> bool {
        self.miss_hashes.is_empty() && self.hit_hashes.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheBlob {
    pub hash: u64,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientCacheMissResponse {
    pub blobs: Vec<CacheBlob>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkPos {
    pub x: i32,
    pub z: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelChunk {
    pub position: ChunkPos,
    pub dimension: i32,
    pub sub_chunk_count: u32,
    pub highest_sub_chunk: u16,
    pub cache_enabled: bool,
    pub blob_hashes: Vec<u64>,
    pub raw_payload: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubChunkEntry {
    pub offset: [i8; 3],
    pub result: u8,
    pub raw_payload: Vec<u8>,
    pub height_map_type: u8,
    pub height_map_data: Vec<i8>,
    pub blob_hash: u64,
}

impl SubChunkEntry {
    pub const RESULT_SUCCESS: u8 = 1;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubChunk {
    pub cache_enabled: bool,
    pub dimension: i32,
    pub position: [i32; 3],
    pub entries: Vec<SubChunkEntry>,
}

impl SubChunk {
    /// Column an entry belongs to.
    pub fn entry_column(&self, entry: &SubChunkEntry) -> ChunkPos {
        ChunkPos {
            x: self.position[0] + i32::from(entry.offset[0]),
            z: self.position[2] + i32::from(entry.offset[2]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_and_names() {
        let pk: Packet = Transfer {
            address: "example.net".into(),
            port: 19132,
        }
        .into();
        assert_eq!(pk.id(), ids::TRANSFER);
        assert_eq!(pk.name(), "Transfer");
        assert_eq!(<Transfer as PacketBody>::NAME, "Transfer");

        let unknown = Packet::Unknown {
            id: 0x99,
            payload: Bytes::from_static(b"x"),
        };
        assert_eq!(unknown.id(), 0x99);
        assert_eq!(unknown.name(), "Unknown");
    }

    #[test]
    fn test_login_sequence_classification() {
        assert!(Packet::from(StartGame::default()).is_login_sequence());
        assert!(Packet::from(ResourcePackChunkData::default()).is_login_sequence());
        assert!(!Packet::from(Text::default()).is_login_sequence());
        assert!(!Packet::from(LevelChunk::default()).is_login_sequence());
    }

    #[test]
    fn test_sub_chunk_entry_column() {
        let sub = SubChunk {
            position: [10, 4, -3],
            ..Default::default()
        };
        let entry = SubChunkEntry {
            offset: [1, 0, -1],
            ..Default::default()
        };
        assert_eq!(sub.entry_column(&entry), ChunkPos { x: 11, z: -4 });
    }
}
