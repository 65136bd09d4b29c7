//! # Error Types
//!
//! Error handling for the relay, its caches and the capture format.
//!
//! ## Error Categories
//! - **I/O Errors**: Network and file system failures
//! - **Codec Errors**: Invalid frame headers, oversized frames, undecodable packets
//! - **Protocol Desync**: Out-of-order chunks, size or hash mismatches, unknown packs.
//!   These are always fatal to the session and never retried.
//! - **Transport Errors**: Closed connections, cancellation, peer disconnects
//! - **Capture Errors**: Corrupted or unsupported pcap2 files
//!
//! A server-initiated transfer is not an error; see
//! [`SessionEnd`](crate::service::session::SessionEnd).
//!
//! ## Example Usage
//! ```rust
//! use packet_relay::error::{ProxyError, Result};
//! use std::fs::File;
//! use std::io::Read;
//! use tracing::{error, info};
//!
//! fn read_file(path: &str) -> Result<String> {
//!     let mut file = File::open(path).map_err(ProxyError::Io)?;
//!     let mut contents = String::new();
//!     file.read_to_string(&mut contents).map_err(ProxyError::Io)?;
//!     Ok(contents)
//! }
//!
//! fn main() {
//!     match read_file("example.txt") {
//!         Ok(contents) => info!(contents, "Successfully read file"),
//!         Err(e) => error!(error=%e, "Error reading file"),
//!     }
//! }
//! ```

use std::io;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    /// Codec errors
    pub const ERR_INVALID_HEADER: &str = "Invalid frame header";
    pub const ERR_OVERSIZED_PACKET: &str = "Frame exceeds maximum size";

    /// Connection errors
    pub const ERR_CONNECTION_CLOSED: &str = "Connection closed";
    pub const ERR_CANCELLED: &str = "Session cancelled";
    pub const ERR_DIAL_TIMEOUT: &str = "Timed out dialing the remote server";

    /// Login errors
    pub const ERR_EXPECTED_LOGIN: &str = "First client packet was not a login packet";
    pub const ERR_ALREADY_CONNECTED: &str = "You are already connected!";
    pub const ERR_NO_GAME_DATA: &str = "Server spawned without sending start game data";

    /// Resource pack errors
    pub const ERR_CHUNK_WITHOUT_DOWNLOAD: &str =
        "resource pack chunk data for resource pack that was not being downloaded";

    /// Capture errors
    pub const ERR_BAD_CAPTURE_MAGIC: &str = "not a pcap2 capture (bad magic)";
    pub const ERR_BAD_RECORD_MAGIC: &str = "record start magic mismatch";
    pub const ERR_BAD_RECORD_TRAILER: &str = "record trailer magic mismatch";
    pub const ERR_TRUNCATED_RECORD: &str = "record truncated";
    pub const ERR_SEEK_UNSUPPORTED: &str = "capture version < 5 cannot seek";

    /// Synchronization errors
    pub const ERR_LOCK_POISONED: &str = "Synchronization primitive poisoned";
}

/// ProxyError is the primary error type for all relay operations
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Invalid frame header")]
    InvalidHeader,

    #[error("Packet too large: {0} bytes")]
    OversizedPacket(usize),

    #[error("Failed to decode packet {name} (0x{id:02x}): {reason}")]
    Decode {
        id: u32,
        name: &'static str,
        reason: String,
    },

    #[error("Decoding packet 0x{0:02x} panicked")]
    DecodePanic(u32),

    #[error("Unknown packet id 0x{0:02x}")]
    UnknownPacket(u32),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("chunk for {pack} had index {got}, but expected {expected}")]
    ChunkOrder {
        pack: String,
        expected: u32,
        got: u32,
    },

    #[error("incorrect resource pack size for {pack}: expected {expected}, but got {actual}")]
    SizeMismatch {
        pack: String,
        expected: u64,
        actual: u64,
    },

    #[error("resource pack download error, hash mismatch in download {0}")]
    HashMismatch(String),

    #[error("unknown resource pack {0}")]
    UnknownPack(String),

    #[error("Corrupt capture: {0}")]
    CorruptCapture(String),

    #[error("Unsupported capture version: {0}")]
    UnsupportedCaptureVersion(u32),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Session cancelled")]
    Cancelled,

    #[error("{0}")]
    Disconnected(String),

    #[error("Timeout occurred")]
    Timeout,

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Compression failed")]
    CompressionFailure,

    #[error("Decompression failed")]
    DecompressionFailure,

    #[error("Custom error: {0}")]
    Custom(String),
}

impl ProxyError {
    /// Errors that mean the two peers no longer agree on protocol state.
    pub fn is_desync(&self) -> bool {
        matches!(
            self,
            ProxyError::ChunkOrder { .. }
                | ProxyError::SizeMismatch { .. }
                | ProxyError::HashMismatch(_)
                | ProxyError::UnknownPack(_)
                | ProxyError::Protocol(_)
        )
    }

    /// Errors that only mean a connection went away.
    pub fn is_transport(&self) -> bool {
        match self {
            ProxyError::ConnectionClosed | ProxyError::Cancelled => true,
            ProxyError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::NotConnected
            ),
            _ => false,
        }
    }
}

impl From<reqwest::Error> for ProxyError {
    fn from(e: reqwest::Error) -> Self {
        ProxyError::Http(e.to_string())
    }
}

/// Type alias for Results using ProxyError
pub type Result<T> = std::result::Result<T, ProxyError>;
