//! # Capture and Replay
//!
//! Sessions can be recorded to pcap2 files and replayed later in place of a
//! live server.
//!
//! ## Components
//! - **pcap2**: Capture file reader/writer with seeking
//! - **Archive**: Pack archive embedded in a capture header
//! - **Capture**: Handler that records a live session
//! - **Connector**: Capture-backed server connection
//!
//! ## File Format
//! ```text
//! "BTCP" | version:u32 | archive_size:u64 | archive | records...
//! ```

pub mod archive;
pub mod capture;
pub mod connector;
pub mod pcap2;

pub use capture::PacketCapturer;
pub use connector::ReplayConnector;
pub use pcap2::{Pcap2Reader, Pcap2Writer, Record};
