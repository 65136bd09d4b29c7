//! # packet-relay
//!
//! Man-in-the-middle relay for a binary game protocol.
//!
//! The relay sits between a game client and a remote server, decodes every
//! packet and hands it to a chain of [`PacketHandler`]s that may inspect,
//! rewrite or drop it. Resource packs are downloaded once and kept in a
//! [`PackCache`]; world content is served from a hash-addressed
//! [`BlobStore`]. A session can be captured to a pcap2 file and replayed
//! later as if it were a live server.
//!
//! ## Modules
//! - [`core`]: Frame codec, typed packets, id registry
//! - [`transport`]: Client listener and server connections
//! - [`protocol`]: Handler chain and login helpers
//! - [`service`]: Sessions, resource packs, blob cache
//! - [`cache`]: Pack cache and blob store
//! - [`replay`]: pcap2 capture and replay
//! - [`config`], [`error`], [`utils`]
//!
//! ## Example
//! ```no_run
//! use packet_relay::config::ProxyConfig;
//! use packet_relay::protocol::{HandlerChain, PacketLogger};
//! use packet_relay::service::Proxy;
//! use std::sync::Arc;
//!
//! # async fn run() -> packet_relay::error::Result<()> {
//! let config = ProxyConfig::default_with_overrides(|c| {
//!     c.proxy.server_address = "play.example.net:19132".into();
//! });
//! let chain = HandlerChain::new().with(Arc::new(PacketLogger));
//! Proxy::new(config, chain)?.run().await
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod core;
pub mod error;
pub mod protocol;
pub mod replay;
pub mod service;
pub mod transport;
pub mod utils;

pub use cache::{BlobStore, PackCache};
pub use error::{ProxyError, Result};
pub use protocol::PacketHandler;
