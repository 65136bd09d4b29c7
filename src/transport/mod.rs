//! # Transport Layer
//!
//! TCP connections to the client and the remote server.
//!
//! ## Components
//! - **Connection**: Framed reader/writer halves, server dialing with timeout
//! - **Listener**: Single-client listener that turns away extra clients
//!
//! Reads observe the session's cancellation token, so cancelling a session
//! unblocks every relay task on its next read.

pub mod connection;
pub mod listener;

pub use connection::{dial, split, PacketReader, PacketWriter, Peer, Received};
pub use listener::{Accepted, ClientListener};
