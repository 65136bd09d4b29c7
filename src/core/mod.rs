//! # Core Protocol Components
//!
//! Frame codec, typed packets and the id registry.
//!
//! ## Components
//! - **Codec**: Tokio codec for length-prefixed frames over byte streams
//! - **Packet**: Typed packet bodies and the [`Packet`](packet::Packet) enum
//! - **Pool**: Id to decode/encode function registry
//!
//! ## Wire Format
//! ```text
//! [Length(4, BE)] [Packet Id(4, BE)] [Body(N)]
//! ```
//!
//! ## Security
//! - Maximum frame size: 16MB, checked before allocation
//! - Decoder panics are caught and turned into errors

pub mod codec;
pub mod packet;
pub mod pool;

pub use codec::{Frame, FrameCodec};
pub use packet::{Packet, PacketBody};
pub use pool::PacketPool;
