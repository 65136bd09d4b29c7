//! # Protocol Layer
//!
//! Session-level protocol pieces that sit above the packet codec.
//!
//! ## Components
//! - **Handler**: [`PacketHandler`] trait and the ordered [`HandlerChain`]
//! - **Login**: Login-phase packet queue and transfer helpers
//!
//! ## Handler Contract
//! `on_packet` is called at most once per packet per direction, in arrival
//! order. Returning `None` drops the packet; packets flagged `pre_login` were
//! already consumed by the relay and are never forwarded.

pub mod handler;
pub mod login;

pub use handler::{HandlerChain, PacketHandler, PacketLogger};
pub use login::LoginQueue;
