//! # Session Services
//!
//! Everything that runs for the lifetime of one proxied session.
//!
//! ## Components
//! - **Session**: Connect, log in, relay, close; [`Proxy`] follows transfers
//! - **Resource Packs**: Pack discovery, chunked download and re-upload
//! - **Blob Cache**: Hash-based world content cache
//! - **Context**: Cancellation, first-error slot, latches and wait groups
//!
//! All tasks of a session share one [`SessionContext`]; cancelling it stops
//! every task at its next blocking call.

pub mod blob_cache;
pub mod context;
pub mod resource_packs;
pub mod session;

pub use blob_cache::{BlobCache, ClientMode};
pub use context::SessionContext;
pub use resource_packs::ResourcePackHandler;
pub use session::{Proxy, Session, SessionEnd, SessionState};
