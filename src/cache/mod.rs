//! # Caches
//!
//! Stores shared across sessions: complete resource packs and content blobs.
//! Both tolerate concurrent readers and only ever expose complete entries.

pub mod blob_store;
pub mod pack;
pub mod pack_cache;

pub use blob_store::{open_blob_store, BlobStore, DiskBlobStore, MemoryBlobStore};
pub use pack::{PackId, ResourcePack};
pub use pack_cache::{DiskPackCache, PackCache, PackWriter, ReplayPackCache};
