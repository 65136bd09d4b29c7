//! # Utility Modules
//!
//! Supporting utilities for compression, logging and metrics.
//!
//! ## Components
//! - **Compression**: LZ4 per-record and zstd whole-stream compression for captures
//! - **Logging**: `tracing-subscriber` setup from [`LoggingConfig`](crate::config::LoggingConfig)
//! - **Metrics**: Atomic per-session counters

pub mod compression;
pub mod logging;
pub mod metrics;

pub use metrics::{Metrics, MetricsSnapshot};
