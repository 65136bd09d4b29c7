//! Observability and Metrics
//!
//! Per-session counters for relayed traffic, blob caching and pack transfer.
//!
//! Uses atomic counters so every relay task can record without locking.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, info};

/// Metrics collector for one session
#[derive(Debug)]
pub struct Metrics {
    /// Packets forwarded client -> server
    pub packets_to_server: AtomicU64,
    /// Packets forwarded server -> client
    pub packets_to_client: AtomicU64,
    /// Frame bytes read from either peer
    pub bytes_received: AtomicU64,
    /// Frame bytes written to either peer
    pub bytes_sent: AtomicU64,
    /// Packets a handler chose to drop
    pub packets_dropped: AtomicU64,
    /// Blob hashes found in the local store
    pub blob_hits: AtomicU64,
    /// Blob hashes requested from the server
    pub blob_misses: AtomicU64,
    /// Blobs received from the server and stored
    pub blobs_fulfilled: AtomicU64,
    /// Packs fully downloaded and verified
    pub packs_downloaded: AtomicU64,
    /// Packs served from the pack cache
    pub packs_cached: AtomicU64,
    /// Packs uploaded to the client
    pub packs_uploaded: AtomicU64,
    /// Start time for uptime calculation
    start_time: Instant,
}

impl Metrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            packets_to_server: AtomicU64::new(0),
            packets_to_client: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            packets_dropped: AtomicU64::new(0),
            blob_hits: AtomicU64::new(0),
            blob_misses: AtomicU64::new(0),
            blobs_fulfilled: AtomicU64::new(0),
            packs_downloaded: AtomicU64::new(0),
            packs_cached: AtomicU64::new(0),
            packs_uploaded: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Record a forwarded packet
    pub fn packet_relayed(&self, to_server: bool) {
        if to_server {
            self.packets_to_server.fetch_add(1, Ordering::Relaxed);
        } else {
            self.packets_to_client.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn frame_received(&self, byte_count: u64) {
        self.bytes_received.fetch_add(byte_count, Ordering::Relaxed);
    }

    pub fn frame_sent(&self, byte_count: u64) {
        self.bytes_sent.fetch_add(byte_count, Ordering::Relaxed);
    }

    pub fn packet_dropped(&self) {
        self.packets_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn blob_lookup(&self, hits: u64, misses: u64) {
        self.blob_hits.fetch_add(hits, Ordering::Relaxed);
        self.blob_misses.fetch_add(misses, Ordering::Relaxed);
    }

    pub fn blobs_fulfilled(&self, count: u64) {
        self.blobs_fulfilled.fetch_add(count, Ordering::Relaxed);
    }

    pub fn pack_downloaded(&self) {
        self.packs_downloaded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn pack_cached(&self) {
        self.packs_cached.fetch_add(1, Ordering::Relaxed);
    }

    pub fn pack_uploaded(&self) {
        self.packs_uploaded.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            packets_to_server: self.packets_to_server.load(Ordering::Relaxed),
            packets_to_client: self.packets_to_client.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            packets_dropped: self.packets_dropped.load(Ordering::Relaxed),
            blob_hits: self.blob_hits.load(Ordering::Relaxed),
            blob_misses: self.blob_misses.load(Ordering::Relaxed),
            blobs_fulfilled: self.blobs_fulfilled.load(Ordering::Relaxed),
            packs_downloaded: self.packs_downloaded.load(Ordering::Relaxed),
            packs_cached: self.packs_cached.load(Ordering::Relaxed),
            packs_uploaded: self.packs_uploaded.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    /// Log current metrics
    pub fn log_summary(&self) {
        let snapshot = self.snapshot();
        info!(
            packets_to_server = snapshot.packets_to_server,
            packets_to_client = snapshot.packets_to_client,
            bytes_received = snapshot.bytes_received,
            bytes_sent = snapshot.bytes_sent,
            packets_dropped = snapshot.packets_dropped,
            blob_hits = snapshot.blob_hits,
            blob_misses = snapshot.blob_misses,
            blobs_fulfilled = snapshot.blobs_fulfilled,
            packs_downloaded = snapshot.packs_downloaded,
            packs_cached = snapshot.packs_cached,
            packs_uploaded = snapshot.packs_uploaded,
            uptime_seconds = snapshot.uptime_seconds,
            "Session metrics"
        );
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub packets_to_server: u64,
    pub packets_to_client: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub packets_dropped: u64,
    pub blob_hits: u64,
    pub blob_misses: u64,
    pub blobs_fulfilled: u64,
    pub packs_downloaded: u64,
    pub packs_cached: u64,
    pub packs_uploaded: u64,
    pub uptime_seconds: u64,
}

/// Timer for measuring operation duration
pub struct Timer {
    start: Instant,
    operation: &'static str,
}

impl Timer {
    /// Start timing an operation
    pub fn start(operation: &'static str) -> Self {
        Self {
            start: Instant::now(),
            operation,
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        let duration = self.start.elapsed();
        debug!(
            operation = self.operation,
            duration_ms = duration.as_millis(),
            "Operation completed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let m = Metrics::new();
        m.packet_relayed(true);
        m.packet_relayed(false);
        m.packet_relayed(false);
        m.blob_lookup(3, 2);
        m.blobs_fulfilled(2);
        let s = m.snapshot();
        assert_eq!(s.packets_to_server, 1);
        assert_eq!(s.packets_to_client, 2);
        assert_eq!(s.blob_hits, 3);
        assert_eq!(s.blob_misses, 2);
        assert_eq!(s.blobs_fulfilled, 2);
    }
}
