//! Blob cache for world-content packets.
//!
//! Cacheable packets (`LevelChunk`, `SubChunk`) reference content by hash.
//! Each such packet is answered with a hit/miss status to the server; hits
//! are read from the [`BlobStore`], misses are awaited from the server's
//! `ClientCacheMissResponse`. Once every referenced blob is present the
//! packet is reassembled with the content inline and handed back as
//! resolved.
//!
//! The cache never writes to a connection itself. Every call returns a
//! [`BlobOutcome`] listing what the session should send where, so the state
//! lock is only ever held for map updates. Store reads and writes happen
//! outside the lock.

use crate::cache::blob_store::BlobStore;
use crate::core::packet::{
    CacheBlob, ChunkPos, ClientCacheBlobStatus, ClientCacheMissResponse, LevelChunk, Packet,
    SubChunk, SubChunkEntry,
};
use crate::error::{constants, ProxyError, Result};
use crate::utils::metrics::Metrics;
use bytes::Bytes;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, trace, warn};

/// Status replies are held back while this many requested hashes are in
/// flight. A reply is always sent when nothing else is outstanding, however
/// many misses it carries.
pub const MAX_INFLIGHT_BLOBS: usize = 90;

/// How the attached client takes cacheable packets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ClientMode {
    /// No client; resolved packets only go to the handler chain
    #[default]
    Detached,
    /// Client runs its own blob cache and gets the original packets
    CacheEnabled,
    /// Client needs reassembled packets
    CacheDisabled,
}

/// Work produced by one cache call.
#[derive(Debug, Default, PartialEq)]
pub struct BlobOutcome {
    /// Status replies for the server
    pub to_server: Vec<Packet>,
    /// Packets for the client: originals in cache-enabled mode and answers
    /// to the client's own blob queries
    pub to_client: Vec<Packet>,
    /// Reassembled packets in resolution order
    pub resolved: Vec<Packet>,
    /// Blobs served from the local store
    pub hits: Vec<CacheBlob>,
}

/// Result of offering a packet to the cache.
#[derive(Debug)]
pub enum Filtered {
    /// Not a blob packet; continue normally
    Pass(Packet),
    /// Consumed by the cache
    Consumed(BlobOutcome),
}

struct Waiter {
    fill: Packet,
    remaining: usize,
    blobs: HashMap<u64, Bytes>,
}

struct ClientWaiter {
    order: Vec<u64>,
    remaining: HashSet<u64>,
    blobs: HashMap<u64, Bytes>,
}

impl ClientWaiter {
    fn response(mut self) -> Packet {
        let blobs = self
            .order
            .iter()
            .filter_map(|hash| {
                self.blobs.remove(hash).map(|payload| CacheBlob {
                    hash: *hash,
                    payload: payload.to_vec(),
                })
            })
            .collect();
        Packet::ClientCacheMissResponse(ClientCacheMissResponse { blobs })
    }
}

#[derive(Default)]
struct State {
    mode: ClientMode,
    next_id: u64,
    waiters: HashMap<u64, Waiter>,
    server_waits: HashMap<u64, Vec<u64>>,
    client_waiters: HashMap<u64, ClientWaiter>,
    client_waits: HashMap<u64, Vec<u64>>,
    level_chunks_waiting: HashSet<ChunkPos>,
    subs: HashMap<ChunkPos, Vec<u64>>,
    queued: VecDeque<ClientCacheBlobStatus>,
    /// Misses registered in `server_waits` by statuses still in `queued`
    queued_misses: usize,
}

impl State {
    fn register(&mut self, fill: Packet, blobs: HashMap<u64, Bytes>) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.waiters.insert(
            id,
            Waiter {
                fill,
                remaining: 0,
                blobs,
            },
        );
        id
    }

    /// Await `hash` for waiter `id`; only the first waiter asks the server.
    fn add_server_wait(&mut self, status: &mut ClientCacheBlobStatus, id: u64, hash: u64) {
        let waiting = self.server_waits.entry(hash).or_default();
        if waiting.is_empty() {
            status.miss_hashes.push(hash);
        }
        waiting.push(id);
        if let Some(w) = self.waiters.get_mut(&id) {
            w.remaining += 1;
        }
    }

    fn remaining(&self, id: u64) -> usize {
        self.waiters.get(&id).map_or(0, |w| w.remaining)
    }

    fn resolve(&mut self, id: u64, out: &mut BlobOutcome) {
        let Some(waiter) = self.waiters.remove(&id) else {
            return;
        };

        match waiter.fill {
            Packet::LevelChunk(mut chunk) => {
                self.level_chunks_waiting.remove(&chunk.position);
                reassemble_level_chunk(&mut chunk, &waiter.blobs);
                let pos = chunk.position;
                trace!(x = pos.x, z = pos.z, "Level chunk resolved");
                out.resolved.push(Packet::LevelChunk(chunk));

                for sub in self.subs.remove(&pos).unwrap_or_default() {
                    let ready = match self.waiters.get_mut(&sub) {
                        Some(w) => {
                            w.remaining = w.remaining.saturating_sub(1);
                            w.remaining == 0
                        }
                        None => false,
                    };
                    if ready {
                        self.resolve(sub, out);
                    }
                }
            }
            Packet::SubChunk(mut sub) => {
                reassemble_sub_chunk(&mut sub, &waiter.blobs);
                out.resolved.push(Packet::SubChunk(sub));
            }
            other => out.resolved.push(other),
        }
    }

    /// Hashes the server has been asked for and not yet delivered.
    fn in_flight(&self) -> usize {
        self.server_waits.len().saturating_sub(self.queued_misses)
    }

    /// Send `status` unless the server already has enough outstanding. Its
    /// own misses are registered by now and do not count against it.
    fn send_status(&mut self, status: ClientCacheBlobStatus, out: &mut BlobOutcome) {
        if status.is_empty() {
            return;
        }
        let own = status.miss_hashes.len();
        let others = self.in_flight().saturating_sub(own);
        if !self.queued.is_empty() || others >= MAX_INFLIGHT_BLOBS {
            trace!(queued = self.queued.len() + 1, "Holding back blob status");
            self.queued_misses += own;
            self.queued.push_back(status);
        } else {
            out.to_server.push(Packet::ClientCacheBlobStatus(status));
        }
    }

    fn flush_queued(&mut self, out: &mut BlobOutcome) {
        while self.in_flight() < MAX_INFLIGHT_BLOBS {
            let Some(status) = self.queued.pop_front() else {
                break;
            };
            self.queued_misses = self.queued_misses.saturating_sub(status.miss_hashes.len());
            out.to_server.push(Packet::ClientCacheBlobStatus(status));
        }
    }
}

fn reassemble_level_chunk(chunk: &mut LevelChunk, blobs: &HashMap<u64, Bytes>) {
    if !chunk.cache_enabled {
        return;
    }
    let mut payload = Vec::with_capacity(chunk.raw_payload.len());
    for hash in &chunk.blob_hashes {
        match blobs.get(hash) {
            Some(blob) => payload.extend_from_slice(blob),
            None => warn!(hash, "Blob missing while reassembling level chunk"),
        }
    }
    payload.extend_from_slice(&chunk.raw_payload);
    chunk.raw_payload = payload;
    chunk.cache_enabled = false;
    chunk.blob_hashes.clear();
}

fn reassemble_sub_chunk(sub: &mut SubChunk, blobs: &HashMap<u64, Bytes>) {
    if !sub.cache_enabled {
        return;
    }
    for entry in sub.entries.iter_mut().filter(|e| is_cached_entry(e)) {
        match blobs.get(&entry.blob_hash) {
            Some(blob) => {
                entry.raw_payload = blob.to_vec();
                entry.blob_hash = 0;
            }
            None => warn!(hash = entry.blob_hash, "Blob missing while reassembling sub chunk"),
        }
    }
    sub.cache_enabled = false;
}

fn is_cached_entry(entry: &SubChunkEntry) -> bool {
    entry.result == SubChunkEntry::RESULT_SUCCESS && entry.blob_hash != 0
}

/// Per-session blob cache over a shared store.
pub struct BlobCache {
    store: Arc<dyn BlobStore>,
    metrics: Arc<Metrics>,
    replay: bool,
    state: Mutex<State>,
}

impl std::fmt::Debug for BlobCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobCache")
            .field("replay", &self.replay)
            .finish_non_exhaustive()
    }
}

impl BlobCache {
    pub fn new(store: Arc<dyn BlobStore>, metrics: Arc<Metrics>, replay: bool) -> Self {
        Self {
            store,
            metrics,
            replay,
            state: Mutex::new(State::default()),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| ProxyError::Custom(constants::ERR_LOCK_POISONED.into()))
    }

    pub fn set_client_mode(&self, mode: ClientMode) -> Result<()> {
        debug!(?mode, "Client blob mode");
        self.lock()?.mode = mode;
        Ok(())
    }

    pub fn client_mode(&self) -> ClientMode {
        self.lock().map(|s| s.mode).unwrap_or_default()
    }

    /// Hashes currently awaited from the server.
    pub fn inflight(&self) -> usize {
        self.lock().map(|s| s.server_waits.len()).unwrap_or(0)
    }

    fn lookup(&self, hashes: &[u64]) -> Result<Vec<(u64, Option<Bytes>)>> {
        hashes
            .iter()
            .map(|&hash| Ok((hash, self.store.get(hash)?)))
            .collect()
    }

    /// Whether the cache consumes `packet` travelling in this direction.
    pub fn handles(packet: &Packet, to_server: bool) -> bool {
        if to_server {
            matches!(packet, Packet::ClientCacheBlobStatus(_))
        } else {
            matches!(
                packet,
                Packet::LevelChunk(_) | Packet::SubChunk(_) | Packet::ClientCacheMissResponse(_)
            )
        }
    }

    /// Offer a packet from either side. Store reads and writes run on the
    /// blocking pool; packets the cache does not handle pass straight
    /// through.
    pub async fn filter(self: &Arc<Self>, packet: Packet, to_server: bool) -> Result<Filtered> {
        if !Self::handles(&packet, to_server) {
            return Ok(Filtered::Pass(packet));
        }
        let cache = Arc::clone(self);
        tokio::task::spawn_blocking(move || {
            if to_server {
                cache.filter_client(packet)
            } else {
                cache.filter_server(packet)
            }
        })
        .await
        .map_err(|e| ProxyError::Custom(format!("blob cache task failed: {e}")))?
    }

    /// Offer a packet read from the server.
    pub fn filter_server(&self, packet: Packet) -> Result<Filtered> {
        match packet {
            Packet::LevelChunk(chunk) => self.handle_level_chunk(chunk).map(Filtered::Consumed),
            Packet::SubChunk(sub) => self.handle_sub_chunk(sub).map(Filtered::Consumed),
            Packet::ClientCacheMissResponse(resp) => {
                self.handle_miss_response(resp).map(Filtered::Consumed)
            }
            other => Ok(Filtered::Pass(other)),
        }
    }

    /// Offer a packet read from the client.
    pub fn filter_client(&self, packet: Packet) -> Result<Filtered> {
        match packet {
            Packet::ClientCacheBlobStatus(status) => {
                self.handle_client_blob_status(status).map(Filtered::Consumed)
            }
            other => Ok(Filtered::Pass(other)),
        }
    }

    fn handle_level_chunk(&self, chunk: LevelChunk) -> Result<BlobOutcome> {
        let hashes = if chunk.cache_enabled {
            chunk.blob_hashes.clone()
        } else {
            Vec::new()
        };
        let lookups = self.lookup(&hashes)?;
        let original = Packet::LevelChunk(chunk.clone());
        let pos = chunk.position;

        let mut out = BlobOutcome::default();
        let mut status = ClientCacheBlobStatus::default();
        let (found, misses) = split_lookups(lookups, &mut status, &mut out);

        let mut state = self.lock()?;
        let id = state.register(Packet::LevelChunk(chunk), found);
        for &hash in &misses {
            state.add_server_wait(&mut status, id, hash);
        }
        if !misses.is_empty() {
            state.level_chunks_waiting.insert(pos);
        }
        self.finish(&mut state, id, status, original, out)
    }

    fn handle_sub_chunk(&self, sub: SubChunk) -> Result<BlobOutcome> {
        let entries: Vec<&SubChunkEntry> = sub
            .entries
            .iter()
            .filter(|e| e.result == SubChunkEntry::RESULT_SUCCESS)
            .collect();
        let columns: HashSet<ChunkPos> = entries.iter().map(|e| sub.entry_column(e)).collect();
        let hashes: Vec<u64> = if sub.cache_enabled {
            entries
                .iter()
                .filter(|e| e.blob_hash != 0)
                .map(|e| e.blob_hash)
                .collect()
        } else {
            Vec::new()
        };
        let lookups = self.lookup(&hashes)?;
        let original = Packet::SubChunk(sub.clone());

        let mut out = BlobOutcome::default();
        let mut status = ClientCacheBlobStatus::default();
        let (found, misses) = split_lookups(lookups, &mut status, &mut out);

        let mut state = self.lock()?;
        let id = state.register(Packet::SubChunk(sub), found);
        for &hash in &misses {
            state.add_server_wait(&mut status, id, hash);
        }
        for pos in columns {
            if state.level_chunks_waiting.contains(&pos) {
                state.subs.entry(pos).or_default().push(id);
                if let Some(w) = state.waiters.get_mut(&id) {
                    w.remaining += 1;
                }
            }
        }
        self.finish(&mut state, id, status, original, out)
    }

    fn finish(
        &self,
        state: &mut State,
        id: u64,
        status: ClientCacheBlobStatus,
        original: Packet,
        mut out: BlobOutcome,
    ) -> Result<BlobOutcome> {
        self.metrics
            .blob_lookup(status.hit_hashes.len() as u64, status.miss_hashes.len() as u64);
        state.send_status(status, &mut out);

        if state.remaining(id) == 0 {
            state.resolve(id, &mut out);
        }
        if state.mode == ClientMode::CacheEnabled {
            out.to_client.push(original);
        }
        Ok(out)
    }

    fn handle_miss_response(&self, resp: ClientCacheMissResponse) -> Result<BlobOutcome> {
        for blob in &resp.blobs {
            self.store.put(blob.hash, &blob.payload)?;
        }
        self.metrics.blobs_fulfilled(resp.blobs.len() as u64);

        let mut out = BlobOutcome::default();
        let mut state = self.lock()?;
        for blob in resp.blobs {
            let hash = blob.hash;
            let payload = Bytes::from(blob.payload);

            let client_ids = state.client_waits.remove(&hash).unwrap_or_default();
            let client_waited = !client_ids.is_empty();
            for cid in client_ids {
                let done = match state.client_waiters.get_mut(&cid) {
                    Some(cw) => {
                        cw.blobs.insert(hash, payload.clone());
                        cw.remaining.remove(&hash);
                        cw.remaining.is_empty()
                    }
                    None => false,
                };
                if done {
                    if let Some(cw) = state.client_waiters.remove(&cid) {
                        out.to_client.push(cw.response());
                    }
                }
            }

            match state.server_waits.remove(&hash) {
                Some(ids) => {
                    for id in ids {
                        let ready = match state.waiters.get_mut(&id) {
                            Some(w) => {
                                w.blobs.insert(hash, payload.clone());
                                w.remaining = w.remaining.saturating_sub(1);
                                w.remaining == 0
                            }
                            None => false,
                        };
                        if ready {
                            state.resolve(id, &mut out);
                        }
                    }
                }
                None if client_waited => {}
                None if self.replay => debug!(hash, "Blob nobody waited for"),
                None => warn!(hash, "Received unexpected blob hash"),
            }
        }

        state.flush_queued(&mut out);
        Ok(out)
    }

    fn handle_client_blob_status(&self, status: ClientCacheBlobStatus) -> Result<BlobOutcome> {
        let mut out = BlobOutcome::default();
        if status.miss_hashes.is_empty() {
            return Ok(out);
        }

        let mut found = HashMap::new();
        let mut pending = Vec::new();
        for (hash, blob) in self.lookup(&status.miss_hashes)? {
            match blob {
                Some(blob) => {
                    found.insert(hash, blob);
                }
                None => pending.push(hash),
            }
        }

        // A hash that left the server wait list between the store read and
        // the lock was fulfilled meanwhile and is in the store now.
        loop {
            let late = {
                let mut state = self.lock()?;
                let (awaited, late): (Vec<u64>, Vec<u64>) = std::mem::take(&mut pending)
                    .into_iter()
                    .partition(|h| state.server_waits.contains_key(h));
                if late.is_empty() {
                    let waiter = ClientWaiter {
                        order: status.miss_hashes,
                        remaining: awaited.iter().copied().collect(),
                        blobs: found,
                    };
                    if awaited.is_empty() {
                        out.to_client.push(waiter.response());
                    } else {
                        trace!(waiting = awaited.len(), "Deferring client blob reply");
                        let cid = state.next_id;
                        state.next_id += 1;
                        for hash in awaited {
                            state.client_waits.entry(hash).or_default().push(cid);
                        }
                        state.client_waiters.insert(cid, waiter);
                    }
                    return Ok(out);
                }
                pending = awaited;
                late
            };

            for (hash, blob) in self.lookup(&late)? {
                match blob {
                    Some(blob) => {
                        found.insert(hash, blob);
                    }
                    None => debug!(hash, "Client asked for a blob nobody has"),
                }
            }
        }
    }
}

fn split_lookups(
    lookups: Vec<(u64, Option<Bytes>)>,
    status: &mut ClientCacheBlobStatus,
    out: &mut BlobOutcome,
) -> (HashMap<u64, Bytes>, Vec<u64>) {
    let mut found = HashMap::new();
    let mut misses = Vec::new();
    for (hash, blob) in lookups {
        match blob {
            Some(blob) => {
                status.hit_hashes.push(hash);
                out.hits.push(CacheBlob {
                    hash,
                    payload: blob.to_vec(),
                });
                found.insert(hash, blob);
            }
            None => misses.push(hash),
        }
    }
    (found, misses)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::cache::blob_store::MemoryBlobStore;

    fn cache() -> (BlobCache, Arc<MemoryBlobStore>) {
        let store = Arc::new(MemoryBlobStore::new());
        let cache = BlobCache::new(store.clone(), Arc::new(Metrics::new()), false);
        (cache, store)
    }

    fn level_chunk(x: i32, hashes: &[u64]) -> Packet {
        Packet::LevelChunk(LevelChunk {
            position: ChunkPos { x, z: 0 },
            cache_enabled: true,
            blob_hashes: hashes.to_vec(),
            raw_payload: b"tail".to_vec(),
            ..Default::default()
        })
    }

    fn consumed(f: Filtered) -> BlobOutcome {
        match f {
            Filtered::Consumed(out) => out,
            Filtered::Pass(p) => panic!("{} was not consumed", p.name()),
        }
    }

    fn status(out: &BlobOutcome) -> Option<&ClientCacheBlobStatus> {
        out.to_server.iter().find_map(|p| match p {
            Packet::ClientCacheBlobStatus(s) => Some(s),
            _ => None,
        })
    }

    fn miss_response(blobs: &[(u64, &[u8])]) -> Packet {
        Packet::ClientCacheMissResponse(ClientCacheMissResponse {
            blobs: blobs
                .iter()
                .map(|(hash, payload)| CacheBlob {
                    hash: *hash,
                    payload: payload.to_vec(),
                })
                .collect(),
        })
    }

    #[test]
    fn test_all_hits_resolve_immediately() {
        let (cache, store) = cache();
        store.put(1, b"aa").unwrap();
        store.put(2, b"bb").unwrap();

        let out = consumed(cache.filter_server(level_chunk(0, &[1, 2])).unwrap());
        let s = status(&out).unwrap();
        assert_eq!(s.hit_hashes, vec![1, 2]);
        assert!(s.miss_hashes.is_empty());
        assert_eq!(out.hits.len(), 2);
        match &out.resolved[..] {
            [Packet::LevelChunk(c)] => {
                assert_eq!(c.raw_payload, b"aabbtail");
                assert!(!c.cache_enabled);
                assert!(c.blob_hashes.is_empty());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_cached_hash_is_never_reported_missing() {
        let (cache, _store) = cache();
        let out = consumed(cache.filter_server(level_chunk(0, &[9])).unwrap());
        assert_eq!(status(&out).unwrap().miss_hashes, vec![9]);
        consumed(cache.filter_server(miss_response(&[(9, b"x")])).unwrap());

        for x in 1..4 {
            let out = consumed(cache.filter_server(level_chunk(x, &[9])).unwrap());
            let s = status(&out).unwrap();
            assert!(s.miss_hashes.is_empty());
            assert_eq!(s.hit_hashes, vec![9]);
        }
    }

    #[test]
    fn test_fulfillment_resolves_every_waiter() {
        let (cache, store) = cache();
        let first = consumed(cache.filter_server(level_chunk(0, &[7])).unwrap());
        assert_eq!(status(&first).unwrap().miss_hashes, vec![7]);
        assert!(first.resolved.is_empty());

        // second waiter on the same hash does not ask again
        let second = consumed(cache.filter_server(level_chunk(1, &[7])).unwrap());
        assert!(second.to_server.is_empty());
        assert_eq!(cache.inflight(), 1);

        let out = consumed(cache.filter_server(miss_response(&[(7, b"blob")])).unwrap());
        assert_eq!(out.resolved.len(), 2);
        assert_eq!(cache.inflight(), 0);
        assert!(store.contains(7).unwrap());
    }

    #[test]
    fn test_unexpected_blob_is_stored_not_fatal() {
        let (cache, store) = cache();
        let out = consumed(cache.filter_server(miss_response(&[(5, b"x")])).unwrap());
        assert!(out.resolved.is_empty());
        assert!(store.contains(5).unwrap());
    }

    #[test]
    fn test_cache_enabled_client_gets_original() {
        let (cache, _) = cache();
        cache.set_client_mode(ClientMode::CacheEnabled).unwrap();
        let original = level_chunk(0, &[3]);
        let out = consumed(cache.filter_server(original.clone()).unwrap());
        assert_eq!(out.to_client, vec![original]);
    }

    #[test]
    fn test_sub_chunk_waits_for_its_level_chunk() {
        let (cache, store) = cache();
        store.put(20, b"sub").unwrap();
        consumed(cache.filter_server(level_chunk(0, &[10])).unwrap());

        let sub = Packet::SubChunk(SubChunk {
            cache_enabled: true,
            position: [0, 0, 0],
            entries: vec![SubChunkEntry {
                result: SubChunkEntry::RESULT_SUCCESS,
                blob_hash: 20,
                ..Default::default()
            }],
            ..Default::default()
        });
        let out = consumed(cache.filter_server(sub).unwrap());
        assert!(out.resolved.is_empty());

        let out = consumed(cache.filter_server(miss_response(&[(10, b"lc")])).unwrap());
        let names: Vec<_> = out.resolved.iter().map(Packet::name).collect();
        assert_eq!(names, vec!["LevelChunk", "SubChunk"]);
        match &out.resolved[1] {
            Packet::SubChunk(s) => {
                assert_eq!(s.entries[0].raw_payload, b"sub");
                assert_eq!(s.entries[0].blob_hash, 0);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_status_replies_queue_past_inflight_limit() {
        let (cache, _) = cache();
        let hashes: Vec<u64> = (1..=MAX_INFLIGHT_BLOBS as u64).collect();
        let out = consumed(cache.filter_server(level_chunk(0, &hashes)).unwrap());
        assert_eq!(out.to_server.len(), 1);

        let held = consumed(cache.filter_server(level_chunk(1, &[500])).unwrap());
        assert!(held.to_server.is_empty());

        let blobs: Vec<(u64, &[u8])> = hashes.iter().map(|h| (*h, &b"b"[..])).collect();
        let out = consumed(cache.filter_server(miss_response(&blobs)).unwrap());
        assert_eq!(status(&out).unwrap().miss_hashes, vec![500]);
    }

    #[test]
    fn test_oversized_status_is_sent_when_nothing_is_in_flight() {
        let (cache, _) = cache();
        let sub = Packet::SubChunk(SubChunk {
            cache_enabled: true,
            entries: (1..=100u64)
                .map(|hash| SubChunkEntry {
                    result: SubChunkEntry::RESULT_SUCCESS,
                    blob_hash: hash,
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        });
        let out = consumed(cache.filter_server(sub).unwrap());
        assert_eq!(status(&out).unwrap().miss_hashes.len(), 100);

        // later statuses wait for it, then go out once it is answered
        let held = consumed(cache.filter_server(level_chunk(0, &[500])).unwrap());
        assert!(held.to_server.is_empty());
        let blobs: Vec<(u64, &[u8])> = (1..=100u64).map(|h| (h, &b"b"[..])).collect();
        let out = consumed(cache.filter_server(miss_response(&blobs)).unwrap());
        assert_eq!(status(&out).unwrap().miss_hashes, vec![500]);
        assert_eq!(out.resolved.len(), 1);
    }

    #[test]
    fn test_queued_statuses_flush_in_order() {
        let (cache, _) = cache();
        let first: Vec<u64> = (1..=MAX_INFLIGHT_BLOBS as u64).collect();
        consumed(cache.filter_server(level_chunk(0, &first)).unwrap());
        let second: Vec<u64> = (1000..1000 + MAX_INFLIGHT_BLOBS as u64).collect();
        assert!(consumed(cache.filter_server(level_chunk(1, &second)).unwrap())
            .to_server
            .is_empty());
        assert!(consumed(cache.filter_server(level_chunk(2, &[5000])).unwrap())
            .to_server
            .is_empty());

        // answering the first lets the second out; the third waits its turn
        let blobs: Vec<(u64, &[u8])> = first.iter().map(|h| (*h, &b"b"[..])).collect();
        let out = consumed(cache.filter_server(miss_response(&blobs)).unwrap());
        assert_eq!(out.to_server.len(), 1);
        assert_eq!(status(&out).unwrap().miss_hashes, second);

        let blobs: Vec<(u64, &[u8])> = second.iter().map(|h| (*h, &b"b"[..])).collect();
        let out = consumed(cache.filter_server(miss_response(&blobs)).unwrap());
        assert_eq!(status(&out).unwrap().miss_hashes, vec![5000]);
    }

    #[test]
    fn test_client_query_answered_once_all_blobs_arrive() {
        let (cache, store) = cache();
        store.put(1, b"one").unwrap();
        consumed(cache.filter_server(level_chunk(0, &[2])).unwrap());

        let query = Packet::ClientCacheBlobStatus(ClientCacheBlobStatus {
            miss_hashes: vec![1, 2],
            hit_hashes: vec![],
        });
        let out = consumed(cache.filter_client(query).unwrap());
        assert!(out.to_client.is_empty());

        let out = consumed(cache.filter_server(miss_response(&[(2, b"two")])).unwrap());
        match &out.to_client[..] {
            [Packet::ClientCacheMissResponse(r)] => {
                let hashes: Vec<_> = r.blobs.iter().map(|b| b.hash).collect();
                assert_eq!(hashes, vec![1, 2]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_client_query_with_local_blobs_answers_now() {
        let (cache, store) = cache();
        store.put(4, b"four").unwrap();
        let query = Packet::ClientCacheBlobStatus(ClientCacheBlobStatus {
            miss_hashes: vec![4],
            hit_hashes: vec![],
        });
        let out = consumed(cache.filter_client(query).unwrap());
        assert_eq!(out.to_client.len(), 1);
    }

    #[tokio::test]
    async fn test_async_filter_uses_disk_store() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = Arc::new(crate::cache::blob_store::DiskBlobStore::new(dir.path()).unwrap());
        let cache = Arc::new(BlobCache::new(store.clone(), Arc::new(Metrics::new()), false));

        let text = Packet::Text(Default::default());
        assert!(matches!(
            cache.filter(text, false).await.unwrap(),
            Filtered::Pass(Packet::Text(_))
        ));

        let out = consumed(cache.filter(level_chunk(0, &[3]), false).await.unwrap());
        assert_eq!(status(&out).unwrap().miss_hashes, vec![3]);
        let out = consumed(cache.filter(miss_response(&[(3, b"ccc")]), false).await.unwrap());
        assert_eq!(out.resolved.len(), 1);
        assert_eq!(&store.get(3).unwrap().unwrap()[..], b"ccc");

        let query = Packet::ClientCacheBlobStatus(ClientCacheBlobStatus {
            miss_hashes: vec![3],
            hit_hashes: vec![],
        });
        let out = consumed(cache.filter(query, true).await.unwrap());
        assert_eq!(out.to_client.len(), 1);
    }

    struct BrokenStore;
    impl BlobStore for BrokenStore {
        fn get(&self, _: u64) -> Result<Option<Bytes>> {
            Ok(None)
        }
        fn put(&self, _: u64, _: &[u8]) -> Result<()> {
            Err(ProxyError::Io(std::io::Error::other("disk full")))
        }
    }

    #[test]
    fn test_store_write_error_is_fatal() {
        let cache = BlobCache::new(Arc::new(BrokenStore), Arc::new(Metrics::new()), false);
        assert!(cache.filter_server(miss_response(&[(1, b"x")])).is_err());
    }

    #[test]
    fn test_other_packets_pass() {
        let (cache, _) = cache();
        let text = Packet::Text(Default::default());
        assert!(matches!(cache.filter_server(text.clone()).unwrap(), Filtered::Pass(_)));
        assert!(matches!(cache.filter_client(text).unwrap(), Filtered::Pass(_)));
    }
}
