//! Resource pack negotiation.
//!
//! The handler sits between the server's pack sub-protocol and the client's.
//! Server side: every advertised pack is served from the [`PackCache`] when
//! possible, fetched over HTTP when it carries a URL, and otherwise downloaded
//! chunk by chunk. Client side: packs the client asks for are announced and
//! uploaded with the same chunked protocol from an upload queue, so a slow
//! client never stalls the server path.
//!
//! Chunk indices must arrive (and be requested) in strictly increasing order
//! in both directions; anything else fails the session.

use crate::cache::pack::{chunk_count, PackId, ResourcePack};
use crate::cache::pack_cache::PackCache;
use crate::config::{MAX_FRAME_SIZE, PACK_CHUNK_SIZE};
use crate::core::packet::{
    Packet, ResourcePackChunkData, ResourcePackChunkRequest, ResourcePackClientResponse,
    ResourcePackDataInfo, ResourcePackStack, ResourcePacksInfo, StackResourcePack,
    TexturePackInfo,
};
use crate::error::{constants, ProxyError, Result};
use crate::protocol::handler::HandlerChain;
use crate::service::context::{Latch, SessionContext, WaitGroup};
use crate::transport::connection::PacketWriter;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Packs the game always has, whether or not the server lists them.
pub const EXEMPT_PACKS: &[&str] = &["0fba4063-dba1-4281-9b89-ff9390653530_1.0.0"];

#[derive(Debug)]
struct DownloadEntry {
    id: PackId,
    size: u64,
    content_key: String,
}

struct ActiveDownload {
    uuid: Uuid,
    label: String,
    expected_index: u32,
    chunks: mpsc::UnboundedSender<ResourcePackChunkData>,
}

struct Upload {
    pack: ResourcePack,
    offset: u64,
}

#[derive(Default)]
struct PackState {
    remote_info: Option<ResourcePacksInfo>,
    stack: Option<ResourcePackStack>,
    /// uuid -> announced size -> entry
    downloading: HashMap<Uuid, HashMap<u64, DownloadEntry>>,
    active: Option<ActiveDownload>,
    download_queue: Option<mpsc::UnboundedSender<ResourcePackDataInfo>>,
    finished: Vec<ResourcePack>,
    skipped: HashSet<PackId>,
    requested_from_server: HashSet<PackId>,
    client_requested: bool,
    all_packs_downloaded: bool,
    uploads: HashMap<Uuid, Upload>,
    upload_queue: Option<mpsc::UnboundedSender<ResourcePack>>,
}

/// Drives the pack sub-protocol for one session.
pub struct ResourcePackHandler {
    ctx: SessionContext,
    cache: Arc<dyn PackCache>,
    chain: HandlerChain,
    server: PacketWriter,
    client: Option<PacketWriter>,
    added: Vec<ResourcePack>,
    replay: bool,
    chunk_size: u32,
    http: reqwest::Client,
    state: Mutex<PackState>,
    info_received: Latch,
    stack_received: Latch,
    know_requested: Latch,
    client_done: Latch,
    url_downloads: WaitGroup,
}

impl std::fmt::Debug for ResourcePackHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourcePackHandler")
            .field("client", &self.client.is_some())
            .field("added", &self.added.len())
            .field("replay", &self.replay)
            .finish()
    }
}

impl ResourcePackHandler {
    pub fn new(
        ctx: SessionContext,
        cache: Arc<dyn PackCache>,
        chain: HandlerChain,
        server: PacketWriter,
        client: Option<PacketWriter>,
    ) -> Result<Self> {
        let http = reqwest::Client::builder().build()?;
        Ok(Self {
            ctx,
            cache,
            chain,
            server,
            client,
            added: Vec::new(),
            replay: false,
            chunk_size: PACK_CHUNK_SIZE,
            http,
            state: Mutex::new(PackState::default()),
            info_received: Latch::new(),
            stack_received: Latch::new(),
            know_requested: Latch::new(),
            client_done: Latch::new(),
            url_downloads: WaitGroup::new(),
        })
    }

    /// Packs offered to the client on top of the server's.
    pub fn with_added_packs(mut self, packs: Vec<ResourcePack>) -> Self {
        self.added = packs;
        self
    }

    /// Serve packs only from the cache and never write to the server.
    pub fn replaying(mut self) -> Self {
        self.replay = true;
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: u32) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    fn lock(&self) -> Result<MutexGuard<'_, PackState>> {
        self.state
            .lock()
            .map_err(|_| ProxyError::Custom(constants::ERR_LOCK_POISONED.to_string()))
    }

    /// Every pack finished so far, in completion order.
    pub fn resource_packs(&self) -> Vec<ResourcePack> {
        self.lock().map(|s| s.finished.clone()).unwrap_or_default()
    }

    pub fn stack(&self) -> Option<ResourcePackStack> {
        self.lock().ok().and_then(|s| s.stack.clone())
    }

    pub fn stack_received(&self) -> bool {
        self.stack_received.is_open()
    }

    /// Pack info as the client should see it: the server's packs without
    /// download URLs or skipped packs, followed by the added packs.
    pub fn client_info(&self) -> Option<ResourcePacksInfo> {
        let state = self.lock().ok()?;
        let mut info = state.remote_info.clone()?;
        info.texture_packs.retain(|tp| {
            PackId::from_parts(&tp.uuid, &tp.version)
                .map(|id| !state.skipped.contains(&id))
                .unwrap_or(true)
        });
        for tp in &mut info.texture_packs {
            tp.download_url.clear();
        }
        info.texture_packs.extend(self.added.iter().map(|p| TexturePackInfo {
            uuid: p.id.uuid.to_string(),
            version: p.id.version.clone(),
            size: p.len(),
            content_key: p.content_key.clone(),
            sub_pack_name: p.sub_pack_name.clone(),
            ..Default::default()
        }));
        Some(info)
    }

    fn finish_pack(&self, pack: ResourcePack) -> Result<()> {
        debug!(pack = %pack.id, size = pack.len(), "Pack finished");
        self.chain.finished_pack(&pack)?;
        self.lock()?.finished.push(pack);
        Ok(())
    }

    fn has_pack(&self, uuid: &str, version: &str) -> Result<bool> {
        if uuid.is_empty() {
            return Ok(true);
        }
        let id = PackId::from_parts(uuid, version)?;
        if EXEMPT_PACKS.contains(&id.to_string().as_str()) {
            return Ok(true);
        }
        if self.added.iter().any(|p| p.id == id) {
            return Ok(true);
        }
        let state = self.lock()?;
        Ok(state.skipped.contains(&id) || state.finished.iter().any(|p| p.id == id))
    }

    // ---------------------------------------------------------------
    // Server side
    // ---------------------------------------------------------------

    /// Handle the server's pack list.
    #[instrument(skip_all, fields(packs = info.texture_packs.len()))]
    pub async fn on_packs_info(self: &Arc<Self>, info: ResourcePacksInfo) -> Result<()> {
        let mut seen = HashSet::new();
        let mut cached = Vec::new();
        let mut from_url = Vec::new();
        let mut skipped = Vec::new();
        let mut to_download = Vec::new();

        for tp in &info.texture_packs {
            let id = PackId::from_parts(&tp.uuid, &tp.version)?;
            if self.chain.filter_resource_pack(&id) {
                debug!(pack = %id, "Pack skipped by handler");
                skipped.push(id);
                continue;
            }
            if !seen.insert(id.uuid) {
                warn!(pack = %id, "Duplicate pack in pack info");
                continue;
            }
            if self.cache.has(&id) {
                let pack = self
                    .cache
                    .get(&id)?
                    .ok_or_else(|| ProxyError::UnknownPack(id.to_string()))?;
                cached.push(pack.with_content_key(tp.content_key.clone()));
                continue;
            }
            if self.replay {
                warn!(pack = %id, "Pack missing from capture");
                continue;
            }
            if !tp.download_url.is_empty() {
                from_url.push(tp.clone());
                continue;
            }
            to_download.push(DownloadEntry {
                id,
                size: tp.size,
                content_key: tp.content_key.clone(),
            });
        }

        let download_ids: Vec<String> = to_download.iter().map(|e| e.id.to_string()).collect();
        {
            let mut state = self.lock()?;
            state.skipped.extend(skipped);
            for entry in to_download {
                state
                    .downloading
                    .entry(entry.id.uuid)
                    .or_default()
                    .insert(entry.size, entry);
            }
            state.remote_info = Some(info);
        }

        for pack in cached {
            self.ctx.metrics().pack_cached();
            self.finish_pack(pack)?;
        }

        self.url_downloads.add(from_url.len());
        for tp in from_url {
            let this = Arc::clone(self);
            tokio::spawn(async move {
                if let Err(e) = this.download_from_url(&tp).await {
                    error!(url = %tp.download_url, error = %e, "Pack download failed");
                    this.ctx.fail(e);
                }
                this.url_downloads.done();
            });
        }
        self.info_received.open();

        if let Some(client) = &self.client {
            if let Some(client_info) = self.client_info() {
                client.write(&Packet::ResourcePacksInfo(client_info)).await?;
            }
            self.know_requested.wait(&self.ctx).await?;
        }

        if self.replay {
            return Ok(());
        }

        if download_ids.is_empty() {
            self.url_downloads.wait(&self.ctx).await?;
            info!("All packs available, skipping download");
            return self
                .respond(ResourcePackClientResponse::ALL_PACKS_DOWNLOADED, Vec::new())
                .await;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        self.lock()?.download_queue = Some(tx);
        tokio::spawn(Arc::clone(self).run_downloads(rx));

        info!(count = download_ids.len(), "Requesting packs from server");
        self.respond(ResourcePackClientResponse::SEND_PACKS, download_ids)
            .await
    }

    async fn respond(&self, response: u8, packs: Vec<String>) -> Result<()> {
        self.server
            .write(&Packet::ResourcePackClientResponse(
                ResourcePackClientResponse {
                    response,
                    packs_to_download: packs,
                },
            ))
            .await
    }

    async fn run_downloads(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<ResourcePackDataInfo>) {
        loop {
            let info = tokio::select! {
                _ = self.ctx.cancelled() => return,
                next = rx.recv() => match next {
                    Some(info) => info,
                    None => return,
                },
            };
            if let Err(e) = self.download(info).await {
                error!(error = %e, "Pack download failed");
                self.ctx.fail(e);
                return;
            }
        }
    }

    /// Queue a data-info announcement for the download worker.
    pub fn on_data_info(&self, info: ResourcePackDataInfo) -> Result<()> {
        if self.replay {
            return Ok(());
        }
        let state = self.lock()?;
        let queue = state
            .download_queue
            .as_ref()
            .ok_or_else(|| ProxyError::UnknownPack(info.uuid.clone()))?;
        queue.send(info).map_err(|_| ProxyError::Cancelled)
    }

    /// Route a chunk to the active download, checking its pack and index.
    pub fn on_chunk_data(&self, chunk: ResourcePackChunkData) -> Result<()> {
        if self.replay {
            return Ok(());
        }
        let uuid = PackId::uuid_of(&chunk.uuid)?;
        let mut state = self.lock()?;
        let active = state.active.as_mut().ok_or_else(|| {
            ProxyError::Protocol(constants::ERR_CHUNK_WITHOUT_DOWNLOAD.to_string())
        })?;
        if uuid != active.uuid {
            return Err(ProxyError::UnknownPack(chunk.uuid));
        }
        if chunk.chunk_index != active.expected_index {
            return Err(ProxyError::ChunkOrder {
                pack: active.label.clone(),
                expected: active.expected_index,
                got: chunk.chunk_index,
            });
        }
        active.expected_index += 1;
        active.chunks.send(chunk).map_err(|_| ProxyError::Cancelled)
    }

    async fn request_chunk(&self, uuid: &str, index: u32) -> Result<()> {
        self.server
            .write(&Packet::ResourcePackChunkRequest(ResourcePackChunkRequest {
                uuid: uuid.to_string(),
                chunk_index: index,
            }))
            .await
    }

    #[instrument(skip_all, fields(pack = %info.uuid, size = info.size))]
    async fn download(self: &Arc<Self>, info: ResourcePackDataInfo) -> Result<()> {
        let uuid = PackId::uuid_of(&info.uuid)?;
        let (entry, mut chunks) = {
            let mut state = self.lock()?;
            let sizes = state
                .downloading
                .get_mut(&uuid)
                .ok_or_else(|| ProxyError::UnknownPack(info.uuid.clone()))?;
            let mut entry = match sizes.remove(&info.size) {
                Some(entry) => entry,
                None => {
                    let Some(&announced) = sizes.keys().next() else {
                        return Err(ProxyError::UnknownPack(info.uuid.clone()));
                    };
                    sizes
                        .remove(&announced)
                        .ok_or_else(|| ProxyError::UnknownPack(info.uuid.clone()))?
                }
            };
            if sizes.is_empty() {
                state.downloading.remove(&uuid);
            }
            if entry.size != info.size {
                warn!(announced = entry.size, "Pack size differs from pack info");
                entry.size = info.size;
            }
            let (tx, rx) = mpsc::unbounded_channel();
            state.active = Some(ActiveDownload {
                uuid,
                label: info.uuid.clone(),
                expected_index: 0,
                chunks: tx,
            });
            (entry, rx)
        };

        let chunk_size = info.data_chunk_size;
        if chunk_size == 0 && entry.size > 0 {
            return Err(ProxyError::Protocol(format!(
                "pack {} announced a zero chunk size",
                entry.id
            )));
        }
        let total_chunks = chunk_count(entry.size, chunk_size);
        debug!(chunks = total_chunks, chunk_size, "Downloading pack");

        let mut writer = self.cache.create(&entry.id)?;
        if let Some(w) = writer.as_mut() {
            w.set_pack_type(info.pack_type);
        }
        let mut data = Vec::with_capacity(entry.size.min(MAX_FRAME_SIZE as u64) as usize);
        let mut hasher = Sha256::new();

        if total_chunks > 0 {
            self.request_chunk(&info.uuid, 0).await?;
            let mut requested = 1;
            loop {
                let chunk = tokio::select! {
                    _ = self.ctx.cancelled() => return Err(ProxyError::Cancelled),
                    next = chunks.recv() => next.ok_or(ProxyError::Cancelled)?,
                };
                let written = data.len() as u64;
                let last = written + u64::from(chunk_size) >= entry.size;
                if !last && chunk.data.len() != chunk_size as usize {
                    return Err(ProxyError::Protocol(format!(
                        "resource pack chunk data had a length of {}, but expected {}",
                        chunk.data.len(),
                        chunk_size
                    )));
                }
                if chunk.data_offset != written {
                    return Err(ProxyError::Protocol(format!(
                        "resource pack chunk data had offset {}, but expected {}",
                        chunk.data_offset, written
                    )));
                }
                let received = written + chunk.data.len() as u64;
                if received > entry.size {
                    return Err(ProxyError::SizeMismatch {
                        pack: entry.id.to_string(),
                        expected: entry.size,
                        actual: received,
                    });
                }

                hasher.update(&chunk.data);
                if let Some(w) = writer.as_mut() {
                    w.write_all(&chunk.data).await?;
                }
                data.extend_from_slice(&chunk.data);

                if last {
                    break;
                }
                if requested < total_chunks {
                    self.request_chunk(&info.uuid, requested).await?;
                    requested += 1;
                }
            }
        }

        if data.len() as u64 != entry.size {
            return Err(ProxyError::SizeMismatch {
                pack: entry.id.to_string(),
                expected: entry.size,
                actual: data.len() as u64,
            });
        }
        if hasher.finalize().as_slice() != info.hash.as_slice() {
            return Err(ProxyError::HashMismatch(entry.id.to_string()));
        }
        if let Some(w) = writer {
            w.commit().await?;
        }

        let pack = ResourcePack::new(entry.id, data)
            .with_content_key(entry.content_key)
            .with_pack_type(info.pack_type);
        self.ctx.metrics().pack_downloaded();
        self.finish_pack(pack.clone())?;

        let (requested_by_client, all_done) = {
            let mut state = self.lock()?;
            state.active = None;
            let all_done = state.downloading.is_empty();
            if all_done {
                state.download_queue = None;
            }
            (state.requested_from_server.contains(&pack.id), all_done)
        };
        if requested_by_client {
            self.queue_upload(pack)?;
        }

        if all_done {
            self.url_downloads.wait(&self.ctx).await?;
            info!("Finished downloading packs");
            self.respond(ResourcePackClientResponse::ALL_PACKS_DOWNLOADED, Vec::new())
                .await?;
        }
        Ok(())
    }

    #[instrument(skip_all, fields(url = %tp.download_url))]
    async fn download_from_url(&self, tp: &TexturePackInfo) -> Result<()> {
        let id = PackId::from_parts(&tp.uuid, &tp.version)?;
        info!(pack = %id, "Downloading pack over HTTP");
        let fetch = async {
            let response = self
                .http
                .get(&tp.download_url)
                .send()
                .await?
                .error_for_status()?;
            Ok::<_, ProxyError>(response.bytes().await?)
        };
        let data = tokio::select! {
            _ = self.ctx.cancelled() => return Err(ProxyError::Cancelled),
            data = fetch => data?,
        };

        if let Some(mut w) = self.cache.create(&id)? {
            w.write_all(&data).await?;
            w.commit().await?;
        }
        let pack = ResourcePack::new(id, data).with_content_key(tp.content_key.clone());
        self.ctx.metrics().pack_downloaded();
        self.finish_pack(pack.clone())?;

        if self.client.is_some() {
            self.know_requested.wait(&self.ctx).await?;
            if self.lock()?.requested_from_server.contains(&pack.id) {
                self.queue_upload(pack)?;
            }
        }
        Ok(())
    }

    /// Validate the server's stack and acknowledge it once every pack is in
    /// place.
    #[instrument(skip_all)]
    pub async fn on_stack(&self, mut stack: ResourcePackStack) -> Result<()> {
        let texture_uuids: HashSet<String> =
            stack.texture_packs.iter().map(|p| p.uuid.clone()).collect();
        stack.behaviour_packs.retain(|bp| {
            let collides = texture_uuids.contains(&bp.uuid);
            if collides {
                warn!(pack = %bp.uuid, "Dropping behaviour pack that shares a texture pack's uuid");
            }
            !collides
        });

        for p in stack.texture_packs.iter().chain(&stack.behaviour_packs) {
            if !self.has_pack(&p.uuid, &p.version)? {
                return Err(ProxyError::UnknownPack(format!("{}_{}", p.uuid, p.version)));
            }
        }

        let mut texture_packs: Vec<StackResourcePack> = self
            .added
            .iter()
            .map(|p| StackResourcePack {
                uuid: p.id.uuid.to_string(),
                version: p.id.version.clone(),
                sub_pack_name: p.sub_pack_name.clone(),
            })
            .collect();
        texture_packs.append(&mut stack.texture_packs);
        stack.texture_packs = texture_packs;

        self.lock()?.stack = Some(stack);
        self.stack_received.open();
        debug!("Received pack stack");

        if self.replay {
            return Ok(());
        }
        if self.client.is_some() {
            self.client_done.wait(&self.ctx).await?;
        }
        self.url_downloads.wait(&self.ctx).await?;
        self.respond(ResourcePackClientResponse::COMPLETED, Vec::new())
            .await
    }

    // ---------------------------------------------------------------
    // Client side
    // ---------------------------------------------------------------

    /// Handle the client's pack response.
    pub async fn on_client_response(
        self: &Arc<Self>,
        response: ResourcePackClientResponse,
    ) -> Result<()> {
        match response.response {
            ResourcePackClientResponse::REFUSED => {
                info!("Client refused resource packs");
                self.client_done.open();
                Err(ProxyError::Disconnected(
                    "client refused resource packs".to_string(),
                ))
            }
            ResourcePackClientResponse::SEND_PACKS => {
                self.lock()?.client_requested = true;
                self.process_client_request(response.packs_to_download)
                    .await
            }
            ResourcePackClientResponse::ALL_PACKS_DOWNLOADED => {
                let requested = {
                    let mut state = self.lock()?;
                    if state.all_packs_downloaded {
                        debug!("Duplicate all packs downloaded from client");
                        return Ok(());
                    }
                    state.all_packs_downloaded = true;
                    state.client_requested
                };
                if !requested {
                    self.know_requested.open();
                }
                self.stack_received.wait(&self.ctx).await?;
                let stack = self.stack().unwrap_or_default();
                if let Some(client) = &self.client {
                    client.write(&Packet::ResourcePackStack(stack)).await?;
                }
                Ok(())
            }
            ResourcePackClientResponse::COMPLETED => {
                debug!("Client finished resource packs");
                self.client_done.open();
                Ok(())
            }
            other => Err(ProxyError::Protocol(format!(
                "unknown resource pack client response {other}"
            ))),
        }
    }

    async fn process_client_request(self: &Arc<Self>, packs: Vec<String>) -> Result<()> {
        self.info_received.wait(&self.ctx).await?;

        let content_keys: HashMap<PackId, String> = {
            let state = self.lock()?;
            state
                .remote_info
                .iter()
                .flat_map(|info| &info.texture_packs)
                .filter_map(|tp| {
                    PackId::from_parts(&tp.uuid, &tp.version)
                        .ok()
                        .filter(|id| !state.skipped.contains(id))
                        .map(|id| (id, tp.content_key.clone()))
                })
                .collect()
        };

        let mut ready = Vec::new();
        let mut from_server = HashSet::new();
        for name in packs {
            let id: PackId = name.parse()?;
            if let Some(pack) = self.added.iter().find(|p| p.id == id) {
                ready.push(pack.clone());
            } else if self.cache.has(&id) {
                let pack = self
                    .cache
                    .get(&id)?
                    .ok_or_else(|| ProxyError::UnknownPack(name.clone()))?;
                let key = content_keys.get(&id).cloned().unwrap_or_default();
                ready.push(pack.with_content_key(key));
            } else if content_keys.contains_key(&id) {
                from_server.insert(id);
            } else {
                return Err(ProxyError::UnknownPack(name));
            }
        }

        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut state = self.lock()?;
            state.requested_from_server = from_server;
            state.upload_queue = Some(tx.clone());
        }
        for pack in ready {
            tx.send(pack).map_err(|_| ProxyError::Cancelled)?;
        }
        tokio::spawn(Arc::clone(self).run_uploads(rx));
        self.know_requested.open();
        Ok(())
    }

    fn queue_upload(&self, pack: ResourcePack) -> Result<()> {
        if let Some(queue) = &self.lock()?.upload_queue {
            queue.send(pack).map_err(|_| ProxyError::Cancelled)?;
        }
        Ok(())
    }

    async fn run_uploads(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<ResourcePack>) {
        loop {
            let pack = tokio::select! {
                _ = self.ctx.cancelled() => return,
                next = rx.recv() => match next {
                    Some(pack) => pack,
                    None => return,
                },
            };
            if let Err(e) = self.announce_upload(pack).await {
                error!(error = %e, "Failed to announce pack to client");
                self.ctx.fail(e);
                return;
            }
        }
    }

    async fn announce_upload(&self, pack: ResourcePack) -> Result<()> {
        let Some(client) = &self.client else {
            return Ok(());
        };
        let info = ResourcePackDataInfo {
            uuid: pack.id.to_string(),
            data_chunk_size: self.chunk_size,
            chunk_count: pack.chunk_count(self.chunk_size),
            size: pack.len(),
            hash: pack.checksum().to_vec(),
            premium: false,
            pack_type: pack.pack_type,
        };
        debug!(pack = %pack.id, chunks = info.chunk_count, "Announcing pack to client");
        self.lock()?
            .uploads
            .insert(pack.id.uuid, Upload { pack, offset: 0 });
        client.write(&Packet::ResourcePackDataInfo(info)).await
    }

    /// Answer a client chunk request. Requests must follow the upload offset.
    pub async fn on_chunk_request(&self, request: ResourcePackChunkRequest) -> Result<()> {
        let uuid = PackId::uuid_of(&request.uuid)?;
        let (chunk, finished) = {
            let mut state = self.lock()?;
            let upload = state
                .uploads
                .get_mut(&uuid)
                .ok_or_else(|| ProxyError::UnknownPack(request.uuid.clone()))?;
            let expected = (upload.offset / u64::from(self.chunk_size)) as u32;
            if request.chunk_index != expected {
                return Err(ProxyError::ChunkOrder {
                    pack: upload.pack.id.to_string(),
                    expected,
                    got: request.chunk_index,
                });
            }
            let data = upload
                .pack
                .chunk(request.chunk_index, self.chunk_size)
                .unwrap_or_default();
            let chunk = ResourcePackChunkData {
                uuid: request.uuid.clone(),
                chunk_index: request.chunk_index,
                data_offset: upload.offset,
                data: data.to_vec(),
            };
            upload.offset += data.len() as u64;
            let finished = upload.offset >= upload.pack.len();
            if finished {
                state.uploads.remove(&uuid);
            }
            (chunk, finished)
        };

        if finished {
            self.ctx.metrics().pack_uploaded();
            debug!(pack = %request.uuid, "Finished uploading pack");
        }
        match &self.client {
            Some(client) => client.write(&Packet::ResourcePackChunkData(chunk)).await,
            None => Ok(()),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::cache::pack_cache::ReplayPackCache;
    use crate::core::pool::PacketPool;
    use crate::transport::connection::{split, PacketReader, Peer};
    use crate::utils::metrics::Metrics;
    use tokio_util::sync::CancellationToken;

    const PACK: &str = "5c1f2a1e-7c38-4d0b-9a42-2b3d2b6e4f11_1.2.0";

    fn peer() -> (PacketWriter, PacketReader) {
        let (a, b) = tokio::io::duplex(1 << 20);
        let pool = Arc::new(PacketPool::standard());
        let metrics = Arc::new(Metrics::new());
        let (_, writer) = split(a, Peer::Server, pool.clone(), metrics.clone());
        let (reader, _) = split(b, Peer::Client, pool, metrics);
        (writer, reader)
    }

    fn handler(cache: ReplayPackCache, server: PacketWriter) -> Arc<ResourcePackHandler> {
        Arc::new(
            ResourcePackHandler::new(
                SessionContext::default(),
                Arc::new(cache),
                HandlerChain::new(),
                server,
                None,
            )
            .unwrap(),
        )
    }

    fn info_for(size: u64) -> ResourcePacksInfo {
        let (uuid, version) = PACK.split_once('_').unwrap();
        ResourcePacksInfo {
            texture_packs: vec![TexturePackInfo {
                uuid: uuid.into(),
                version: version.into(),
                size,
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_cached_pack_finishes_without_download() {
        let mut cache = ReplayPackCache::new();
        cache.insert(PACK.parse().unwrap(), vec![1u8; 10]);
        let (server, mut server_side) = peer();
        let h = handler(cache, server);

        h.on_packs_info(info_for(10)).await.unwrap();
        assert_eq!(h.resource_packs().len(), 1);

        let sent = server_side.read(&CancellationToken::new()).await.unwrap();
        match sent.packet {
            Packet::ResourcePackClientResponse(r) => {
                assert_eq!(r.response, ResourcePackClientResponse::ALL_PACKS_DOWNLOADED);
                assert!(r.packs_to_download.is_empty());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_chunk_without_download_is_protocol_error() {
        let (server, _server_side) = peer();
        let h = handler(ReplayPackCache::new(), server);
        let err = h
            .on_chunk_data(ResourcePackChunkData {
                uuid: PACK.into(),
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(err, ProxyError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_stack_drops_colliding_behaviour_pack() {
        let mut cache = ReplayPackCache::new();
        cache.insert(PACK.parse().unwrap(), vec![1u8; 4]);
        let (server, _server_side) = peer();
        let h = Arc::new(
            ResourcePackHandler::new(
                SessionContext::default(),
                Arc::new(cache),
                HandlerChain::new(),
                server,
                None,
            )
            .unwrap()
            .replaying(),
        );
        h.on_packs_info(info_for(4)).await.unwrap();

        let (uuid, version) = PACK.split_once('_').unwrap();
        let entry = StackResourcePack {
            uuid: uuid.into(),
            version: version.into(),
            sub_pack_name: String::new(),
        };
        h.on_stack(ResourcePackStack {
            texture_packs: vec![entry.clone()],
            behaviour_packs: vec![entry],
            ..Default::default()
        })
        .await
        .unwrap();

        let stack = h.stack().unwrap();
        assert_eq!(stack.texture_packs.len(), 1);
        assert!(stack.behaviour_packs.is_empty());
    }

    #[tokio::test]
    async fn test_stack_with_missing_pack_is_unknown_pack() {
        let (server, _server_side) = peer();
        let h = Arc::new(
            ResourcePackHandler::new(
                SessionContext::default(),
                Arc::new(ReplayPackCache::new()),
                HandlerChain::new(),
                server,
                None,
            )
            .unwrap()
            .replaying(),
        );
        h.on_packs_info(info_for(4)).await.unwrap();

        let (uuid, version) = PACK.split_once('_').unwrap();
        let (exempt_uuid, exempt_version) = EXEMPT_PACKS[0].split_once('_').unwrap();
        let err = h
            .on_stack(ResourcePackStack {
                texture_packs: vec![
                    StackResourcePack {
                        uuid: exempt_uuid.into(),
                        version: exempt_version.into(),
                        sub_pack_name: String::new(),
                    },
                    StackResourcePack {
                        uuid: uuid.into(),
                        version: version.into(),
                        sub_pack_name: String::new(),
                    },
                ],
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::UnknownPack(p) if p == PACK));
    }
}
