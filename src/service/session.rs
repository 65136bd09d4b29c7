//! Sessions.
//!
//! A [`Session`] owns one server connection (or a capture standing in for
//! one) and at most one client. It moves through
//! `Connecting → LoginExchange → Spawning → Relaying → Closing`:
//!
//! - **Connecting**: accept the client and dial the server concurrently. The
//!   dial waits until a client is connecting when one is expected.
//! - **LoginExchange / Spawning**: two login loops run side by side, feeding
//!   the [`ResourcePackHandler`] and queueing every packet they read. The
//!   phase ends when the server spawns the player and the client reports
//!   itself initialised.
//! - **Relaying**: the queued packets are replayed into the handler chain,
//!   then one task per direction relays packets through the [`BlobCache`]
//!   and the chain.
//!
//! A server `Transfer` ends the session with [`SessionEnd::Transfer`]; the
//! [`Proxy`] driver follows it with a new session.

use crate::cache::blob_store::{open_blob_store, BlobStore};
use crate::cache::pack::ResourcePack;
use crate::cache::pack_cache::{DiskPackCache, PackCache};
use crate::config::{ProxyConfig, ProxySettings};
use crate::core::packet::{
    ClientCacheStatus, Disconnect, GameData, Login, Packet, PlayStatus,
    SetLocalPlayerAsInitialised, Transfer,
};
use crate::core::pool::PacketPool;
use crate::error::{constants, ProxyError, Result};
use crate::protocol::handler::HandlerChain;
use crate::protocol::login::{default_login, transfer_to_self, LoginQueue};
use crate::replay::capture::PacketCapturer;
use crate::replay::connector::ReplayConnector;
use crate::service::blob_cache::{BlobCache, BlobOutcome, ClientMode, Filtered};
use crate::service::context::{Latch, SessionContext};
use crate::service::resource_packs::ResourcePackHandler;
use crate::transport::connection::{dial, PacketReader, PacketWriter, Received};
use crate::transport::listener::ClientListener;
use crate::utils::metrics::Metrics;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::SystemTime;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// How a session ended without error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    Closed,
    /// The server moved the player to `host:port`
    Transfer(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    LoginExchange,
    Spawning,
    Relaying,
    Closing,
}

enum Upstream {
    Live(PacketReader),
    Replay(ReplayConnector),
}

impl Upstream {
    async fn read(&mut self, cancel: &CancellationToken) -> Result<Received> {
        match self {
            Upstream::Live(reader) => reader.read(cancel).await,
            Upstream::Replay(connector) => connector.read(cancel).await,
        }
    }
}

#[derive(Default)]
struct Shared {
    login: Option<Login>,
    game: Option<GameData>,
    disconnect_reason: Option<String>,
    server_disconnect: Option<String>,
    expect_disconnect: bool,
    transfer: Option<String>,
}

fn client_mode(cache_enabled: bool) -> ClientMode {
    if cache_enabled {
        ClientMode::CacheEnabled
    } else {
        ClientMode::CacheDisabled
    }
}

/// Per-session relay state shared by the login loops and relay tasks.
struct Relay {
    ctx: SessionContext,
    chain: HandlerChain,
    server: PacketWriter,
    client: Option<PacketWriter>,
    packs: Arc<ResourcePackHandler>,
    blobs: Arc<BlobCache>,
    queue: LoginQueue,
    replay: bool,
    blob_cache_enabled: bool,
    client_login: Latch,
    state: Arc<watch::Sender<SessionState>>,
    shared: Mutex<Shared>,
}

impl Relay {
    fn shared(&self) -> Result<MutexGuard<'_, Shared>> {
        self.shared
            .lock()
            .map_err(|_| ProxyError::Custom(constants::ERR_LOCK_POISONED.to_string()))
    }

    fn set_state(&self, state: SessionState) {
        debug!(state = ?state, "Session state");
        self.state.send_replace(state);
    }

    async fn to_client(&self, packet: &Packet) -> Result<()> {
        match &self.client {
            Some(client) => client.write(packet).await,
            None => Ok(()),
        }
    }

    async fn server_login(&self, reader: &mut PacketReader) -> Result<()> {
        let login = if self.client.is_some() {
            self.client_login.wait(&self.ctx).await?;
            self.shared()?.login.clone().unwrap_or_else(default_login)
        } else {
            default_login()
        };
        self.server.write(&Packet::Login(login)).await?;
        self.server
            .write(&Packet::ClientCacheStatus(ClientCacheStatus {
                enabled: self.blob_cache_enabled,
            }))
            .await?;

        loop {
            let received = reader.read(self.ctx.token()).await?;
            let packet = received.packet.clone();
            self.queue.push(received);

            match packet {
                Packet::PlayStatus(status) => match status.status {
                    PlayStatus::LOGIN_SUCCESS => {
                        debug!("Server accepted login");
                        self.to_client(&Packet::PlayStatus(status)).await?;
                    }
                    PlayStatus::PLAYER_SPAWN => {
                        info!("Player spawned");
                        self.to_client(&Packet::PlayStatus(status)).await?;
                        if self.client.is_none() {
                            let init = SetLocalPlayerAsInitialised {
                                entity_runtime_id: self
                                    .shared()?
                                    .game
                                    .as_ref()
                                    .map(|g| g.entity_runtime_id)
                                    .unwrap_or_default(),
                            };
                            let packet = Packet::SetLocalPlayerAsInitialised(init);
                            self.server.write(&packet).await?;
                            self.queue.push(Received::new(packet, true));
                        }
                        return Ok(());
                    }
                    other => {
                        return Err(ProxyError::Disconnected(format!(
                            "login failed with status {other}"
                        )))
                    }
                },
                Packet::Disconnect(d) => {
                    self.shared()?.disconnect_reason = Some(d.message.clone());
                    return Err(ProxyError::Disconnected(d.message));
                }
                Packet::ResourcePacksInfo(info) => self.packs.on_packs_info(info).await?,
                Packet::ResourcePackDataInfo(info) => self.packs.on_data_info(info)?,
                Packet::ResourcePackChunkData(chunk) => self.packs.on_chunk_data(chunk)?,
                Packet::ResourcePackStack(stack) => self.packs.on_stack(stack).await?,
                Packet::StartGame(start) => {
                    self.shared()?.game = Some(start.game_data.clone());
                    self.set_state(SessionState::Spawning);
                    self.to_client(&Packet::StartGame(start)).await?;
                }
                _ => {}
            }
        }
    }

    async fn client_login(&self, reader: &mut PacketReader) -> Result<()> {
        let first = reader.read(self.ctx.token()).await?;
        let Packet::Login(login) = first.packet.clone() else {
            return Err(ProxyError::Protocol(constants::ERR_EXPECTED_LOGIN.to_string()));
        };
        self.queue.push(first);
        info!(player = %login.client_data.display_name, "Client logging in");
        self.blobs
            .set_client_mode(client_mode(login.client_data.client_cache_enabled))?;
        self.shared()?.login = Some(login);
        self.client_login.open();

        loop {
            let received = reader.read(self.ctx.token()).await?;
            let packet = received.packet.clone();
            self.queue.push(received);

            match packet {
                Packet::ClientCacheStatus(status) => {
                    self.blobs.set_client_mode(client_mode(status.enabled))?
                }
                Packet::ResourcePackClientResponse(response) => {
                    self.packs.on_client_response(response).await?
                }
                Packet::ResourcePackChunkRequest(request) => {
                    self.packs.on_chunk_request(request).await?
                }
                Packet::SetLocalPlayerAsInitialised(init) => {
                    self.server
                        .write(&Packet::SetLocalPlayerAsInitialised(init))
                        .await?;
                    return Ok(());
                }
                _ => {}
            }
        }
    }

    /// Run one packet through the blob cache and the chain, then forward it.
    /// Returns false once the session should stop.
    async fn relay(&self, received: Received) -> Result<bool> {
        let Received {
            packet,
            to_server,
            received_at,
            ..
        } = received;
        let filtered = self.blobs.filter(packet, to_server).await?;
        match filtered {
            Filtered::Pass(packet) => self.deliver(packet, to_server, received_at).await,
            Filtered::Consumed(outcome) => {
                self.apply(outcome, received_at).await?;
                Ok(true)
            }
        }
    }

    async fn apply(&self, outcome: BlobOutcome, time: SystemTime) -> Result<()> {
        for packet in &outcome.to_server {
            self.server.write(packet).await?;
        }
        for packet in &outcome.to_client {
            self.to_client(packet).await?;
        }
        if !outcome.hits.is_empty() {
            self.chain.blobs(&outcome.hits);
        }

        let forward = self.blobs.client_mode() == ClientMode::CacheDisabled;
        for packet in outcome.resolved {
            match self.chain.packet(packet, false, time, false)? {
                Some(packet) if forward => {
                    self.to_client(&packet).await?;
                    self.ctx.metrics().packet_relayed(false);
                }
                Some(_) => {}
                None => self.ctx.metrics().packet_dropped(),
            }
        }
        Ok(())
    }

    async fn deliver(&self, packet: Packet, to_server: bool, time: SystemTime) -> Result<bool> {
        let Some(packet) = self.chain.packet(packet, to_server, time, false)? else {
            self.ctx.metrics().packet_dropped();
            return Ok(true);
        };

        if !to_server {
            match &packet {
                Packet::Transfer(transfer) => return self.on_transfer(transfer).await,
                Packet::Disconnect(d) => {
                    info!(reason = %d.message, "Server disconnected");
                    self.shared()?.server_disconnect = Some(d.message.clone());
                    if let Err(e) = self.to_client(&packet).await {
                        debug!(error = %e, "Failed to forward disconnect");
                    }
                    return Ok(false);
                }
                _ => {}
            }
        }

        let dest = if to_server {
            Some(&self.server)
        } else {
            self.client.as_ref()
        };
        if let Some(dest) = dest {
            if let Err(e) = dest.write(&packet).await {
                if e.is_transport() && !matches!(e, ProxyError::Cancelled) {
                    self.shared()?.disconnect_reason = Some(e.to_string());
                }
                return Err(e);
            }
        }
        self.ctx.metrics().packet_relayed(to_server);
        Ok(true)
    }

    async fn on_transfer(&self, transfer: &Transfer) -> Result<bool> {
        let target = format!("{}:{}", transfer.address, transfer.port);
        if self.replay {
            debug!(target = %target, "Replayed transfer");
            return Ok(true);
        }
        info!(target = %target, "Server transferred the session");

        if let Some(client) = &self.client {
            let address = self
                .shared()?
                .login
                .as_ref()
                .map(|l| l.client_data.server_address.clone())
                .unwrap_or_default();
            let own = transfer_to_self(&address)?;
            client.write(&Packet::Transfer(own)).await?;
        }
        self.shared()?.transfer = Some(target);
        Ok(false)
    }

    async fn pump_server(self: Arc<Self>, mut upstream: Upstream) -> Result<()> {
        loop {
            let received = match upstream.read(self.ctx.token()).await {
                Ok(received) => received,
                Err(ProxyError::ConnectionClosed) => {
                    info!("Server connection closed");
                    return Ok(());
                }
                Err(e) => return Err(e),
            };
            if !self.relay(received).await? {
                return Ok(());
            }
        }
    }

    async fn pump_client(self: Arc<Self>, mut reader: PacketReader) -> Result<()> {
        loop {
            let received = match reader.read(self.ctx.token()).await {
                Ok(received) => received,
                Err(ProxyError::ConnectionClosed) => {
                    info!("Client disconnected");
                    return Ok(());
                }
                Err(e) => return Err(e),
            };
            if !self.relay(received).await? {
                return Ok(());
            }
        }
    }

    /// Show the login queue to the chain. `pre_login` packets are never
    /// forwarded.
    async fn drain_login_queue(&self) -> Result<bool> {
        for received in self.queue.drain() {
            if received.pre_login {
                self.chain.packet(
                    received.packet,
                    received.to_server,
                    received.received_at,
                    true,
                )?;
                continue;
            }
            if !self.relay(received).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn end(&self) -> Result<SessionEnd> {
        let shared = self.shared()?;
        if let Some(target) = &shared.transfer {
            return Ok(SessionEnd::Transfer(target.clone()));
        }
        match &shared.server_disconnect {
            Some(reason) if !shared.expect_disconnect => {
                Err(ProxyError::Disconnected(reason.clone()))
            }
            _ => Ok(SessionEnd::Closed),
        }
    }

    async fn close(&self, result: &Result<SessionEnd>) {
        self.set_state(SessionState::Closing);
        self.ctx.cancel();

        if let Some(client) = &self.client {
            let (transferred, reason, forwarded) = match self.shared() {
                Ok(shared) => (
                    shared.transfer.is_some(),
                    shared.disconnect_reason.clone(),
                    shared.server_disconnect.is_some(),
                ),
                Err(_) => (false, None, false),
            };
            if !transferred && !forwarded {
                let reason = reason.unwrap_or_else(|| match result {
                    Err(e) => e.to_string(),
                    Ok(_) => constants::ERR_CONNECTION_CLOSED.to_string(),
                });
                if let Err(e) = client
                    .write_final(&Packet::Disconnect(Disconnect::new(reason)))
                    .await
                {
                    debug!(error = %e, "Failed to send disconnect to client");
                }
            }
            if let Err(e) = client.close().await {
                debug!(error = %e, "Failed to close client connection");
            }
        }
        if let Err(e) = self.server.close().await {
            debug!(error = %e, "Failed to close server connection");
        }
    }
}

/// One proxied connection from connect to close.
pub struct Session {
    settings: ProxySettings,
    chain: HandlerChain,
    pack_cache: Arc<dyn PackCache>,
    blob_store: Arc<dyn BlobStore>,
    blob_cache_enabled: bool,
    listener: Option<ClientListener>,
    pool: Arc<PacketPool>,
    metrics: Arc<Metrics>,
    state: Arc<watch::Sender<SessionState>>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("server", &self.settings.server_address)
            .field("chain", &self.chain)
            .finish()
    }
}

impl Session {
    pub fn new(
        settings: ProxySettings,
        chain: HandlerChain,
        pack_cache: Arc<dyn PackCache>,
        blob_store: Arc<dyn BlobStore>,
    ) -> Self {
        Self {
            settings,
            chain,
            pack_cache,
            blob_store,
            blob_cache_enabled: true,
            listener: None,
            pool: Arc::new(PacketPool::standard()),
            metrics: Arc::new(Metrics::new()),
            state: Arc::new(watch::channel(SessionState::Connecting).0),
        }
    }

    /// Use an already bound listener instead of binding `listen_address`.
    pub fn with_listener(mut self, listener: ClientListener) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn with_blob_cache(mut self, enabled: bool) -> Self {
        self.blob_cache_enabled = enabled;
        self
    }

    pub fn with_pool(mut self, pool: Arc<PacketPool>) -> Self {
        self.pool = pool;
        self
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }

    pub fn state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Run the session to completion.
    #[instrument(skip_all, fields(server = %self.settings.server_address))]
    pub async fn run(mut self) -> Result<SessionEnd> {
        let ctx = SessionContext::new(self.metrics.clone());
        self.chain.session_start(&self.settings.server_address)?;

        let result = self.run_session(&ctx).await;

        ctx.cancel();
        self.state.send_replace(SessionState::Closing);
        self.metrics.log_summary();
        self.chain.session_end();
        match &result {
            Ok(end) => info!(end = ?end, "Session ended"),
            Err(e) => warn!(error = %e, "Session failed"),
        }
        result
    }

    async fn run_session(&mut self, ctx: &SessionContext) -> Result<SessionEnd> {
        let replay = self.settings.is_replay();
        let added = self
            .settings
            .added_packs
            .iter()
            .map(|path| ResourcePack::from_file(path))
            .collect::<Result<Vec<_>>>()?;

        self.state.send_replace(SessionState::Connecting);
        let connected = self.connect(ctx, replay).await?;
        let (client_reader, client_writer, rejector) = match connected.client {
            Some((reader, writer, rejector)) => (Some(reader), Some(writer), Some(rejector)),
            None => (None, None, None),
        };

        let mut packs = ResourcePackHandler::new(
            ctx.clone(),
            connected.pack_cache,
            self.chain.clone(),
            connected.server.clone(),
            client_writer.clone(),
        )?
        .with_added_packs(added);
        if replay {
            packs = packs.replaying();
        }

        let relay = Arc::new(Relay {
            ctx: ctx.clone(),
            chain: self.chain.clone(),
            server: connected.server,
            client: client_writer,
            packs: Arc::new(packs),
            blobs: Arc::new(BlobCache::new(
                self.blob_store.clone(),
                self.metrics.clone(),
                replay,
            )),
            queue: LoginQueue::new(),
            replay,
            blob_cache_enabled: self.blob_cache_enabled,
            client_login: Latch::new(),
            state: self.state.clone(),
            shared: Mutex::new(Shared::default()),
        });

        let result = drive(&relay, connected.upstream, client_reader).await;
        relay.close(&result).await;
        if let Some(rejector) = rejector {
            if let Err(e) = rejector.await {
                debug!(error = %e, "Listener task failed");
            }
        }
        result
    }

    async fn connect(&mut self, ctx: &SessionContext, replay: bool) -> Result<Connected> {
        if replay {
            let connector = ReplayConnector::open(
                &self.settings.server_address,
                self.pool.clone(),
                self.metrics.clone(),
            )?;
            return Ok(Connected {
                pack_cache: connector.pack_cache(),
                upstream: Upstream::Replay(connector),
                server: PacketWriter::discard(),
                client: None,
            });
        }

        let listener = match self.listener.take() {
            Some(listener) => Some(listener),
            None if self.settings.with_client => {
                Some(ClientListener::bind(&self.settings.listen_address).await?)
            }
            None => None,
        };

        let connecting = Latch::new();
        let accept = async {
            let Some(listener) = listener else {
                return Ok(None);
            };
            let accepted = listener
                .accept(self.pool.clone(), self.metrics.clone(), ctx.token().clone())
                .await?;
            debug!(peer = %accepted.peer, "Client connecting");
            connecting.open();
            Ok::<_, ProxyError>(Some((accepted.reader, accepted.writer, accepted.rejector)))
        };
        let with_client = self.settings.with_client;
        let dial_server = async {
            if with_client {
                connecting.wait(ctx).await?;
            }
            dial(
                &self.settings.server_address,
                self.settings.dial_timeout,
                self.pool.clone(),
                self.metrics.clone(),
            )
            .await
        };

        let (client, (reader, server)) = tokio::try_join!(accept, dial_server)?;
        Ok(Connected {
            pack_cache: self.pack_cache.clone(),
            upstream: Upstream::Live(reader),
            server: server.with_cancel(ctx.token().clone()),
            client,
        })
    }
}

struct Connected {
    pack_cache: Arc<dyn PackCache>,
    upstream: Upstream,
    server: PacketWriter,
    client: Option<(PacketReader, PacketWriter, JoinHandle<()>)>,
}

async fn drive(
    relay: &Arc<Relay>,
    upstream: Upstream,
    mut client_reader: Option<PacketReader>,
) -> Result<SessionEnd> {
    relay.set_state(SessionState::LoginExchange);
    let upstream = match upstream {
        Upstream::Replay(mut connector) => {
            let game = connector
                .read_until_login(relay.ctx.token(), &relay.packs, &relay.queue)
                .await?;
            relay.shared()?.game = Some(game);
            Upstream::Replay(connector)
        }
        Upstream::Live(mut reader) => {
            let client_side = async {
                match client_reader.as_mut() {
                    Some(client) => relay.client_login(client).await,
                    None => Ok(()),
                }
            };
            tokio::try_join!(relay.server_login(&mut reader), client_side)?;
            Upstream::Live(reader)
        }
    };

    let game = relay
        .shared()?
        .game
        .clone()
        .ok_or_else(|| ProxyError::Protocol(constants::ERR_NO_GAME_DATA.to_string()))?;
    if relay
        .chain
        .login_complete(&game, &relay.packs.resource_packs())?
    {
        info!("Handler ended the session after login");
        relay.shared()?.expect_disconnect = true;
        return Ok(SessionEnd::Closed);
    }

    relay.set_state(SessionState::Relaying);
    if !relay.drain_login_queue().await? {
        return relay.end();
    }

    let mut tasks = JoinSet::new();
    tasks.spawn(Arc::clone(relay).pump_server(upstream));
    if let Some(reader) = client_reader {
        tasks.spawn(Arc::clone(relay).pump_client(reader));
    }

    let mut outcome = Ok(());
    while let Some(joined) = tasks.join_next().await {
        relay.ctx.cancel();
        let result = joined
            .map_err(|e| ProxyError::Custom(format!("relay task failed: {e}")))
            .and_then(|r| r);
        if let Err(e) = result {
            if outcome.is_ok() && !matches!(e, ProxyError::Cancelled) {
                outcome = Err(e);
            }
        }
    }
    outcome?;
    if let Some(e) = relay.ctx.take_error() {
        return Err(e);
    }
    relay.end()
}

/// Runs sessions back to back, following server transfers.
pub struct Proxy {
    config: ProxyConfig,
    chain: HandlerChain,
    pack_cache: Arc<dyn PackCache>,
    blob_store: Arc<dyn BlobStore>,
    pool: Arc<PacketPool>,
}

impl std::fmt::Debug for Proxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Proxy")
            .field("server", &self.config.proxy.server_address)
            .field("chain", &self.chain)
            .finish()
    }
}

impl Proxy {
    pub fn new(config: ProxyConfig, chain: HandlerChain) -> Result<Self> {
        config.validate_strict()?;
        let pack_cache: Arc<dyn PackCache> =
            Arc::new(DiskPackCache::new(config.cache.pack_dir.clone())?);
        let blob_store = open_blob_store(config.cache.blob_dir.clone());
        Ok(Self {
            config,
            chain,
            pack_cache,
            blob_store,
            pool: Arc::new(PacketPool::standard()),
        })
    }

    fn session_chain(&self, settings: &ProxySettings) -> Result<HandlerChain> {
        let mut chain = HandlerChain::new();
        if settings.capture {
            chain.push(Arc::new(PacketCapturer::in_dir(
                &settings.capture_dir,
                &settings.server_address,
                self.pool.clone(),
            )?));
        }
        chain.extend(&self.chain);
        Ok(chain)
    }

    /// Run until a session ends without a transfer.
    pub async fn run(&self) -> Result<()> {
        let mut settings = self.config.proxy.clone();
        loop {
            let session = Session::new(
                settings.clone(),
                self.session_chain(&settings)?,
                self.pack_cache.clone(),
                self.blob_store.clone(),
            )
            .with_blob_cache(self.config.cache.blob_cache_enabled)
            .with_pool(self.pool.clone());

            match session.run().await? {
                SessionEnd::Closed => return Ok(()),
                SessionEnd::Transfer(target) => {
                    info!(target = %target, "Following transfer");
                    settings.server_address = target;
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_client_mode_from_cache_flag() {
        assert_eq!(client_mode(true), ClientMode::CacheEnabled);
        assert_eq!(client_mode(false), ClientMode::CacheDisabled);
    }

    #[tokio::test]
    async fn test_replay_of_missing_capture_fails() {
        let dir = tempfile::tempdir().unwrap();
        let settings = ProxySettings {
            server_address: dir.path().join("missing.pcap2").display().to_string(),
            with_client: false,
            ..Default::default()
        };
        let session = Session::new(
            settings,
            HandlerChain::new(),
            Arc::new(DiskPackCache::new(dir.path().join("packs")).unwrap()),
            Arc::new(crate::cache::blob_store::MemoryBlobStore::new()),
        );
        let state = session.state();
        assert!(matches!(session.run().await, Err(ProxyError::Io(_))));
        assert_eq!(*state.borrow(), SessionState::Closing);
    }
}
