//! Capture-backed server connection.
//!
//! A [`ReplayConnector`] stands in for the server side of a session: reads
//! pull the next pcap2 record, writes go nowhere, and packs come from the
//! capture's embedded archive. End of file reads as a closed connection.

use crate::cache::pack_cache::{PackCache, ReplayPackCache};
use crate::core::packet::{GameData, Packet};
use crate::core::pool::PacketPool;
use crate::error::{constants, ProxyError, Result};
use crate::protocol::login::{ends_login, LoginQueue};
use crate::replay::pcap2::Pcap2Reader;
use crate::service::resource_packs::ResourcePackHandler;
use crate::transport::connection::Received;
use crate::utils::metrics::Metrics;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

pub struct ReplayConnector {
    reader: Pcap2Reader<BufReader<File>>,
    packs: Arc<ReplayPackCache>,
    pool: Arc<PacketPool>,
    metrics: Arc<Metrics>,
    path: PathBuf,
}

impl std::fmt::Debug for ReplayConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplayConnector")
            .field("path", &self.path)
            .field("version", &self.reader.version())
            .finish()
    }
}

impl ReplayConnector {
    #[instrument(skip(pool, metrics), fields(path = %path.as_ref().display()))]
    pub fn open(
        path: impl AsRef<Path>,
        pool: Arc<PacketPool>,
        metrics: Arc<Metrics>,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        let mut reader = Pcap2Reader::new(BufReader::new(file))?;
        let packs = Arc::new(reader.take_packs());
        info!(
            version = reader.version(),
            packs = packs.len(),
            "Opened capture for replay"
        );
        Ok(Self {
            reader,
            packs,
            pool,
            metrics,
            path,
        })
    }

    /// Packs embedded in the capture.
    pub fn pack_cache(&self) -> Arc<dyn PackCache> {
        self.packs.clone()
    }

    /// Next captured packet. End of file is [`ProxyError::ConnectionClosed`].
    pub async fn read(&mut self, cancel: &CancellationToken) -> Result<Received> {
        tokio::task::yield_now().await;
        if cancel.is_cancelled() {
            return Err(ProxyError::Cancelled);
        }
        let record = self
            .reader
            .read_record()?
            .ok_or(ProxyError::ConnectionClosed)?;
        self.metrics.frame_received(record.frame.wire_len() as u64);
        let packet = self.pool.decode_lossy(&record.frame);
        Ok(Received::new(packet, record.to_server).at(record.time()))
    }

    /// Replay the login sequence.
    ///
    /// Every record up to the client's `SetLocalPlayerAsInitialised` is queued
    /// exactly as a live session queues it. Pack packets are fed to `packs`
    /// and the start-game data is returned.
    pub async fn read_until_login(
        &mut self,
        cancel: &CancellationToken,
        packs: &Arc<ResourcePackHandler>,
        queue: &LoginQueue,
    ) -> Result<GameData> {
        let mut game = None;
        loop {
            let received = match self.read(cancel).await {
                Ok(received) => received,
                Err(ProxyError::ConnectionClosed) => {
                    return Err(ProxyError::Protocol(
                        "capture ended before login finished".to_string(),
                    ))
                }
                Err(e) => return Err(e),
            };

            let done = ends_login(&received.packet, received.to_server);
            match &received.packet {
                Packet::StartGame(start) if !received.to_server => {
                    debug!(world = %start.game_data.world_name, "Replayed start game");
                    game = Some(start.game_data.clone());
                }
                Packet::ResourcePacksInfo(info) if !received.to_server => {
                    packs.on_packs_info(info.clone()).await?;
                }
                Packet::ResourcePackStack(stack) if !received.to_server => {
                    packs.on_stack(stack.clone()).await?;
                }
                _ => {}
            }
            queue.push(received);
            if done {
                break;
            }
        }
        game.ok_or_else(|| ProxyError::Protocol(constants::ERR_NO_GAME_DATA.to_string()))
    }
}
