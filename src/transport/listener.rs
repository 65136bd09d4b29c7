//! Client-facing listener.
//!
//! A session serves exactly one client. The first accepted connection
//! becomes the session's client; any later connection is told it is already
//! connected and closed, until the session is cancelled.

use crate::core::codec::FrameCodec;
use crate::core::packet::{Disconnect, Packet};
use crate::core::pool::PacketPool;
use crate::error::{constants, ProxyError, Result};
use crate::transport::connection::{split, PacketReader, PacketWriter, Peer};
use crate::utils::metrics::Metrics;
use futures::SinkExt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// A client accepted by [`ClientListener::accept`].
#[derive(Debug)]
pub struct Accepted {
    pub reader: PacketReader,
    pub writer: PacketWriter,
    pub peer: SocketAddr,
    /// Task turning away later clients; ends once the session is cancelled
    pub rejector: JoinHandle<()>,
}

/// Listener waiting for the session's client.
#[derive(Debug)]
pub struct ClientListener {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl ClientListener {
    #[instrument]
    pub async fn bind(addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!(address = %local_addr, "Listening for client");
        Ok(Self {
            listener,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept the first client, then keep turning away extra clients in the
    /// background until `cancel` fires.
    #[instrument(skip_all, fields(address = %self.local_addr))]
    pub async fn accept(
        self,
        pool: Arc<PacketPool>,
        metrics: Arc<Metrics>,
        cancel: CancellationToken,
    ) -> Result<Accepted> {
        let (stream, peer) = tokio::select! {
            _ = cancel.cancelled() => return Err(ProxyError::Cancelled),
            accepted = self.listener.accept() => accepted?,
        };
        stream.set_nodelay(true)?;
        info!(peer = %peer, "Client connected");

        let (reader, writer) = split(stream, Peer::Client, pool.clone(), metrics);
        let writer = writer.with_cancel(cancel.clone());
        let rejector = tokio::spawn(reject_extra_clients(self.listener, pool, cancel));
        Ok(Accepted {
            reader,
            writer,
            peer,
            rejector,
        })
    }
}

async fn reject_extra_clients(
    listener: TcpListener,
    pool: Arc<PacketPool>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Listener closed");
                return;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    warn!(peer = %peer, "Rejecting second client");
                    if let Err(e) = reject(stream, &pool).await {
                        debug!(peer = %peer, error = %e, "Failed to notify rejected client");
                    }
                }
                Err(e) => {
                    error!(error = %e, "Error accepting connection");
                }
            }
        }
    }
}

async fn reject(stream: TcpStream, pool: &PacketPool) -> Result<()> {
    let mut framed = Framed::new(stream, FrameCodec::new());
    let packet = Packet::Disconnect(Disconnect::new(constants::ERR_ALREADY_CONNECTED));
    framed.send(pool.encode(&packet)?).await?;
    framed.close().await
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_second_client_is_rejected() {
        let pool = Arc::new(PacketPool::standard());
        let listener = ClientListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr();
        let cancel = CancellationToken::new();

        let accept = tokio::spawn(listener.accept(
            pool.clone(),
            Arc::new(Metrics::new()),
            cancel.clone(),
        ));
        let _first = TcpStream::connect(addr).await.unwrap();
        let accepted = accept.await.unwrap().unwrap();

        let second = TcpStream::connect(addr).await.unwrap();
        let mut framed = Framed::new(second, FrameCodec::new());
        let frame = framed.next().await.unwrap().unwrap();
        match pool.decode(&frame).unwrap() {
            Packet::Disconnect(d) => assert_eq!(d.message, constants::ERR_ALREADY_CONNECTED),
            other => panic!("unexpected {other:?}"),
        }
        cancel.cancel();
        accepted.rejector.await.unwrap();
        // listener is released once the rejector stops
        tokio::net::TcpListener::bind(addr).await.unwrap();
    }
}
