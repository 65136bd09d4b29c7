//! Framed packet connections.
//!
//! A byte stream is split into a [`PacketReader`] owned by one relay task and
//! a cloneable [`PacketWriter`] any task may write through. Writers serialize
//! access to the sink internally so whole frames are never interleaved.
//! A writer bound to a session token gives up with [`ProxyError::Cancelled`]
//! as soon as the token fires, even when the peer has stopped reading.

use crate::core::codec::{Frame, FrameCodec};
use crate::core::packet::Packet;
use crate::core::pool::PacketPool;
use crate::error::{ProxyError, Result};
use crate::utils::metrics::Metrics;
use futures::{Sink, SinkExt, Stream, StreamExt};
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace};

/// Upper bound on the goodbye write and flush made while closing.
pub const CLOSE_GRACE: Duration = Duration::from_secs(1);

type FrameSink = Pin<Box<dyn Sink<Frame, Error = ProxyError> + Send>>;
type FrameStream = Pin<Box<dyn Stream<Item = Result<Frame>> + Send>>;

/// Which end of the proxy a connection faces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Peer {
    Client,
    Server,
}

impl Peer {
    /// Direction of packets read from this peer.
    pub fn reads_to_server(self) -> bool {
        matches!(self, Peer::Client)
    }
}

/// A packet read from a connection or a capture.
#[derive(Debug, Clone, PartialEq)]
pub struct Received {
    pub packet: Packet,
    pub to_server: bool,
    pub received_at: SystemTime,
    /// Set when the relay consumed the packet while logging in
    pub pre_login: bool,
}

impl Received {
    pub fn new(packet: Packet, to_server: bool) -> Self {
        Self {
            packet,
            to_server,
            received_at: SystemTime::now(),
            pre_login: false,
        }
    }

    pub fn at(mut self, time: SystemTime) -> Self {
        self.received_at = time;
        self
    }
}

/// Split `io` into a reader and writer speaking [`FrameCodec`].
pub fn split<T>(
    io: T,
    peer: Peer,
    pool: Arc<PacketPool>,
    metrics: Arc<Metrics>,
) -> (PacketReader, PacketWriter)
where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (sink, stream) = Framed::new(io, FrameCodec::new()).split();
    let reader = PacketReader {
        frames: Box::pin(stream),
        peer,
        pool: pool.clone(),
        metrics: metrics.clone(),
    };
    let writer = PacketWriter {
        inner: Arc::new(WriterInner::Socket {
            sink: Mutex::new(Box::pin(sink)),
            peer,
            pool,
            metrics,
        }),
        cancel: CancellationToken::new(),
    };
    (reader, writer)
}

/// Dial the remote server, failing with [`ProxyError::Timeout`] after `timeout`.
#[instrument(skip(pool, metrics))]
pub async fn dial(
    addr: &str,
    timeout: Duration,
    pool: Arc<PacketPool>,
    metrics: Arc<Metrics>,
) -> Result<(PacketReader, PacketWriter)> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| ProxyError::Timeout)??;
    stream.set_nodelay(true)?;
    debug!(peer = ?stream.peer_addr().ok(), "Connected to server");
    Ok(split(stream, Peer::Server, pool, metrics))
}

/// Read half of a connection.
pub struct PacketReader {
    frames: FrameStream,
    peer: Peer,
    pool: Arc<PacketPool>,
    metrics: Arc<Metrics>,
}

impl std::fmt::Debug for PacketReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketReader").field("peer", &self.peer).finish()
    }
}

impl PacketReader {
    pub fn peer(&self) -> Peer {
        self.peer
    }

    /// Read the next packet. Undecodable bodies come back as
    /// [`Packet::Unknown`]; a closed stream is [`ProxyError::ConnectionClosed`].
    pub async fn read(&mut self, cancel: &CancellationToken) -> Result<Received> {
        let frame = tokio::select! {
            _ = cancel.cancelled() => return Err(ProxyError::Cancelled),
            next = self.frames.next() => next.ok_or(ProxyError::ConnectionClosed)??,
        };
        self.metrics.frame_received(frame.wire_len() as u64);

        let packet = self.pool.decode_lossy(&frame);
        trace!(peer = ?self.peer, packet = packet.name(), "Read packet");
        Ok(Received::new(packet, self.peer.reads_to_server()))
    }
}

enum WriterInner {
    Socket {
        sink: Mutex<FrameSink>,
        peer: Peer,
        pool: Arc<PacketPool>,
        metrics: Arc<Metrics>,
    },
    Discard,
}

/// Write half of a connection. Clones share the same sink.
#[derive(Clone)]
pub struct PacketWriter {
    inner: Arc<WriterInner>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for PacketWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &*self.inner {
            WriterInner::Socket { peer, .. } => write!(f, "PacketWriter({peer:?})"),
            WriterInner::Discard => f.write_str("PacketWriter(discard)"),
        }
    }
}

impl PacketWriter {
    /// Writer that accepts and drops every packet; the server side of a replay.
    pub fn discard() -> Self {
        Self {
            inner: Arc::new(WriterInner::Discard),
            cancel: CancellationToken::new(),
        }
    }

    /// Bind writes to `cancel`.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn is_discard(&self) -> bool {
        matches!(&*self.inner, WriterInner::Discard)
    }

    /// Write one packet, failing with [`ProxyError::Cancelled`] once the
    /// bound token fires.
    pub async fn write(&self, packet: &Packet) -> Result<()> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(ProxyError::Cancelled),
            sent = self.send(packet) => sent,
        }
    }

    /// Write a last packet after the session was cancelled, giving up after
    /// [`CLOSE_GRACE`].
    pub async fn write_final(&self, packet: &Packet) -> Result<()> {
        tokio::time::timeout(CLOSE_GRACE, self.send(packet))
            .await
            .map_err(|_| ProxyError::Timeout)?
    }

    async fn send(&self, packet: &Packet) -> Result<()> {
        let WriterInner::Socket {
            sink,
            peer,
            pool,
            metrics,
        } = &*self.inner
        else {
            return Ok(());
        };

        let frame = pool.encode(packet)?;
        let len = frame.wire_len() as u64;
        sink.lock().await.send(frame).await?;
        metrics.frame_sent(len);
        trace!(peer = ?peer, packet = packet.name(), "Wrote packet");
        Ok(())
    }

    /// Flush and close the sink, giving up after [`CLOSE_GRACE`]. Later
    /// writes fail.
    pub async fn close(&self) -> Result<()> {
        if let WriterInner::Socket { sink, .. } = &*self.inner {
            tokio::time::timeout(CLOSE_GRACE, async { sink.lock().await.close().await })
                .await
                .map_err(|_| ProxyError::Timeout)??;
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::core::packet::Text;

    fn pair() -> ((PacketReader, PacketWriter), (PacketReader, PacketWriter)) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let pool = Arc::new(PacketPool::standard());
        let metrics = Arc::new(Metrics::new());
        (
            split(a, Peer::Client, pool.clone(), metrics.clone()),
            split(b, Peer::Server, pool, metrics),
        )
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let ((_, client_w), (mut server_r, _)) = pair();
        let text = Packet::Text(Text {
            message: "hello".into(),
            ..Default::default()
        });
        client_w.write(&text).await.unwrap();

        let got = server_r.read(&CancellationToken::new()).await.unwrap();
        assert_eq!(got.packet, text);
        // server-facing reader yields client-bound packets
        assert!(!got.to_server);
    }

    #[tokio::test]
    async fn test_read_after_close_is_connection_closed() {
        let ((_, client_w), (mut server_r, _)) = pair();
        client_w.close().await.unwrap();
        drop(client_w);
        let err = server_r.read(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, ProxyError::ConnectionClosed));
    }

    #[tokio::test]
    async fn test_read_observes_cancellation() {
        let ((mut client_r, _), _server) = pair();
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(
            client_r.read(&cancel).await,
            Err(ProxyError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn test_write_to_stalled_peer_observes_cancellation() {
        let (a, _b) = tokio::io::duplex(64);
        let (_, writer) = split(
            a,
            Peer::Client,
            Arc::new(PacketPool::standard()),
            Arc::new(Metrics::new()),
        );
        let cancel = CancellationToken::new();
        let writer = writer.with_cancel(cancel.clone());
        let big = Packet::Text(Text {
            message: "x".repeat(4096),
            ..Default::default()
        });

        let pending = tokio::spawn({
            let writer = writer.clone();
            async move { writer.write(&big).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!pending.is_finished());

        cancel.cancel();
        let result = tokio::time::timeout(Duration::from_secs(2), pending)
            .await
            .expect("write stayed blocked after cancel")
            .unwrap();
        assert!(matches!(result, Err(ProxyError::Cancelled)));

        assert!(matches!(
            writer.write(&Packet::Text(Text::default())).await,
            Err(ProxyError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn test_final_write_to_stalled_peer_gives_up() {
        let (a, _b) = tokio::io::duplex(64);
        let (_, writer) = split(
            a,
            Peer::Client,
            Arc::new(PacketPool::standard()),
            Arc::new(Metrics::new()),
        );
        let big = Packet::Text(Text {
            message: "x".repeat(4096),
            ..Default::default()
        });
        assert!(matches!(
            writer.write_final(&big).await,
            Err(ProxyError::Timeout)
        ));
    }

    #[tokio::test]
    async fn test_discard_writer_accepts_everything() {
        let w = PacketWriter::discard();
        assert!(w.is_discard());
        w.write(&Packet::Text(Text::default())).await.unwrap();
        w.close().await.unwrap();
    }
}
