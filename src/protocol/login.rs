//! Login-phase helpers shared by live sessions and replays.
//!
//! Everything read while logging in is kept in a [`LoginQueue`] in arrival
//! order. Packets the relay consumes itself are flagged `pre_login`; once the
//! session starts relaying, the queue is drained into the handler chain first
//! so observers see the whole session.

use crate::core::packet::{ClientData, Login, Packet, Transfer};
use crate::error::{ProxyError, Result};
use crate::transport::connection::Received;
use std::sync::{Arc, Mutex};
use tracing::trace;

/// Protocol version announced when logging in without a client.
pub const PROTOCOL_VERSION: i32 = 712;

/// Login sent to the server when no client is attached.
pub fn default_login() -> Login {
    Login {
        protocol_version: PROTOCOL_VERSION,
        client_data: ClientData {
            display_name: String::from("packet-relay"),
            client_cache_enabled: true,
            ..Default::default()
        },
    }
}

/// Transfer that sends the client back to the address it reached the relay
/// on. `server_address` is the client's own `host:port`.
pub fn transfer_to_self(server_address: &str) -> Result<Transfer> {
    let (host, port) = server_address.rsplit_once(':').ok_or_else(|| {
        ProxyError::Protocol(format!(
            "client server address {server_address:?} has no port"
        ))
    })?;
    let port = port.parse::<u16>().map_err(|e| {
        ProxyError::Protocol(format!("client server address {server_address:?}: {e}"))
    })?;
    Ok(Transfer {
        address: host.to_string(),
        port,
    })
}

/// Ordered buffer of packets read during login, shared by both login loops.
#[derive(Debug, Clone, Default)]
pub struct LoginQueue {
    packets: Arc<Mutex<Vec<Received>>>,
}

impl LoginQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `received`, flagging it `pre_login` if the relay consumes it.
    pub fn push(&self, mut received: Received) {
        received.pre_login = received.packet.is_login_sequence();
        trace!(
            packet = received.packet.name(),
            pre_login = received.pre_login,
            "Queued login packet"
        );
        if let Ok(mut packets) = self.packets.lock() {
            packets.push(received);
        }
    }

    pub fn len(&self) -> usize {
        self.packets.lock().map(|p| p.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Take everything queued so far.
    pub fn drain(&self) -> Vec<Received> {
        self.packets
            .lock()
            .map(|mut p| std::mem::take(&mut *p))
            .unwrap_or_default()
    }
}

/// Packet that ends the login phase in the client-to-server direction.
pub fn ends_login(packet: &Packet, to_server: bool) -> bool {
    to_server && matches!(packet, Packet::SetLocalPlayerAsInitialised(_))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::core::packet::{SetLocalPlayerAsInitialised, Text};

    #[test]
    fn test_transfer_to_self() {
        let t = transfer_to_self("play.example.net:19133").unwrap();
        assert_eq!(t.address, "play.example.net");
        assert_eq!(t.port, 19133);
        assert!(transfer_to_self("no-port").is_err());
        assert!(transfer_to_self("host:notaport").is_err());
    }

    #[test]
    fn test_queue_flags_login_packets() {
        let queue = LoginQueue::new();
        queue.push(Received::new(Packet::Login(default_login()), true));
        queue.push(Received::new(Packet::Text(Text::default()), false));
        queue.push(Received::new(
            Packet::SetLocalPlayerAsInitialised(SetLocalPlayerAsInitialised::default()),
            true,
        ));
        assert_eq!(queue.len(), 3);

        let drained = queue.drain();
        let flags: Vec<bool> = drained.iter().map(|r| r.pre_login).collect();
        assert_eq!(flags, vec![true, false, true]);
        assert!(ends_login(&drained[2].packet, true));
        assert!(!ends_login(&drained[2].packet, false));
        assert!(queue.is_empty());
    }
}
