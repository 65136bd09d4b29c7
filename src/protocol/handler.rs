//! Handler chain.
//!
//! External observers and mutators implement [`PacketHandler`]; every method
//! has a no-op default so a handler only overrides what it needs. The
//! [`HandlerChain`] calls handlers in registration order.

use crate::cache::pack::{PackId, ResourcePack};
use crate::core::packet::{CacheBlob, GameData, Packet};
use crate::error::Result;
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, trace, warn};

/// Observer/mutator hooked into a session.
#[allow(unused_variables)]
pub trait PacketHandler: Send + Sync {
    fn name(&self) -> &str {
        "handler"
    }

    fn on_session_start(&self, server_name: &str) -> Result<()> {
        Ok(())
    }

    /// Inspect or rewrite a packet. Returning `None` drops it.
    ///
    /// `pre_login` is set for packets the relay consumed while logging in;
    /// those are never forwarded whatever this returns.
    fn on_packet(
        &self,
        packet: Packet,
        to_server: bool,
        time: SystemTime,
        pre_login: bool,
    ) -> Result<Option<Packet>> {
        Ok(Some(packet))
    }

    fn on_finished_pack(&self, pack: &ResourcePack) -> Result<()> {
        Ok(())
    }

    /// Return true to skip downloading this pack.
    fn filter_resource_pack(&self, id: &PackId) -> bool {
        false
    }

    /// Blobs served from the local store instead of the wire.
    fn on_blobs(&self, blobs: &[CacheBlob]) {}

    /// Called once the login sequence finished. Return true to end the
    /// session now.
    fn on_login_complete(&self, game: &GameData, packs: &[ResourcePack]) -> Result<bool> {
        Ok(false)
    }

    fn on_session_end(&self) {}
}

/// Ordered list of handlers.
#[derive(Clone, Default)]
pub struct HandlerChain {
    handlers: Vec<Arc<dyn PacketHandler>>,
}

impl std::fmt::Debug for HandlerChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.handlers.iter().map(|h| h.name().to_string()))
            .finish()
    }
}

impl HandlerChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, handler: Arc<dyn PacketHandler>) {
        debug!(handler = handler.name(), "Registered handler");
        self.handlers.push(handler);
    }

    pub fn with(mut self, handler: Arc<dyn PacketHandler>) -> Self {
        self.push(handler);
        self
    }

    /// Append every handler of `other`, keeping its order.
    pub fn extend(&mut self, other: &HandlerChain) {
        self.handlers.extend(other.handlers.iter().cloned());
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn session_start(&self, server_name: &str) -> Result<()> {
        for h in &self.handlers {
            h.on_session_start(server_name)?;
        }
        Ok(())
    }

    /// Run the packet through every handler; the first `None` stops the chain.
    pub fn packet(
        &self,
        packet: Packet,
        to_server: bool,
        time: SystemTime,
        pre_login: bool,
    ) -> Result<Option<Packet>> {
        let mut current = packet;
        for h in &self.handlers {
            match h.on_packet(current, to_server, time, pre_login)? {
                Some(next) => current = next,
                None => {
                    trace!(handler = h.name(), "Packet dropped by handler");
                    return Ok(None);
                }
            }
        }
        Ok(Some(current))
    }

    pub fn finished_pack(&self, pack: &ResourcePack) -> Result<()> {
        for h in &self.handlers {
            h.on_finished_pack(pack)?;
        }
        Ok(())
    }

    /// True if any handler wants the pack skipped.
    pub fn filter_resource_pack(&self, id: &PackId) -> bool {
        self.handlers.iter().any(|h| h.filter_resource_pack(id))
    }

    pub fn blobs(&self, blobs: &[CacheBlob]) {
        for h in &self.handlers {
            h.on_blobs(blobs);
        }
    }

    /// True if any handler asked to end the session.
    pub fn login_complete(&self, game: &GameData, packs: &[ResourcePack]) -> Result<bool> {
        let mut disconnect = false;
        for h in &self.handlers {
            if h.on_login_complete(game, packs)? {
                debug!(handler = h.name(), "Handler requested disconnect");
                disconnect = true;
            }
        }
        Ok(disconnect)
    }

    pub fn session_end(&self) {
        for h in &self.handlers {
            h.on_session_end();
        }
    }
}

/// Handler that logs every packet name at trace level.
#[derive(Debug, Default)]
pub struct PacketLogger;

impl PacketHandler for PacketLogger {
    fn name(&self) -> &str {
        "packet-logger"
    }

    fn on_packet(
        &self,
        packet: Packet,
        to_server: bool,
        _time: SystemTime,
        pre_login: bool,
    ) -> Result<Option<Packet>> {
        let dir = if to_server { "C->S" } else { "S->C" };
        if let Packet::Unknown { id, payload } = &packet {
            warn!(dir, id, len = payload.len(), pre_login, "Unknown packet");
        } else {
            trace!(dir, packet = packet.name(), pre_login, "Packet");
        }
        Ok(Some(packet))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::core::packet::Text;
    use std::sync::Mutex;

    struct Rewrite;
    impl PacketHandler for Rewrite {
        fn on_packet(&self, packet: Packet, _: bool, _: SystemTime, _: bool) -> Result<Option<Packet>> {
            Ok(Some(match packet {
                Packet::Text(mut t) => {
                    t.message.push('!');
                    Packet::Text(t)
                }
                other => other,
            }))
        }
    }

    struct DropAll;
    impl PacketHandler for DropAll {
        fn on_packet(&self, _: Packet, _: bool, _: SystemTime, _: bool) -> Result<Option<Packet>> {
            Ok(None)
        }
    }

    #[derive(Default)]
    struct Seen(Mutex<usize>);
    impl PacketHandler for Seen {
        fn on_packet(&self, p: Packet, _: bool, _: SystemTime, _: bool) -> Result<Option<Packet>> {
            *self.0.lock().unwrap() += 1;
            Ok(Some(p))
        }
    }

    fn text() -> Packet {
        Packet::Text(Text {
            message: "hi".into(),
            ..Default::default()
        })
    }

    #[test]
    fn test_handlers_run_in_order() {
        let chain = HandlerChain::new()
            .with(Arc::new(Rewrite))
            .with(Arc::new(Rewrite));
        let out = chain.packet(text(), false, SystemTime::now(), false).unwrap();
        assert!(matches!(out, Some(Packet::Text(t)) if t.message == "hi!!"));
    }

    #[test]
    fn test_first_drop_short_circuits() {
        let seen = Arc::new(Seen::default());
        let chain = HandlerChain::new()
            .with(Arc::new(DropAll))
            .with(seen.clone());
        assert!(chain.packet(text(), true, SystemTime::now(), false).unwrap().is_none());
        assert_eq!(*seen.0.lock().unwrap(), 0);
    }

    #[test]
    fn test_defaults_are_noops() {
        let chain = HandlerChain::new().with(Arc::new(PacketLogger));
        let id = "0fba4063-dba1-4281-9b89-ff9390653530_1.0.0".parse().unwrap();
        assert!(!chain.filter_resource_pack(&id));
        assert!(!chain.login_complete(&GameData::default(), &[]).unwrap());
        assert!(chain.packet(text(), true, SystemTime::now(), true).unwrap().is_some());
    }
}
