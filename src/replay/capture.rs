//! Session capture.
//!
//! [`PacketCapturer`] is a [`PacketHandler`] that records what the handler
//! chain sees into a pcap2 file. The file header embeds every finished pack,
//! so nothing is written until login completes; packets seen before that are
//! held in memory.

use crate::cache::pack::ResourcePack;
use crate::core::packet::{GameData, Packet};
use crate::core::pool::PacketPool;
use crate::error::{constants, ProxyError, Result};
use crate::protocol::handler::PacketHandler;
use crate::replay::pcap2::{unix_millis, Pcap2Writer, Record};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::SystemTime;
use tracing::{error, info};

enum CaptureState {
    Buffering(Vec<Record>),
    Writing(Pcap2Writer<BufWriter<File>>),
    Closed,
}

/// Handler writing the session to a capture file.
pub struct PacketCapturer {
    path: PathBuf,
    pool: Arc<PacketPool>,
    state: Mutex<CaptureState>,
}

impl std::fmt::Debug for PacketCapturer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketCapturer")
            .field("path", &self.path)
            .finish()
    }
}

impl PacketCapturer {
    pub fn new(path: impl Into<PathBuf>, pool: Arc<PacketPool>) -> Self {
        Self {
            path: path.into(),
            pool,
            state: Mutex::new(CaptureState::Buffering(Vec::new())),
        }
    }

    /// Capture into `dir`, naming the file after the server and the time.
    pub fn in_dir(dir: &Path, server_name: &str, pool: Arc<PacketPool>) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let name: String = server_name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '.' { c } else { '_' })
            .collect();
        let stamp = unix_millis(SystemTime::now()) / 1000;
        Ok(Self::new(dir.join(format!("{name}-{stamp}.pcap2")), pool))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> Result<MutexGuard<'_, CaptureState>> {
        self.state
            .lock()
            .map_err(|_| ProxyError::Custom(constants::ERR_LOCK_POISONED.to_string()))
    }
}

impl PacketHandler for PacketCapturer {
    fn name(&self) -> &str {
        "capture"
    }

    fn on_packet(
        &self,
        packet: Packet,
        to_server: bool,
        time: SystemTime,
        _pre_login: bool,
    ) -> Result<Option<Packet>> {
        let record = Record::new(to_server, time, self.pool.encode(&packet)?);
        match &mut *self.lock()? {
            CaptureState::Buffering(buffer) => buffer.push(record),
            CaptureState::Writing(writer) => writer.write_record(&record)?,
            CaptureState::Closed => {}
        }
        Ok(Some(packet))
    }

    fn on_login_complete(&self, _game: &GameData, packs: &[ResourcePack]) -> Result<bool> {
        let mut state = self.lock()?;
        let CaptureState::Buffering(buffer) = std::mem::replace(&mut *state, CaptureState::Closed)
        else {
            return Ok(false);
        };

        let file = File::create(&self.path)?;
        let mut writer = Pcap2Writer::new(BufWriter::new(file), packs)?;
        for record in &buffer {
            writer.write_record(record)?;
        }
        info!(path = %self.path.display(), packs = packs.len(), "Capture started");
        *state = CaptureState::Writing(writer);
        Ok(false)
    }

    fn on_session_end(&self) {
        let Ok(mut state) = self.lock() else {
            return;
        };
        if let CaptureState::Writing(writer) = std::mem::replace(&mut *state, CaptureState::Closed)
        {
            let records = writer.records();
            match writer.finish().and_then(|mut w| w.flush().map_err(ProxyError::Io)) {
                Ok(()) => info!(path = %self.path.display(), records, "Capture finished"),
                Err(e) => error!(path = %self.path.display(), error = %e, "Failed to finish capture"),
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::cache::pack::PackId;
    use crate::cache::pack_cache::PackCache;
    use crate::core::packet::Text;
    use crate::replay::pcap2::Pcap2Reader;
    use std::io::BufReader;

    fn text(message: &str) -> Packet {
        Packet::Text(Text {
            message: message.into(),
            ..Default::default()
        })
    }

    #[test]
    fn test_buffers_until_login_complete() {
        let dir = tempfile::tempdir().unwrap();
        let pool = Arc::new(PacketPool::standard());
        let capturer = PacketCapturer::in_dir(dir.path(), "play.example.net:19132", pool.clone())
            .unwrap();

        capturer
            .on_packet(text("early"), false, SystemTime::now(), true)
            .unwrap();
        assert!(!capturer.path().exists());

        let pack = ResourcePack::new(
            "0fba4063-dba1-4281-9b89-ff9390653530_1.0.0"
                .parse::<PackId>()
                .unwrap(),
            vec![9u8; 32],
        );
        assert!(!capturer
            .on_login_complete(&GameData::default(), &[pack.clone()])
            .unwrap());
        capturer
            .on_packet(text("late"), true, SystemTime::now(), false)
            .unwrap();
        capturer.on_session_end();

        let file = File::open(capturer.path()).unwrap();
        let mut reader = Pcap2Reader::new(BufReader::new(file)).unwrap();
        assert!(reader.packs().has(&pack.id));

        let first = reader.read_record().unwrap().unwrap();
        assert!(!first.to_server);
        assert_eq!(pool.decode(&first.frame).unwrap(), text("early"));
        let second = reader.read_record().unwrap().unwrap();
        assert!(second.to_server);
        assert_eq!(pool.decode(&second.frame).unwrap(), text("late"));
        assert!(reader.read_record().unwrap().is_none());
    }
}
