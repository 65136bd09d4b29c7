//! # pcap2 capture format
//!
//! ```text
//! "BTCP" | version:u32 | archive_size:u64 | archive[archive_size] | records...
//! record := 0xAAAAAAAA:u32 | length:u32 | direction:u8 | timestamp_ms:u64
//!           | payload[length] | 0xBBBBBBBB:u32
//! ```
//!
//! All integers are little-endian. `direction` is 1 for client to server.
//! The payload is a [`Frame`] in its `id | body` form.
//!
//! - **Version 5**: every payload is LZ4-compressed on its own and `length`
//!   is the compressed size. Records can be indexed and seeked.
//! - **Version 4**: payloads are raw, but the whole record stream is a
//!   single zstd stream. Only forward reading is possible.
//!
//! Anything older is rejected. A partial record header at the end of the
//! stream ends the capture; any other mismatch is a corruption error.

use crate::config::MAX_FRAME_SIZE;
use crate::core::codec::Frame;
use crate::cache::pack::ResourcePack;
use crate::cache::pack_cache::ReplayPackCache;
use crate::error::{constants, ProxyError, Result};
use crate::replay::archive::{decode_archive, encode_archive};
use crate::utils::compression;
use bytes::Bytes;
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, instrument};

pub const CAPTURE_MAGIC: &[u8; 4] = b"BTCP";
pub const CURRENT_VERSION: u32 = 5;
pub const MIN_VERSION: u32 = 4;
pub const RECORD_MAGIC: u32 = 0xAAAA_AAAA;
pub const RECORD_TRAILER: u32 = 0xBBBB_BBBB;

const HEADER_LEN: usize = 16;
const RECORD_HEADER_LEN: usize = 4 + 4 + 1 + 8;
const MAX_RECORD_LEN: usize = 2 * MAX_FRAME_SIZE;

/// One captured packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub to_server: bool,
    pub timestamp_ms: u64,
    pub frame: Frame,
}

impl Record {
    pub fn new(to_server: bool, time: SystemTime, frame: Frame) -> Self {
        Self {
            to_server,
            timestamp_ms: unix_millis(time),
            frame,
        }
    }

    pub fn time(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_millis(self.timestamp_ms)
    }
}

pub fn unix_millis(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

struct RecordHead {
    length: usize,
    to_server: bool,
    timestamp_ms: u64,
}

enum Source<R: Read + Seek> {
    Indexed(R),
    Stream(zstd::stream::Decoder<'static, BufReader<R>>),
}

impl<R: Read + Seek> Source<R> {
    fn reader(&mut self) -> &mut dyn Read {
        match self {
            Source::Indexed(r) => r,
            Source::Stream(r) => r,
        }
    }
}

/// Reads records from a capture.
pub struct Pcap2Reader<R: Read + Seek> {
    version: u32,
    source: Source<R>,
    packs: ReplayPackCache,
    index: Vec<u64>,
    current: usize,
}

impl<R: Read + Seek> std::fmt::Debug for Pcap2Reader<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pcap2Reader")
            .field("version", &self.version)
            .field("packs", &self.packs.len())
            .field("current", &self.current)
            .finish()
    }
}

impl<R: Read + Seek> Pcap2Reader<R> {
    /// Parse the header and embedded pack archive.
    #[instrument(skip(inner))]
    pub fn new(mut inner: R) -> Result<Self> {
        let mut head = [0u8; HEADER_LEN];
        read_exact_or(&mut inner, &mut head, "capture header truncated")?;
        if &head[0..4] != CAPTURE_MAGIC {
            return Err(ProxyError::CorruptCapture(
                constants::ERR_BAD_CAPTURE_MAGIC.to_string(),
            ));
        }
        let version = u32::from_le_bytes([head[4], head[5], head[6], head[7]]);
        if !(MIN_VERSION..=CURRENT_VERSION).contains(&version) {
            return Err(ProxyError::UnsupportedCaptureVersion(version));
        }
        let archive_size = u64::from_le_bytes([
            head[8], head[9], head[10], head[11], head[12], head[13], head[14], head[15],
        ]);

        let mut archive = Vec::new();
        let read = (&mut inner).take(archive_size).read_to_end(&mut archive)?;
        if read as u64 != archive_size {
            return Err(ProxyError::CorruptCapture(format!(
                "pack archive truncated: {read} of {archive_size} bytes"
            )));
        }
        let packs = decode_archive(Bytes::from(archive))?;

        let source = if version >= 5 {
            Source::Indexed(inner)
        } else {
            Source::Stream(compression::zstd_reader(inner)?)
        };

        info!(version, packs = packs.len(), "Opened capture");
        Ok(Self {
            version,
            source,
            packs,
            index: Vec::new(),
            current: 0,
        })
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    /// Packs embedded in the capture.
    pub fn packs(&self) -> &ReplayPackCache {
        &self.packs
    }

    pub fn take_packs(&mut self) -> ReplayPackCache {
        std::mem::take(&mut self.packs)
    }

    /// Number of the next record to be read.
    pub fn position(&self) -> usize {
        self.current
    }

    fn note_offset(&mut self) -> Result<()> {
        if let Source::Indexed(r) = &mut self.source {
            if self.index.len() <= self.current {
                let off = r.stream_position()?;
                self.index.push(off);
            }
        }
        Ok(())
    }

    fn read_head(&mut self) -> Result<Option<RecordHead>> {
        let mut head = [0u8; RECORD_HEADER_LEN];
        let mut filled = 0;
        let reader = self.source.reader();
        while filled < head.len() {
            match reader.read(&mut head[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        if filled < head.len() {
            if filled > 0 {
                debug!(bytes = filled, "Partial record header at end of capture");
            }
            return Ok(None);
        }

        let magic = u32::from_le_bytes([head[0], head[1], head[2], head[3]]);
        if magic != RECORD_MAGIC {
            return Err(ProxyError::CorruptCapture(format!(
                "{} at record {}",
                constants::ERR_BAD_RECORD_MAGIC,
                self.current
            )));
        }
        let length = u32::from_le_bytes([head[4], head[5], head[6], head[7]]) as usize;
        if length > MAX_RECORD_LEN {
            return Err(ProxyError::CorruptCapture(format!(
                "record {} declares {length} bytes",
                self.current
            )));
        }
        let mut ts = [0u8; 8];
        ts.copy_from_slice(&head[9..17]);
        Ok(Some(RecordHead {
            length,
            to_server: head[8] == 1,
            timestamp_ms: u64::from_le_bytes(ts),
        }))
    }

    /// Read the next record. `None` at the end of the capture.
    pub fn read_record(&mut self) -> Result<Option<Record>> {
        self.note_offset()?;
        let Some(head) = self.read_head()? else {
            return Ok(None);
        };

        let mut body = vec![0u8; head.length];
        read_exact_or(self.source.reader(), &mut body, constants::ERR_TRUNCATED_RECORD)?;
        self.check_trailer()?;

        let payload = if self.version >= 5 {
            compression::decompress(&body).map_err(|e| {
                ProxyError::CorruptCapture(format!("record {} payload: {e}", self.current))
            })?
        } else {
            body
        };
        let frame = Frame::from_bytes(&payload).map_err(|_| {
            ProxyError::CorruptCapture(format!("record {} has no packet id", self.current))
        })?;

        self.current += 1;
        Ok(Some(Record {
            to_server: head.to_server,
            timestamp_ms: head.timestamp_ms,
            frame,
        }))
    }

    /// Skip the next record without decoding it. Returns false at the end.
    pub fn skip_record(&mut self) -> Result<bool> {
        self.note_offset()?;
        let Some(head) = self.read_head()? else {
            return Ok(false);
        };
        let want = head.length as u64;
        let copied = io::copy(&mut self.source.reader().take(want), &mut io::sink())?;
        if copied != want {
            return Err(ProxyError::CorruptCapture(
                constants::ERR_TRUNCATED_RECORD.to_string(),
            ));
        }
        self.check_trailer()?;
        self.current += 1;
        Ok(true)
    }

    fn check_trailer(&mut self) -> Result<()> {
        let mut trailer = [0u8; 4];
        read_exact_or(self.source.reader(), &mut trailer, constants::ERR_TRUNCATED_RECORD)?;
        if u32::from_le_bytes(trailer) != RECORD_TRAILER {
            return Err(ProxyError::CorruptCapture(format!(
                "{} at record {}",
                constants::ERR_BAD_RECORD_TRAILER,
                self.current
            )));
        }
        Ok(())
    }

    fn seekable(&mut self) -> Result<&mut R> {
        match &mut self.source {
            Source::Indexed(r) => Ok(r),
            Source::Stream(_) => {
                debug!("{}", constants::ERR_SEEK_UNSUPPORTED);
                Err(ProxyError::UnsupportedCaptureVersion(self.version))
            }
        }
    }

    /// Move so that the next read returns record `n`.
    pub fn seek(&mut self, n: usize) -> Result<()> {
        self.seekable()?;
        if n >= self.current {
            while self.current < n {
                if !self.skip_record()? {
                    return Err(ProxyError::ConnectionClosed);
                }
            }
            return Ok(());
        }
        let off = self.index[n];
        self.seekable()?.seek(SeekFrom::Start(off))?;
        self.current = n;
        Ok(())
    }

    /// Read the record before the current position and step back over it.
    pub fn read_back(&mut self) -> Result<Option<Record>> {
        self.seekable()?;
        if self.current == 0 {
            return Ok(None);
        }
        self.seek(self.current - 1)?;
        let record = self.read_record()?;
        if record.is_some() {
            self.current -= 1;
        }
        let off = self.index[self.current];
        self.seekable()?.seek(SeekFrom::Start(off))?;
        Ok(record)
    }
}

fn read_exact_or(reader: &mut dyn Read, buf: &mut [u8], msg: &str) -> Result<()> {
    reader.read_exact(buf).map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            ProxyError::CorruptCapture(msg.to_string())
        } else {
            ProxyError::Io(e)
        }
    })
}

enum Sink<W: Write> {
    Plain(W),
    Stream(zstd::stream::Encoder<'static, W>),
}

/// Writes a capture.
pub struct Pcap2Writer<W: Write> {
    version: u32,
    sink: Sink<W>,
    records: u64,
}

impl<W: Write> Pcap2Writer<W> {
    /// Start a current-version capture with `packs` embedded.
    pub fn new(inner: W, packs: &[ResourcePack]) -> Result<Self> {
        Self::with_version(inner, CURRENT_VERSION, packs)
    }

    pub fn with_version(mut inner: W, version: u32, packs: &[ResourcePack]) -> Result<Self> {
        if !(MIN_VERSION..=CURRENT_VERSION).contains(&version) {
            return Err(ProxyError::UnsupportedCaptureVersion(version));
        }
        let archive = encode_archive(packs)?;
        inner.write_all(CAPTURE_MAGIC)?;
        inner.write_all(&version.to_le_bytes())?;
        inner.write_all(&(archive.len() as u64).to_le_bytes())?;
        inner.write_all(&archive)?;

        let sink = if version >= 5 {
            Sink::Plain(inner)
        } else {
            Sink::Stream(compression::zstd_writer(inner)?)
        };
        Ok(Self {
            version,
            sink,
            records: 0,
        })
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn records(&self) -> u64 {
        self.records
    }

    pub fn write_record(&mut self, record: &Record) -> Result<()> {
        let raw = record.frame.to_bytes();
        let payload = if self.version >= 5 {
            compression::compress(&raw)
        } else {
            raw
        };
        let length = u32::try_from(payload.len())
            .map_err(|_| ProxyError::OversizedPacket(payload.len()))?;

        let mut buf = Vec::with_capacity(RECORD_HEADER_LEN + payload.len() + 4);
        buf.extend_from_slice(&RECORD_MAGIC.to_le_bytes());
        buf.extend_from_slice(&length.to_le_bytes());
        buf.push(u8::from(record.to_server));
        buf.extend_from_slice(&record.timestamp_ms.to_le_bytes());
        buf.extend_from_slice(&payload);
        buf.extend_from_slice(&RECORD_TRAILER.to_le_bytes());

        match &mut self.sink {
            Sink::Plain(w) => w.write_all(&buf)?,
            Sink::Stream(w) => w.write_all(&buf)?,
        }
        self.records += 1;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        match &mut self.sink {
            Sink::Plain(w) => w.flush()?,
            Sink::Stream(w) => w.flush()?,
        }
        Ok(())
    }

    /// Finish any compression stream and return the inner writer.
    pub fn finish(self) -> Result<W> {
        match self.sink {
            Sink::Plain(mut w) => {
                w.flush()?;
                Ok(w)
            }
            Sink::Stream(w) => {
                let mut inner = w.finish()?;
                inner.flush()?;
                Ok(inner)
            }
        }
    }
}
