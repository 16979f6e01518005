//! Fixed-capacity packet ring buffer.
//!
//! # Responsibilities
//! - Store the most recent packets in fixed-size slots, wrapping around
//! - Persist packets to `<dir>/packetbuf` and the stream index to
//!   `<dir>/streamidx` unless the ring is volatile
//! - Serve per-client reader cursors (packet id + byte offset)
//! - Carry the aggregate transfer rates published by the supervisor
//!
//! # Design Decisions
//! - The in-memory map is authoritative; the file is a write-through
//!   mirror so a restart rebuilds the map by scanning the slots
//! - Packet ids are dense and monotonically increasing, so a slot index
//!   and byte offset derive directly from the id
//! - Readers that fall behind the earliest live packet jump forward to it

pub mod format;
pub mod recovery;

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use format::{FileHeader, SLOT_HEADER_LEN};

/// Packet buffer file name inside the ring directory.
pub const PACKET_BUFFER_FILE: &str = "packetbuf";

/// Stream index file name inside the ring directory.
pub const STREAM_INDEX_FILE: &str = "streamidx";

/// Error initializing the ring from its files.
#[derive(Debug)]
pub enum RingInitError {
    /// The files are unusable but a recovery policy may re-create them.
    Corrupt(String),
    /// The packet buffer is an older format the loader can convert.
    UnsupportedVersion(u16),
    /// Filesystem failure; never recoverable.
    Io(io::Error),
}

impl std::fmt::Display for RingInitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RingInitError::Corrupt(reason) => write!(f, "ring files corrupt: {}", reason),
            RingInitError::UnsupportedVersion(v) => {
                write!(f, "ring files are format version {}", v)
            }
            RingInitError::Io(e) => write!(f, "ring I/O error: {}", e),
        }
    }
}

impl std::error::Error for RingInitError {}

/// Error writing a packet.
#[derive(Debug)]
pub enum RingError {
    PacketTooLarge { len: usize, max: usize },
    Io(io::Error),
}

impl std::fmt::Display for RingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RingError::PacketTooLarge { len, max } => {
                write!(f, "packet of {} bytes exceeds slot capacity {}", len, max)
            }
            RingError::Io(e) => write!(f, "ring I/O error: {}", e),
        }
    }
}

impl std::error::Error for RingError {}

/// A packet handed to a reader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RingPacket {
    pub id: u64,
    pub stream: String,
    pub payload: Vec<u8>,
}

/// Byte-offset view of the ring for lag calculations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingOffsets {
    pub earliest: u64,
    pub latest: u64,
    pub max: u64,
}

/// Aggregate transfer rates across all clients, written by the supervisor.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AggregateRates {
    pub tx_packet_rate: f64,
    pub tx_byte_rate: f64,
    pub rx_packet_rate: f64,
    pub rx_byte_rate: f64,
}

/// A reader's position inside the ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReaderPosition {
    pub pkt_id: u64,
    pub pkt_offset: u64,
}

/// A client's cursor into the ring. Unset until the first read.
#[derive(Debug, Clone, Copy, Default)]
pub struct RingReader {
    position: Option<ReaderPosition>,
}

impl RingReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn position(&self) -> Option<ReaderPosition> {
        self.position
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct StreamEntry {
    latest_id: u64,
    packet_count: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct StreamIndex {
    next_id: u64,
    streams: HashMap<String, StreamEntry>,
}

#[derive(Debug)]
struct RingInner {
    /// Id the next written packet receives; ids start at 1.
    next_id: u64,
    packets: BTreeMap<u64, (String, Vec<u8>)>,
    streams: HashMap<String, StreamEntry>,
    file: Option<std::fs::File>,
}

/// The ring buffer handle shared across the server.
#[derive(Debug)]
pub struct Ring {
    dir: Option<PathBuf>,
    pkt_size: u32,
    slots: u64,
    ring_size: u64,
    memory_map: bool,
    inner: Mutex<RingInner>,
    rates: Mutex<AggregateRates>,
    latest_written: watch::Sender<u64>,
    shut_down: AtomicBool,
}

impl Ring {
    /// Initialize the ring. With `volatile` everything stays in memory;
    /// otherwise existing files are validated and re-loaded, and missing
    /// files are created.
    pub fn initialize(
        dir: Option<&Path>,
        ring_size: u64,
        pkt_size: u32,
        memory_map: bool,
        volatile: bool,
    ) -> Result<Self, RingInitError> {
        let slots = (ring_size / pkt_size as u64).max(1);

        let mut inner = RingInner {
            next_id: 1,
            packets: BTreeMap::new(),
            streams: HashMap::new(),
            file: None,
        };

        let dir = if volatile { None } else { dir };
        if let Some(dir) = dir {
            std::fs::create_dir_all(dir).map_err(RingInitError::Io)?;
            let buf_path = dir.join(PACKET_BUFFER_FILE);
            let idx_path = dir.join(STREAM_INDEX_FILE);

            let exists = buf_path.exists();
            let file = std::fs::OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&buf_path)
                .map_err(RingInitError::Io)?;

            if exists {
                Self::load_existing(&file, ring_size, pkt_size, slots, &mut inner)?;
                Self::load_stream_index(&idx_path, &mut inner)?;
            } else {
                let header = FileHeader {
                    version: format::CURRENT_VERSION,
                    ring_size,
                    pkt_size,
                };
                file.write_all_at(&header.encode(), 0)
                    .map_err(RingInitError::Io)?;
                file.set_len(format::HEADER_LEN + slots * pkt_size as u64)
                    .map_err(RingInitError::Io)?;
            }

            inner.file = Some(file);
        }

        Ok(Self {
            dir: dir.map(Path::to_path_buf),
            pkt_size,
            slots,
            ring_size,
            memory_map,
            inner: Mutex::new(inner),
            rates: Mutex::new(AggregateRates::default()),
            latest_written: watch::channel(0).0,
            shut_down: AtomicBool::new(false),
        })
    }

    fn load_existing(
        file: &std::fs::File,
        ring_size: u64,
        pkt_size: u32,
        slots: u64,
        inner: &mut RingInner,
    ) -> Result<(), RingInitError> {
        let mut header_buf = [0u8; format::HEADER_LEN as usize];
        file.read_exact_at(&mut header_buf, 0)
            .map_err(|_| RingInitError::Corrupt("file shorter than header".to_string()))?;
        let header = FileHeader::decode(&header_buf).map_err(RingInitError::Corrupt)?;

        if header.version == 1 {
            return Err(RingInitError::UnsupportedVersion(1));
        }
        if header.version != format::CURRENT_VERSION {
            return Err(RingInitError::Corrupt(format!(
                "unknown format version {}",
                header.version
            )));
        }
        if header.ring_size != ring_size || header.pkt_size != pkt_size {
            return Err(RingInitError::Corrupt(format!(
                "geometry mismatch: file is {}/{}, configured {}/{}",
                header.ring_size, header.pkt_size, ring_size, pkt_size
            )));
        }

        // Rebuild the in-memory map from occupied slots
        let mut slot_buf = vec![0u8; pkt_size as usize];
        for index in 0..slots {
            let pos = format::HEADER_LEN + index * pkt_size as u64;
            match file.read_exact_at(&mut slot_buf, pos) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(RingInitError::Io(e)),
            }
            if let Some(slot) = format::decode_slot(&slot_buf).map_err(RingInitError::Corrupt)? {
                inner
                    .packets
                    .insert(slot.pkt_id, (slot.stream, slot.data));
            }
        }

        if let Some((&max_id, _)) = inner.packets.iter().next_back() {
            inner.next_id = max_id + 1;
        }
        for (id, (stream, _)) in &inner.packets {
            let entry = inner.streams.entry(stream.clone()).or_default();
            entry.packet_count += 1;
            entry.latest_id = entry.latest_id.max(*id);
        }
        Ok(())
    }

    fn load_stream_index(path: &Path, inner: &mut RingInner) -> Result<(), RingInitError> {
        let content = match std::fs::read(path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(RingInitError::Io(e)),
        };
        let index: StreamIndex = serde_json::from_slice(&content)
            .map_err(|e| RingInitError::Corrupt(format!("stream index: {}", e)))?;
        inner.next_id = inner.next_id.max(index.next_id);
        Ok(())
    }

    /// Write one packet, evicting the slot it wraps onto.
    pub fn write_packet(&self, stream: &str, payload: &[u8]) -> Result<u64, RingError> {
        let max = (self.pkt_size as usize).saturating_sub(SLOT_HEADER_LEN + stream.len());
        if payload.len() > max {
            return Err(RingError::PacketTooLarge {
                len: payload.len(),
                max,
            });
        }

        let id;
        {
            let mut inner = self.inner.lock().expect("ring lock poisoned");
            id = inner.next_id;
            inner.next_id += 1;

            // Evict the packet whose slot this write reuses
            if id > self.slots {
                if let Some((evicted_stream, _)) = inner.packets.remove(&(id - self.slots)) {
                    let emptied = match inner.streams.get_mut(&evicted_stream) {
                        Some(entry) => {
                            entry.packet_count = entry.packet_count.saturating_sub(1);
                            entry.packet_count == 0
                        }
                        None => false,
                    };
                    if emptied {
                        inner.streams.remove(&evicted_stream);
                    }
                }
            }

            inner
                .packets
                .insert(id, (stream.to_string(), payload.to_vec()));
            let entry = inner.streams.entry(stream.to_string()).or_default();
            entry.packet_count += 1;
            entry.latest_id = id;

            if let Some(file) = &inner.file {
                let slot = format::encode_slot(id, stream, payload);
                let pos = format::HEADER_LEN + self.slot_index(id) * self.pkt_size as u64;
                file.write_all_at(&slot, pos).map_err(RingError::Io)?;
            }
        }

        let _ = self.latest_written.send(id);
        Ok(id)
    }

    /// Advance the reader and return the next packet, or None when the
    /// reader is caught up. A lapped reader jumps to the earliest packet.
    pub fn read_next(&self, reader: &mut RingReader) -> Option<RingPacket> {
        let inner = self.inner.lock().expect("ring lock poisoned");
        let earliest = *inner.packets.keys().next()?;

        let wanted = match reader.position {
            Some(pos) => (pos.pkt_id + 1).max(earliest),
            None => earliest,
        };

        let (&id, (stream, payload)) = inner.packets.range(wanted..).next()?;
        reader.position = Some(ReaderPosition {
            pkt_id: id,
            pkt_offset: self.slot_index(id) * self.pkt_size as u64,
        });
        Some(RingPacket {
            id,
            stream: stream.clone(),
            payload: payload.clone(),
        })
    }

    /// Subscribe to packet arrivals. The receiver's `changed()` resolves
    /// for any write since it was last checked, so a write racing a drain
    /// loop is never missed.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.latest_written.subscribe()
    }

    fn slot_index(&self, id: u64) -> u64 {
        (id - 1) % self.slots
    }

    /// Byte-offset view for lag calculations; None while the ring is empty.
    pub fn offsets(&self) -> Option<RingOffsets> {
        let inner = self.inner.lock().expect("ring lock poisoned");
        let earliest = *inner.packets.keys().next()?;
        let latest = *inner.packets.keys().next_back()?;
        Some(RingOffsets {
            earliest: self.slot_index(earliest) * self.pkt_size as u64,
            latest: self.slot_index(latest) * self.pkt_size as u64,
            max: self.slots * self.pkt_size as u64,
        })
    }

    pub fn set_rates(&self, rates: AggregateRates) {
        *self.rates.lock().expect("ring rates lock poisoned") = rates;
    }

    pub fn rates(&self) -> AggregateRates {
        *self.rates.lock().expect("ring rates lock poisoned")
    }

    pub fn packet_count(&self) -> u64 {
        self.inner.lock().expect("ring lock poisoned").packets.len() as u64
    }

    pub fn stream_count(&self) -> u64 {
        self.inner.lock().expect("ring lock poisoned").streams.len() as u64
    }

    /// Flush the stream index and mark the ring shut down. Idempotent; the
    /// supervisor invokes it exactly once after the loop exits.
    pub fn shutdown(&self) -> io::Result<()> {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let inner = self.inner.lock().expect("ring lock poisoned");
        if let Some(file) = &inner.file {
            file.sync_all()?;
        }
        if let Some(dir) = &self.dir {
            let index = StreamIndex {
                next_id: inner.next_id,
                streams: inner.streams.clone(),
            };
            let content = serde_json::to_vec(&index)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            std::fs::write(dir.join(STREAM_INDEX_FILE), content)?;
        }
        Ok(())
    }

    pub fn was_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Log ring parameters, used at startup and for the diagnostic dump.
    pub fn log_parameters(&self) {
        let rates = self.rates();
        tracing::info!("Ring parameters:");
        tracing::info!(
            "   ring size: {} bytes ({} slots of {} bytes)",
            self.ring_size,
            self.slots,
            self.pkt_size
        );
        tracing::info!(
            "   directory: {}",
            self.dir
                .as_deref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "NONE (volatile)".to_string())
        );
        tracing::info!("   memory mapping: {}", if self.memory_map { "yes" } else { "no" });
        tracing::info!(
            "   packets: {}, streams: {}",
            self.packet_count(),
            self.stream_count()
        );
        tracing::info!(
            "   tx rate: {:.1} pkt/s {:.1} B/s, rx rate: {:.1} pkt/s {:.1} B/s",
            rates.tx_packet_rate,
            rates.tx_byte_rate,
            rates.rx_packet_rate,
            rates.rx_byte_rate
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn volatile_ring(slots: u64, pkt_size: u32) -> Ring {
        Ring::initialize(None, slots * pkt_size as u64, pkt_size, false, true).unwrap()
    }

    #[test]
    fn test_write_and_read_in_order() {
        let ring = volatile_ring(8, 128);
        ring.write_packet("S1", b"one").unwrap();
        ring.write_packet("S2", b"two").unwrap();

        let mut reader = RingReader::new();
        let p1 = ring.read_next(&mut reader).unwrap();
        assert_eq!((p1.id, p1.stream.as_str(), p1.payload.as_slice()), (1, "S1", b"one".as_slice()));
        let p2 = ring.read_next(&mut reader).unwrap();
        assert_eq!(p2.id, 2);
        assert!(ring.read_next(&mut reader).is_none());
    }

    #[test]
    fn test_wrap_evicts_oldest() {
        let ring = volatile_ring(4, 128);
        for i in 0..6u8 {
            ring.write_packet("S", &[i]).unwrap();
        }
        assert_eq!(ring.packet_count(), 4);

        // A fresh reader starts at the earliest surviving packet
        let mut reader = RingReader::new();
        let p = ring.read_next(&mut reader).unwrap();
        assert_eq!(p.id, 3);
    }

    #[test]
    fn test_lapped_reader_jumps_forward() {
        let ring = volatile_ring(4, 128);
        ring.write_packet("S", b"a").unwrap();

        let mut reader = RingReader::new();
        ring.read_next(&mut reader).unwrap();

        for i in 0..8u8 {
            ring.write_packet("S", &[i]).unwrap();
        }
        let p = ring.read_next(&mut reader).unwrap();
        assert_eq!(p.id, 6); // earliest of ids 6..=9
    }

    #[test]
    fn test_oversized_packet_rejected() {
        let ring = volatile_ring(4, 64);
        let big = vec![0u8; 64];
        assert!(matches!(
            ring.write_packet("S", &big),
            Err(RingError::PacketTooLarge { .. })
        ));
    }

    #[test]
    fn test_persistence_across_reinit() {
        let dir = tempfile::tempdir().unwrap();
        {
            let ring =
                Ring::initialize(Some(dir.path()), 4 * 256, 256, false, false).unwrap();
            ring.write_packet("NET_STA", b"payload one").unwrap();
            ring.write_packet("NET_STA", b"payload two").unwrap();
            ring.shutdown().unwrap();
        }

        let ring = Ring::initialize(Some(dir.path()), 4 * 256, 256, false, false).unwrap();
        assert_eq!(ring.packet_count(), 2);
        let mut reader = RingReader::new();
        let p = ring.read_next(&mut reader).unwrap();
        assert_eq!(p.payload, b"payload one");
        // New packets continue the id sequence
        let id = ring.write_packet("NET_STA", b"payload three").unwrap();
        assert_eq!(id, 3);
    }

    #[test]
    fn test_geometry_mismatch_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        {
            let ring =
                Ring::initialize(Some(dir.path()), 4 * 256, 256, false, false).unwrap();
            ring.shutdown().unwrap();
        }
        let err = Ring::initialize(Some(dir.path()), 8 * 256, 256, false, false).unwrap_err();
        assert!(matches!(err, RingInitError::Corrupt(_)));
    }

    #[test]
    fn test_offsets_track_slot_positions() {
        let ring = volatile_ring(4, 100);
        assert!(ring.offsets().is_none());

        for _ in 0..3 {
            ring.write_packet("S", b"x").unwrap();
        }
        let off = ring.offsets().unwrap();
        assert_eq!(off.earliest, 0);
        assert_eq!(off.latest, 200);
        assert_eq!(off.max, 400);

        // Wrap: latest lands on a lower slot than earliest
        for _ in 0..3 {
            ring.write_packet("S", b"x").unwrap();
        }
        let off = ring.offsets().unwrap();
        assert_eq!(off.latest, 100); // id 6, slot index 1
        assert_eq!(off.earliest, 200); // id 3, slot index 2
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let ring = volatile_ring(4, 128);
        assert!(!ring.was_shut_down());
        ring.shutdown().unwrap();
        ring.shutdown().unwrap();
        assert!(ring.was_shut_down());
    }
}
