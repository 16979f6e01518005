//! Per-connection client record and statistics.
//!
//! # Responsibilities
//! - Hold everything the server knows about one accepted connection
//! - Accumulate tx/rx counters on the hot path without locking
//! - Compute transfer rates and ring lag on the supervisor's pass
//!
//! # Design Decisions
//! - Counters are atomics written by the owning client task and read by
//!   the supervisor; they only ever increase, so unsynchronized snapshots
//!   are safe for rate purposes
//! - The one-step rate history lives behind a mutex touched only by the
//!   supervisor, keeping the write path free of it

pub mod archive;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use regex::Regex;

use crate::net::{PeerAddr, ProtocolSet};
use crate::protocol::ProtocolKind;
use crate::ring::{ReaderPosition, RingOffsets, RingReader};

pub use archive::{ArchiveSpec, ArchiveWriter};

/// Everything the server tracks for one accepted connection.
pub struct ClientRecord {
    /// Registry unit id.
    pub id: u64,
    /// Remote socket address as accepted.
    pub peer: PeerAddr,
    /// Numeric host string ("unix" for UNIX peers).
    pub host: String,
    /// Numeric port string (the socket path for UNIX peers).
    pub port: String,
    /// Port string of the endpoint that admitted this client.
    pub server_port: String,
    /// Protocols permitted by the admitting endpoint.
    pub protocols: ProtocolSet,
    /// Endpoint served TLS.
    pub tls: bool,
    /// Source may write packets into the ring.
    pub write_permitted: bool,
    /// Source may use privileged protocol operations.
    pub trusted: bool,
    /// Stream-ID pattern this source is limited to, if any.
    pub limit: Option<Regex>,
    /// Fixed header lines for HTTP responses.
    pub http_headers: Vec<String>,
    /// Fraction of the ring a time-window search may cover.
    pub time_win_limit: f64,
    /// Wall-clock connect time, for logs.
    pub connect_time: DateTime<Utc>,
    /// Connect time in monotonic nanoseconds.
    pub connected_at: u64,
    /// Last data exchange in monotonic nanoseconds; starts at connect.
    last_exchange: AtomicU64,
    /// Protocol detected by the handler; Undetermined until the handshake.
    pub protocol: Mutex<ProtocolKind>,
    /// Display identifier, refined by the protocol handshake.
    pub client_id: Mutex<String>,
    /// Transfer counters and rate history.
    pub stats: ClientStats,
    /// Cursor into the ring, set once the client starts reading.
    pub reader: Mutex<Option<RingReader>>,
    /// Archive sink settings when archiving is configured.
    pub archive: Option<ArchiveSpec>,
}

impl ClientRecord {
    /// "host:port" for log lines.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Record a data exchange at the given monotonic time.
    pub fn touch(&self, now_nanos: u64) {
        self.last_exchange.store(now_nanos, Ordering::Relaxed);
    }

    pub fn last_exchange(&self) -> u64 {
        self.last_exchange.load(Ordering::Relaxed)
    }

    pub fn set_protocol(&self, kind: ProtocolKind) {
        *self.protocol.lock().expect("protocol lock poisoned") = kind;
    }

    pub fn protocol(&self) -> ProtocolKind {
        *self.protocol.lock().expect("protocol lock poisoned")
    }

    /// Reader position for the lag calculation.
    pub fn reader_position(&self) -> Option<ReaderPosition> {
        self.reader
            .lock()
            .expect("reader lock poisoned")
            .as_ref()
            .and_then(|r| r.position())
    }
}

/// Builder-free construction helper used by the listener; keeps the field
/// soup in one place.
pub struct ClientParams {
    pub id: u64,
    pub peer: PeerAddr,
    pub host: String,
    pub port: String,
    pub server_port: String,
    pub protocols: ProtocolSet,
    pub tls: bool,
    pub write_permitted: bool,
    pub trusted: bool,
    pub limit: Option<Regex>,
    pub http_headers: Vec<String>,
    pub time_win_limit: f64,
    pub connect_time: DateTime<Utc>,
    pub connected_at: u64,
    pub archive: Option<ArchiveSpec>,
}

impl From<ClientParams> for ClientRecord {
    fn from(p: ClientParams) -> Self {
        Self {
            id: p.id,
            peer: p.peer,
            host: p.host,
            port: p.port,
            server_port: p.server_port,
            protocols: p.protocols,
            tls: p.tls,
            write_permitted: p.write_permitted,
            trusted: p.trusted,
            limit: p.limit,
            http_headers: p.http_headers,
            time_win_limit: p.time_win_limit,
            connect_time: p.connect_time,
            connected_at: p.connected_at,
            last_exchange: AtomicU64::new(p.connected_at),
            protocol: Mutex::new(ProtocolKind::Undetermined),
            client_id: Mutex::new("Client".to_string()),
            stats: ClientStats::new(),
            reader: Mutex::new(None),
            archive: p.archive,
        }
    }
}

/// One supervisor pass worth of derived rates.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RateSnapshot {
    pub tx_packet_rate: f64,
    pub tx_byte_rate: f64,
    pub rx_packet_rate: f64,
    pub rx_byte_rate: f64,
    pub percent_lag: u8,
}

/// Interval totals handed to the transfer log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferTotals {
    pub tx_packets: u64,
    pub tx_bytes: u64,
    pub rx_packets: u64,
    pub rx_bytes: u64,
}

#[derive(Debug, Default)]
struct StatsWindow {
    prev_tx_packets: u64,
    prev_tx_bytes: u64,
    prev_rx_packets: u64,
    prev_rx_bytes: u64,
    logged: TransferTotals,
    rate_time: Option<u64>,
    rates: RateSnapshot,
}

/// Cumulative transfer counters with a one-step history for rates.
pub struct ClientStats {
    tx_packets: AtomicU64,
    tx_bytes: AtomicU64,
    rx_packets: AtomicU64,
    rx_bytes: AtomicU64,
    window: Mutex<StatsWindow>,
}

impl ClientStats {
    pub fn new() -> Self {
        Self {
            tx_packets: AtomicU64::new(0),
            tx_bytes: AtomicU64::new(0),
            rx_packets: AtomicU64::new(0),
            rx_bytes: AtomicU64::new(0),
            window: Mutex::new(StatsWindow::default()),
        }
    }

    /// Record one packet sent to the client.
    pub fn record_tx(&self, bytes: u64) {
        self.tx_packets.fetch_add(1, Ordering::Relaxed);
        self.tx_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Record one packet received from the client.
    pub fn record_rx(&self, bytes: u64) {
        self.rx_packets.fetch_add(1, Ordering::Relaxed);
        self.rx_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn tx_packets(&self) -> u64 {
        self.tx_packets.load(Ordering::Relaxed)
    }

    pub fn tx_bytes(&self) -> u64 {
        self.tx_bytes.load(Ordering::Relaxed)
    }

    pub fn rx_packets(&self) -> u64 {
        self.rx_packets.load(Ordering::Relaxed)
    }

    pub fn rx_bytes(&self) -> u64 {
        self.rx_bytes.load(Ordering::Relaxed)
    }

    /// Update rates from the counter deltas and roll current values into
    /// the history. Must be called from one thread only (the supervisor).
    pub fn calc(&self, now_nanos: u64, percent_lag: u8) -> RateSnapshot {
        let tx_packets = self.tx_packets();
        let tx_bytes = self.tx_bytes();
        let rx_packets = self.rx_packets();
        let rx_bytes = self.rx_bytes();

        let mut guard = self.window.lock().expect("stats window lock poisoned");
        let window = &mut *guard;

        let delta_sec = match window.rate_time {
            None => 1.0,
            Some(t) => ((now_nanos.saturating_sub(t)) as f64 / 1e9).max(1e-3),
        };

        if tx_packets > 0 {
            window.rates.tx_packet_rate =
                (tx_packets - window.prev_tx_packets) as f64 / delta_sec;
            window.rates.tx_byte_rate = (tx_bytes - window.prev_tx_bytes) as f64 / delta_sec;
            window.prev_tx_packets = tx_packets;
            window.prev_tx_bytes = tx_bytes;
        }
        if rx_packets > 0 {
            window.rates.rx_packet_rate =
                (rx_packets - window.prev_rx_packets) as f64 / delta_sec;
            window.rates.rx_byte_rate = (rx_bytes - window.prev_rx_bytes) as f64 / delta_sec;
            window.prev_rx_packets = rx_packets;
            window.prev_rx_bytes = rx_bytes;
        }

        window.rate_time = Some(now_nanos);
        window.rates.percent_lag = percent_lag;
        window.rates
    }

    /// Latest computed rates without recomputation.
    pub fn rates(&self) -> RateSnapshot {
        self.window.lock().expect("stats window lock poisoned").rates
    }

    /// Counter deltas since the previous transfer-log row.
    pub fn take_interval_totals(&self) -> TransferTotals {
        let mut window = self.window.lock().expect("stats window lock poisoned");
        let current = TransferTotals {
            tx_packets: self.tx_packets(),
            tx_bytes: self.tx_bytes(),
            rx_packets: self.rx_packets(),
            rx_bytes: self.rx_bytes(),
        };
        let delta = TransferTotals {
            tx_packets: current.tx_packets - window.logged.tx_packets,
            tx_bytes: current.tx_bytes - window.logged.tx_bytes,
            rx_packets: current.rx_packets - window.logged.rx_packets,
            rx_bytes: current.rx_bytes - window.logged.rx_bytes,
        };
        window.logged = current;
        delta
    }
}

impl Default for ClientStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Percent lag of a reader in the ring: 0% at the latest packet, 100% at
/// the earliest. Offsets below the earliest are unwrapped by adding the
/// ring's maximum offset. With no valid position, or a degenerate ring
/// where latest and earliest coincide, there is no lag to report.
pub fn percent_lag(position: Option<ReaderPosition>, offsets: Option<RingOffsets>) -> u8 {
    let (Some(pos), Some(off)) = (position, offsets) else {
        return 0;
    };

    let latest_unwrapped = if off.latest < off.earliest {
        off.latest + off.max
    } else {
        off.latest
    };
    let reader_unwrapped = if pos.pkt_offset < off.earliest {
        pos.pkt_offset + off.max
    } else {
        pos.pkt_offset
    };

    let denominator = latest_unwrapped.saturating_sub(off.earliest);
    if denominator == 0 {
        return 0;
    }

    let lag = latest_unwrapped.saturating_sub(reader_unwrapped) as f64 / denominator as f64;
    (lag * 100.0).clamp(0.0, 100.0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEC: u64 = 1_000_000_000;

    #[test]
    fn test_rates_from_counter_deltas() {
        let stats = ClientStats::new();
        stats.record_tx(100);
        stats.record_tx(100);

        // First call assumes a one-second window
        let r = stats.calc(SEC, 0);
        assert_eq!(r.tx_packet_rate, 2.0);
        assert_eq!(r.tx_byte_rate, 200.0);

        stats.record_tx(50);
        let r = stats.calc(3 * SEC, 0);
        assert_eq!(r.tx_packet_rate, 0.5);
        assert_eq!(r.tx_byte_rate, 25.0);
    }

    #[test]
    fn test_unchanged_counters_rate_is_zero() {
        let stats = ClientStats::new();
        stats.record_rx(64);
        stats.calc(SEC, 0);
        let r = stats.calc(2 * SEC, 0);
        assert_eq!(r.rx_packet_rate, 0.0);
        assert_eq!(r.rx_byte_rate, 0.0);
    }

    #[test]
    fn test_no_traffic_no_rates() {
        let stats = ClientStats::new();
        let r = stats.calc(SEC, 0);
        assert_eq!(r, RateSnapshot::default());
    }

    #[test]
    fn test_interval_totals_are_deltas() {
        let stats = ClientStats::new();
        stats.record_tx(10);
        stats.record_tx(10);
        assert_eq!(
            stats.take_interval_totals(),
            TransferTotals {
                tx_packets: 2,
                tx_bytes: 20,
                ..Default::default()
            }
        );

        stats.record_tx(5);
        let second = stats.take_interval_totals();
        assert_eq!(second.tx_packets, 1);
        assert_eq!(second.tx_bytes, 5);
    }

    #[test]
    fn test_percent_lag_bounds() {
        let off = RingOffsets {
            earliest: 0,
            latest: 900,
            max: 1000,
        };
        let at = |o| {
            percent_lag(
                Some(ReaderPosition {
                    pkt_id: 1,
                    pkt_offset: o,
                }),
                Some(off),
            )
        };
        assert_eq!(at(900), 0);
        assert_eq!(at(0), 100);
        assert_eq!(at(450), 50);
    }

    #[test]
    fn test_percent_lag_unwraps_offsets() {
        // Wrapped ring: latest slot sits below the earliest slot
        let off = RingOffsets {
            earliest: 600,
            latest: 400,
            max: 1000,
        };
        // Reader just behind the latest packet, also in the wrapped region
        let lag = percent_lag(
            Some(ReaderPosition {
                pkt_id: 9,
                pkt_offset: 200,
            }),
            Some(off),
        );
        assert_eq!(lag, 25); // (1400 - 1200) / (1400 - 600)
    }

    #[test]
    fn test_percent_lag_degenerate_cases() {
        assert_eq!(percent_lag(None, None), 0);
        let off = RingOffsets {
            earliest: 100,
            latest: 100,
            max: 1000,
        };
        assert_eq!(
            percent_lag(
                Some(ReaderPosition {
                    pkt_id: 1,
                    pkt_offset: 100
                }),
                Some(off)
            ),
            0
        );
    }
}
