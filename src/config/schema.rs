//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the server.
//! All types derive Serde traits for deserialization from config files, and
//! `PartialEq` so an unchanged file re-read yields an equal snapshot.

use serde::{Deserialize, Serialize};

/// Root configuration for the packet server.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// General server settings (identity, limits, timeouts).
    pub server: GeneralConfig,

    /// Ring buffer settings.
    pub ring: RingConfig,

    /// IP-based access policy lists.
    pub access: AccessConfig,

    /// TLS settings for endpoints that enable it.
    pub tls: TlsConfig,

    /// Static HTTP resources handed to protocol handlers.
    pub web: WebConfig,

    /// Optional per-client archive sink.
    pub archive: ArchiveConfig,

    /// Transfer log settings.
    pub transfer_log: TransferLogConfig,

    /// Listener endpoint definitions.
    pub listen: Vec<ListenConfig>,

    /// Directory scanner definitions.
    pub scan: Vec<ScanConfig>,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// General server settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct GeneralConfig {
    /// Server identifier reported to clients.
    pub server_id: String,

    /// Log verbosity (0-3), mapped onto the tracing filter when no
    /// environment filter is set.
    pub verbosity: u8,

    /// Resolve client hostnames for display (numeric strings otherwise).
    pub resolve_hosts: bool,

    /// Maximum concurrent clients (0 = unlimited).
    pub max_clients: u32,

    /// Maximum concurrent clients per source address (0 = unlimited).
    pub max_clients_per_ip: u32,

    /// Idle client timeout in seconds (0 = no timeout).
    pub client_timeout_secs: u32,

    /// Fraction of the ring a time-window search may cover, 0.0 to 1.0.
    pub time_win_limit: f64,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            server_id: "Ringstream Server".to_string(),
            verbosity: 0,
            resolve_hosts: true,
            max_clients: 600,
            max_clients_per_ip: 0,
            client_timeout_secs: 3600,
            time_win_limit: 1.0,
        }
    }
}

/// Ring buffer settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct RingConfig {
    /// Directory holding the packet buffer and stream index files.
    pub dir: Option<String>,

    /// Total ring size in bytes.
    pub size: u64,

    /// Maximum packet slot size in bytes.
    pub pkt_size: u32,

    /// Memory-map the packet buffer file.
    pub memory_map: bool,

    /// Keep the ring in memory only, nothing persisted.
    pub volatile: bool,

    /// Recovery policy when the ring files are corrupt or an old version:
    /// 0 = fail, 1 = move aside and re-create, 2 = delete and re-create.
    pub auto_recovery: u8,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            dir: None,
            size: 1024 * 1024 * 1024,
            pkt_size: 512,
            memory_map: true,
            volatile: false,
            auto_recovery: 1,
        }
    }
}

/// IP-based access policy lists. Entries are CIDR strings; a bare address
/// implies a full-length mask.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default)]
pub struct AccessConfig {
    /// If non-empty, only sources matching an entry are admitted.
    pub match_ips: Vec<String>,

    /// Sources matching an entry are rejected.
    pub reject_ips: Vec<String>,

    /// Sources matching an entry may write packets into the ring, are
    /// exempt from the per-IP cap, and may use the reserve above the
    /// global cap.
    pub write_ips: Vec<String>,

    /// Sources matching an entry may access privileged protocol operations.
    pub trusted_ips: Vec<String>,

    /// Sources matching an entry only see streams matching the pattern.
    pub limit_ips: Vec<LimitEntry>,
}

/// A stream-limit policy entry: sources inside `net` may only use streams
/// matching `streams`.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct LimitEntry {
    /// CIDR network the limit applies to.
    pub net: String,

    /// Regular expression on stream IDs.
    pub streams: String,
}

/// TLS settings for endpoints that enable it.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default)]
pub struct TlsConfig {
    /// Path to certificate file (PEM).
    pub cert_file: Option<String>,

    /// Path to private key file (PEM).
    pub key_file: Option<String>,

    /// Require and verify client certificates.
    pub verify_client_cert: bool,
}

/// Static HTTP resources handed to protocol handlers.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default)]
pub struct WebConfig {
    /// Root directory for static file serving.
    pub root: Option<String>,

    /// Fixed header lines added to every HTTP response.
    pub http_headers: Vec<String>,
}

/// Optional per-client archive sink for received packets.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ArchiveConfig {
    /// Base directory for archive files; archiving is off when unset.
    pub dir: Option<String>,

    /// Close archive files idle longer than this many seconds.
    pub idle_timeout_secs: u32,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            dir: None,
            idle_timeout_secs: 300,
        }
    }
}

/// Transfer log settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct TransferLogConfig {
    /// Base directory for transfer logs; logging is off when unset.
    pub dir: Option<String>,

    /// Prefix for transfer log file names.
    pub prefix: Option<String>,

    /// Log interval in hours.
    pub interval_hours: f64,

    /// Record transmission (server to client) totals.
    pub tx_log: bool,

    /// Record reception (client to server) totals.
    pub rx_log: bool,
}

impl Default for TransferLogConfig {
    fn default() -> Self {
        Self {
            dir: None,
            prefix: None,
            interval_hours: 24.0,
            tx_log: true,
            rx_log: true,
        }
    }
}

/// One listener endpoint.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ListenConfig {
    /// Numeric TCP port, or a filesystem path for a UNIX socket.
    pub port: String,

    /// Protocols served on this endpoint ("DataLink", "SeedLink", "HTTP").
    /// Empty means all three.
    pub protocols: Vec<String>,

    /// Address families to accept: "IPv4", "IPv6", "UNIX". Empty means
    /// IPv4 + IPv6 for numeric ports, UNIX for paths.
    pub families: Vec<String>,

    /// Serve TLS on this endpoint.
    pub tls: bool,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            port: "16000".to_string(),
            protocols: Vec::new(),
            families: Vec::new(),
            tls: false,
        }
    }
}

/// One directory scanner job.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ScanConfig {
    /// Directory to scan for packet files.
    pub dir: String,

    /// File persisting per-file read offsets across restarts.
    pub state_file: Option<String>,

    /// Only scan file names matching this pattern.
    #[serde(rename = "match")]
    pub match_pattern: Option<String>,

    /// Skip file names matching this pattern.
    #[serde(rename = "reject")]
    pub reject_pattern: Option<String>,

    /// Ingest pre-existing file content on first sight instead of starting
    /// at the current end of file.
    pub init_current_state: bool,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            dir: String::new(),
            state_file: None,
            match_pattern: None,
            reject_pattern: None,
            init_current_state: false,
        }
    }
}

/// Observability settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable the Prometheus metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}
