//! Streaming packet server binary.
//!
//! Reads its configuration from a TOML file (`-c` or `RS_CONFIG_FILE`),
//! overlaid by `RS_*` environment variables and command-line flags, in
//! that order of increasing precedence. Exits 0 on clean shutdown and
//! non-zero on any initialization failure.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;

use ringstream::config::loader::read_config;
use ringstream::config::validation::validate_config;
use ringstream::config::Snapshot;
use ringstream::observability;
use ringstream::protocol::BasicHandler;
use ringstream::ring::recovery::open_ring;
use ringstream::Server;
use ringstream::ServerConfig;

#[derive(Parser)]
#[command(name = "ringstream")]
#[command(about = "Streaming packet server with a fixed-capacity ring buffer")]
#[command(version)]
struct Cli {
    /// Configuration file (or RS_CONFIG_FILE)
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Raise log verbosity (repeatable)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    verbose: u8,

    /// Server identifier reported to clients
    #[arg(long)]
    server_id: Option<String>,

    /// Ring directory
    #[arg(short = 'R', long)]
    ring_dir: Option<String>,

    /// Ring size in bytes
    #[arg(long)]
    ring_size: Option<u64>,

    /// Maximum packet slot size in bytes
    #[arg(long)]
    pkt_size: Option<u32>,

    /// Memory-map the packet buffer file
    #[arg(long)]
    memory_map_ring: Option<bool>,

    /// Keep the ring in memory only
    #[arg(long)]
    volatile_ring: Option<bool>,

    /// Recovery policy for corrupt or old-version ring files (0, 1, 2)
    #[arg(long)]
    auto_recovery: Option<u8>,

    /// Maximum concurrent clients (0 = unlimited)
    #[arg(long)]
    max_clients: Option<u32>,

    /// Maximum concurrent clients per source address
    #[arg(long)]
    max_clients_per_ip: Option<u32>,

    /// Idle client timeout in seconds
    #[arg(long)]
    client_timeout: Option<u32>,

    /// Time-window search limit, 0.0 to 1.0
    #[arg(long)]
    time_win_limit: Option<f64>,

    /// Listen endpoint port (repeatable); replaces configured endpoints
    #[arg(short = 'L', long = "listen")]
    listen: Vec<String>,

    /// Admit only sources matching this network (repeatable)
    #[arg(long = "match-ip")]
    match_ips: Vec<String>,

    /// Reject sources matching this network (repeatable)
    #[arg(long = "reject-ip")]
    reject_ips: Vec<String>,

    /// Grant write permission to this network (repeatable)
    #[arg(long = "write-ip")]
    write_ips: Vec<String>,

    /// Trust this network (repeatable)
    #[arg(long = "trusted-ip")]
    trusted_ips: Vec<String>,

    /// TLS certificate file (PEM)
    #[arg(long)]
    tls_cert_file: Option<String>,

    /// TLS key file (PEM)
    #[arg(long)]
    tls_key_file: Option<String>,

    /// Web root for static HTTP serving
    #[arg(long)]
    web_root: Option<String>,

    /// Archive directory for received packets
    #[arg(long)]
    archive_dir: Option<String>,

    /// Transfer log directory
    #[arg(long)]
    tlog_dir: Option<String>,

    /// Directory to scan for packet files; replaces configured scanners
    #[arg(long)]
    scan_dir: Option<String>,

    /// State file persisting per-file scan offsets (with --scan-dir)
    #[arg(long)]
    scan_state_file: Option<String>,

    /// Only scan file names matching this pattern (with --scan-dir)
    #[arg(long)]
    scan_match: Option<String>,

    /// Skip file names matching this pattern (with --scan-dir)
    #[arg(long)]
    scan_reject: Option<String>,

    /// Ingest pre-existing file content on first sight (with --scan-dir)
    #[arg(long)]
    scan_init_current_state: Option<bool>,
}

impl Cli {
    fn apply(&self, config: &mut ServerConfig) {
        if self.verbose > 0 {
            config.server.verbosity = self.verbose;
        }
        if let Some(v) = &self.server_id {
            config.server.server_id = v.clone();
        }
        if let Some(v) = &self.ring_dir {
            config.ring.dir = Some(v.clone());
        }
        if let Some(v) = self.ring_size {
            config.ring.size = v;
        }
        if let Some(v) = self.pkt_size {
            config.ring.pkt_size = v;
        }
        if let Some(v) = self.memory_map_ring {
            config.ring.memory_map = v;
        }
        if let Some(v) = self.volatile_ring {
            config.ring.volatile = v;
        }
        if let Some(v) = self.auto_recovery {
            config.ring.auto_recovery = v;
        }
        if let Some(v) = self.max_clients {
            config.server.max_clients = v;
        }
        if let Some(v) = self.max_clients_per_ip {
            config.server.max_clients_per_ip = v;
        }
        if let Some(v) = self.client_timeout {
            config.server.client_timeout_secs = v;
        }
        if let Some(v) = self.time_win_limit {
            config.server.time_win_limit = v;
        }
        if !self.listen.is_empty() {
            config.listen = self
                .listen
                .iter()
                .map(|port| ringstream::config::schema::ListenConfig {
                    port: port.clone(),
                    ..Default::default()
                })
                .collect();
        }
        if !self.match_ips.is_empty() {
            config.access.match_ips = self.match_ips.clone();
        }
        if !self.reject_ips.is_empty() {
            config.access.reject_ips = self.reject_ips.clone();
        }
        if !self.write_ips.is_empty() {
            config.access.write_ips = self.write_ips.clone();
        }
        if !self.trusted_ips.is_empty() {
            config.access.trusted_ips = self.trusted_ips.clone();
        }
        if let Some(v) = &self.tls_cert_file {
            config.tls.cert_file = Some(v.clone());
        }
        if let Some(v) = &self.tls_key_file {
            config.tls.key_file = Some(v.clone());
        }
        if let Some(v) = &self.web_root {
            config.web.root = Some(v.clone());
        }
        if let Some(v) = &self.archive_dir {
            config.archive.dir = Some(v.clone());
        }
        if let Some(v) = &self.tlog_dir {
            config.transfer_log.dir = Some(v.clone());
        }
        if let Some(dir) = &self.scan_dir {
            config.scan = vec![ringstream::config::schema::ScanConfig {
                dir: dir.clone(),
                state_file: self.scan_state_file.clone(),
                match_pattern: self.scan_match.clone(),
                reject_pattern: self.scan_reject.clone(),
                init_current_state: self.scan_init_current_state.unwrap_or(false),
            }];
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .clone()
        .or_else(|| std::env::var("RS_CONFIG_FILE").ok().map(PathBuf::from));

    let mut config = match read_config(config_path.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error reading configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };
    cli.apply(&mut config);

    observability::logging::init(&config.observability, config.server.verbosity);

    if let Err(errors) = validate_config(&config) {
        for error in &errors {
            tracing::error!("{}", error);
        }
        return ExitCode::FAILURE;
    }

    tracing::info!("ringstream v{} starting", env!("CARGO_PKG_VERSION"));

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => observability::metrics::init_metrics(addr),
            Err(_) => {
                tracing::error!(
                    metrics_address = %config.observability.metrics_address,
                    "Failed to parse metrics address"
                );
            }
        }
    }

    let ring = match open_ring(&config.ring) {
        Ok(ring) => ring,
        Err(e) => {
            tracing::error!(error = %e, "Error initializing ring buffer");
            return ExitCode::FAILURE;
        }
    };

    let snapshot = match Snapshot::new(config) {
        Ok(snapshot) => snapshot,
        Err(e) => {
            tracing::error!(error = %e, "Error compiling configuration");
            return ExitCode::FAILURE;
        }
    };

    let server = Server::new(snapshot, ring, Arc::new(BasicHandler), config_path);
    let code = server.run().await;
    ExitCode::from(code)
}
