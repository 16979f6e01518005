//! Server core: shared state, startup, and shutdown.
//!
//! A [`Server`] value owns everything the process needs: the configuration
//! snapshot, the client registry, the ring handle and the shutdown flag.
//! The only cross-task signal is the shutdown flag, shared with the signal
//! dispatcher and the listeners.

pub mod registry;
pub mod signals;
pub mod supervisor;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;

use tokio::sync::Notify;

use crate::config::{ConfigWatcher, Snapshot};
use crate::net::listener::{ListenerError, ListenerShared};
use crate::net::ListenEndpoint;
use crate::protocol::ProtocolHandler;
use crate::ring::Ring;
use crate::scanner::ScanJob;
use crate::server::registry::{ClientRegistry, ServerPayload, ServerSlot};
use crate::server::supervisor::Supervisor;

/// Monotonic time base for the whole process.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    start: Instant,
}

impl Clock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Nanoseconds since server start.
    pub fn now_nanos(&self) -> u64 {
        self.start.elapsed().as_nanos() as u64
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

/// Process-wide shutdown request flag.
#[derive(Clone)]
pub struct ShutdownFlag {
    inner: Arc<ShutdownInner>,
}

struct ShutdownInner {
    requested: AtomicBool,
    changed: Notify,
}

impl ShutdownFlag {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ShutdownInner {
                requested: AtomicBool::new(false),
                changed: Notify::new(),
            }),
        }
    }

    /// Request shutdown; observed by the supervisor on its next tick and
    /// by anything waiting on [`requested`](Self::requested).
    pub fn request(&self) {
        self.inner.requested.store(true, Ordering::SeqCst);
        self.inner.changed.notify_waiters();
    }

    pub fn is_requested(&self) -> bool {
        self.inner.requested.load(Ordering::SeqCst)
    }

    /// Resolve once shutdown has been requested.
    pub async fn requested(&self) {
        let notified = self.inner.changed.notified();
        tokio::pin!(notified);
        loop {
            notified.as_mut().enable();
            if self.is_requested() {
                return;
            }
            notified.as_mut().await;
            notified.set(self.inner.changed.notified());
        }
    }
}

impl Default for ShutdownFlag {
    fn default() -> Self {
        Self::new()
    }
}

/// State shared between the supervisor, listeners, clients and the signal
/// dispatcher.
pub struct Shared {
    snapshot: RwLock<Arc<Snapshot>>,
    snapshot_generation: AtomicU64,
    pub clients: ClientRegistry,
    pub ring: Arc<Ring>,
    pub shutdown: ShutdownFlag,
    pub clock: Clock,
    pub handler: Arc<dyn ProtocolHandler>,
}

impl Shared {
    /// Current configuration snapshot.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        Arc::clone(&self.snapshot.read().expect("snapshot lock poisoned"))
    }

    /// Swap in a re-read configuration. Established sessions keep the
    /// values they copied at connect time.
    pub fn install_snapshot(&self, snapshot: Snapshot) {
        *self.snapshot.write().expect("snapshot lock poisoned") = Arc::new(snapshot);
        self.snapshot_generation.fetch_add(1, Ordering::Relaxed);
    }

    /// How many times the configuration has been swapped since startup.
    pub fn snapshot_generation(&self) -> u64 {
        self.snapshot_generation.load(Ordering::Relaxed)
    }

    /// Log server parameters, used at startup and for the diagnostic dump.
    pub fn log_parameters(&self) {
        let snapshot = self.snapshot();
        let config = &snapshot.config;
        tracing::info!("Server parameters:");
        tracing::info!("   server ID: {}", config.server.server_id);
        tracing::info!(
            "   ring directory: {}",
            config.ring.dir.as_deref().unwrap_or("NONE")
        );
        tracing::info!("   max clients: {}", config.server.max_clients);
        tracing::info!("   max clients per IP: {}", config.server.max_clients_per_ip);
        tracing::info!("   client timeout: {} seconds", config.server.client_timeout_secs);
        tracing::info!(
            "   time window limit: {:.0}%",
            config.server.time_win_limit * 100.0
        );
        tracing::info!(
            "   resolve hostnames: {}",
            if config.server.resolve_hosts { "yes" } else { "no" }
        );
        tracing::info!("   auto recovery: {}", config.ring.auto_recovery);
        tracing::info!(
            "   TLS certificate file: {}",
            config.tls.cert_file.as_deref().unwrap_or("NONE")
        );
        tracing::info!(
            "   TLS key file: {}",
            config.tls.key_file.as_deref().unwrap_or("NONE")
        );
        tracing::info!(
            "   web root: {}",
            config.web.root.as_deref().unwrap_or("NONE")
        );
        tracing::info!(
            "   archive: {}",
            config.archive.dir.as_deref().unwrap_or("NONE")
        );
        tracing::info!(
            "   transfer log: {}",
            config.transfer_log.dir.as_deref().unwrap_or("NONE")
        );
        for (name, list) in [
            ("match", &snapshot.policy.match_ips),
            ("reject", &snapshot.policy.reject_ips),
            ("write", &snapshot.policy.write_ips),
            ("trusted", &snapshot.policy.trusted_ips),
            ("limit", &snapshot.policy.limit_ips),
        ] {
            for net in list.iter() {
                tracing::info!("   {} IP range: {}", name, net);
            }
        }
        tracing::info!("   client connections: {}", self.clients.count());
    }
}

/// The packet server. Construct, optionally pre-bind endpoints (tests use
/// port 0), then [`run`](Self::run) to completion.
pub struct Server {
    shared: Arc<Shared>,
    listeners: Vec<Arc<ListenerShared>>,
    scan_jobs: Vec<Arc<ScanJob>>,
    config_path: Option<PathBuf>,
}

impl Server {
    pub fn new(
        snapshot: Snapshot,
        ring: Ring,
        handler: Arc<dyn ProtocolHandler>,
        config_path: Option<PathBuf>,
    ) -> Self {
        let listeners = snapshot
            .config
            .listen
            .iter()
            .map(|l| Arc::new(ListenerShared::new(ListenEndpoint::from_config(l))))
            .collect();
        let scan_jobs = snapshot
            .config
            .scan
            .iter()
            .filter_map(|s| match ScanJob::from_config(s) {
                Ok(job) => Some(Arc::new(job)),
                Err(e) => {
                    tracing::error!(dir = %s.dir, error = %e, "Skipping invalid scan job");
                    None
                }
            })
            .collect();

        let shared = Arc::new(Shared {
            snapshot: RwLock::new(Arc::new(snapshot)),
            snapshot_generation: AtomicU64::new(0),
            clients: ClientRegistry::new(),
            ring: Arc::new(ring),
            shutdown: ShutdownFlag::new(),
            clock: Clock::new(),
            handler,
        });

        Self {
            shared,
            listeners,
            scan_jobs,
            config_path,
        }
    }

    /// Bind every endpoint socket. Called before the supervisor starts so
    /// a bad endpoint fails startup; also lets tests discover the port of
    /// endpoints configured with port 0.
    pub fn bind_endpoints(&self) -> Result<Vec<Option<u16>>, ListenerError> {
        let mut ports = Vec::with_capacity(self.listeners.len());
        for listener in &self.listeners {
            listener.bind()?;
            ports.push(listener.local_port());
        }
        Ok(ports)
    }

    pub fn shutdown_flag(&self) -> ShutdownFlag {
        self.shared.shutdown.clone()
    }

    pub fn shared(&self) -> Arc<Shared> {
        Arc::clone(&self.shared)
    }

    /// Run the server to completion: spawn the signal dispatcher, start
    /// all server units, and drive the supervisor loop. Returns the
    /// process exit code.
    pub async fn run(self) -> u8 {
        if let Err(e) = self.bind_endpoints() {
            tracing::error!(error = %e, "Cannot bind listen endpoints");
            return 1;
        }

        let signal_task = signals::spawn(Arc::clone(&self.shared));

        self.shared.ring.log_parameters();
        self.shared.log_parameters();

        let mut slots: Vec<ServerSlot> = Vec::new();
        for listener in &self.listeners {
            slots.push(ServerSlot::new(ServerPayload::Listener(Arc::clone(listener))));
        }
        for job in &self.scan_jobs {
            slots.push(ServerSlot::new(ServerPayload::Scanner(Arc::clone(job))));
        }

        let watcher = ConfigWatcher::new(self.config_path.clone());
        let supervisor = Supervisor::new(Arc::clone(&self.shared), slots, watcher);
        supervisor.run().await;

        let mut code = 0;
        if let Err(e) = self.shared.ring.shutdown() {
            tracing::error!(error = %e, "Error shutting down ring buffer");
            code = 1;
        }

        signal_task.abort();
        let _ = signal_task.await;

        tracing::info!("Shutdown complete");
        code
    }
}
