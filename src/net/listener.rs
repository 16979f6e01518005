//! Connection acceptance and admission.
//!
//! # Responsibilities
//! - Accept incoming connections on one bound endpoint
//! - Apply the IP policy lists and connection caps, in order
//! - Build the client record and hand off to the protocol handler task
//!
//! # Admission order
//! ```text
//! match list → reject list → per-IP cap (write-exempt) → global cap
//!                                                        (write reserve)
//! ```
//!
//! # Design Decisions
//! - Transient accept errors retry; terminal errors end the acceptor and
//!   the supervisor restarts it on its next pass
//! - Policy is evaluated against the snapshot current at accept time
//! - UNIX peers carry no usable source address: they fail a configured
//!   match list and never gain write or trusted permissions

use std::io;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::io::AsyncWriteExt;

use crate::client::{ArchiveSpec, ClientParams, ClientRecord};
use crate::net::{BoundSocket, ClientStream, ListenEndpoint, PeerAddr};
use crate::protocol::{self, ClientCtx};
use crate::server::registry::{ClientUnit, LifecycleCell};
use crate::server::Shared;

/// Admissions allowed above the global cap for write-permitted sources.
pub const RESERVE_CONNECTIONS: usize = 10;

/// Error type for listener operations.
#[derive(Debug)]
pub enum ListenerError {
    /// Failed to bind to an endpoint.
    Bind(String, io::Error),
    /// Failed to accept a connection.
    Accept(io::Error),
}

impl std::fmt::Display for ListenerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ListenerError::Bind(port, e) => write!(f, "Failed to bind port {}: {}", port, e),
            ListenerError::Accept(e) => write!(f, "Failed to accept: {}", e),
        }
    }
}

impl std::error::Error for ListenerError {}

/// Listener state that outlives worker restarts: the endpoint description
/// and the bound socket. The supervisor closes the socket to drain.
pub struct ListenerShared {
    pub endpoint: ListenEndpoint,
    socket: Mutex<Option<Arc<BoundSocket>>>,
}

impl ListenerShared {
    pub fn new(endpoint: ListenEndpoint) -> Self {
        Self {
            endpoint,
            socket: Mutex::new(None),
        }
    }

    /// Bind the endpoint if it is not already bound.
    pub fn bind(&self) -> Result<(), ListenerError> {
        let mut socket = self.socket.lock().expect("listener socket lock poisoned");
        if socket.is_none() {
            let bound = self
                .endpoint
                .bind()
                .map_err(|e| ListenerError::Bind(self.endpoint.port.clone(), e))?;
            tracing::info!(
                port = %self.endpoint.port,
                endpoint = %self.endpoint.describe(),
                "Listener bound"
            );
            *socket = Some(Arc::new(bound));
        }
        Ok(())
    }

    pub fn socket(&self) -> Option<Arc<BoundSocket>> {
        self.socket
            .lock()
            .expect("listener socket lock poisoned")
            .clone()
    }

    /// Drop the bound socket, unblocking the acceptor.
    pub fn close_socket(&self) {
        let taken = self
            .socket
            .lock()
            .expect("listener socket lock poisoned")
            .take();
        if taken.is_some() {
            tracing::debug!(port = %self.endpoint.port, "Closing server socket");
        }
    }

    pub fn local_port(&self) -> Option<u16> {
        self.socket
            .lock()
            .expect("listener socket lock poisoned")
            .as_ref()
            .and_then(|s| s.local_port())
    }
}

/// Acceptor worker: one task per listener unit.
pub async fn listen_task(
    shared: Arc<Shared>,
    listener: Arc<ListenerShared>,
    lifecycle: Arc<LifecycleCell>,
) {
    lifecycle.set_active();

    // A restarted worker re-binds if the socket was lost with it
    if let Err(e) = listener.bind() {
        if !shared.shutdown.is_requested() {
            tracing::error!(error = %e, "Listener could not bind");
        }
        lifecycle.set_closed();
        return;
    }
    let socket = match listener.socket() {
        Some(socket) => socket,
        None => {
            lifecycle.set_closed();
            return;
        }
    };

    tracing::info!(
        port = %listener.endpoint.port,
        endpoint = %listener.endpoint.describe(),
        "Listening for connections"
    );

    loop {
        tokio::select! {
            biased;
            _ = shared.shutdown.requested() => break,
            _ = lifecycle.close_requested() => break,
            accepted = socket.accept() => match accepted {
                Ok((stream, peer)) => {
                    admit(&shared, &listener.endpoint, stream, peer).await;
                }
                Err(e) if is_transient(&e) => continue,
                Err(e) => {
                    if !shared.shutdown.is_requested() {
                        tracing::error!(error = %e, "Could not accept incoming connection");
                    }
                    break;
                }
            }
        }
    }

    drop(socket);
    lifecycle.set_closed();
    tracing::info!(port = %listener.endpoint.port, "Listener closing");
    if listener.endpoint.is_unix() {
        let _ = std::fs::remove_file(&listener.endpoint.port);
    }
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::Interrupted
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
    )
}

/// Why a connection was turned away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    /// A match list is configured and the source is not on it.
    NoMatch,
    /// The source is on the reject list.
    Rejected,
    /// The per-address cap would be exceeded.
    TooManyFromSource(usize),
    /// The global cap (plus any applicable reserve) is exhausted.
    MaxClients,
}

/// What an admitted connection is granted.
#[derive(Debug)]
pub struct AdmissionGrants {
    pub write_permitted: bool,
    pub trusted: bool,
    pub limit: Option<regex::Regex>,
    /// Admitted through the write-list reserve above the global cap.
    pub in_reserve: bool,
}

/// Evaluate admission policy for one source, in order: match list, reject
/// list, per-address cap (write sources exempt), global cap (with the
/// write reserve). UNIX peers carry no address: they fail a configured
/// match list and receive no grants.
pub fn admission_decision(
    snapshot: &crate::config::Snapshot,
    clients: &crate::server::registry::ClientRegistry,
    peer: &PeerAddr,
) -> Result<AdmissionGrants, RejectReason> {
    let config = &snapshot.config;
    let policy = &snapshot.policy;
    let ip = peer.ip();

    if !policy.match_ips.is_empty()
        && !ip.map(|ip| policy.match_ips.contains(&ip)).unwrap_or(false)
    {
        return Err(RejectReason::NoMatch);
    }

    if let Some(ip) = ip {
        if policy.reject_ips.contains(&ip) {
            return Err(RejectReason::Rejected);
        }
    }

    let write_permitted = ip.map(|ip| policy.write_ips.contains(&ip)).unwrap_or(false);

    if config.server.max_clients_per_ip > 0 && !write_permitted {
        let from_source = clients.ip_count(peer);
        if from_source >= config.server.max_clients_per_ip as usize {
            return Err(RejectReason::TooManyFromSource(from_source));
        }
    }

    let mut in_reserve = false;
    if config.server.max_clients > 0 {
        let count = clients.count();
        let max = config.server.max_clients as usize;
        if count >= max {
            if write_permitted && count < max + RESERVE_CONNECTIONS {
                in_reserve = true;
            } else {
                return Err(RejectReason::MaxClients);
            }
        }
    }

    Ok(AdmissionGrants {
        write_permitted,
        trusted: ip
            .map(|ip| policy.trusted_ips.contains(&ip))
            .unwrap_or(false),
        limit: ip.and_then(|ip| policy.stream_limit(&ip)),
        in_reserve,
    })
}

/// Apply admission policy and hand an accepted connection to its handler.
/// A rejected connection is simply dropped, closing the socket before any
/// protocol bytes are read.
async fn admit(
    shared: &Arc<Shared>,
    endpoint: &ListenEndpoint,
    mut stream: ClientStream,
    peer: PeerAddr,
) {
    let (host, port) = match &peer {
        PeerAddr::Ip(addr) => (
            peer.ip().expect("ip peer has an address").to_string(),
            addr.port().to_string(),
        ),
        PeerAddr::Unix => ("unix".to_string(), endpoint.port.clone()),
    };
    let client = format!("{}:{}", host, port);

    if let ClientStream::Tcp(tcp) = &stream {
        if let Err(e) = tcp.set_nodelay(true) {
            tracing::warn!(error = %e, "Could not disable TCP delay algorithm");
        }
    }

    tracing::debug!(port = %endpoint.port, client = %client, "Incoming connection");

    let snapshot = shared.snapshot();
    let config = &snapshot.config;

    let grants = match admission_decision(&snapshot, &shared.clients, &peer) {
        Ok(grants) => grants,
        Err(reason) => {
            match reason {
                RejectReason::NoMatch => {
                    tracing::info!(client = %client, "Rejecting non-matching connection");
                }
                RejectReason::Rejected => {
                    tracing::info!(client = %client, "Rejecting connection");
                }
                RejectReason::TooManyFromSource(n) => {
                    tracing::info!(client = %client, connections = n, "Too many connections from source");
                }
                RejectReason::MaxClients => {
                    tracing::info!(
                        max_clients = config.server.max_clients,
                        "Maximum number of clients exceeded"
                    );
                    tracing::info!(client = %client, "  Rejecting connection");
                }
            }
            shutdown_socket(&mut stream).await;
            return;
        }
    };
    if grants.in_reserve {
        tracing::info!(client = %client, "Allowing connection in reserve space");
    }

    let AdmissionGrants {
        write_permitted,
        trusted,
        limit,
        ..
    } = grants;

    let archive = config.archive.dir.as_ref().map(|dir| ArchiveSpec {
        dir: dir.clone(),
        idle_timeout: std::time::Duration::from_secs(config.archive.idle_timeout_secs as u64),
    });

    let now = shared.clock.now_nanos();
    let record = Arc::new(ClientRecord::from(ClientParams {
        id: shared.clients.next_id(),
        peer,
        host,
        port,
        server_port: endpoint.port.clone(),
        protocols: endpoint.protocols,
        tls: endpoint.tls,
        write_permitted,
        trusted,
        limit,
        http_headers: config.web.http_headers.clone(),
        time_win_limit: config.server.time_win_limit,
        connect_time: Utc::now(),
        connected_at: now,
        archive,
    }));

    let lifecycle = Arc::new(LifecycleCell::new());
    let ctx = ClientCtx {
        record: Arc::clone(&record),
        lifecycle: Arc::clone(&lifecycle),
        stream,
        ring: Arc::clone(&shared.ring),
        clock: shared.clock,
        server_id: config.server.server_id.clone(),
    };
    let join = tokio::spawn(protocol::client_task(Arc::clone(&shared.handler), ctx));

    tracing::info!(
        client = %record.address(),
        id = record.id,
        write = write_permitted,
        trusted,
        "Client connected"
    );
    shared.clients.insert(ClientUnit {
        record,
        lifecycle,
        join,
    });
}

async fn shutdown_socket(stream: &mut ClientStream) {
    let _ = stream.shutdown().await;
}
