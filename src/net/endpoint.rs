//! Listener endpoint definition and socket binding.
//!
//! An endpoint is one `(port, protocols, families, tls)` tuple the server
//! listens on. The port string is either a numeric TCP port or a filesystem
//! path for a UNIX socket. Sockets are bound before the listener unit
//! starts so a bad endpoint fails startup instead of a worker.

use std::fmt;
use std::io;
use std::path::Path;

use tokio::net::{TcpListener, UnixListener};

use crate::config::schema::ListenConfig;
use crate::net::{ClientStream, PeerAddr};

/// The protocols an endpoint serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolSet {
    pub datalink: bool,
    pub seedlink: bool,
    pub http: bool,
}

impl ProtocolSet {
    pub const ALL: Self = Self {
        datalink: true,
        seedlink: true,
        http: true,
    };

    /// Build from config names; an empty list means all protocols.
    pub fn from_names(names: &[String]) -> Self {
        if names.is_empty() {
            return Self::ALL;
        }
        let mut set = Self {
            datalink: false,
            seedlink: false,
            http: false,
        };
        for name in names {
            match name.as_str() {
                "DataLink" => set.datalink = true,
                "SeedLink" => set.seedlink = true,
                "HTTP" => set.http = true,
                _ => {}
            }
        }
        set
    }

    /// Whether a detected protocol is served on this endpoint.
    pub fn permits(&self, kind: crate::protocol::ProtocolKind) -> bool {
        match kind {
            crate::protocol::ProtocolKind::Undetermined => true,
            crate::protocol::ProtocolKind::DataLink => self.datalink,
            crate::protocol::ProtocolKind::SeedLink => self.seedlink,
            crate::protocol::ProtocolKind::Http => self.http,
        }
    }
}

impl fmt::Display for ProtocolSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        if self.datalink {
            names.push("DataLink");
        }
        if self.seedlink {
            names.push("SeedLink");
        }
        if self.http {
            names.push("HTTP");
        }
        write!(f, "{}", names.join(" "))
    }
}

/// The address families an endpoint accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FamilySet {
    pub v4: bool,
    pub v6: bool,
    pub unix: bool,
}

impl FamilySet {
    fn from_names(names: &[String]) -> Option<Self> {
        if names.is_empty() {
            return None;
        }
        let mut set = Self {
            v4: false,
            v6: false,
            unix: false,
        };
        for name in names {
            match name.as_str() {
                "IPv4" => set.v4 = true,
                "IPv6" => set.v6 = true,
                "UNIX" => set.unix = true,
                _ => {}
            }
        }
        Some(set)
    }
}

impl fmt::Display for FamilySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.unix {
            write!(f, "UNIX")
        } else if self.v6 {
            write!(f, "IPv6")
        } else if self.v4 {
            write!(f, "IPv4")
        } else {
            write!(f, "Unknown family?")
        }
    }
}

/// One configured listen endpoint.
#[derive(Debug, Clone)]
pub struct ListenEndpoint {
    /// Numeric port string, or socket path for UNIX endpoints.
    pub port: String,
    pub protocols: ProtocolSet,
    pub families: FamilySet,
    pub tls: bool,
}

impl ListenEndpoint {
    pub fn from_config(config: &ListenConfig) -> Self {
        let is_path = config.port.contains('/');
        let families = FamilySet::from_names(&config.families).unwrap_or(FamilySet {
            v4: !is_path,
            v6: !is_path,
            unix: is_path,
        });
        Self {
            port: config.port.clone(),
            protocols: ProtocolSet::from_names(&config.protocols),
            families,
            tls: config.tls,
        }
    }

    pub fn is_unix(&self) -> bool {
        self.families.unix
    }

    /// Human-readable endpoint description for startup logging.
    pub fn describe(&self) -> String {
        if self.tls {
            format!("{}: {} over TLS", self.families, self.protocols)
        } else {
            format!("{}: {}", self.families, self.protocols)
        }
    }

    /// Bind the endpoint's socket.
    pub fn bind(&self) -> io::Result<BoundSocket> {
        if self.is_unix() {
            // A stale socket file from an unclean exit blocks the bind
            let path = Path::new(&self.port);
            if path.exists() {
                let _ = std::fs::remove_file(path);
            }
            Ok(BoundSocket::Unix(UnixListener::bind(path)?))
        } else {
            // One socket per endpoint; an IPv6 socket accepts IPv4 via
            // dual-stack when both families are enabled
            let std_listener = if self.families.v6 {
                match std::net::TcpListener::bind(format!("[::]:{}", self.port)) {
                    Ok(listener) => listener,
                    Err(e) if self.families.v4 => {
                        tracing::warn!(error = %e, "IPv6 bind failed, falling back to IPv4");
                        std::net::TcpListener::bind(format!("0.0.0.0:{}", self.port))?
                    }
                    Err(e) => return Err(e),
                }
            } else {
                std::net::TcpListener::bind(format!("0.0.0.0:{}", self.port))?
            };
            std_listener.set_nonblocking(true)?;
            Ok(BoundSocket::Tcp(TcpListener::from_std(std_listener)?))
        }
    }
}

/// A bound listening socket.
pub enum BoundSocket {
    Tcp(TcpListener),
    Unix(UnixListener),
}

impl BoundSocket {
    /// Accept one connection, yielding the stream and its peer address.
    pub async fn accept(&self) -> io::Result<(ClientStream, PeerAddr)> {
        match self {
            BoundSocket::Tcp(listener) => {
                let (stream, addr) = listener.accept().await?;
                Ok((ClientStream::Tcp(stream), PeerAddr::Ip(addr)))
            }
            BoundSocket::Unix(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok((ClientStream::Unix(stream), PeerAddr::Unix))
            }
        }
    }

    /// Locally bound TCP port, for endpoints configured with port 0.
    pub fn local_port(&self) -> Option<u16> {
        match self {
            BoundSocket::Tcp(listener) => listener.local_addr().ok().map(|a| a.port()),
            BoundSocket::Unix(_) => None,
        }
    }
}
