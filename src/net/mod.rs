//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP / UNIX connection
//!     → endpoint.rs (bound socket per configured endpoint)
//!     → listener.rs (accept loop, IP policy, connection caps)
//!     → client record + protocol handler task
//! ```

pub mod endpoint;
pub mod listener;
pub mod policy;

pub use endpoint::{BoundSocket, FamilySet, ListenEndpoint, ProtocolSet};
pub use listener::{
    admission_decision, AdmissionGrants, ListenerError, ListenerShared, RejectReason,
};

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpStream, UnixStream};

/// The remote address of an accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerAddr {
    Ip(SocketAddr),
    Unix,
}

impl PeerAddr {
    /// The IP address, when the peer is a TCP client. IPv4 connections
    /// accepted on a dual-stack socket arrive as IPv4-mapped IPv6
    /// addresses; those are canonicalized so IPv4 policy entries apply.
    pub fn ip(&self) -> Option<IpAddr> {
        match self {
            PeerAddr::Ip(addr) => Some(match addr.ip() {
                IpAddr::V6(v6) => v6
                    .to_ipv4_mapped()
                    .map(IpAddr::V4)
                    .unwrap_or(IpAddr::V6(v6)),
                v4 => v4,
            }),
            PeerAddr::Unix => None,
        }
    }

    /// Whether two peers are the same source: same family and the same
    /// full address bytes. Ports are ignored; UNIX peers never match.
    pub fn same_source(&self, other: &PeerAddr) -> bool {
        match (self.ip(), other.ip()) {
            (Some(IpAddr::V4(a)), Some(IpAddr::V4(b))) => a.octets() == b.octets(),
            (Some(IpAddr::V6(a)), Some(IpAddr::V6(b))) => a.octets() == b.octets(),
            _ => false,
        }
    }
}

/// An accepted client stream, TCP or UNIX.
pub enum ClientStream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl AsyncRead for ClientStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ClientStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            ClientStream::Unix(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ClientStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            ClientStream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            ClientStream::Unix(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ClientStream::Tcp(s) => Pin::new(s).poll_flush(cx),
            ClientStream::Unix(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ClientStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            ClientStream::Unix(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}
