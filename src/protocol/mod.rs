//! Protocol handler seam.
//!
//! The server core does not parse wire protocols. A [`ProtocolHandler`]
//! receives each admitted connection and is responsible for the protocol
//! handshake, all protocol state, counter and last-exchange updates, the
//! stream-limit pattern, and driving the unit lifecycle to `Closed`.
//!
//! The crate ships [`BasicHandler`], a minimal length-prefixed packet
//! relay: write-permitted clients ingest packets into the ring, any client
//! can stream from its reader cursor. It exercises every core path while
//! the full DataLink/SeedLink/HTTP parsers stay external.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::client::{ArchiveWriter, ClientRecord};
use crate::net::ClientStream;
use crate::ring::{Ring, RingReader};
use crate::server::registry::LifecycleCell;
use crate::server::Clock;

/// Wire protocol selected for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolKind {
    Undetermined,
    DataLink,
    SeedLink,
    Http,
}

impl ProtocolKind {
    pub fn name(&self) -> &'static str {
        match self {
            ProtocolKind::Undetermined => "Undetermined",
            ProtocolKind::DataLink => "DataLink",
            ProtocolKind::SeedLink => "SeedLink",
            ProtocolKind::Http => "HTTP",
        }
    }
}

/// Classify a connection from its first byte: DataLink announces itself
/// with a "DL" preamble, HTTP with a method verb, anything else is taken
/// for SeedLink.
pub fn detect_protocol(first: u8) -> ProtocolKind {
    match first {
        b'D' => ProtocolKind::DataLink,
        b'G' | b'H' | b'O' => ProtocolKind::Http,
        _ => ProtocolKind::SeedLink,
    }
}

/// Everything a handler needs to serve one connection.
pub struct ClientCtx {
    pub record: Arc<ClientRecord>,
    pub lifecycle: Arc<LifecycleCell>,
    pub stream: ClientStream,
    pub ring: Arc<Ring>,
    pub clock: Clock,
    pub server_id: String,
}

/// Boxed serve future, so handlers stay object-safe.
pub type BoxedServe = Pin<Box<dyn Future<Output = io::Result<()>> + Send>>;

/// Entry point contract for protocol handling.
pub trait ProtocolHandler: Send + Sync {
    fn serve(&self, ctx: ClientCtx) -> BoxedServe;
}

/// Task wrapper around a handler invocation: announces the unit Active,
/// runs the handler, and always leaves the unit Closed.
pub async fn client_task(handler: Arc<dyn ProtocolHandler>, ctx: ClientCtx) {
    let lifecycle = Arc::clone(&ctx.lifecycle);
    let record = Arc::clone(&ctx.record);

    lifecycle.set_active();
    if let Err(e) = handler.serve(ctx).await {
        tracing::debug!(client = %record.address(), error = %e, "Client connection ended with error");
    }
    lifecycle.set_closed();
    let client_id = record
        .client_id
        .lock()
        .expect("client id lock poisoned")
        .clone();
    tracing::info!(
        client = %record.address(),
        id = %client_id,
        protocol = record.protocol().name(),
        tx_packets = record.stats.tx_packets(),
        rx_packets = record.stats.rx_packets(),
        "Client disconnected"
    );
}

// Relay frame opcodes
const OP_WRITE: u8 = b'W';
const OP_STREAM: u8 = b'S';
const OP_IDENT: u8 = b'I';
const OP_ACK: u8 = b'A';
const OP_PACKET: u8 = b'P';
const OP_ERROR: u8 = b'E';

const MAX_STREAM_ID_LEN: usize = 1024;
const MAX_FRAME_DATA_LEN: usize = 16 * 1024 * 1024;

/// The built-in length-prefixed packet relay.
pub struct BasicHandler;

impl ProtocolHandler for BasicHandler {
    fn serve(&self, ctx: ClientCtx) -> BoxedServe {
        Box::pin(serve_relay(ctx))
    }
}

async fn serve_relay(ctx: ClientCtx) -> io::Result<()> {
    let ClientCtx {
        record,
        lifecycle,
        mut stream,
        ring,
        clock,
        server_id,
    } = ctx;

    // Protocol selection handshake: sniff the first byte
    let mut first = [0u8; 1];
    let n = tokio::select! {
        biased;
        _ = lifecycle.close_requested() => {
            lifecycle.set_closing();
            return Ok(());
        }
        n = stream.read(&mut first) => n?,
    };
    if n == 0 {
        return Ok(());
    }
    record.touch(clock.now_nanos());

    let kind = detect_protocol(first[0]);
    record.set_protocol(kind);
    if !record.protocols.permits(kind) {
        tracing::info!(
            client = %record.address(),
            protocol = kind.name(),
            "Closing connection, protocol not served on this endpoint"
        );
        return Ok(());
    }

    let mut archive = record.archive.clone().map(ArchiveWriter::new);
    let mut reader = RingReader::new();
    let mut data_rx = ring.subscribe();
    let mut streaming = false;
    let mut next_op = Some(first[0]);

    loop {
        if let Some(op) = next_op.take() {
            if !handle_op(
                op, &record, &mut stream, &ring, &clock, &server_id,
                &mut archive, &mut streaming,
            )
            .await?
            {
                break;
            }
            continue;
        }

        // Push available packets before blocking again
        if streaming {
            while let Some(packet) = ring.read_next(&mut reader) {
                *record.reader.lock().expect("reader lock poisoned") = Some(reader);
                if let Some(limit) = &record.limit {
                    if !limit.is_match(&packet.stream) {
                        continue;
                    }
                }
                send_packet(&mut stream, &packet).await?;
                record.stats.record_tx(packet.payload.len() as u64);
                record.touch(clock.now_nanos());
            }

            let mut op = [0u8; 1];
            tokio::select! {
                biased;
                _ = lifecycle.close_requested() => {
                    lifecycle.set_closing();
                    break;
                }
                n = stream.read(&mut op) => {
                    if n? == 0 {
                        break;
                    }
                    next_op = Some(op[0]);
                }
                _ = data_rx.changed() => {}
            }
        } else {
            let mut op = [0u8; 1];
            tokio::select! {
                biased;
                _ = lifecycle.close_requested() => {
                    lifecycle.set_closing();
                    break;
                }
                n = stream.read(&mut op) => {
                    if n? == 0 {
                        break;
                    }
                    next_op = Some(op[0]);
                }
            }
        }
    }

    stream.flush().await.ok();
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn handle_op(
    op: u8,
    record: &Arc<ClientRecord>,
    stream: &mut ClientStream,
    ring: &Arc<Ring>,
    clock: &Clock,
    server_id: &str,
    archive: &mut Option<ArchiveWriter>,
    streaming: &mut bool,
) -> io::Result<bool> {
    match op {
        OP_WRITE => {
            let stream_len = stream.read_u16().await? as usize;
            let data_len = stream.read_u32().await? as usize;
            if stream_len > MAX_STREAM_ID_LEN || data_len > MAX_FRAME_DATA_LEN {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "oversized write frame",
                ));
            }
            let mut stream_id = vec![0u8; stream_len];
            stream.read_exact(&mut stream_id).await?;
            let stream_id = String::from_utf8(stream_id).map_err(|_| {
                io::Error::new(io::ErrorKind::InvalidData, "non-UTF8 stream id")
            })?;
            let mut data = vec![0u8; data_len];
            stream.read_exact(&mut data).await?;

            record.touch(clock.now_nanos());

            if !record.write_permitted {
                send_error(stream, "write permission denied").await?;
                return Ok(true);
            }
            if let Some(limit) = &record.limit {
                if !limit.is_match(&stream_id) {
                    send_error(stream, "stream not permitted for this source").await?;
                    return Ok(true);
                }
            }

            match ring.write_packet(&stream_id, &data) {
                Ok(id) => {
                    record.stats.record_rx(data.len() as u64);
                    if let Some(writer) = archive {
                        if let Err(e) = writer.archive(&stream_id, &data).await {
                            tracing::warn!(stream = %stream_id, error = %e, "Archive write failed");
                        }
                    }
                    stream.write_u8(OP_ACK).await?;
                    stream.write_u64(id).await?;
                    stream.flush().await?;
                }
                Err(e) => {
                    send_error(stream, &e.to_string()).await?;
                }
            }
            Ok(true)
        }
        OP_STREAM => {
            record.touch(clock.now_nanos());
            *streaming = true;
            Ok(true)
        }
        OP_IDENT => {
            // The client announces its display identifier and gets the
            // server identifier back
            let name_len = stream.read_u16().await? as usize;
            if name_len > MAX_STREAM_ID_LEN {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "oversized ident frame",
                ));
            }
            if name_len > 0 {
                let mut name = vec![0u8; name_len];
                stream.read_exact(&mut name).await?;
                if let Ok(name) = String::from_utf8(name) {
                    *record.client_id.lock().expect("client id lock poisoned") = name;
                }
            }
            record.touch(clock.now_nanos());
            let ident = if record.trusted {
                format!(
                    "{} :: packets {} streams {}",
                    server_id,
                    ring.packet_count(),
                    ring.stream_count()
                )
            } else {
                server_id.to_string()
            };
            stream.write_u8(b'R').await?;
            stream.write_u16(ident.len() as u16).await?;
            stream.write_all(ident.as_bytes()).await?;
            stream.flush().await?;
            Ok(true)
        }
        other => {
            tracing::debug!(
                client = %record.address(),
                op = other,
                "Unknown relay opcode, closing"
            );
            Ok(false)
        }
    }
}

async fn send_packet(
    stream: &mut ClientStream,
    packet: &crate::ring::RingPacket,
) -> io::Result<()> {
    stream.write_u8(OP_PACKET).await?;
    stream.write_u64(packet.id).await?;
    stream.write_u16(packet.stream.len() as u16).await?;
    stream.write_u32(packet.payload.len() as u32).await?;
    stream.write_all(packet.stream.as_bytes()).await?;
    stream.write_all(&packet.payload).await?;
    stream.flush().await
}

async fn send_error(stream: &mut ClientStream, message: &str) -> io::Result<()> {
    stream.write_u8(OP_ERROR).await?;
    stream.write_u16(message.len() as u16).await?;
    stream.write_all(message.as_bytes()).await?;
    stream.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_protocol() {
        assert_eq!(detect_protocol(b'D'), ProtocolKind::DataLink);
        assert_eq!(detect_protocol(b'G'), ProtocolKind::Http);
        assert_eq!(detect_protocol(b'H'), ProtocolKind::Http);
        assert_eq!(detect_protocol(b'W'), ProtocolKind::SeedLink);
        assert_eq!(detect_protocol(0x00), ProtocolKind::SeedLink);
    }
}
