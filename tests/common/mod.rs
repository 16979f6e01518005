//! Shared utilities for integration testing.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use ringstream::config::schema::{ListenConfig, ServerConfig};
use ringstream::config::Snapshot;
use ringstream::protocol::BasicHandler;
use ringstream::ring::Ring;
use ringstream::server::{Server, Shared, ShutdownFlag};

/// A server running on ephemeral ports with a volatile ring.
pub struct TestServer {
    pub ports: Vec<u16>,
    pub shared: Arc<Shared>,
    pub shutdown: ShutdownFlag,
    pub handle: tokio::task::JoinHandle<u8>,
}

impl TestServer {
    pub fn port(&self) -> u16 {
        self.ports[0]
    }
}

/// Start a server with one ephemeral TCP endpoint (more via `mutate`) and
/// a volatile ring.
pub async fn start_server(mutate: impl FnOnce(&mut ServerConfig)) -> TestServer {
    let mut config = ServerConfig::default();
    config.ring.volatile = true;
    config.ring.size = 256 * 512;
    config.ring.pkt_size = 512;
    config.listen = vec![ListenConfig {
        port: "0".to_string(),
        ..Default::default()
    }];
    mutate(&mut config);

    let ring = Ring::initialize(
        None,
        config.ring.size,
        config.ring.pkt_size,
        false,
        true,
    )
    .expect("volatile ring");
    let snapshot = Snapshot::new(config).expect("test config compiles");

    let server = Server::new(snapshot, ring, Arc::new(BasicHandler), None);
    let ports: Vec<u16> = server
        .bind_endpoints()
        .expect("bind test endpoints")
        .into_iter()
        .map(|p| p.expect("tcp endpoint has a port"))
        .collect();

    let shared = server.shared();
    let shutdown = server.shutdown_flag();
    let handle = tokio::spawn(server.run());

    TestServer {
        ports,
        shared,
        shutdown,
        handle,
    }
}

pub async fn connect(port: u16) -> TcpStream {
    TcpStream::connect(("127.0.0.1", port))
        .await
        .expect("connect to test server")
}

/// Send a write frame and await the acknowledged packet id.
pub async fn write_packet(stream: &mut TcpStream, stream_id: &str, data: &[u8]) -> u64 {
    stream.write_u8(b'W').await.unwrap();
    stream.write_u16(stream_id.len() as u16).await.unwrap();
    stream.write_u32(data.len() as u32).await.unwrap();
    stream.write_all(stream_id.as_bytes()).await.unwrap();
    stream.write_all(data).await.unwrap();
    stream.flush().await.unwrap();

    let op = stream.read_u8().await.unwrap();
    match op {
        b'A' => stream.read_u64().await.unwrap(),
        b'E' => {
            let len = stream.read_u16().await.unwrap() as usize;
            let mut msg = vec![0u8; len];
            stream.read_exact(&mut msg).await.unwrap();
            panic!("write rejected: {}", String::from_utf8_lossy(&msg));
        }
        other => panic!("unexpected reply op {}", other),
    }
}

/// Send a write frame expecting a rejection; returns the error message.
pub async fn write_packet_expect_error(
    stream: &mut TcpStream,
    stream_id: &str,
    data: &[u8],
) -> String {
    stream.write_u8(b'W').await.unwrap();
    stream.write_u16(stream_id.len() as u16).await.unwrap();
    stream.write_u32(data.len() as u32).await.unwrap();
    stream.write_all(stream_id.as_bytes()).await.unwrap();
    stream.write_all(data).await.unwrap();
    stream.flush().await.unwrap();

    assert_eq!(stream.read_u8().await.unwrap(), b'E');
    let len = stream.read_u16().await.unwrap() as usize;
    let mut msg = vec![0u8; len];
    stream.read_exact(&mut msg).await.unwrap();
    String::from_utf8_lossy(&msg).to_string()
}

/// Announce a client identifier and await the server's reply.
#[allow(dead_code)]
pub async fn ident(stream: &mut TcpStream) -> String {
    let name = b"integration-test";
    stream.write_u8(b'I').await.unwrap();
    stream.write_u16(name.len() as u16).await.unwrap();
    stream.write_all(name).await.unwrap();
    stream.flush().await.unwrap();
    assert_eq!(stream.read_u8().await.unwrap(), b'R');
    let len = stream.read_u16().await.unwrap() as usize;
    let mut reply = vec![0u8; len];
    stream.read_exact(&mut reply).await.unwrap();
    String::from_utf8(reply).unwrap()
}

/// Enter streaming mode.
pub async fn subscribe(stream: &mut TcpStream) {
    stream.write_u8(b'S').await.unwrap();
    stream.flush().await.unwrap();
}

/// Read one streamed packet frame.
pub async fn read_packet(stream: &mut TcpStream) -> (u64, String, Vec<u8>) {
    assert_eq!(stream.read_u8().await.unwrap(), b'P');
    let id = stream.read_u64().await.unwrap();
    let stream_len = stream.read_u16().await.unwrap() as usize;
    let data_len = stream.read_u32().await.unwrap() as usize;
    let mut stream_id = vec![0u8; stream_len];
    stream.read_exact(&mut stream_id).await.unwrap();
    let mut data = vec![0u8; data_len];
    stream.read_exact(&mut data).await.unwrap();
    (id, String::from_utf8(stream_id).unwrap(), data)
}

/// Poll until the condition holds or the timeout expires.
pub async fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    condition()
}

/// Whether the remote side closed this connection.
pub async fn is_closed(stream: &mut TcpStream, within: Duration) -> bool {
    let mut buf = [0u8; 1];
    match tokio::time::timeout(within, stream.read(&mut buf)).await {
        Ok(Ok(0)) => true,
        Ok(Ok(_)) => false,
        Ok(Err(_)) => true,
        Err(_) => false,
    }
}
