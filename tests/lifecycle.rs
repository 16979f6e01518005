//! Client lifecycle scenarios: relay traffic, idle eviction, and graceful
//! shutdown.

mod common;

use std::time::Duration;

use tokio::net::TcpStream;

#[tokio::test]
async fn relay_write_and_stream() {
    let server = common::start_server(|c| {
        c.access.write_ips = vec!["127.0.0.1/32".into()];
        c.server.server_id = "Relay Test Server".into();
    })
    .await;

    let mut subscriber = common::connect(server.port()).await;
    common::subscribe(&mut subscriber).await;

    let mut writer = common::connect(server.port()).await;
    let id = common::write_packet(&mut writer, "NET_STA", b"sample payload").await;
    assert_eq!(id, 1);

    let (got_id, stream_id, payload) = common::read_packet(&mut subscriber).await;
    assert_eq!(got_id, 1);
    assert_eq!(stream_id, "NET_STA");
    assert_eq!(payload, b"sample payload");

    // Counters accumulate on both sides of the relay
    assert!(
        common::wait_for(Duration::from_secs(2), || {
            server.shared.clients.live().iter().any(|(record, _)| {
                record.stats.rx_packets() == 1 && record.stats.rx_bytes() == 14
            }) && server.shared.clients.live().iter().any(|(record, _)| {
                record.stats.tx_packets() == 1
            })
        })
        .await
    );

    server.shutdown.request();
    assert_eq!(server.handle.await.unwrap(), 0);
}

#[tokio::test]
async fn write_denied_without_permission() {
    let server = common::start_server(|_| {}).await;

    let mut client = common::connect(server.port()).await;
    let error = common::write_packet_expect_error(&mut client, "NET_STA", b"data").await;
    assert!(error.contains("write permission denied"));

    server.shutdown.request();
    assert_eq!(server.handle.await.unwrap(), 0);
}

#[tokio::test]
async fn stream_limit_filters_writes() {
    let server = common::start_server(|c| {
        c.access.write_ips = vec!["127.0.0.1/32".into()];
        c.access.limit_ips = vec![ringstream::config::schema::LimitEntry {
            net: "127.0.0.1/32".into(),
            streams: "^GOOD_".into(),
        }];
    })
    .await;

    let mut client = common::connect(server.port()).await;
    let error = common::write_packet_expect_error(&mut client, "BAD_STA", b"data").await;
    assert!(error.contains("not permitted"));
    assert_eq!(common::write_packet(&mut client, "GOOD_STA", b"data").await, 1);

    server.shutdown.request();
    assert_eq!(server.handle.await.unwrap(), 0);
}

#[tokio::test]
async fn idle_client_is_evicted() {
    let server = common::start_server(|c| {
        c.server.client_timeout_secs = 2;
        c.server.max_clients = 10;
    })
    .await;

    let mut client = common::connect(server.port()).await;
    assert!(
        common::wait_for(Duration::from_secs(2), || server.shared.clients.count() == 1).await
    );

    // Send nothing: the supervisor closes the connection once idle longer
    // than the timeout, and the client observes remote EOF
    let start = std::time::Instant::now();
    assert!(common::is_closed(&mut client, Duration::from_secs(5)).await);
    assert!(start.elapsed() >= Duration::from_millis(1500));

    assert!(
        common::wait_for(Duration::from_secs(3), || server.shared.clients.count() == 0).await
    );

    server.shutdown.request();
    assert_eq!(server.handle.await.unwrap(), 0);
}

#[tokio::test]
async fn active_client_is_not_evicted() {
    let server = common::start_server(|c| {
        c.server.client_timeout_secs = 2;
    })
    .await;

    let mut client = common::connect(server.port()).await;
    for _ in 0..3 {
        common::ident(&mut client).await;
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    assert_eq!(server.shared.clients.count(), 1);

    server.shutdown.request();
    assert_eq!(server.handle.await.unwrap(), 0);
}

#[tokio::test]
async fn graceful_shutdown_drains_all_units() {
    let server = common::start_server(|c| {
        c.listen = vec![
            ringstream::config::schema::ListenConfig {
                port: "0".into(),
                ..Default::default()
            },
            ringstream::config::schema::ListenConfig {
                port: "0".into(),
                ..Default::default()
            },
        ];
        c.server.max_clients = 100;
    })
    .await;
    assert_eq!(server.ports.len(), 2);

    let mut clients = Vec::new();
    for i in 0..50 {
        let port = server.ports[i % 2];
        let mut stream = common::connect(port).await;
        common::subscribe(&mut stream).await;
        clients.push(stream);
    }
    assert!(
        common::wait_for(Duration::from_secs(3), || server.shared.clients.count() == 50).await
    );

    server.shutdown.request();
    let code = tokio::time::timeout(Duration::from_secs(10), server.handle)
        .await
        .expect("shutdown within ten seconds")
        .unwrap();
    assert_eq!(code, 0);

    // The ring was shut down and every client saw the connection close
    assert!(server.shared.ring.was_shut_down());
    assert_eq!(server.shared.clients.count(), 0);
    for client in &mut clients {
        assert!(common::is_closed(client, Duration::from_secs(1)).await);
    }

    // Listener sockets are gone
    for port in &server.ports {
        assert!(TcpStream::connect(("127.0.0.1", *port)).await.is_err());
    }
}

#[tokio::test]
async fn disconnected_clients_are_reaped() {
    let server = common::start_server(|_| {}).await;

    let client = common::connect(server.port()).await;
    assert!(
        common::wait_for(Duration::from_secs(2), || server.shared.clients.count() == 1).await
    );

    drop(client);
    assert!(
        common::wait_for(Duration::from_secs(3), || server.shared.clients.count() == 0).await
    );

    server.shutdown.request();
    assert_eq!(server.handle.await.unwrap(), 0);
}
