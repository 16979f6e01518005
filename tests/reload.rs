//! Configuration hot-reload through the supervisor.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use ringstream::config::{load_config, Snapshot};
use ringstream::protocol::BasicHandler;
use ringstream::ring::Ring;
use ringstream::server::Server;

fn bump_mtime(path: &std::path::Path, ahead: Duration) {
    let times = std::fs::FileTimes::new().set_modified(SystemTime::now() + ahead);
    std::fs::File::options()
        .write(true)
        .open(path)
        .unwrap()
        .set_times(times)
        .unwrap();
}

#[tokio::test]
async fn changed_file_is_reread_and_swapped() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("server.toml");
    std::fs::write(
        &path,
        "[server]\nmax_clients = 10\n[ring]\nvolatile = true\n",
    )
    .unwrap();

    let config = load_config(Some(&path)).unwrap();
    let ring = Ring::initialize(None, config.ring.size, config.ring.pkt_size, false, true).unwrap();
    let server = Server::new(
        Snapshot::new(config).unwrap(),
        ring,
        Arc::new(BasicHandler),
        Some(path.clone()),
    );

    let shared = server.shared();
    let shutdown = server.shutdown_flag();
    let handle = tokio::spawn(server.run());

    assert_eq!(shared.snapshot().config.server.max_clients, 10);
    assert_eq!(shared.snapshot_generation(), 0);

    std::fs::write(
        &path,
        "[server]\nmax_clients = 99\n[ring]\nvolatile = true\n",
    )
    .unwrap();
    bump_mtime(&path, Duration::from_secs(2));

    // The supervisor polls on its tick; wait for the swap
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while shared.snapshot_generation() == 0 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(shared.snapshot_generation(), 1);
    assert_eq!(shared.snapshot().config.server.max_clients, 99);

    shutdown.request();
    assert_eq!(handle.await.unwrap(), 0);
}

#[tokio::test]
async fn broken_file_keeps_previous_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("server.toml");
    std::fs::write(
        &path,
        "[server]\nmax_clients = 10\n[ring]\nvolatile = true\n",
    )
    .unwrap();

    let config = load_config(Some(&path)).unwrap();
    let ring = Ring::initialize(None, config.ring.size, config.ring.pkt_size, false, true).unwrap();
    let server = Server::new(
        Snapshot::new(config).unwrap(),
        ring,
        Arc::new(BasicHandler),
        Some(path.clone()),
    );

    let shared = server.shared();
    let shutdown = server.shutdown_flag();
    let handle = tokio::spawn(server.run());

    std::fs::write(&path, "broken [[[").unwrap();
    bump_mtime(&path, Duration::from_secs(2));

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(shared.snapshot_generation(), 0);
    assert_eq!(shared.snapshot().config.server.max_clients, 10);

    shutdown.request();
    assert_eq!(handle.await.unwrap(), 0);
}
