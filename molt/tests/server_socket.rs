//! The interactive command server over a real UNIX socket: one command per
//! connection, line in, response out.

#![cfg(unix)]

use std::sync::Arc;
use std::time::Duration;

use molt::concurrency::create_shutdown_channel;
use molt::context::MigrationContext;
use molt::server::Server;
use molt::test_utils::test_config;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

async fn send_command(socket_path: &std::path::Path, command: &str) -> String {
    let mut stream = UnixStream::connect(socket_path).await.expect("connect");
    stream
        .write_all(format!("{command}\n").as_bytes())
        .await
        .expect("write command");

    let mut response = String::new();
    stream.read_to_string(&mut response).await.expect("read response");
    response
}

#[tokio::test]
async fn chunk_size_set_and_query_over_socket() {
    let dir = tempfile::tempdir().unwrap();
    let socket_path = dir.path().join("molt.sock");

    let mut config = test_config();
    config.serve.socket_file = Some(socket_path.to_string_lossy().into_owned());
    let context = Arc::new(MigrationContext::new(config).unwrap());

    let (shutdown_tx, shutdown_rx) = create_shutdown_channel();
    let handles = Server::new(context.clone(), "0.0.0-test", shutdown_rx)
        .spawn()
        .unwrap();
    assert_eq!(handles.len(), 1);

    // The listener task needs a beat to start accepting.
    tokio::time::sleep(Duration::from_millis(20)).await;

    send_command(&socket_path, "chunk-size=12345").await;
    let response = send_command(&socket_path, "chunk-size=?").await;
    assert_eq!(response, "12345\n");

    let response = send_command(&socket_path, "max-lag-millis=2500").await;
    assert!(!response.is_empty());
    let response = send_command(&socket_path, "max-lag-millis=?").await;
    assert_eq!(response, "2500\n");

    let response = send_command(&socket_path, "bogus").await;
    assert_eq!(response, "Unknown command: bogus\n");

    shutdown_tx.shutdown();
    for handle in handles {
        handle.wait().await.unwrap();
    }
}

#[tokio::test]
async fn stale_socket_is_replaced_when_configured() {
    let dir = tempfile::tempdir().unwrap();
    let socket_path = dir.path().join("stale.sock");
    std::fs::write(&socket_path, b"").unwrap();

    let mut config = test_config();
    config.serve.socket_file = Some(socket_path.to_string_lossy().into_owned());
    config.serve.drop_stale_socket = true;
    let context = Arc::new(MigrationContext::new(config).unwrap());

    let (shutdown_tx, shutdown_rx) = create_shutdown_channel();
    let handles = Server::new(context, "0.0.0-test", shutdown_rx)
        .spawn()
        .unwrap();

    tokio::time::sleep(Duration::from_millis(20)).await;
    let response = send_command(&socket_path, "version").await;
    assert_eq!(response, "migrator version: 0.0.0-test\n");

    shutdown_tx.shutdown();
    for handle in handles {
        handle.wait().await.unwrap();
    }
}
