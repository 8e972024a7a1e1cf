//! Accept server lifecycle over the TCP backend
//!
//! Start/stop semantics, dispatch policies with overlapping clients, and the
//! no-auto-restart contract.

use async_trait::async_trait;
use blueport_core::backend::tcp::TcpBackend;
use blueport_core::{
    AcceptConfig, AcceptServer, ConnectionNotifier, DispatchPolicy, SecurityPolicy,
    ServiceParams, SessionConsumer, SessionHandle, TransportKind,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use uuid::Uuid;

struct EchoConsumer;

#[async_trait]
impl SessionConsumer for EchoConsumer {
    async fn handle_session(&self, mut session: SessionHandle) {
        let mut buf = vec![0u8; 1024];
        loop {
            match session.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if session.write(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            }
        }
        let _ = session.close().await;
    }
}

async fn start_echo_server(dispatch: DispatchPolicy) -> (Arc<TcpBackend>, AcceptServer) {
    let backend = Arc::new(TcpBackend::new());
    let params = ServiceParams::new(Uuid::from_u128(0x1101), "echo-responder");
    let notifier = Arc::new(
        ConnectionNotifier::open(
            backend.clone(),
            TransportKind::Stream,
            &params,
            SecurityPolicy::None,
        )
        .await
        .expect("Notifier opens"),
    );
    let config = AcceptConfig {
        dispatch,
        ..AcceptConfig::default()
    };
    let server = AcceptServer::start(notifier, Arc::new(EchoConsumer), config);
    (backend, server)
}

async fn echo_once(addr: std::net::SocketAddr, payload: &[u8]) -> Vec<u8> {
    let mut client = TcpStream::connect(addr).await.expect("Client connects");
    client.write_all(payload).await.expect("Client write");
    let mut echo = vec![0u8; payload.len()];
    client.read_exact(&mut echo).await.expect("Client read");
    echo
}

#[tokio::test]
async fn test_serial_dispatch_echoes_sequential_clients() {
    let (backend, server) = start_echo_server(DispatchPolicy::Serial).await;
    let addr = backend
        .local_addr(server.notifier().listener_id())
        .expect("Listener address");

    assert_eq!(echo_once(addr, b"one").await, b"one");
    assert_eq!(echo_once(addr, b"two").await, b"two");
    assert!(server.is_running());

    server.stop().await;
    assert!(!server.is_running());
}

#[tokio::test]
async fn test_accept_while_busy_serves_overlapping_sessions() {
    let (backend, server) = start_echo_server(DispatchPolicy::AcceptWhileBusy).await;
    let addr = backend
        .local_addr(server.notifier().listener_id())
        .expect("Listener address");

    // Hold the first session open while the second is served; only the
    // accept-while-busy policy can answer the second one.
    let mut first = TcpStream::connect(addr).await.expect("First client");
    first.write_all(b"held").await.expect("First write");
    let mut held_echo = [0u8; 4];
    first.read_exact(&mut held_echo).await.expect("First echo");
    assert_eq!(&held_echo, b"held");

    let second = tokio::time::timeout(Duration::from_secs(2), echo_once(addr, b"second"))
        .await
        .expect("Second session served while the first is open");
    assert_eq!(second, b"second");

    drop(first);
    server.stop().await;
}

#[tokio::test]
async fn test_stop_rejects_new_connections() {
    let (backend, server) = start_echo_server(DispatchPolicy::Serial).await;
    let addr = backend
        .local_addr(server.notifier().listener_id())
        .expect("Listener address");

    assert_eq!(echo_once(addr, b"pre").await, b"pre");
    server.stop().await;
    assert!(!server.is_running());

    // The listener is gone: a fresh dial must fail or be dropped unanswered.
    match tokio::time::timeout(Duration::from_millis(500), TcpStream::connect(addr)).await {
        Ok(Ok(mut stream)) => {
            let mut buf = [0u8; 1];
            let n = tokio::time::timeout(Duration::from_secs(1), stream.read(&mut buf))
                .await
                .expect("Read resolves")
                .unwrap_or(0);
            assert_eq!(n, 0, "No listener should serve this connection");
        }
        _ => {} // Connection refused: also the expected shape
    }
}

#[tokio::test]
async fn test_no_auto_restart_after_stop() {
    let (_backend, server) = start_echo_server(DispatchPolicy::Serial).await;
    server.stop().await;
    assert!(!server.is_running());

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!server.is_running(), "A stopped server never restarts itself");
    assert!(server.notifier().is_closed());
}
