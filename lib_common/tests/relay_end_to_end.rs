//! End-to-end relay scenarios: a real axum listener on an ephemeral port,
//! `tokio-tungstenite` clients and the in-memory queue broker.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use lib_common::configs::RelayConfig;
use lib_common::connections::MemoryBroker;
use lib_common::relay::{RelayHandle, RelayServer, StartupError};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const QUEUE: &str = "shared_items";
const WAIT: Duration = Duration::from_secs(5);

fn test_config(heartbeat: Duration) -> RelayConfig {
    RelayConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        max_retries: 3,
        retry_delay: Duration::from_millis(5),
        retry_max_delay: Duration::from_millis(20),
        retry_jitter: Duration::ZERO,
        heartbeat_interval: heartbeat,
        consumer_name: "relay-test".to_string(),
        ..RelayConfig::default()
    }
}

async fn start(broker: &MemoryBroker, heartbeat: Duration) -> RelayHandle {
    RelayServer::start(&test_config(heartbeat), Arc::new(broker.clone()))
        .await
        .unwrap()
}

async fn connect(addr: SocketAddr) -> Client {
    let (client, _) = connect_async(format!("ws://{addr}/ws")).await.unwrap();
    client
}

async fn wait_for_connections(handle: &RelayHandle, expected: usize) {
    tokio::time::timeout(WAIT, async {
        while handle.connection_count() != expected {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("expected {expected} connections, have {}", handle.connection_count()));
}

/// Next text frame, skipping control frames.
async fn next_text(client: &mut Client) -> String {
    tokio::time::timeout(WAIT, async {
        loop {
            match client.next().await {
                Some(Ok(Message::Text(text))) => return text.to_string(),
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                other => panic!("expected a text frame, got {other:?}"),
            }
        }
    })
    .await
    .unwrap()
}

async fn http_get(addr: SocketAddr, path: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!("GET {path} HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    response
}

#[tokio::test]
async fn peer_and_queue_events_reach_every_client() {
    let broker = MemoryBroker::new().with_poll_window(Duration::from_millis(20));
    let handle = start(&broker, Duration::from_secs(30)).await;
    let addr = handle.local_addr();

    let mut a = connect(addr).await;
    let mut b = connect(addr).await;
    wait_for_connections(&handle, 2).await;

    // Peer event: relayed unwrapped to everyone, the sender included.
    let peer_event = r#"{"action":"share_item","item":{"id":9}}"#;
    a.send(Message::text(peer_event)).await.unwrap();
    assert_eq!(next_text(&mut a).await, peer_event);
    assert_eq!(next_text(&mut b).await, peer_event);

    // Queue event: wrapped with its source.
    broker.publish(QUEUE, r#"{"action":"share_item","item":{"id":10}}"#);
    let wrapped = r#"{"source":"realtime","payload":{"action":"share_item","item":{"id":10}}}"#;
    assert_eq!(next_text(&mut a).await, wrapped);
    assert_eq!(next_text(&mut b).await, wrapped);

    // A malformed peer frame is dropped, so the next frame anyone sees is
    // the raw-wrapped queue message published after it.
    b.send(Message::text("{oops")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    broker.publish(QUEUE, "not-json");
    let raw = r#"{"source":"realtime","payload":{"raw":"not-json"}}"#;
    assert_eq!(next_text(&mut a).await, raw);
    assert_eq!(next_text(&mut b).await, raw);

    let health = http_get(addr, "/health").await;
    assert!(health.starts_with("HTTP/1.1 200"), "{health}");
    assert!(health.contains(r#""connections":2"#), "{health}");

    handle.shutdown().await.unwrap();
    let stats = broker.stats(QUEUE);
    assert_eq!(stats.acked, 2);
    assert_eq!(stats.unacked, 0);
    assert_eq!(stats.rejected, 0);
}

#[tokio::test]
async fn closed_client_is_deregistered() {
    let broker = MemoryBroker::new().with_poll_window(Duration::from_millis(20));
    let handle = start(&broker, Duration::from_secs(30)).await;

    let mut a = connect(handle.local_addr()).await;
    let _b = connect(handle.local_addr()).await;
    wait_for_connections(&handle, 2).await;

    a.close(None).await.unwrap();
    wait_for_connections(&handle, 1).await;

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn silent_client_is_evicted_and_responsive_client_kept() {
    let broker = MemoryBroker::new().with_poll_window(Duration::from_millis(20));
    let handle = start(&broker, Duration::from_millis(100)).await;

    // Never polled, so it never answers a ping.
    let _silent = connect(handle.local_addr()).await;
    let responsive = connect(handle.local_addr()).await;
    wait_for_connections(&handle, 2).await;

    // Reading drives tungstenite's automatic pong replies.
    let reader = tokio::spawn(async move {
        let mut responsive = responsive;
        while let Some(Ok(_)) = responsive.next().await {}
    });

    wait_for_connections(&handle, 1).await;
    tokio::time::sleep(Duration::from_millis(350)).await;
    assert_eq!(handle.connection_count(), 1);

    handle.shutdown().await.unwrap();
    reader.abort();
}

#[tokio::test]
async fn shutdown_closes_client_sessions() {
    let broker = MemoryBroker::new().with_poll_window(Duration::from_millis(20));
    let handle = start(&broker, Duration::from_secs(30)).await;

    let mut a = connect(handle.local_addr()).await;
    wait_for_connections(&handle, 1).await;

    handle.shutdown().await.unwrap();

    let end = tokio::time::timeout(WAIT, async {
        loop {
            match a.next().await {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await;
    assert!(end.is_ok(), "client was not disconnected");
}

#[tokio::test]
async fn startup_fails_after_exactly_max_retries() {
    let broker = MemoryBroker::new();
    broker.fail_next_connects(100);

    let result = RelayServer::start(&test_config(Duration::from_secs(30)), Arc::new(broker.clone())).await;

    assert!(matches!(result, Err(StartupError::Queue(_))));
    assert_eq!(broker.connect_attempts(), 3);
}

#[tokio::test]
async fn queue_payload_is_forwarded_verbatim() {
    let broker = MemoryBroker::new().with_poll_window(Duration::from_millis(20));
    let handle = start(&broker, Duration::from_secs(30)).await;
    let mut a = connect(handle.local_addr()).await;
    wait_for_connections(&handle, 1).await;

    broker.publish(QUEUE, r#"{"action":"share_item","item":{"id":"11","title":"t"}}"#);

    assert_eq!(
        next_text(&mut a).await,
        r#"{"source":"realtime","payload":{"action":"share_item","item":{"id":"11","title":"t"}}}"#
    );
    handle.shutdown().await.unwrap();
}
