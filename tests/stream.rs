//! End-to-end tests: real files, real listener, real WebSocket clients.

use std::io::Write;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use futures_util::stream::StreamExt;
use tempfile::tempdir;
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{client_async, connect_async, MaybeTlsStream, WebSocketStream};

use tailhub::config::{DashboardConfig, LogEntry, Profiles};
use tailhub::gate::{hash_password, COOKIE_NAME};
use tailhub::{follower, server, AppState, Hub, HubConfig, LineEvent, SessionGate, WatchMode};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const FAST: WatchMode = WatchMode::Poll {
    interval: Duration::from_millis(20),
};

fn append(path: &Path, data: &str) {
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .unwrap();
    file.write_all(data.as_bytes()).unwrap();
    file.sync_all().unwrap();
}

fn numbered(range: std::ops::RangeInclusive<usize>) -> String {
    range.map(|i| format!("line {}\n", i)).collect()
}

/// Starts followers, the hub and the server for the given config.
async fn start(dir: &Path, config: DashboardConfig) -> (SocketAddr, Hub) {
    start_with_write_timeout(dir, config, server::DEFAULT_WRITE_TIMEOUT).await
}

async fn start_with_write_timeout(
    dir: &Path,
    config: DashboardConfig,
    write_timeout: Duration,
) -> (SocketAddr, Hub) {
    let sources = config.sources();
    let profiles = Profiles::load(dir, &sources);

    let hub = Hub::new(HubConfig {
        sources: sources.len(),
        history_len: 50,
        ..HubConfig::default()
    });
    let (tx, rx) = mpsc::channel(follower::INGEST_QUEUE);
    tokio::spawn({
        let hub = hub.clone();
        async move { hub.run(rx).await }
    });
    follower::spawn_followers(&sources, &hub, &tx, FAST).await;

    let state = AppState::new(
        hub.clone(),
        SessionGate::new(config.password()),
        server::dashboard_entries(&sources, &profiles),
    )
    .unwrap()
    .with_write_timeout(write_timeout);
    let listener = server::bind(([127, 0, 0, 1], 0).into()).await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(server::serve(listener, state, std::future::pending()));

    (addr, hub)
}

fn two_logs(dir: &Path, password: Option<&str>) -> DashboardConfig {
    DashboardConfig {
        server_password: password.map(str::to_string),
        logs: vec![
            LogEntry {
                path: dir.join("app.log").display().to_string(),
                ..LogEntry::default()
            },
            LogEntry {
                path: dir.join("err.log").display().to_string(),
                profile: "errors".to_string(),
                ..LogEntry::default()
            },
        ],
    }
}

async fn wait_for_clients(hub: &Hub, clients: usize) {
    timeout(Duration::from_secs(2), async {
        while hub.client_count() != clients {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("client count never settled");
}

async fn next_event(client: &mut Client) -> LineEvent {
    loop {
        let message = timeout(Duration::from_secs(2), client.next())
            .await
            .expect("timed out waiting for a line")
            .expect("stream ended")
            .expect("stream failed");
        if let Message::Text(_) = message {
            return serde_json::from_str(message.to_text().unwrap()).unwrap();
        }
    }
}

async fn next_events(client: &mut Client, n: usize) -> Vec<LineEvent> {
    let mut events = Vec::with_capacity(n);
    for _ in 0..n {
        events.push(next_event(client).await);
    }
    events
}

#[tokio::test]
async fn test_history_then_live() {
    let dir = tempdir().unwrap();
    append(&dir.path().join("app.log"), &numbered(1..=60));
    append(&dir.path().join("err.log"), "");

    let (addr, hub) = start(dir.path(), two_logs(dir.path(), None)).await;
    assert_eq!(hub.history(0).len(), 50);

    let (mut client, _) = connect_async(format!("ws://{}/ws", addr)).await.unwrap();

    let replay = next_events(&mut client, 50).await;
    let expected: Vec<_> = (11..=60)
        .map(|i| LineEvent::new(0, format!("line {}", i)))
        .collect();
    assert_eq!(replay, expected);

    append(&dir.path().join("app.log"), "line 61\n");
    assert_eq!(next_event(&mut client).await, LineEvent::new(0, "line 61"));
}

#[tokio::test]
async fn test_two_clients_see_same_lines() {
    let dir = tempdir().unwrap();
    append(&dir.path().join("app.log"), "");
    append(&dir.path().join("err.log"), "");

    let (addr, hub) = start(dir.path(), two_logs(dir.path(), None)).await;

    let (mut first, _) = connect_async(format!("ws://{}/ws", addr)).await.unwrap();
    let (mut second, _) = connect_async(format!("ws://{}/ws", addr)).await.unwrap();
    wait_for_clients(&hub, 2).await;

    append(&dir.path().join("app.log"), "a1\na2\n");
    append(&dir.path().join("err.log"), "e1\n");

    let mut seen_first = next_events(&mut first, 3).await;
    let mut seen_second = next_events(&mut second, 3).await;

    // Per-source order is guaranteed; interleaving across sources is not.
    seen_first.sort_by_key(|e| e.source_index);
    seen_second.sort_by_key(|e| e.source_index);
    let expected = vec![
        LineEvent::new(0, "a1"),
        LineEvent::new(0, "a2"),
        LineEvent::new(1, "e1"),
    ];
    assert_eq!(seen_first, expected);
    assert_eq!(seen_second, expected);
}

#[tokio::test]
async fn test_disconnect_unregisters() {
    let dir = tempdir().unwrap();
    append(&dir.path().join("app.log"), "");
    append(&dir.path().join("err.log"), "");

    let (addr, hub) = start(dir.path(), two_logs(dir.path(), None)).await;

    let (mut client, _) = connect_async(format!("ws://{}/ws", addr)).await.unwrap();
    wait_for_clients(&hub, 1).await;

    client.close(None).await.unwrap();

    wait_for_clients(&hub, 0).await;
}

#[tokio::test]
async fn test_stalled_client_hits_write_deadline() {
    let dir = tempdir().unwrap();
    append(&dir.path().join("app.log"), "");
    append(&dir.path().join("err.log"), "");

    let (addr, hub) = start_with_write_timeout(
        dir.path(),
        two_logs(dir.path(), None),
        Duration::from_millis(200),
    )
    .await;

    // A client that completes the handshake and then never reads.
    let socket = TcpSocket::new_v4().unwrap();
    socket.set_recv_buffer_size(4096).unwrap();
    let stream = socket.connect(addr).await.unwrap();
    let (_stalled, _) = client_async(format!("ws://{}/ws", addr), stream)
        .await
        .unwrap();
    wait_for_clients(&hub, 1).await;

    let chunk = "x".repeat(16 * 1024);
    timeout(Duration::from_secs(10), async {
        while hub.client_count() > 0 {
            for _ in 0..16 {
                hub.ingest(LineEvent::new(0, chunk.clone()));
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("stalled client was never dropped");
}

#[tokio::test]
async fn test_stream_requires_session() {
    let dir = tempdir().unwrap();
    append(&dir.path().join("app.log"), "hello\n");
    append(&dir.path().join("err.log"), "");

    let (addr, _hub) = start(dir.path(), two_logs(dir.path(), Some("secret"))).await;

    let url = format!("ws://{}/ws", addr);
    match connect_async(url.as_str()).await {
        Err(tungstenite::Error::Http(response)) => assert_eq!(response.status().as_u16(), 401),
        other => panic!("expected 401, got {:?}", other.map(|(_, response)| response)),
    }

    let mut request = url.into_client_request().unwrap();
    request.headers_mut().insert(
        "Cookie",
        format!("{}={}", COOKIE_NAME, hash_password("secret"))
            .parse()
            .unwrap(),
    );
    let (mut client, _) = connect_async(request).await.unwrap();
    assert_eq!(next_event(&mut client).await, LineEvent::new(0, "hello"));
}
