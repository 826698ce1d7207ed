//! End-to-end tests: a real relay on an ephemeral port, the in-process
//! broker, and tokio-tungstenite clients.

use crate::*;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, http::StatusCode, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const WAIT: Duration = Duration::from_secs(3);

struct TestRelay {
    addr: SocketAddr,
    server: Arc<RelayServer>,
    shutdown: ShutdownState,
    task: JoinHandle<Result<(), RelayError>>,
}

impl TestRelay {
    async fn start() -> Self {
        Self::start_with(Arc::new(MemoryBroker::default()), Arc::new(TokioSleeper), RelayConfig::default())
            .await
    }

    async fn start_with(broker: Arc<dyn Broker>, sleeper: Arc<dyn Sleeper>, config: RelayConfig) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = Arc::new(RelayServer::with_broker(config, broker, sleeper));
        let shutdown = ShutdownState::new();

        let task = {
            let server = server.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { server.serve(listener, shutdown).await })
        };

        Self { addr, server, shutdown, task }
    }

    async fn wait_until_connected(&self) {
        let bridge = self.server.get_bridge();
        tokio::time::timeout(WAIT, async {
            while !bridge.is_connected().await {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("bridge should connect to the memory broker");
    }

    async fn client(&self) -> Client {
        let (ws, _) = connect_async(format!("ws://{}/chat/ws", self.addr)).await.unwrap();
        ws
    }

    async fn stop(self) -> Result<(), RelayError> {
        self.shutdown.initiate_shutdown();
        tokio::time::timeout(WAIT, self.task).await.expect("relay should stop").unwrap()
    }
}

async fn send(ws: &mut Client, value: Value) {
    ws.send(Message::text(value.to_string())).await.unwrap();
}

/// Next JSON text frame, skipping control frames.
async fn next_json(ws: &mut Client) -> Value {
    tokio::time::timeout(WAIT, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => return serde_json::from_str(text.as_str()).unwrap(),
                Some(Ok(_)) => continue,
                other => panic!("socket ended while waiting for a frame: {other:?}"),
            }
        }
    })
    .await
    .expect("timed out waiting for a frame")
}

/// Next frame of the given `type`, skipping others.
async fn next_of_type(ws: &mut Client, kind: &str) -> Value {
    loop {
        let frame = next_json(ws).await;
        if frame["type"] == kind {
            return frame;
        }
    }
}

fn user_ids(snapshot: &Value) -> Vec<String> {
    snapshot["userList"]
        .as_array()
        .unwrap()
        .iter()
        .map(|u| u["userId"].as_str().unwrap().to_string())
        .collect()
}

/// Builds a one-shot HTTP/1.1 request head.
fn request(method: &str, path: &str, extra_headers: &str) -> String {
    format!("{method} {path} HTTP/1.1\r\nHost: relay\r\nConnection: close\r\n{extra_headers}\r\n")
}

/// Sends `request` on a fresh connection and reads until the relay closes it.
async fn http_get(addr: SocketAddr, request: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = String::new();
    tokio::time::timeout(WAIT, stream.read_to_string(&mut response))
        .await
        .unwrap()
        .unwrap();
    response
}

#[tokio::test(flavor = "multi_thread")]
async fn test_chat_reaches_every_client_including_sender() {
    let relay = TestRelay::start().await;
    relay.wait_until_connected().await;

    let mut alice = relay.client().await;
    let mut bob = relay.client().await;

    send(&mut alice, json!({"type": "user_join", "user": "alice"})).await;
    let snapshot = next_of_type(&mut alice, "user_list_update").await;
    assert_eq!(user_ids(&snapshot), vec!["alice"]);

    send(&mut bob, json!({"type": "user_join", "user": "bob"})).await;
    let snapshot = next_of_type(&mut alice, "user_list_update").await;
    assert_eq!(user_ids(&snapshot), vec!["alice", "bob"]);
    assert_eq!(snapshot["totalUsers"], 2);

    send(&mut alice, json!({"text": "hello", "user": "alice"})).await;
    for ws in [&mut alice, &mut bob] {
        let chat = next_of_type(ws, "chat").await;
        assert_eq!(chat["text"], "hello");
        assert_eq!(chat["user"], "alice");
        assert!(chat["ts"].as_i64().unwrap() > 0);
    }

    relay.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_double_join_keeps_one_entry() {
    let relay = TestRelay::start().await;
    relay.wait_until_connected().await;
    let registry = relay.server.get_registry();

    let mut ws = relay.client().await;
    send(&mut ws, json!({"type": "user_join", "user": "alice"})).await;
    next_of_type(&mut ws, "user_list_update").await;
    send(&mut ws, json!({"type": "user_join", "user": "alice"})).await;

    // A chat round-trip proves the second join has been processed
    send(&mut ws, json!({"text": "ping", "user": "alice"})).await;
    let frame = next_json(&mut ws).await;
    assert_eq!(frame["type"], "chat", "no second snapshot expected");
    assert_eq!(registry.size().await, 1);

    relay.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_clean_close_publishes_snapshot_without_user() {
    let relay = TestRelay::start().await;
    relay.wait_until_connected().await;

    let mut alice = relay.client().await;
    let mut bob = relay.client().await;
    send(&mut alice, json!({"type": "user_join", "user": "alice"})).await;
    next_of_type(&mut alice, "user_list_update").await;
    send(&mut bob, json!({"type": "user_join", "user": "bob"})).await;
    let snapshot = next_of_type(&mut alice, "user_list_update").await;
    assert_eq!(snapshot["totalUsers"], 2);

    bob.close(None).await.unwrap();

    let snapshot = next_of_type(&mut alice, "user_list_update").await;
    assert_eq!(user_ids(&snapshot), vec!["alice"]);
    assert_eq!(snapshot["totalUsers"], 1);

    relay.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_same_user_on_two_connections() {
    let relay = TestRelay::start().await;
    relay.wait_until_connected().await;

    let mut first = relay.client().await;
    let mut second = relay.client().await;
    send(&mut first, json!({"type": "user_join", "user": "alice"})).await;
    next_of_type(&mut first, "user_list_update").await;
    send(&mut second, json!({"type": "user_join", "user": "alice"})).await;

    let snapshot = next_of_type(&mut first, "user_list_update").await;
    assert_eq!(user_ids(&snapshot), vec!["alice", "alice"]);
    assert_eq!(snapshot["totalUsers"], 2);

    relay.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_malformed_frame_keeps_connection_open() {
    let relay = TestRelay::start().await;
    relay.wait_until_connected().await;

    let mut ws = relay.client().await;
    ws.send(Message::text("definitely not json")).await.unwrap();
    send(&mut ws, json!({"text": "still here"})).await;

    // Implicit join as anonymous, then the chat line
    let snapshot = next_of_type(&mut ws, "user_list_update").await;
    assert_eq!(user_ids(&snapshot), vec!["anonymous"]);
    let chat = next_of_type(&mut ws, "chat").await;
    assert_eq!(chat["text"], "still here");
    assert_eq!(chat["user"], "anonymous");

    relay.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_frames_from_other_instances_are_delivered() {
    let broker = MemoryBroker::default();
    let relay =
        TestRelay::start_with(Arc::new(broker.clone()), Arc::new(TokioSleeper), RelayConfig::default()).await;
    relay.wait_until_connected().await;

    let mut ws = relay.client().await;
    // Wait for the connection to be registered before injecting
    let registry = relay.server.get_registry();
    tokio::time::timeout(WAIT, async {
        while registry.connection_count().await == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    broker.inject(r#"{"type":"chat","text":"from afar","user":"remote","ts":1}"#.as_bytes().to_vec());
    let chat = next_of_type(&mut ws, "chat").await;
    assert_eq!(chat["user"], "remote");
    assert_eq!(chat["text"], "from afar");

    relay.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_health_endpoints() {
    let relay = TestRelay::start().await;
    relay.wait_until_connected().await;

    let response = http_get(relay.addr, &request("GET", "/healthz", "")).await;
    assert!(response.starts_with("HTTP/1.1 200 OK"));
    assert!(response.ends_with("\r\n\r\nok"));

    let response = http_get(relay.addr, &request("GET", "/", "Origin: http://chat.example\r\n")).await;
    assert!(response.starts_with("HTTP/1.1 200 OK"));
    assert!(response.to_ascii_lowercase().contains("access-control-allow-origin: *"));
    let body = response.split("\r\n\r\n").nth(1).unwrap();
    let body: Value = serde_json::from_str(body).unwrap();
    assert_eq!(body, json!({"status": "healthy", "service": "chat-relay"}));

    let preflight = "Origin: http://chat.example\r\nAccess-Control-Request-Method: GET\r\n\
                     Access-Control-Request-Headers: traceparent\r\n";
    let response = http_get(relay.addr, &request("OPTIONS", "/chat/ws", preflight)).await;
    assert!(response.starts_with("HTTP/1.1 200 OK"));
    let headers = response.to_ascii_lowercase();
    assert!(headers.contains("access-control-allow-origin: *"));
    assert!(headers.contains("access-control-allow-methods:"));
    assert!(headers.contains("traceparent"));

    let response = http_get(relay.addr, &request("GET", "/missing", "")).await;
    assert!(response.starts_with("HTTP/1.1 404 Not Found"));

    relay.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_upgrade_on_other_path_is_refused() {
    let relay = TestRelay::start().await;
    relay.wait_until_connected().await;

    match connect_async(format!("ws://{}/elsewhere", relay.addr)).await {
        Err(tungstenite::Error::Http(response)) => assert_eq!(response.status(), StatusCode::NOT_FOUND),
        other => panic!("expected a 404 refusal, got {:?}", other.map(|(_, r)| r.status())),
    }
    assert_eq!(relay.server.get_registry().connection_count().await, 0);

    relay.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_upgrade_head_split_across_packets() {
    let relay = TestRelay::start().await;
    relay.wait_until_connected().await;

    let mut stream = TcpStream::connect(relay.addr).await.unwrap();
    stream.write_all(b"GET /chat/ws HTTP/1.1\r\nHost: relay\r\n").await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    stream
        .write_all(
            b"Upgrade: websocket\r\nConnection: Upgrade\r\n\
              Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 13\r\n\r\n",
        )
        .await
        .unwrap();

    let mut head = Vec::new();
    tokio::time::timeout(WAIT, async {
        let mut buf = [0u8; 512];
        while !head.windows(4).any(|w| w == b"\r\n\r\n") {
            let n = stream.read(&mut buf).await.unwrap();
            assert!(n > 0, "relay closed the connection during the handshake");
            head.extend_from_slice(&buf[..n]);
        }
    })
    .await
    .expect("handshake response should arrive");
    let head = String::from_utf8_lossy(&head);
    assert!(head.starts_with("HTTP/1.1 101"), "unexpected response: {head}");

    let registry = relay.server.get_registry();
    tokio::time::timeout(WAIT, async {
        while registry.connection_count().await == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    drop(stream);
    relay.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_upgrade_refused_at_capacity() {
    let config = RelayConfig { max_connections: 1, ..RelayConfig::default() };
    let relay = TestRelay::start_with(Arc::new(MemoryBroker::default()), Arc::new(TokioSleeper), config).await;
    relay.wait_until_connected().await;

    let _first = relay.client().await;
    let registry = relay.server.get_registry();
    tokio::time::timeout(WAIT, async {
        while registry.connection_count().await == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    match connect_async(format!("ws://{}/chat/ws", relay.addr)).await {
        Err(tungstenite::Error::Http(response)) => {
            assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE)
        }
        other => panic!("expected a 503 refusal, got {:?}", other.map(|(_, r)| r.status())),
    }

    relay.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unrecognized_frame_type_is_relayed_as_chat() {
    let relay = TestRelay::start().await;
    relay.wait_until_connected().await;

    let mut ws = relay.client().await;
    send(&mut ws, json!({"type": "typing", "user": "carol", "text": "x"})).await;

    let snapshot = next_of_type(&mut ws, "user_list_update").await;
    assert_eq!(user_ids(&snapshot), vec!["carol"]);
    let chat = next_of_type(&mut ws, "chat").await;
    assert_eq!(chat["user"], "carol");
    assert_eq!(chat["text"], "x");

    relay.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_idle_socket_does_not_hold_up_shutdown() {
    let relay = TestRelay::start().await;
    relay.wait_until_connected().await;

    // Connected but never sends a request
    let _idle = TcpStream::connect(relay.addr).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    relay.shutdown.initiate_shutdown();
    let result = tokio::time::timeout(Duration::from_secs(5), relay.task)
        .await
        .expect("serve should return while an idle socket is open");
    result.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_shutdown_sends_close_frame() {
    let relay = TestRelay::start().await;
    relay.wait_until_connected().await;

    let mut ws = relay.client().await;
    send(&mut ws, json!({"type": "user_join", "user": "alice"})).await;
    next_of_type(&mut ws, "user_list_update").await;

    let shutdown = relay.shutdown.clone();
    let stopping = tokio::spawn(relay.stop());

    let closed = tokio::time::timeout(WAIT, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Close(_))) | None => return true,
                Some(Ok(_)) => continue,
                Some(Err(_)) => return false,
            }
        }
    })
    .await
    .unwrap();
    assert!(closed);

    stopping.await.unwrap().unwrap();
    assert!(shutdown.is_shutdown_complete());
}

/// Broker that refuses every connection.
#[derive(Default)]
struct UnreachableBroker {
    attempts: AtomicU32,
}

#[async_trait]
impl Broker for UnreachableBroker {
    async fn connect(&self) -> Result<Arc<dyn BrokerSession>, BrokerError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(BrokerError::Connect("connection refused".to_string()))
    }

    fn name(&self) -> &'static str {
        "unreachable"
    }
}

#[derive(Default)]
struct RecordingSleeper {
    sleeps: Mutex<Vec<Duration>>,
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration) {
        self.sleeps.lock().unwrap().push(duration);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unreachable_broker_is_fatal_after_budget() {
    let broker = Arc::new(UnreachableBroker::default());
    let sleeper = Arc::new(RecordingSleeper::default());
    let relay = TestRelay::start_with(broker.clone(), sleeper.clone(), RelayConfig::default()).await;

    let result = tokio::time::timeout(WAIT, relay.task).await.unwrap().unwrap();

    assert!(matches!(result, Err(RelayError::BrokerExhausted { attempts: 10 })));
    assert_eq!(broker.attempts.load(Ordering::SeqCst), 10);
    assert_eq!(*sleeper.sleeps.lock().unwrap(), vec![Duration::from_secs(5); 9]);
    assert_eq!(relay.server.get_bridge().state().await, BridgeState::Failed);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_health_answers_while_broker_retries() {
    let mut config = RelayConfig::default();
    config.broker.retry_delay_ms = 60_000;
    let relay =
        TestRelay::start_with(Arc::new(UnreachableBroker::default()), Arc::new(TokioSleeper), config).await;

    let response = http_get(relay.addr, &request("GET", "/healthz", "")).await;
    assert!(response.ends_with("ok"));
    assert!(matches!(
        relay.server.get_bridge().state().await,
        BridgeState::Connecting { .. }
    ));

    // Shutdown wins over the pending retry
    relay.stop().await.unwrap();
}
