//! Platform agent against a stub coordinator
//!
//! The stub speaks just enough HTTP/1.1 for the agent's client: it records
//! every request and answers from a route table supplied by the test.

use bytes::Bytes;
use magicbox::broker::Broker;
use magicbox::config::{ConfigStore, NodeState};
use magicbox::hardware::Capabilities;
use magicbox::pipeline::StreamPipeline;
use magicbox::platform::PlatformAgent;
use magicbox::queue::{EventQueue, EventSender, EventType};
use parking_lot::Mutex;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tempfile::tempdir;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

#[derive(Debug, Clone)]
struct Request {
    method: String,
    path: String,
    authorization: Option<String>,
    worker_id_header: Option<String>,
    body: String,
}

type Responder = Arc<dyn Fn(&str, &str) -> (u16, serde_json::Value) + Send + Sync>;

#[derive(Clone)]
struct StubCoordinator {
    requests: Arc<Mutex<Vec<Request>>>,
    addr: SocketAddr,
}

impl StubCoordinator {
    async fn start(responder: Responder) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests: Arc<Mutex<Vec<Request>>> = Arc::new(Mutex::new(Vec::new()));

        let log = Arc::clone(&requests);
        tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else {
                    break;
                };
                let responder = Arc::clone(&responder);
                let log = Arc::clone(&log);
                tokio::spawn(async move {
                    let _ = serve(socket, responder, log).await;
                });
            }
        });

        Self { requests, addr }
    }

    fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    fn requests(&self) -> Vec<Request> {
        self.requests.lock().clone()
    }
}

async fn serve(
    socket: tokio::net::TcpStream,
    responder: Responder,
    log: Arc<Mutex<Vec<Request>>>,
) -> std::io::Result<()> {
    let (read_half, mut write_half) = socket.into_split();
    let mut reader = BufReader::new(read_half);

    loop {
        let mut request_line = String::new();
        if reader.read_line(&mut request_line).await? == 0 {
            return Ok(());
        }
        let mut parts = request_line.split_whitespace();
        let method = parts.next().unwrap_or_default().to_string();
        let path = parts.next().unwrap_or_default().to_string();

        let mut content_length = 0usize;
        let mut authorization = None;
        let mut worker_id_header = None;
        loop {
            let mut line = String::new();
            reader.read_line(&mut line).await?;
            let line = line.trim_end();
            if line.is_empty() {
                break;
            }
            let Some((name, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim().to_string();
            match name.to_ascii_lowercase().as_str() {
                "content-length" => content_length = value.parse().unwrap_or(0),
                "authorization" => authorization = Some(value),
                "x-worker-id" => worker_id_header = Some(value),
                _ => {}
            }
        }

        let mut body = vec![0u8; content_length];
        reader.read_exact(&mut body).await?;

        let (status, response) = responder(&method, &path);
        log.lock().push(Request {
            method,
            path,
            authorization,
            worker_id_header,
            body: String::from_utf8_lossy(&body).to_string(),
        });

        let body = response.to_string();
        let reply = format!(
            "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: keep-alive\r\n\r\n{}",
            status,
            if status < 400 { "OK" } else { "Error" },
            body.len(),
            body
        );
        write_half.write_all(reply.as_bytes()).await?;
    }
}

struct Node {
    store: Arc<ConfigStore>,
    broker: Broker,
    queue: Arc<EventQueue>,
    agent: Arc<PlatformAgent>,
    _dir: tempfile::TempDir,
}

fn node() -> Node {
    let dir = tempdir().unwrap();
    let store = Arc::new(ConfigStore::load_or_create(dir.path().join("node.json")).unwrap());
    let broker = Broker::default();
    let queue = Arc::new(EventQueue::open(dir.path()).unwrap());
    let pipeline = StreamPipeline::new(
        broker.clone(),
        Arc::clone(&store),
        Arc::new(Capabilities::software()),
    );
    let agent = PlatformAgent::new(
        Arc::clone(&store),
        broker.clone(),
        Arc::clone(&queue),
        pipeline,
    );
    Node {
        store,
        broker,
        queue,
        agent,
        _dir: dir,
    }
}

#[tokio::test]
async fn test_token_registration_provisions_the_node() {
    let stub = StubCoordinator::start(Arc::new(|_, path| match path {
        "/api/workers/register" => (
            200,
            json!({"status": "registered", "worker_id": "w1", "auth_token": "A"}),
        ),
        _ => (404, json!({})),
    }))
    .await;

    let node = node();
    let response = node
        .agent
        .register(&stub.url(), "T", Some("n1"))
        .await
        .unwrap();
    assert_eq!(response.worker_id, "w1");

    let config = node.store.get();
    assert_eq!(config.state, NodeState::Approved);
    assert_eq!(config.platform.worker_id, "w1");
    assert_eq!(config.platform.auth_token, "A");
    assert_eq!(config.platform.server_url, stub.url());

    let requests = stub.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].method, "POST");
    let body: serde_json::Value = serde_json::from_str(&requests[0].body).unwrap();
    assert_eq!(body["token"], "T");
    assert_eq!(body["device_name"], "n1");
}

#[tokio::test]
async fn test_rejected_registration_leaves_state_unchanged() {
    let stub = StubCoordinator::start(Arc::new(|_, _| {
        (401, json!({"error": "invalid token"}))
    }))
    .await;

    let node = node();
    let err = node.agent.register(&stub.url(), "bad", None).await.unwrap_err();
    assert!(err.to_string().contains("401"), "got: {}", err);
    assert!(err.to_string().contains("invalid token"));
    assert_eq!(node.store.get().state, NodeState::Unconfigured);
}

#[tokio::test]
async fn test_tokenless_flow_approves_via_poll() {
    let stub = StubCoordinator::start(Arc::new(|_, path| match path {
        "/api/workers/request-approval" => (200, json!({"success": true, "requestId": "r1"})),
        "/api/workers/approval-status/r1" => (
            200,
            json!({"status": "approved", "workerId": "w2", "authToken": "B"}),
        ),
        _ => (404, json!({})),
    }))
    .await;

    let node = node();
    let request_id = node.agent.request_approval(&stub.url()).await.unwrap();
    assert_eq!(request_id, "r1");
    assert_eq!(node.store.get().state, NodeState::Pending);

    // While pending the heartbeat tick polls approval instead.
    node.agent.heartbeat_tick().await;

    let config = node.store.get();
    assert_eq!(config.state, NodeState::Approved);
    assert_eq!(config.platform.worker_id, "w2");
    assert_eq!(config.platform.auth_token, "B");

    let paths: Vec<String> = stub.requests().iter().map(|r| r.path.clone()).collect();
    assert!(paths.contains(&"/api/workers/approval-status/r1".to_string()));
    assert!(
        !paths.iter().any(|p| p.contains("heartbeat")),
        "no heartbeat may be posted while pending"
    );
}

#[tokio::test]
async fn test_rejection_moves_node_to_error() {
    let stub = StubCoordinator::start(Arc::new(|_, path| match path {
        "/api/workers/request-approval" => (200, json!({"success": true, "requestId": "r2"})),
        "/api/workers/approval-status/r2" => (
            200,
            json!({"status": "rejected", "message": "unknown device"}),
        ),
        _ => (404, json!({})),
    }))
    .await;

    let node = node();
    node.agent.request_approval(&stub.url()).await.unwrap();
    node.agent.heartbeat_tick().await;
    assert_eq!(node.store.get().state, NodeState::Error);
}

#[tokio::test]
async fn test_heartbeat_carries_token_and_activates_node() {
    let stub = StubCoordinator::start(Arc::new(|_, path| match path {
        "/api/workers/register" => (
            200,
            json!({"status": "registered", "worker_id": "w1", "auth_token": "A"}),
        ),
        "/api/workers/w1/heartbeat" => (200, json!({})),
        _ => (404, json!({})),
    }))
    .await;

    let node = node();
    node.agent.register(&stub.url(), "T", None).await.unwrap();
    node.agent.heartbeat_tick().await;

    assert_eq!(node.store.get().state, NodeState::Active);

    let requests = stub.requests();
    let heartbeat = requests
        .iter()
        .find(|r| r.path == "/api/workers/w1/heartbeat")
        .expect("heartbeat not posted");
    assert_eq!(heartbeat.authorization.as_deref(), Some("Bearer A"));
    let body: serde_json::Value = serde_json::from_str(&heartbeat.body).unwrap();
    assert_eq!(body["state"], "approved");
    assert!(body["resources"]["memoryTotal"].as_u64().unwrap() > 0);
    assert!(body["queue"]["pending"].is_number());
}

#[tokio::test]
async fn test_config_sync_applies_only_newer_versions() {
    let stub = StubCoordinator::start(Arc::new(|_, path| match path {
        "/api/workers/register" => (
            200,
            json!({"status": "registered", "worker_id": "w1", "auth_token": "A"}),
        ),
        "/api/workers/w1/config" => (
            200,
            json!({
                "configVersion": 7,
                "cameras": [{
                    "device_id": "cam_AA",
                    "name": "N",
                    "rtsp_url": "rtsp://x",
                    "enabled": true,
                    "fps": 15,
                }],
            }),
        ),
        _ => (404, json!({})),
    }))
    .await;

    let node = node();
    node.agent.register(&stub.url(), "T", None).await.unwrap();
    let mut notifications = node.broker.subscribe("config.cameras").unwrap();

    node.agent.sync_tick().await;

    let config = node.store.get();
    assert_eq!(config.config_version, 7);
    assert_eq!(config.cameras.len(), 1);
    assert_eq!(config.cameras[0].device_id, "cam_AA");
    let msg = notifications.try_next().expect("reconcile notification missing");
    assert_eq!(&msg.payload[..], b"updated");

    // Same version again: no mutation, but last_sync still advances.
    let last_sync = config.last_sync;
    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    node.agent.sync_tick().await;
    let config = node.store.get();
    assert_eq!(config.config_version, 7);
    assert!(notifications.try_next().is_none());
    assert!(config.last_sync > last_sync);
}

#[tokio::test]
async fn test_event_ingest_delivers_queue_events() {
    let stub = StubCoordinator::start(Arc::new(|_, path| match path {
        "/api/workers/register" => (
            200,
            json!({"status": "registered", "worker_id": "w1", "auth_token": "A"}),
        ),
        "/api/events/ingest" => (201, json!({"ok": true})),
        _ => (404, json!({})),
    }))
    .await;

    let node = node();
    node.agent.register(&stub.url(), "T", None).await.unwrap();

    node.queue
        .enqueue(
            EventType::Anpr,
            "cam_AA",
            json!({"plate": "XY99"}),
            vec![("plate.jpg".to_string(), Bytes::from_static(b"img"))],
        )
        .unwrap();

    let sender: Arc<dyn EventSender> = node.agent.clone();
    node.queue.process_batch(sender.as_ref()).await.unwrap();

    assert_eq!(node.queue.counters().processed, 1);
    let ingest = stub
        .requests()
        .into_iter()
        .find(|r| r.path == "/api/events/ingest")
        .expect("ingest not called");
    assert_eq!(ingest.worker_id_header.as_deref(), Some("w1"));
    assert_eq!(ingest.authorization.as_deref(), Some("Bearer A"));
    // Multipart upload since an image rides along.
    assert!(ingest.body.contains("plate.jpg"));
}
