//! Central forwarder gating behaviour against an embedded central broker

use bytes::Bytes;
use magicbox::broker::{Broker, BrokerServer};
use magicbox::config::ConfigStore;
use magicbox::forwarder::CentralForwarder;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;
use tokio::sync::watch;

struct Fixture {
    local: Broker,
    central: Broker,
    forwarder: Arc<CentralForwarder>,
    _dir: tempfile::TempDir,
    _shutdowns: Vec<watch::Sender<bool>>,
}

/// Starts a local broker, a stand-in central broker on an ephemeral port,
/// and a forwarder wired to it through a provisioned config store.
async fn fixture() -> Fixture {
    let central = Broker::default();
    let central_server = BrokerServer::bind(central.clone(), "127.0.0.1:0")
        .await
        .unwrap();
    let central_port = central_server.local_addr().port();
    let (central_tx, central_rx) = watch::channel(false);
    tokio::spawn(central_server.run(central_rx));

    let dir = tempdir().unwrap();
    let store = Arc::new(ConfigStore::load_or_create(dir.path().join("node.json")).unwrap());
    store
        .set_approved("http://127.0.0.1:3001", "w1", "token")
        .unwrap();

    let local = Broker::default();
    let forwarder = CentralForwarder::new(local.clone(), store, central_port);
    let (fwd_tx, fwd_rx) = watch::channel(false);
    tokio::spawn(Arc::clone(&forwarder).run(fwd_rx));

    // Wait for the forwarder to connect.
    for _ in 0..100 {
        if forwarder.stats().connected {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(forwarder.stats().connected, "forwarder never connected");
    // Let the session subscriptions land in the central tables.
    tokio::time::sleep(Duration::from_millis(50)).await;

    Fixture {
        local,
        central,
        forwarder,
        _dir: dir,
        _shutdowns: vec![central_tx, fwd_tx],
    }
}

async fn recv(
    sub: &mut magicbox::broker::Subscription,
) -> Option<magicbox::broker::Message> {
    tokio::time::timeout(Duration::from_secs(2), sub.next())
        .await
        .ok()
        .flatten()
}

fn command(action: &str, camera: &str) -> Bytes {
    Bytes::from(
        serde_json::to_vec(&json!({"action": action, "cameraId": camera})).unwrap(),
    )
}

#[tokio::test]
async fn test_events_always_forwarded() {
    let fx = fixture().await;
    let mut upstream = fx.central.subscribe("events.w1").unwrap();

    fx.local
        .publish("events.anpr", Bytes::from_static(b"{\"plate\":\"X\"}"))
        .unwrap();

    let msg = recv(&mut upstream).await.expect("event not forwarded");
    assert_eq!(msg.subject, "events.w1");
    assert_eq!(&msg.payload[..], b"{\"plate\":\"X\"}");
    assert_eq!(fx.forwarder.stats().events_forwarded, 1);
}

#[tokio::test]
async fn test_frames_gated_by_stream_commands() {
    let fx = fixture().await;
    let mut upstream = fx.central.subscribe("frames.w1.cam_AA").unwrap();

    // Not in the active set: nothing crosses.
    fx.local
        .publish("frames.cam_AA", Bytes::from_static(b"f0"))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(upstream.try_next().is_none());
    assert_eq!(fx.forwarder.stats().frames_forwarded, 0);

    // start_stream opens the gate.
    fx.central
        .publish("command.w1", command("start_stream", "cam_AA"))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(fx.forwarder.stats().active_streams, vec!["cam_AA"]);

    fx.local
        .publish("frames.cam_AA", Bytes::from_static(b"f1"))
        .unwrap();
    let msg = recv(&mut upstream).await.expect("frame not forwarded");
    assert_eq!(msg.subject, "frames.w1.cam_AA");
    assert_eq!(&msg.payload[..], b"f1");

    // stop_stream closes it again; events are unaffected.
    fx.central
        .publish("command.w1", command("stop_stream", "cam_AA"))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(fx.forwarder.stats().active_streams.is_empty());

    fx.local
        .publish("frames.cam_AA", Bytes::from_static(b"f2"))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(upstream.try_next().is_none());

    let mut events = fx.central.subscribe("events.w1").unwrap();
    fx.local
        .publish("events.vcc", Bytes::from_static(b"{}"))
        .unwrap();
    assert!(recv(&mut events).await.is_some());
}

#[tokio::test]
async fn test_start_stream_is_idempotent() {
    let fx = fixture().await;
    let mut upstream = fx.central.subscribe("frames.w1.cam_AA").unwrap();

    for _ in 0..2 {
        fx.central
            .publish("command.w1", command("start_stream", "cam_AA"))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert_eq!(fx.forwarder.stats().active_streams, vec!["cam_AA"]);

    fx.local
        .publish("frames.cam_AA", Bytes::from_static(b"once"))
        .unwrap();

    let first = recv(&mut upstream).await.expect("frame not forwarded");
    assert_eq!(&first.payload[..], b"once");
    // Exactly one subscription: no duplicate delivery.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(upstream.try_next().is_none());

    // stop after either leaves none.
    fx.central
        .publish("command.w1", command("stop_stream", "cam_AA"))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(fx.forwarder.stats().active_streams.is_empty());
}

#[tokio::test]
async fn test_detections_gated_like_frames() {
    let fx = fixture().await;
    let mut upstream = fx.central.subscribe("detections.w1.cam_BB").unwrap();

    fx.local
        .publish("detections.cam_BB", Bytes::from_static(b"d0"))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(upstream.try_next().is_none());

    fx.central
        .publish("command.w1", command("start_stream", "cam_BB"))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    fx.local
        .publish("detections.cam_BB", Bytes::from_static(b"d1"))
        .unwrap();
    let msg = recv(&mut upstream).await.expect("detection not forwarded");
    assert_eq!(msg.subject, "detections.w1.cam_BB");
    assert_eq!(fx.forwarder.stats().detections_forwarded, 1);
}

#[tokio::test]
async fn test_unknown_command_ignored() {
    let fx = fixture().await;
    fx.central
        .publish("command.w1", command("reboot", "cam_AA"))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(fx.forwarder.stats().active_streams.is_empty());
    assert!(fx.forwarder.stats().connected);
}
