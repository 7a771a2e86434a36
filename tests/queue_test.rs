//! Event queue durability and retry behaviour

use async_trait::async_trait;
use bytes::Bytes;
use magicbox::queue::{
    Event, EventQueue, EventSender, EventStatus, EventType, BATCH_SIZE, MAX_RETRIES,
};
use serde_json::json;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tempfile::tempdir;

struct OkSender {
    sent: AtomicU64,
}

#[async_trait]
impl EventSender for OkSender {
    async fn send(&self, _event: &Event, _dir: &Path) -> anyhow::Result<()> {
        self.sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

struct FailSender;

#[async_trait]
impl EventSender for FailSender {
    async fn send(&self, _event: &Event, _dir: &Path) -> anyhow::Result<()> {
        anyhow::bail!("connection refused")
    }
}

fn event_dir(root: &Path, status: &str, id: &str) -> std::path::PathBuf {
    root.join("events").join(status).join(id)
}

#[tokio::test]
async fn test_enqueue_is_immediately_durable() {
    let dir = tempdir().unwrap();
    let queue = EventQueue::open(dir.path()).unwrap();

    let event = queue
        .enqueue(
            EventType::Anpr,
            "cam_01",
            json!({"plate": "AB12CD"}),
            vec![("plate.jpg".to_string(), Bytes::from_static(b"jpegdata"))],
        )
        .unwrap();

    let pending = event_dir(dir.path(), "pending", &event.id);
    assert!(pending.join("event.json").is_file());
    assert!(pending.join("plate.jpg").is_file());
    assert_eq!(queue.counters().pending, 1);

    // Reopen: recovery must find the same event.
    drop(queue);
    let queue = EventQueue::open(dir.path()).unwrap();
    assert_eq!(queue.counters().pending, 1);
    let listed = queue.pending_events(10).unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, event.id);
    assert_eq!(listed[0].status, EventStatus::Pending);
}

#[tokio::test]
async fn test_successful_send_moves_to_sent() {
    let dir = tempdir().unwrap();
    let queue = EventQueue::open(dir.path()).unwrap();
    let sender = OkSender {
        sent: AtomicU64::new(0),
    };

    let event = queue
        .enqueue(
            EventType::Violation,
            "cam_02",
            json!({"kind": "red_light"}),
            vec![("ctx.jpg".to_string(), Bytes::from_static(b"img"))],
        )
        .unwrap();

    queue.process_batch(&sender).await.unwrap();

    assert_eq!(sender.sent.load(Ordering::Relaxed), 1);
    assert!(!event_dir(dir.path(), "pending", &event.id).exists());
    let sent = event_dir(dir.path(), "sent", &event.id);
    assert!(sent.join("event.json").is_file());
    assert!(sent.join("ctx.jpg").is_file(), "images must travel with the event");

    let counters = queue.counters();
    assert_eq!(counters.pending, 0);
    assert_eq!(counters.processed, 1);
}

#[tokio::test]
async fn test_failures_retry_then_park_in_failed() {
    let dir = tempdir().unwrap();
    let queue = EventQueue::open(dir.path()).unwrap();
    let sender = FailSender;

    let event = queue
        .enqueue(EventType::Vcc, "cam_03", json!({"count": 4}), vec![])
        .unwrap();

    // Each tick is one attempt; the event stays pending until MAX_RETRIES.
    for attempt in 1..MAX_RETRIES {
        queue.process_batch(&sender).await.unwrap();
        let listed = queue.pending_events(10).unwrap();
        assert_eq!(listed.len(), 1, "attempt {}", attempt);
        assert_eq!(listed[0].retries, attempt);
        assert_eq!(listed[0].last_error.as_deref(), Some("connection refused"));
    }

    queue.process_batch(&sender).await.unwrap();
    assert!(!event_dir(dir.path(), "pending", &event.id).exists());
    assert!(event_dir(dir.path(), "failed", &event.id).is_dir());

    let failed = queue.failed_events(10).unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].retries, MAX_RETRIES);
    assert_eq!(failed[0].status, EventStatus::Failed);
    assert_eq!(queue.counters().failed, 1);
}

#[tokio::test]
async fn test_retry_event_resets_and_is_single_shot() {
    let dir = tempdir().unwrap();
    let queue = EventQueue::open(dir.path()).unwrap();

    let event = queue
        .enqueue(EventType::Alert, "cam_04", json!({}), vec![])
        .unwrap();
    for _ in 0..MAX_RETRIES {
        queue.process_batch(&FailSender).await.unwrap();
    }
    assert_eq!(queue.counters().failed, 1);

    queue.retry_event(&event.id).unwrap();
    let listed = queue.pending_events(10).unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].retries, 0);
    assert!(listed[0].last_error.is_none());

    // Already requeued: a second retry is a not-found error.
    assert!(queue.retry_event(&event.id).is_err());
}

#[tokio::test]
async fn test_retry_all_failed_drains_once_reachable() {
    let dir = tempdir().unwrap();
    let queue = EventQueue::open(dir.path()).unwrap();

    for i in 0..3 {
        queue
            .enqueue(EventType::Anpr, "cam_05", json!({"n": i}), vec![])
            .unwrap();
    }
    for _ in 0..MAX_RETRIES {
        queue.process_batch(&FailSender).await.unwrap();
    }
    assert_eq!(queue.counters().failed, 3);

    let moved = queue.retry_all_failed().unwrap();
    assert_eq!(moved, 3);

    let sender = OkSender {
        sent: AtomicU64::new(0),
    };
    queue.process_batch(&sender).await.unwrap();
    assert_eq!(sender.sent.load(Ordering::Relaxed), 3);
    assert_eq!(queue.counters().processed, 3);
    assert_eq!(queue.sent_events(10).unwrap().len(), 3);
}

#[tokio::test]
async fn test_batch_cap_respected() {
    let dir = tempdir().unwrap();
    let queue = EventQueue::open(dir.path()).unwrap();
    let sender = OkSender {
        sent: AtomicU64::new(0),
    };

    for i in 0..(BATCH_SIZE + 3) {
        queue
            .enqueue(EventType::Crowd, "cam_06", json!({"n": i}), vec![])
            .unwrap();
    }

    queue.process_batch(&sender).await.unwrap();
    assert_eq!(sender.sent.load(Ordering::Relaxed), BATCH_SIZE as u64);
    assert_eq!(queue.pending_events(100).unwrap().len(), 3);
}

#[tokio::test]
async fn test_clear_sent_removes_old_events() {
    let dir = tempdir().unwrap();
    let queue = EventQueue::open(dir.path()).unwrap();

    queue
        .enqueue(EventType::Anpr, "cam_07", json!({}), vec![])
        .unwrap();
    queue
        .process_batch(&OkSender {
            sent: AtomicU64::new(0),
        })
        .await
        .unwrap();
    assert_eq!(queue.sent_events(10).unwrap().len(), 1);

    // Nothing is old enough yet.
    assert_eq!(queue.clear_sent(chrono::Duration::hours(1)).unwrap(), 0);
    // Everything is older than "now minus nothing".
    assert_eq!(queue.clear_sent(chrono::Duration::zero()).unwrap(), 1);
    assert_eq!(queue.sent_events(10).unwrap().len(), 0);
}
