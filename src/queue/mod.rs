//! Durable at-least-once event queue
//!
//! Analytics facts (violations, plate reads, counts) are persisted as one
//! directory per event under `<data>/events/{pending,sent,failed}/<id>/`,
//! holding `event.json` plus any evidence images. `event.json` is written
//! atomically (temp + rename) so an event either exists completely or not
//! at all. A 1 Hz processor drains `pending/` through a pluggable
//! [`EventSender`]; delivery failures are retried up to [`MAX_RETRIES`]
//! times before the event lands in `failed/`.
//!
//! Directory moves are write-new-then-remove-old: crash recovery tolerates
//! a transient duplicate and keeps the copy with the newest `updated_at`.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Attempts before an event is parked in `failed/`.
pub const MAX_RETRIES: u32 = 5;

/// Events drained per processor tick.
pub const BATCH_SIZE: usize = 10;

/// Processor cadence.
pub const TICK_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse event: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("event not found: {0}")]
    NotFound(String),
}

/// Durable analytic fact category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Anpr,
    Vcc,
    Violation,
    Crowd,
    Alert,
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            EventType::Anpr => "anpr",
            EventType::Vcc => "vcc",
            EventType::Violation => "violation",
            EventType::Crowd => "crowd",
            EventType::Alert => "alert",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    Pending,
    Processing,
    Sent,
    Failed,
}

impl EventStatus {
    fn dir_name(self) -> &'static str {
        match self {
            EventStatus::Pending | EventStatus::Processing => "pending",
            EventStatus::Sent => "sent",
            EventStatus::Failed => "failed",
        }
    }
}

/// One durable event, as persisted in `event.json` and sent on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,

    #[serde(rename = "type")]
    pub event_type: EventType,

    #[serde(rename = "deviceId")]
    pub device_id: String,

    pub timestamp: DateTime<Utc>,

    /// Opaque analytics payload.
    pub data: serde_json::Value,

    /// File names of evidence images stored beside `event.json`.
    #[serde(default)]
    pub images: Vec<String>,

    pub status: EventStatus,

    #[serde(default)]
    pub retries: u32,

    #[serde(rename = "error", default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,

    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,

    #[serde(rename = "updatedAt")]
    pub updated_at: DateTime<Utc>,
}

/// Delivery seam. The platform agent implements this against the
/// coordinator's ingest endpoint.
#[async_trait]
pub trait EventSender: Send + Sync {
    async fn send(&self, event: &Event, event_dir: &Path) -> anyhow::Result<()>;
}

/// In-memory counter snapshot, reconciled from disk at startup.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueCounters {
    pub pending: u64,
    pub failed: u64,
    pub processed: u64,
}

/// The on-disk event queue. Owns the three status directories exclusively.
pub struct EventQueue {
    root: PathBuf,
    pending: AtomicU64,
    failed: AtomicU64,
    processed: AtomicU64,
}

impl EventQueue {
    /// Opens (or creates) the queue under `<data_dir>/events` and
    /// reconciles counters and stranded events from disk.
    pub fn open<P: AsRef<Path>>(data_dir: P) -> Result<Self, QueueError> {
        let root = data_dir.as_ref().join("events");
        for status in ["pending", "sent", "failed"] {
            fs::create_dir_all(root.join(status))?;
        }

        let queue = Self {
            root,
            pending: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            processed: AtomicU64::new(0),
        };
        queue.recover()?;
        Ok(queue)
    }

    /// Crash recovery: drop stale duplicates (an interrupted move leaves
    /// the event in two directories; the newest `updated_at` wins), reset
    /// events stranded in `processing`, and rebuild counters.
    fn recover(&self) -> Result<(), QueueError> {
        let mut newest: std::collections::HashMap<String, (DateTime<Utc>, PathBuf)> =
            std::collections::HashMap::new();

        for status in ["pending", "sent", "failed"] {
            for dir in list_event_dirs(&self.root.join(status))? {
                let event = match load_event(&dir) {
                    Ok(event) => event,
                    Err(e) => {
                        warn!(dir = %dir.display(), error = %e, "Unreadable event directory, skipping");
                        continue;
                    }
                };
                match newest.get(&event.id).cloned() {
                    Some((seen, _)) if seen >= event.updated_at => {
                        info!(event = %event.id, "Removing stale duplicate after interrupted move");
                        let _ = fs::remove_dir_all(&dir);
                    }
                    Some((_, stale_dir)) => {
                        info!(event = %event.id, "Removing stale duplicate after interrupted move");
                        let _ = fs::remove_dir_all(&stale_dir);
                        newest.insert(event.id.clone(), (event.updated_at, dir));
                    }
                    None => {
                        newest.insert(event.id.clone(), (event.updated_at, dir));
                    }
                }
            }
        }

        let mut pending = 0u64;
        let mut failed = 0u64;
        let mut processed = 0u64;
        for (_, (_, dir)) in newest {
            let mut event = load_event(&dir)?;
            if in_status_dir(&dir, &self.root, "pending") {
                if event.status == EventStatus::Processing {
                    // The sender never acknowledged; deliver again.
                    event.status = EventStatus::Pending;
                    event.updated_at = Utc::now();
                    persist_event(&dir, &event)?;
                }
                pending += 1;
            } else if in_status_dir(&dir, &self.root, "failed") {
                failed += 1;
            } else {
                processed += 1;
            }
        }

        self.pending.store(pending, Ordering::Relaxed);
        self.failed.store(failed, Ordering::Relaxed);
        self.processed.store(processed, Ordering::Relaxed);
        info!(pending, failed, processed, "Event queue recovered");
        Ok(())
    }

    /// Persists a new event with optional evidence images. The event
    /// becomes visible only once `event.json` lands, so a crash mid-write
    /// leaves no half-event behind.
    pub fn enqueue(
        &self,
        event_type: EventType,
        device_id: &str,
        data: serde_json::Value,
        images: Vec<(String, Bytes)>,
    ) -> Result<Event, QueueError> {
        let id = Uuid::new_v4().to_string();
        let dir = self.root.join("pending").join(&id);
        fs::create_dir_all(&dir)?;

        let mut names = Vec::with_capacity(images.len());
        for (name, bytes) in &images {
            fs::write(dir.join(name), bytes)?;
            names.push(name.clone());
        }

        let now = Utc::now();
        let event = Event {
            id: id.clone(),
            event_type,
            device_id: device_id.to_string(),
            timestamp: now,
            data,
            images: names,
            status: EventStatus::Pending,
            retries: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
        };
        persist_event(&dir, &event)?;

        self.pending.fetch_add(1, Ordering::Relaxed);
        debug!(event = %id, kind = %event_type, device = %device_id, "Event enqueued");
        Ok(event)
    }

    /// Background processor: drains pending events through `sender` once
    /// per second until `shutdown` flips.
    pub async fn run(
        self: Arc<Self>,
        sender: Arc<dyn EventSender>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(TICK_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("Event queue processor stopping");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.process_batch(sender.as_ref()).await {
                        error!(error = %e, "Event batch processing failed");
                    }
                }
            }
        }
    }

    /// One processing tick: oldest pending events first, at most
    /// [`BATCH_SIZE`] of them.
    pub async fn process_batch(&self, sender: &dyn EventSender) -> Result<(), QueueError> {
        let pending_dir = self.root.join("pending");
        let mut events: Vec<(PathBuf, Event)> = Vec::new();
        for dir in list_event_dirs(&pending_dir)? {
            match load_event(&dir) {
                Ok(event) => events.push((dir, event)),
                Err(e) => warn!(dir = %dir.display(), error = %e, "Skipping unreadable event"),
            }
        }
        events.sort_by_key(|(_, e)| e.created_at);
        events.truncate(BATCH_SIZE);

        for (dir, mut event) in events {
            event.status = EventStatus::Processing;
            event.updated_at = Utc::now();
            persist_event(&dir, &event)?;

            match sender.send(&event, &dir).await {
                Ok(()) => {
                    event.status = EventStatus::Sent;
                    event.updated_at = Utc::now();
                    event.last_error = None;
                    self.move_event(&dir, &event)?;
                    self.pending.fetch_sub(1, Ordering::Relaxed);
                    self.processed.fetch_add(1, Ordering::Relaxed);
                    debug!(event = %event.id, "Event delivered");
                }
                Err(e) => {
                    event.retries += 1;
                    event.last_error = Some(e.to_string());
                    event.updated_at = Utc::now();
                    if event.retries >= MAX_RETRIES {
                        event.status = EventStatus::Failed;
                        self.move_event(&dir, &event)?;
                        self.pending.fetch_sub(1, Ordering::Relaxed);
                        self.failed.fetch_add(1, Ordering::Relaxed);
                        warn!(event = %event.id, retries = event.retries, error = %e, "Event moved to failed");
                    } else {
                        event.status = EventStatus::Pending;
                        persist_event(&dir, &event)?;
                        debug!(event = %event.id, retries = event.retries, error = %e, "Event delivery failed, will retry");
                    }
                }
            }
        }
        Ok(())
    }

    /// Moves `failed/<id>` back to `pending/` with a clean slate.
    /// Repeating on the same id is a not-found error.
    pub fn retry_event(&self, id: &str) -> Result<(), QueueError> {
        let dir = self.root.join("failed").join(id);
        if !dir.is_dir() {
            return Err(QueueError::NotFound(id.to_string()));
        }
        let mut event = load_event(&dir)?;
        event.status = EventStatus::Pending;
        event.retries = 0;
        event.last_error = None;
        event.updated_at = Utc::now();
        self.move_event(&dir, &event)?;
        self.failed.fetch_sub(1, Ordering::Relaxed);
        self.pending.fetch_add(1, Ordering::Relaxed);
        info!(event = %id, "Failed event requeued");
        Ok(())
    }

    /// Requeues everything in `failed/`. Returns how many moved.
    pub fn retry_all_failed(&self) -> Result<usize, QueueError> {
        let mut moved = 0;
        for dir in list_event_dirs(&self.root.join("failed"))? {
            if let Some(id) = dir.file_name().and_then(|n| n.to_str()) {
                match self.retry_event(id) {
                    Ok(()) => moved += 1,
                    Err(e) => warn!(event = %id, error = %e, "Retry failed"),
                }
            }
        }
        Ok(moved)
    }

    /// Deletes sent events (and their images) older than `age`.
    pub fn clear_sent(&self, age: chrono::Duration) -> Result<usize, QueueError> {
        let cutoff = Utc::now() - age;
        let mut removed = 0;
        for dir in list_event_dirs(&self.root.join("sent"))? {
            let event = match load_event(&dir) {
                Ok(event) => event,
                Err(_) => continue,
            };
            if event.updated_at < cutoff {
                fs::remove_dir_all(&dir)?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    pub fn pending_events(&self, limit: usize) -> Result<Vec<Event>, QueueError> {
        self.list_status("pending", limit)
    }

    pub fn failed_events(&self, limit: usize) -> Result<Vec<Event>, QueueError> {
        self.list_status("failed", limit)
    }

    pub fn sent_events(&self, limit: usize) -> Result<Vec<Event>, QueueError> {
        self.list_status("sent", limit)
    }

    pub fn counters(&self) -> QueueCounters {
        QueueCounters {
            pending: self.pending.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
        }
    }

    fn list_status(&self, status: &str, limit: usize) -> Result<Vec<Event>, QueueError> {
        let mut events = Vec::new();
        for dir in list_event_dirs(&self.root.join(status))? {
            if let Ok(event) = load_event(&dir) {
                events.push(event);
            }
        }
        events.sort_by_key(|e| e.created_at);
        events.truncate(limit);
        Ok(events)
    }

    /// Relocates an event directory to the directory implied by its
    /// status: write the new copy first, then remove the old one.
    fn move_event(&self, old_dir: &Path, event: &Event) -> Result<(), QueueError> {
        let new_dir = self.root.join(event.status.dir_name()).join(&event.id);
        if new_dir == old_dir {
            persist_event(old_dir, event)?;
            return Ok(());
        }

        fs::create_dir_all(&new_dir)?;
        for name in &event.images {
            let src = old_dir.join(name);
            if src.is_file() {
                fs::copy(&src, new_dir.join(name))?;
            }
        }
        persist_event(&new_dir, event)?;
        fs::remove_dir_all(old_dir)?;
        Ok(())
    }
}

fn list_event_dirs(status_dir: &Path) -> Result<Vec<PathBuf>, QueueError> {
    let mut dirs = Vec::new();
    for entry in fs::read_dir(status_dir)? {
        let path = entry?.path();
        if path.is_dir() {
            dirs.push(path);
        }
    }
    Ok(dirs)
}

fn load_event(dir: &Path) -> Result<Event, QueueError> {
    let bytes = fs::read(dir.join("event.json"))?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Atomic replace of `event.json` within `dir`.
fn persist_event(dir: &Path, event: &Event) -> Result<(), QueueError> {
    let tmp = dir.join("event.json.tmp");
    fs::write(&tmp, serde_json::to_vec_pretty(event)?)?;
    fs::rename(&tmp, dir.join("event.json"))?;
    Ok(())
}

fn in_status_dir(dir: &Path, root: &Path, status: &str) -> bool {
    dir.parent() == Some(root.join(status).as_path())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_envelope_keys() {
        let now = Utc::now();
        let event = Event {
            id: "e1".to_string(),
            event_type: EventType::Anpr,
            device_id: "cam_01".to_string(),
            timestamp: now,
            data: json!({"plate": "AB123"}),
            images: vec!["plate.jpg".to_string()],
            status: EventStatus::Pending,
            retries: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "anpr");
        assert_eq!(value["deviceId"], "cam_01");
        assert!(value["createdAt"].is_string());
        assert!(value["updatedAt"].is_string());
        assert!(value.get("error").is_none());
        assert_eq!(value["status"], "pending");
    }
}
