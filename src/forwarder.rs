//! Bridge between the local broker and the platform's central broker
//!
//! While the node is provisioned, the forwarder keeps a client connection
//! to the central broker on the coordinator's host (default port 4233).
//! `events.<type>` messages are always forwarded upstream as
//! `events.<worker_id>`; frames and detections are forwarded per camera
//! only while the coordinator has issued `start_stream` for that camera
//! on `command.<worker_id>`. Reconnects every 2 s on loss.

use crate::broker::{Broker, BrokerClient};
use crate::config::ConfigStore;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Default central broker port.
pub const DEFAULT_CENTRAL_PORT: u16 = 4233;

/// Wait between reconnect attempts.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// Remote command payload on `command.<worker_id>`.
#[derive(Debug, Deserialize)]
struct StreamCommand {
    action: String,
    #[serde(rename = "cameraId", default)]
    camera_id: String,
}

/// Counter snapshot.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ForwarderStats {
    pub connected: bool,
    pub events_forwarded: u64,
    pub frames_forwarded: u64,
    pub detections_forwarded: u64,
    pub active_streams: Vec<String>,
}

struct Inner {
    connected: AtomicBool,
    events_forwarded: AtomicU64,
    frames_forwarded: AtomicU64,
    detections_forwarded: AtomicU64,
    /// Cameras the coordinator wants bridged. Survives reconnects.
    active: Mutex<HashSet<String>>,
    /// Per-camera bridge tasks for the current connection.
    bridges: Mutex<HashMap<String, Vec<JoinHandle<()>>>>,
}

/// Reconciling local-to-central forwarder.
pub struct CentralForwarder {
    local: Broker,
    store: Arc<ConfigStore>,
    central_port: u16,
    inner: Arc<Inner>,
}

impl CentralForwarder {
    pub fn new(local: Broker, store: Arc<ConfigStore>, central_port: u16) -> Arc<Self> {
        Arc::new(Self {
            local,
            store,
            central_port,
            inner: Arc::new(Inner {
                connected: AtomicBool::new(false),
                events_forwarded: AtomicU64::new(0),
                frames_forwarded: AtomicU64::new(0),
                detections_forwarded: AtomicU64::new(0),
                active: Mutex::new(HashSet::new()),
                bridges: Mutex::new(HashMap::new()),
            }),
        })
    }

    pub fn stats(&self) -> ForwarderStats {
        let mut active: Vec<String> = self.inner.active.lock().iter().cloned().collect();
        active.sort();
        ForwarderStats {
            connected: self.inner.connected.load(Ordering::Relaxed),
            events_forwarded: self.inner.events_forwarded.load(Ordering::Relaxed),
            frames_forwarded: self.inner.frames_forwarded.load(Ordering::Relaxed),
            detections_forwarded: self.inner.detections_forwarded.load(Ordering::Relaxed),
            active_streams: active,
        }
    }

    /// Connect loop. Waits for a usable configuration, then keeps one
    /// central connection alive until `shutdown` flips.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }

            let target = match self.central_target() {
                Some(target) => target,
                None => {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = tokio::time::sleep(RECONNECT_DELAY) => continue,
                    }
                }
            };

            match BrokerClient::connect(&target.addr, &format!("magicbox-{}", target.worker_id))
                .await
            {
                Ok(client) => {
                    info!(central = %target.addr, "Connected to central broker");
                    self.inner.connected.store(true, Ordering::Relaxed);
                    let client = Arc::new(client);

                    let session = self.start_session(&client, &target.worker_id).await;
                    let mut connected = client.connected();

                    let stop = loop {
                        tokio::select! {
                            _ = shutdown.changed() => break true,
                            changed = connected.changed() => {
                                if changed.is_err() || !*connected.borrow() {
                                    break false;
                                }
                            }
                        }
                    };

                    self.teardown_session(session).await;
                    self.inner.connected.store(false, Ordering::Relaxed);
                    if stop {
                        break;
                    }
                    warn!("Central broker connection lost, reconnecting");
                }
                Err(e) => {
                    debug!(central = %target.addr, error = %e, "Central broker unreachable");
                }
            }

            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(RECONNECT_DELAY) => {}
            }
        }
        info!("Central forwarder stopped");
    }

    /// Central address derived from the coordinator URL plus the assigned
    /// worker id; `None` until both exist.
    fn central_target(&self) -> Option<Target> {
        let config = self.store.get();
        let worker_id = config.platform.worker_id;
        if worker_id.is_empty() {
            return None;
        }
        let host = host_from_url(&config.platform.server_url)?;
        Some(Target {
            addr: format!("{}:{}", host, self.central_port),
            worker_id,
        })
    }

    /// Subscribes the command channel and the unconditional event bridge,
    /// and re-establishes gated bridges for the surviving active set.
    async fn start_session(
        self: &Arc<Self>,
        client: &Arc<BrokerClient>,
        worker_id: &str,
    ) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        // command.<worker_id> from the platform
        match client.subscribe(&format!("command.{}", worker_id)).await {
            Ok(mut sub) => {
                let forwarder = Arc::clone(self);
                let client = Arc::clone(client);
                let worker_id = worker_id.to_string();
                handles.push(tokio::spawn(async move {
                    while let Some(msg) = sub.next().await {
                        forwarder.handle_command(&client, &worker_id, &msg.payload).await;
                    }
                }));
            }
            Err(e) => warn!(error = %e, "Command subscription failed"),
        }

        // events.* are forwarded unconditionally
        match self.local.subscribe("events.*") {
            Ok(mut sub) => {
                let inner = Arc::clone(&self.inner);
                let client = Arc::clone(client);
                let subject = format!("events.{}", worker_id);
                handles.push(tokio::spawn(async move {
                    while let Some(msg) = sub.next().await {
                        if client.publish(&subject, &msg.payload).await.is_err() {
                            break;
                        }
                        inner.events_forwarded.fetch_add(1, Ordering::Relaxed);
                    }
                }));
            }
            Err(e) => warn!(error = %e, "Event subscription failed"),
        }

        let active: Vec<String> = self.inner.active.lock().iter().cloned().collect();
        for camera_id in active {
            self.spawn_bridges(client, worker_id, &camera_id);
        }

        handles
    }

    async fn teardown_session(&self, handles: Vec<JoinHandle<()>>) {
        for handle in handles {
            handle.abort();
        }
        let mut bridges = self.inner.bridges.lock();
        for (_, tasks) in bridges.drain() {
            for task in tasks {
                task.abort();
            }
        }
    }

    /// Applies one `{action, cameraId}` command. Both actions are
    /// idempotent; anything else is logged and ignored.
    async fn handle_command(
        self: &Arc<Self>,
        client: &Arc<BrokerClient>,
        worker_id: &str,
        payload: &[u8],
    ) {
        let command: StreamCommand = match serde_json::from_slice(payload) {
            Ok(command) => command,
            Err(e) => {
                warn!(error = %e, "Malformed command payload");
                return;
            }
        };

        match command.action.as_str() {
            "start_stream" => {
                if command.camera_id.is_empty() {
                    warn!("start_stream without cameraId");
                    return;
                }
                let newly_added = self.inner.active.lock().insert(command.camera_id.clone());
                if newly_added {
                    info!(camera = %command.camera_id, "Streaming to platform enabled");
                    self.spawn_bridges(client, worker_id, &command.camera_id);
                }
            }
            "stop_stream" => {
                let was_active = self.inner.active.lock().remove(&command.camera_id);
                if was_active {
                    info!(camera = %command.camera_id, "Streaming to platform disabled");
                }
                if let Some(tasks) = self.inner.bridges.lock().remove(&command.camera_id) {
                    for task in tasks {
                        task.abort();
                    }
                }
            }
            other => {
                warn!(action = %other, "Ignoring unknown command");
            }
        }
    }

    /// Bridges `frames.<cam>` and `detections.<cam>` upstream for one
    /// camera on the current connection.
    fn spawn_bridges(&self, client: &Arc<BrokerClient>, worker_id: &str, camera_id: &str) {
        let mut tasks = Vec::with_capacity(2);

        for kind in ["frames", "detections"] {
            let local_subject = format!("{}.{}", kind, camera_id);
            let remote_subject = format!("{}.{}.{}", kind, worker_id, camera_id);
            match self.local.subscribe(&local_subject) {
                Ok(mut sub) => {
                    let client = Arc::clone(client);
                    let inner = Arc::clone(&self.inner);
                    let is_frames = kind == "frames";
                    tasks.push(tokio::spawn(async move {
                        while let Some(msg) = sub.next().await {
                            if client.publish(&remote_subject, &msg.payload).await.is_err() {
                                break;
                            }
                            if is_frames {
                                inner.frames_forwarded.fetch_add(1, Ordering::Relaxed);
                            } else {
                                inner.detections_forwarded.fetch_add(1, Ordering::Relaxed);
                            }
                        }
                    }));
                }
                Err(e) => warn!(subject = %local_subject, error = %e, "Bridge subscription failed"),
            }
        }

        // Replacing an existing entry (reconnect) aborts the stale tasks.
        if let Some(stale) = self.inner.bridges.lock().insert(camera_id.to_string(), tasks) {
            for task in stale {
                task.abort();
            }
        }
    }
}

struct Target {
    addr: String,
    worker_id: String,
}

/// Extracts the host from a coordinator URL like `http://srv:3001`.
fn host_from_url(url: &str) -> Option<String> {
    let rest = url
        .trim()
        .trim_start_matches("https://")
        .trim_start_matches("http://");
    let host_port = rest.split('/').next()?;
    let host = host_port.split(':').next()?.trim();
    if host.is_empty() {
        None
    } else {
        Some(host.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_from_url() {
        assert_eq!(host_from_url("http://srv:3001"), Some("srv".to_string()));
        assert_eq!(
            host_from_url("https://platform.example.com/"),
            Some("platform.example.com".to_string())
        );
        assert_eq!(
            host_from_url("10.8.0.1:3001"),
            Some("10.8.0.1".to_string())
        );
        assert_eq!(host_from_url(""), None);
    }
}
