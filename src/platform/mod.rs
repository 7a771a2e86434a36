//! Platform lifecycle agent
//!
//! Owns the node-to-coordinator contract: the registration state machine,
//! the heartbeat and configuration-sync loops, camera catalog sync, VPN
//! provisioning, and event delivery for the queue. All loops are
//! self-healing: transient failures are logged and retried on the next
//! tick; only explicit cancellation stops them.

mod api;
pub mod resources;
pub mod wireguard;

pub use api::{
    ApprovalStatus, CameraHealth, CameraUpload, CoordinatorClient, HeartbeatRequest,
    RegisterResponse,
};
pub use resources::{ResourceSampler, ResourceSnapshot};

use crate::broker::Broker;
use crate::config::{ConfigError, ConfigStore, NodeState};
use crate::pipeline::StreamPipeline;
use crate::queue::{Event, EventQueue, EventSender};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Heartbeat cadence while provisioned (or approval poll while pending).
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Configuration sync cadence.
pub const SYNC_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Error, Debug)]
pub enum PlatformError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("coordinator rejected request: HTTP {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("serialisation error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("node is not provisioned with the coordinator")]
    NotProvisioned,

    #[error("wireguard: {0}")]
    WireGuard(String),

    #[error("invalid state for this operation: {0}")]
    InvalidState(String),
}

/// Long-lived client of the central coordinator.
pub struct PlatformAgent {
    store: Arc<ConfigStore>,
    broker: Broker,
    queue: Arc<EventQueue>,
    pipeline: Arc<StreamPipeline>,
    sampler: ResourceSampler,
    /// Coordinator client cached per base URL.
    client: Mutex<Option<(String, Arc<CoordinatorClient>)>>,
}

impl PlatformAgent {
    pub fn new(
        store: Arc<ConfigStore>,
        broker: Broker,
        queue: Arc<EventQueue>,
        pipeline: Arc<StreamPipeline>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            broker,
            queue,
            pipeline,
            sampler: ResourceSampler::new(),
            client: Mutex::new(None),
        })
    }

    fn client_for(&self, server_url: &str) -> Result<Arc<CoordinatorClient>, PlatformError> {
        let server_url = server_url.trim_end_matches('/');
        if server_url.is_empty() {
            return Err(PlatformError::NotProvisioned);
        }
        let mut cached = self.client.lock();
        if let Some((url, client)) = cached.as_ref() {
            if url == server_url {
                return Ok(Arc::clone(client));
            }
        }
        let client = Arc::new(CoordinatorClient::new(server_url)?);
        *cached = Some((server_url.to_string(), Arc::clone(&client)));
        Ok(client)
    }

    fn current_client(&self) -> Result<Arc<CoordinatorClient>, PlatformError> {
        self.client_for(&self.store.get().platform.server_url)
    }

    /// Token-based registration. On success the node is immediately
    /// approved. Coordinator rejections are surfaced verbatim and leave
    /// the state untouched.
    pub async fn register(
        &self,
        server_url: &str,
        token: &str,
        node_name: Option<&str>,
    ) -> Result<RegisterResponse, PlatformError> {
        let config = self.store.get();
        let client = self.client_for(server_url)?;
        let response = client
            .register(&api::RegisterRequest {
                token: token.to_string(),
                device_name: node_name.unwrap_or(&config.node_name).to_string(),
                mac: config.mac.clone(),
                model: config.node_model.clone(),
                ip: crate::config::local_ip(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            })
            .await?;

        self.store
            .set_approved(server_url, &response.worker_id, &response.auth_token)?;
        info!(worker = %response.worker_id, "Registered with coordinator");
        Ok(response)
    }

    /// Tokenless registration: files an approval request and parks the
    /// node in `pending` until an operator decides.
    pub async fn request_approval(&self, server_url: &str) -> Result<String, PlatformError> {
        let config = self.store.get();
        let client = self.client_for(server_url)?;
        let response = client
            .request_approval(&api::ApprovalRequest {
                device_name: config.node_name.clone(),
                mac: config.mac.clone(),
                model: config.node_model.clone(),
                ip: crate::config::local_ip(),
            })
            .await?;
        if !response.success {
            return Err(PlatformError::Rejected {
                status: 200,
                body: response.message.unwrap_or_default(),
            });
        }

        self.store.set_pending(server_url, &response.request_id)?;
        info!(request = %response.request_id, "Approval requested, awaiting operator");
        Ok(response.request_id)
    }

    /// Drops coordinator credentials and returns to `unconfigured`.
    pub fn disconnect(&self) -> Result<(), PlatformError> {
        self.store.disconnect()?;
        info!("Disconnected from coordinator");
        Ok(())
    }

    /// Pushes the local camera catalog to the coordinator, preserving the
    /// node-generated device ids.
    pub async fn sync_cameras(&self) -> Result<(), PlatformError> {
        let config = self.store.get();
        if !config.state.is_provisioned() {
            return Err(PlatformError::NotProvisioned);
        }
        let upload: Vec<CameraUpload> = config
            .cameras
            .iter()
            .map(|c| CameraUpload {
                device_id: c.device_id.clone(),
                name: c.name.clone(),
                rtsp_url: c.rtsp_url.clone(),
            })
            .collect();
        let client = self.current_client()?;
        let response = client
            .sync_cameras(&config.platform.worker_id, &config.platform.auth_token, &upload)
            .await?;
        info!(
            created = response.created,
            updated = response.updated,
            "Camera catalog synced"
        );
        Ok(())
    }

    /// Deletes a camera on the coordinator side.
    pub async fn delete_camera(&self, device_id: &str) -> Result<(), PlatformError> {
        let config = self.store.get();
        if !config.state.is_provisioned() {
            return Err(PlatformError::NotProvisioned);
        }
        let client = self.current_client()?;
        client
            .delete_camera(&config.platform.worker_id, &config.platform.auth_token, device_id)
            .await
    }

    /// Provisions the WireGuard tunnel, if not already latched.
    pub async fn setup_wireguard(&self) -> Result<(), PlatformError> {
        let client = self.current_client()?;
        wireguard::setup(&client, &self.store).await?;
        Ok(())
    }

    /// Spawns the heartbeat and config-sync loops. Both run until
    /// `shutdown` flips; the returned handles let the caller wait for
    /// them during ordered teardown.
    pub fn run(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let agent = Arc::clone(self);
        let mut hb_shutdown = shutdown.clone();
        let heartbeat = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = hb_shutdown.changed() => break,
                    _ = ticker.tick() => agent.heartbeat_tick().await,
                }
            }
            debug!("Heartbeat loop stopped");
        });

        let agent = Arc::clone(self);
        let mut sync_shutdown = shutdown;
        let sync = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SYNC_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = sync_shutdown.changed() => break,
                    _ = ticker.tick() => agent.sync_tick().await,
                }
            }
            debug!("Config sync loop stopped");
        });

        vec![heartbeat, sync]
    }

    /// One heartbeat cycle. While pending, polls approval status instead
    /// of posting a heartbeat.
    pub async fn heartbeat_tick(&self) {
        let config = self.store.get();
        match config.state {
            NodeState::Approved | NodeState::Active => {
                if let Err(e) = self.send_heartbeat(&config).await {
                    // 4xx does not change state; everything retries next tick.
                    warn!(error = %e, "Heartbeat failed");
                }
            }
            NodeState::Pending => {
                if let Err(e) = self.poll_approval(&config).await {
                    warn!(error = %e, "Approval poll failed");
                }
            }
            NodeState::Unconfigured | NodeState::Error => {}
        }
    }

    async fn send_heartbeat(&self, config: &crate::config::NodeConfig) -> Result<(), PlatformError> {
        let client = self.client_for(&config.platform.server_url)?;

        let cameras = self
            .pipeline
            .decoder_stats()
            .await
            .into_iter()
            .map(|s| CameraHealth {
                device_id: s.camera_id,
                connected: s.is_connected,
                fps: s.current_fps,
            })
            .collect();

        let body = HeartbeatRequest {
            state: serde_json::to_value(config.state)?
                .as_str()
                .unwrap_or("unconfigured")
                .to_string(),
            resources: self.sampler.snapshot().await,
            cameras,
            queue: self.queue.counters(),
            config_version: config.config_version,
        };

        client
            .heartbeat(&config.platform.worker_id, &config.platform.auth_token, &body)
            .await?;
        debug!("Heartbeat delivered");

        // First accepted heartbeat marks the node active.
        if config.state == NodeState::Approved {
            self.store.set_state(NodeState::Active)?;
        }
        Ok(())
    }

    async fn poll_approval(&self, config: &crate::config::NodeConfig) -> Result<(), PlatformError> {
        let request_id = config
            .platform
            .request_id
            .clone()
            .ok_or_else(|| PlatformError::InvalidState("pending without request id".to_string()))?;
        let client = self.client_for(&config.platform.server_url)?;
        let status = client.approval_status(&request_id).await?;

        match status.status.as_str() {
            "approved" => {
                let worker_id = status.worker_id.unwrap_or_default();
                let auth_token = status.auth_token.unwrap_or_default();
                if worker_id.is_empty() || auth_token.is_empty() {
                    return Err(PlatformError::InvalidState(
                        "approval response missing credentials".to_string(),
                    ));
                }
                self.store
                    .set_approved(&config.platform.server_url, &worker_id, &auth_token)?;
                info!(worker = %worker_id, "Node approved by operator");
            }
            "rejected" => {
                self.store.set_state(NodeState::Error)?;
                error!(
                    message = %status.message.unwrap_or_default(),
                    "Approval request rejected"
                );
            }
            _ => debug!("Approval still pending"),
        }
        Ok(())
    }

    /// One configuration sync cycle: fetch the assignment and apply it
    /// when the coordinator's revision is strictly newer.
    pub async fn sync_tick(&self) {
        let config = self.store.get();
        if !config.state.is_provisioned() {
            return;
        }
        let result = async {
            let client = self.client_for(&config.platform.server_url)?;
            let assignment = client
                .worker_config(&config.platform.worker_id, &config.platform.auth_token)
                .await?;

            if assignment.config_version > config.config_version {
                info!(
                    from = config.config_version,
                    to = assignment.config_version,
                    cameras = assignment.cameras.len(),
                    "Applying new camera assignment"
                );
                self.store
                    .replace_cameras(assignment.cameras, assignment.config_version)?;
                self.broker
                    .publish("config.cameras", Bytes::from_static(b"updated"))
                    .ok();
            } else {
                self.store.touch_last_sync()?;
            }
            Ok::<(), PlatformError>(())
        }
        .await;

        if let Err(e) = result {
            warn!(error = %e, "Config sync failed");
        }
    }
}

/// Event delivery for the queue: POST to the ingest endpoint, multipart
/// when evidence images are present.
#[async_trait]
impl EventSender for PlatformAgent {
    async fn send(&self, event: &Event, event_dir: &Path) -> anyhow::Result<()> {
        let config = self.store.get();
        if !config.state.is_provisioned() {
            anyhow::bail!("node is not provisioned with the coordinator");
        }

        let mut images = Vec::with_capacity(event.images.len());
        for name in &event.images {
            let path = event_dir.join(name);
            match std::fs::read(&path) {
                Ok(bytes) => images.push((name.clone(), bytes)),
                Err(e) => warn!(image = %path.display(), error = %e, "Event image unreadable, sending without it"),
            }
        }

        let client = self.client_for(&config.platform.server_url)?;
        client
            .ingest_event(
                &config.platform.worker_id,
                &config.platform.auth_token,
                event,
                images,
            )
            .await?;
        Ok(())
    }
}
