//! Camera-set reconciliation and frame publishing
//!
//! Keeps exactly one running [`Decoder`] per enabled camera in the node
//! configuration. Reconciliation runs on start and again on every
//! `config.cameras` notification from the local broker; the whole running
//! map sits behind one async mutex so overlapping triggers serialise.
//! Each frame is serialised into the compact envelope `{c,s,t,w,h,f}` and
//! published on `frames.<device_id>`.

use crate::broker::Broker;
use crate::config::{resolution_dimensions, CameraSpec, ConfigStore};
use crate::decoder::{Decoder, DecoderConfig, DecoderStats, Frame, FrameHandler};
use crate::hardware::Capabilities;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Default JPEG quality for published frames.
const FRAME_QUALITY: u32 = 80;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("broker error: {0}")]
    Broker(#[from] crate::broker::BrokerError),

    #[error("decoder error: {0}")]
    Decoder(#[from] crate::decoder::DecoderError),

    #[error("unknown camera: {0}")]
    UnknownCamera(String),
}

/// Reconciling owner of the per-camera decoders.
pub struct StreamPipeline {
    broker: Broker,
    store: Arc<ConfigStore>,
    caps: Arc<Capabilities>,
    running: Arc<Mutex<HashMap<String, Decoder>>>,
    shutdown_tx: Mutex<Option<watch::Sender<bool>>>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl StreamPipeline {
    pub fn new(broker: Broker, store: Arc<ConfigStore>, caps: Arc<Capabilities>) -> Arc<Self> {
        Arc::new(Self {
            broker,
            store,
            caps,
            running: Arc::new(Mutex::new(HashMap::new())),
            shutdown_tx: Mutex::new(None),
            watcher: Mutex::new(None),
        })
    }

    /// Reconciles against the current configuration and begins watching
    /// `config.cameras` for changes.
    pub async fn start(self: &Arc<Self>) -> Result<(), PipelineError> {
        self.reconcile().await;

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        *self.shutdown_tx.lock().await = Some(shutdown_tx);

        let mut sub = self.broker.subscribe("config.cameras")?;
        let pipeline = Arc::clone(self);
        let watcher = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    msg = sub.next() => {
                        if msg.is_none() {
                            break;
                        }
                        debug!("Camera configuration changed, reconciling");
                        pipeline.reconcile().await;
                    }
                }
            }
        });
        *self.watcher.lock().await = Some(watcher);

        Ok(())
    }

    /// Stops the watcher and every running decoder. Idempotent.
    pub async fn stop(&self) {
        if let Some(tx) = self.shutdown_tx.lock().await.take() {
            let _ = tx.send(true);
        }
        if let Some(watcher) = self.watcher.lock().await.take() {
            let _ = watcher.await;
        }

        let mut running = self.running.lock().await;
        for (_, mut decoder) in running.drain() {
            decoder.stop().await;
        }
        info!("Stream pipeline stopped");
    }

    /// Brings the running set in line with the enabled cameras.
    pub async fn reconcile(&self) {
        let config = self.store.get();
        let desired: HashMap<String, CameraSpec> = config
            .cameras
            .iter()
            .filter(|c| c.enabled)
            .map(|c| (c.device_id.clone(), c.clone()))
            .collect();

        let mut running = self.running.lock().await;

        // Stop decoders whose cameras were removed or disabled.
        let stale: Vec<String> = running
            .keys()
            .filter(|id| !desired.contains_key(*id))
            .cloned()
            .collect();
        for id in stale {
            if let Some(mut decoder) = running.remove(&id) {
                info!(camera = %id, "Camera removed from assignment");
                decoder.stop().await;
            }
        }

        // Start decoders for newly enabled cameras.
        for (id, cam) in &desired {
            if running.contains_key(id) {
                continue;
            }
            match self.spawn_decoder(cam) {
                Ok(decoder) => {
                    running.insert(id.clone(), decoder);
                }
                Err(e) => {
                    error!(camera = %id, error = %e, "Failed to start decoder");
                }
            }
        }

        debug!(cameras = running.len(), "Reconcile complete");
    }

    /// Force-restarts one camera's decoder without a config change.
    pub async fn refresh_camera(&self, device_id: &str) -> Result<(), PipelineError> {
        let cam = self
            .store
            .get()
            .camera(device_id)
            .cloned()
            .ok_or_else(|| PipelineError::UnknownCamera(device_id.to_string()))?;

        let mut running = self.running.lock().await;
        if let Some(mut decoder) = running.remove(device_id) {
            decoder.stop().await;
        }
        if cam.enabled {
            let decoder = self.spawn_decoder(&cam)?;
            running.insert(device_id.to_string(), decoder);
        }
        Ok(())
    }

    /// Device ids with a running decoder, for tests and status surfaces.
    pub async fn running_cameras(&self) -> Vec<String> {
        let running = self.running.lock().await;
        let mut ids: Vec<String> = running.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Per-camera decoder snapshots for the heartbeat.
    pub async fn decoder_stats(&self) -> Vec<DecoderStats> {
        let running = self.running.lock().await;
        running.values().map(|d| d.stats()).collect()
    }

    fn spawn_decoder(&self, cam: &CameraSpec) -> Result<Decoder, PipelineError> {
        let config = DecoderConfig {
            camera_id: cam.device_id.clone(),
            rtsp_url: cam.rtsp_url.clone(),
            fps: cam.fps,
            resolution: resolution_dimensions(&cam.resolution),
            quality: FRAME_QUALITY,
        };
        let mut decoder = Decoder::new(config, Arc::clone(&self.caps));
        decoder.start(frame_publisher(self.broker.clone(), cam.device_id.clone()))?;
        Ok(decoder)
    }
}

/// Builds the publish handler for one camera: envelope serialisation plus
/// a once-per-second throughput log.
fn frame_publisher(broker: Broker, device_id: String) -> FrameHandler {
    let subject = format!("frames.{}", device_id);
    let window_start_ms = AtomicI64::new(0);
    let window_frames = AtomicU64::new(0);

    Arc::new(move |frame: Frame| {
        let envelope = json!({
            "c": frame.camera_id,
            "s": frame.sequence,
            "t": frame.timestamp_ms,
            "w": frame.width,
            "h": frame.height,
            "f": BASE64.encode(&frame.jpeg),
        });
        let payload = match serde_json::to_vec(&envelope) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(camera = %device_id, error = %e, "Frame envelope serialisation failed");
                return;
            }
        };
        if let Err(e) = broker.publish(&subject, Bytes::from(payload)) {
            warn!(camera = %device_id, error = %e, "Frame publish failed");
        }

        let count = window_frames.fetch_add(1, Ordering::Relaxed) + 1;
        let start = window_start_ms.load(Ordering::Relaxed);
        if start == 0 {
            window_start_ms.store(frame.timestamp_ms, Ordering::Relaxed);
        } else if frame.timestamp_ms - start >= 1000 {
            let fps = count as f64 * 1000.0 / (frame.timestamp_ms - start) as f64;
            debug!(camera = %device_id, fps = format!("{:.1}", fps), "Publishing frames");
            window_start_ms.store(frame.timestamp_ms, Ordering::Relaxed);
            window_frames.store(0, Ordering::Relaxed);
        }
    })
}
