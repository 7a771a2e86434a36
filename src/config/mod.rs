//! Node configuration document and its serialised on-disk store
//!
//! The whole node is driven by one JSON document ([`NodeConfig`]) owned
//! exclusively by [`ConfigStore`]. Components read cloned snapshots and
//! mutate through targeted setters; every mutation persists atomically
//! (temp file + rename) under an exclusive lock.

mod detect;

pub use detect::{device_model, hostname, local_ip, primary_mac};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to access config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("camera not found: {0}")]
    CameraNotFound(String),

    #[error("a camera with RTSP URL {0} already exists")]
    DuplicateRtspUrl(String),

    #[error("mac address is immutable once written")]
    MacImmutable,
}

/// Node lifecycle state against the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    #[default]
    Unconfigured,
    Pending,
    Approved,
    Active,
    Error,
}

impl NodeState {
    /// True once the node holds valid coordinator credentials.
    pub fn is_provisioned(self) -> bool {
        matches!(self, NodeState::Approved | NodeState::Active)
    }
}

/// One camera assignment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CameraSpec {
    /// Stable identifier, generated on the node as `cam_<16 hex>` on first
    /// create and preserved across coordinator syncs.
    pub device_id: String,

    pub name: String,

    pub rtsp_url: String,

    /// Analytics tags this camera feeds (e.g. "anpr", "vcc", "crowd").
    #[serde(default)]
    pub analytics: Vec<String>,

    /// Target frame rate.
    #[serde(default = "default_fps")]
    pub fps: u32,

    /// Resolution tag, e.g. "720p" / "1080p".
    #[serde(default = "default_resolution")]
    pub resolution: String,

    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_fps() -> u32 {
    15
}
fn default_resolution() -> String {
    "720p".to_string()
}
fn default_enabled() -> bool {
    true
}

/// Generates a fresh camera identifier.
pub fn generate_device_id() -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("cam_{}", &hex[..16])
}

/// Maps a resolution tag to pixel dimensions. Unknown tags mean "leave the
/// stream at its native size".
pub fn resolution_dimensions(tag: &str) -> Option<(u32, u32)> {
    match tag {
        "480p" => Some((854, 480)),
        "720p" => Some((1280, 720)),
        "1080p" => Some((1920, 1080)),
        "1440p" => Some((2560, 1440)),
        "4k" | "2160p" => Some((3840, 2160)),
        _ => None,
    }
}

/// Binding to the central coordinator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformBinding {
    #[serde(default)]
    pub server_url: String,

    /// Bearer token issued on approval.
    #[serde(default)]
    pub auth_token: String,

    /// Worker identifier assigned by the coordinator.
    #[serde(default)]
    pub worker_id: String,

    /// Pending tokenless-approval request, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

/// WireGuard tunnel binding.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireGuardBinding {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub private_key: String,

    #[serde(default)]
    pub public_key: String,

    /// Tunnel address assigned by the coordinator, e.g. "10.8.0.7/32".
    #[serde(default)]
    pub address: String,

    #[serde(default)]
    pub server_public_key: String,

    #[serde(default)]
    pub server_endpoint: String,

    /// Latched once the tunnel has been written and brought up.
    #[serde(default)]
    pub configured: bool,
}

impl WireGuardBinding {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.configured
            && (self.private_key.is_empty()
                || self.public_key.is_empty()
                || self.address.is_empty()
                || self.server_public_key.is_empty()
                || self.server_endpoint.is_empty())
        {
            return Err(ConfigError::Invalid(
                "wireguard marked configured with missing fields".to_string(),
            ));
        }
        Ok(())
    }
}

/// The persisted node configuration document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub node_name: String,

    pub node_model: String,

    /// Primary NIC MAC address. Immutable after first write.
    pub mac: String,

    #[serde(default)]
    pub state: NodeState,

    #[serde(default)]
    pub platform: PlatformBinding,

    #[serde(default)]
    pub wireguard: WireGuardBinding,

    #[serde(default)]
    pub cameras: Vec<CameraSpec>,

    /// Monotonic camera-assignment revision, stamped by the coordinator.
    #[serde(default)]
    pub config_version: u64,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync: Option<DateTime<Utc>>,
}

impl NodeConfig {
    /// Fresh document with host identity auto-detected.
    fn bootstrap() -> Self {
        let now = Utc::now();
        Self {
            node_name: detect::hostname(),
            node_model: detect::device_model(),
            mac: detect::primary_mac().unwrap_or_default(),
            state: NodeState::Unconfigured,
            platform: PlatformBinding::default(),
            wireguard: WireGuardBinding::default(),
            cameras: Vec::new(),
            config_version: 0,
            created_at: now,
            updated_at: now,
            last_sync: None,
        }
    }

    /// Placeholder worker id derived from the MAC. Used in pre-approval
    /// requests only; never persisted as the real worker id.
    pub fn placeholder_worker_id(&self) -> String {
        format!("mb_{}", self.mac.replace(':', ""))
    }

    pub fn camera(&self, device_id: &str) -> Option<&CameraSpec> {
        self.cameras.iter().find(|c| c.device_id == device_id)
    }

    /// Device ids of all enabled cameras.
    pub fn enabled_camera_ids(&self) -> Vec<String> {
        self.cameras
            .iter()
            .filter(|c| c.enabled)
            .map(|c| c.device_id.clone())
            .collect()
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.state.is_provisioned()
            && (self.platform.worker_id.is_empty() || self.platform.auth_token.is_empty())
        {
            return Err(ConfigError::Invalid(
                "approved/active state requires worker_id and auth_token".to_string(),
            ));
        }
        self.wireguard.validate()?;

        let mut seen = std::collections::HashSet::new();
        for cam in &self.cameras {
            if !seen.insert(cam.device_id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate camera device_id {}",
                    cam.device_id
                )));
            }
            if cam.fps == 0 {
                return Err(ConfigError::Invalid(format!(
                    "{}: fps must be positive",
                    cam.device_id
                )));
            }
        }
        Ok(())
    }
}

/// Serialised accessor for the node configuration document.
///
/// Holds an exclusive lock around every mutation; each mutation bumps
/// `updated_at` and is persisted atomically before the lock is released.
pub struct ConfigStore {
    path: PathBuf,
    inner: Mutex<NodeConfig>,
}

impl ConfigStore {
    /// Opens the document at `path`, creating it with auto-detected host
    /// identity when absent.
    pub fn load_or_create<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref().to_path_buf();

        let config = match fs::read(&path) {
            Ok(bytes) => {
                let config: NodeConfig = serde_json::from_slice(&bytes)?;
                config.validate()?;
                config
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let config = NodeConfig::bootstrap();
                persist(&path, &config)?;
                config
            }
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            path,
            inner: Mutex::new(config),
        })
    }

    /// Returns a point-in-time snapshot of the document.
    pub fn get(&self) -> NodeConfig {
        self.inner.lock().clone()
    }

    /// Applies a mutation under the exclusive lock, validates the result,
    /// bumps `updated_at`, and persists atomically. The document in memory
    /// is untouched if validation or persistence fails.
    fn mutate<T>(
        &self,
        f: impl FnOnce(&mut NodeConfig) -> Result<T, ConfigError>,
    ) -> Result<T, ConfigError> {
        let mut guard = self.inner.lock();
        let mut next = guard.clone();
        let out = f(&mut next)?;

        if next.mac != guard.mac && !guard.mac.is_empty() {
            return Err(ConfigError::MacImmutable);
        }

        // updated_at never moves backwards, even across clock steps.
        let now = Utc::now();
        next.updated_at = if now > next.updated_at {
            now
        } else {
            next.updated_at
        };

        next.validate()?;
        persist(&self.path, &next)?;
        *guard = next;
        Ok(out)
    }

    pub fn set_state(&self, state: NodeState) -> Result<(), ConfigError> {
        self.mutate(|c| {
            c.state = state;
            Ok(())
        })
    }

    /// Records a successful registration: credentials plus `approved` state.
    pub fn set_approved(
        &self,
        server_url: &str,
        worker_id: &str,
        auth_token: &str,
    ) -> Result<(), ConfigError> {
        self.mutate(|c| {
            c.platform.server_url = server_url.trim_end_matches('/').to_string();
            c.platform.worker_id = worker_id.to_string();
            c.platform.auth_token = auth_token.to_string();
            c.platform.request_id = None;
            c.state = NodeState::Approved;
            Ok(())
        })
    }

    /// Records a pending tokenless-approval request.
    pub fn set_pending(&self, server_url: &str, request_id: &str) -> Result<(), ConfigError> {
        self.mutate(|c| {
            c.platform.server_url = server_url.trim_end_matches('/').to_string();
            c.platform.request_id = Some(request_id.to_string());
            c.state = NodeState::Pending;
            Ok(())
        })
    }

    /// Drops coordinator credentials and returns to `unconfigured`.
    pub fn disconnect(&self) -> Result<(), ConfigError> {
        self.mutate(|c| {
            c.platform = PlatformBinding {
                server_url: c.platform.server_url.clone(),
                ..PlatformBinding::default()
            };
            c.state = NodeState::Unconfigured;
            Ok(())
        })
    }

    /// Replaces the camera list with a coordinator assignment.
    ///
    /// Cameras arriving without a `device_id` are matched to existing ones
    /// by RTSP URL so locally generated ids survive the sync; genuinely new
    /// cameras get a fresh id.
    pub fn replace_cameras(
        &self,
        mut cameras: Vec<CameraSpec>,
        config_version: u64,
    ) -> Result<(), ConfigError> {
        self.mutate(|c| {
            for cam in cameras.iter_mut() {
                if cam.device_id.is_empty() {
                    cam.device_id = c
                        .cameras
                        .iter()
                        .find(|existing| existing.rtsp_url == cam.rtsp_url)
                        .map(|existing| existing.device_id.clone())
                        .unwrap_or_else(generate_device_id);
                }
            }
            c.cameras = cameras;
            c.config_version = config_version;
            c.last_sync = Some(Utc::now());
            Ok(())
        })
    }

    /// Advances `last_sync` without touching the assignment (the coordinator
    /// reported no newer revision).
    pub fn touch_last_sync(&self) -> Result<(), ConfigError> {
        self.mutate(|c| {
            c.last_sync = Some(Utc::now());
            Ok(())
        })
    }

    /// Adds a locally created camera. RTSP URLs must be unique on create.
    pub fn add_camera(
        &self,
        name: &str,
        rtsp_url: &str,
        analytics: Vec<String>,
        fps: u32,
        resolution: &str,
        enabled: bool,
    ) -> Result<CameraSpec, ConfigError> {
        self.mutate(|c| {
            if c.cameras.iter().any(|cam| cam.rtsp_url == rtsp_url) {
                return Err(ConfigError::DuplicateRtspUrl(rtsp_url.to_string()));
            }
            let cam = CameraSpec {
                device_id: generate_device_id(),
                name: name.to_string(),
                rtsp_url: rtsp_url.to_string(),
                analytics,
                fps: if fps == 0 { default_fps() } else { fps },
                resolution: resolution.to_string(),
                enabled,
            };
            c.cameras.push(cam.clone());
            Ok(cam)
        })
    }

    /// Applies an in-place edit to one camera.
    pub fn update_camera(
        &self,
        device_id: &str,
        f: impl FnOnce(&mut CameraSpec),
    ) -> Result<CameraSpec, ConfigError> {
        self.mutate(|c| {
            let cam = c
                .cameras
                .iter_mut()
                .find(|cam| cam.device_id == device_id)
                .ok_or_else(|| ConfigError::CameraNotFound(device_id.to_string()))?;
            f(cam);
            Ok(cam.clone())
        })
    }

    pub fn remove_camera(&self, device_id: &str) -> Result<(), ConfigError> {
        self.mutate(|c| {
            let before = c.cameras.len();
            c.cameras.retain(|cam| cam.device_id != device_id);
            if c.cameras.len() == before {
                return Err(ConfigError::CameraNotFound(device_id.to_string()));
            }
            Ok(())
        })
    }

    pub fn set_wireguard(&self, wireguard: WireGuardBinding) -> Result<(), ConfigError> {
        self.mutate(|c| {
            c.wireguard = wireguard;
            Ok(())
        })
    }
}

/// Atomic replace: write to a sibling temp file, then rename over the
/// destination so a crash mid-write never corrupts the document.
fn persist(path: &Path, config: &NodeConfig) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let tmp = path.with_extension("json.tmp");
    let bytes = serde_json::to_vec_pretty(config)?;
    fs::write(&tmp, &bytes)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn store() -> (tempfile::TempDir, ConfigStore) {
        let dir = tempdir().unwrap();
        let store = ConfigStore::load_or_create(dir.path().join("node.json")).unwrap();
        (dir, store)
    }

    #[test]
    fn test_bootstrap_and_reload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("node.json");

        let store = ConfigStore::load_or_create(&path).unwrap();
        let first = store.get();
        assert_eq!(first.state, NodeState::Unconfigured);
        assert!(!first.node_name.is_empty());
        drop(store);

        let store = ConfigStore::load_or_create(&path).unwrap();
        let second = store.get();
        assert_eq!(first.node_name, second.node_name);
        assert_eq!(first.created_at, second.created_at);
    }

    #[test]
    fn test_serialise_roundtrip_stable() {
        let (_dir, store) = store();
        let config = store.get();
        let a = serde_json::to_string(&config).unwrap();
        let parsed: NodeConfig = serde_json::from_str(&a).unwrap();
        let b = serde_json::to_string(&parsed).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_every_mutation_bumps_updated_at() {
        let (_dir, store) = store();
        let before = store.get().updated_at;
        store
            .add_camera("gate", "rtsp://cam/1", vec![], 15, "720p", true)
            .unwrap();
        assert!(store.get().updated_at >= before);

        let mid = store.get().updated_at;
        store.set_state(NodeState::Error).unwrap();
        assert!(store.get().updated_at >= mid);
    }

    #[test]
    fn test_provisioned_state_requires_credentials() {
        let (_dir, store) = store();
        assert!(store.set_state(NodeState::Approved).is_err());

        store
            .set_approved("http://srv:3001", "w1", "tok")
            .unwrap();
        let config = store.get();
        assert_eq!(config.state, NodeState::Approved);
        assert_eq!(config.platform.worker_id, "w1");
        assert_eq!(config.platform.auth_token, "tok");
    }

    #[test]
    fn test_duplicate_rtsp_url_rejected() {
        let (_dir, store) = store();
        store
            .add_camera("a", "rtsp://cam/1", vec![], 15, "720p", true)
            .unwrap();
        let err = store
            .add_camera("b", "rtsp://cam/1", vec![], 15, "720p", true)
            .unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateRtspUrl(_)));
    }

    #[test]
    fn test_replace_cameras_preserves_device_ids() {
        let (_dir, store) = store();
        let cam = store
            .add_camera("gate", "rtsp://cam/1", vec![], 15, "720p", true)
            .unwrap();

        // Coordinator echoes the camera back without a device_id.
        store
            .replace_cameras(
                vec![CameraSpec {
                    device_id: String::new(),
                    name: "gate renamed".to_string(),
                    rtsp_url: "rtsp://cam/1".to_string(),
                    analytics: vec!["anpr".to_string()],
                    fps: 10,
                    resolution: "1080p".to_string(),
                    enabled: true,
                }],
                7,
            )
            .unwrap();

        let config = store.get();
        assert_eq!(config.config_version, 7);
        assert_eq!(config.cameras.len(), 1);
        assert_eq!(config.cameras[0].device_id, cam.device_id);
        assert!(config.last_sync.is_some());
    }

    #[test]
    fn test_mac_is_immutable() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("node.json");
        let store = ConfigStore::load_or_create(&path).unwrap();

        // Bypass the public setters to simulate a buggy caller.
        let result = store.mutate(|c| {
            c.mac = "de:ad:be:ef:00:01".to_string();
            Ok(())
        });
        if store.get().mac.is_empty() {
            // No NIC detected in this environment; first write is allowed.
            assert!(result.is_ok());
        } else {
            assert!(matches!(result, Err(ConfigError::MacImmutable)));
        }
    }

    #[test]
    fn test_resolution_tags() {
        assert_eq!(resolution_dimensions("720p"), Some((1280, 720)));
        assert_eq!(resolution_dimensions("1080p"), Some((1920, 1080)));
        assert_eq!(resolution_dimensions("native"), None);
    }

    #[test]
    fn test_generated_device_id_shape() {
        let id = generate_device_id();
        assert!(id.starts_with("cam_"));
        assert_eq!(id.len(), 4 + 16);
    }
}
