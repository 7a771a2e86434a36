//! HTTP client for the central coordinator
//!
//! Thin typed wrapper over the coordinator's worker API. Every call after
//! provisioning carries the bearer token; camera and WireGuard endpoints
//! additionally expect `X-Auth-Token`, and event ingest identifies the
//! node with `X-Worker-ID`. Timeouts are fixed at 30 s; retry policy
//! belongs to the calling loops.

use super::PlatformError;
use crate::config::CameraSpec;
use crate::queue::Event;
use reqwest::multipart;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Serialize)]
pub struct RegisterRequest {
    pub token: String,
    pub device_name: String,
    pub mac: String,
    pub model: String,
    pub ip: String,
    pub version: String,
}

#[derive(Debug, Deserialize)]
pub struct RegisterResponse {
    pub status: String,
    #[serde(default)]
    pub worker_id: String,
    #[serde(default)]
    pub auth_token: String,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ApprovalRequest {
    pub device_name: String,
    pub mac: String,
    pub model: String,
    pub ip: String,
}

#[derive(Debug, Deserialize)]
pub struct ApprovalResponse {
    pub success: bool,
    #[serde(rename = "requestId", default)]
    pub request_id: String,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ApprovalStatus {
    pub status: String,
    #[serde(rename = "workerId", default)]
    pub worker_id: Option<String>,
    #[serde(rename = "authToken", default)]
    pub auth_token: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct WorkerAssignment {
    #[serde(rename = "configVersion")]
    pub config_version: u64,
    #[serde(default)]
    pub cameras: Vec<CameraSpec>,
}

#[derive(Debug, Serialize)]
pub struct CameraUpload {
    pub device_id: String,
    pub name: String,
    pub rtsp_url: String,
}

#[derive(Debug, Deserialize)]
pub struct CameraSyncResponse {
    pub success: bool,
    #[serde(default)]
    pub created: u64,
    #[serde(default)]
    pub updated: u64,
    #[serde(default)]
    pub device_ids: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct WireGuardSetupRequest {
    pub worker_id: String,
    pub public_key: String,
}

#[derive(Debug, Deserialize)]
pub struct WireGuardAssignment {
    pub assigned_ip: String,
    pub server_pubkey: String,
    pub server_endpoint: String,
    #[serde(default)]
    pub server_ip: String,
}

#[derive(Debug, Deserialize)]
pub struct WireGuardSetupResponse {
    pub status: String,
    pub wireguard: WireGuardAssignment,
}

/// Heartbeat body posted every 30 s while provisioned.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatRequest {
    pub state: String,
    pub resources: super::resources::ResourceSnapshot,
    pub cameras: Vec<CameraHealth>,
    pub queue: crate::queue::QueueCounters,
    pub config_version: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CameraHealth {
    pub device_id: String,
    pub connected: bool,
    pub fps: f64,
}

pub struct CoordinatorClient {
    http: reqwest::Client,
    base_url: String,
}

impl CoordinatorClient {
    pub fn new(server_url: &str) -> Result<Self, PlatformError> {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .user_agent(concat!("magicbox/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(PlatformError::Http)?;
        Ok(Self {
            http,
            base_url: server_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Token-based registration; immediate approval on success.
    pub async fn register(&self, req: &RegisterRequest) -> Result<RegisterResponse, PlatformError> {
        let response = self
            .http
            .post(self.url("/api/workers/register"))
            .json(req)
            .send()
            .await?;
        decode(response).await
    }

    /// Tokenless approval request; the operator approves it later.
    pub async fn request_approval(
        &self,
        req: &ApprovalRequest,
    ) -> Result<ApprovalResponse, PlatformError> {
        let response = self
            .http
            .post(self.url("/api/workers/request-approval"))
            .json(req)
            .send()
            .await?;
        decode(response).await
    }

    pub async fn approval_status(&self, request_id: &str) -> Result<ApprovalStatus, PlatformError> {
        let response = self
            .http
            .get(self.url(&format!("/api/workers/approval-status/{}", request_id)))
            .send()
            .await?;
        decode(response).await
    }

    pub async fn worker_config(
        &self,
        worker_id: &str,
        token: &str,
    ) -> Result<WorkerAssignment, PlatformError> {
        let response = self
            .http
            .get(self.url(&format!("/api/workers/{}/config", worker_id)))
            .bearer_auth(token)
            .send()
            .await?;
        decode(response).await
    }

    pub async fn heartbeat(
        &self,
        worker_id: &str,
        token: &str,
        body: &HeartbeatRequest,
    ) -> Result<(), PlatformError> {
        let response = self
            .http
            .post(self.url(&format!("/api/workers/{}/heartbeat", worker_id)))
            .bearer_auth(token)
            .json(body)
            .send()
            .await?;
        expect_ok(response).await
    }

    /// Delivers one event. Multipart when evidence images ride along,
    /// plain JSON otherwise.
    pub async fn ingest_event(
        &self,
        worker_id: &str,
        token: &str,
        event: &Event,
        images: Vec<(String, Vec<u8>)>,
    ) -> Result<(), PlatformError> {
        let url = self.url("/api/events/ingest");
        let request = self
            .http
            .post(url)
            .bearer_auth(token)
            .header("X-Worker-ID", worker_id);

        let response = if images.is_empty() {
            request.json(event).send().await?
        } else {
            let mut form = multipart::Form::new()
                .text("event", serde_json::to_string(event).map_err(PlatformError::Json)?);
            for (name, bytes) in images {
                let part = multipart::Part::bytes(bytes)
                    .file_name(name.clone())
                    .mime_str("image/jpeg")
                    .map_err(PlatformError::Http)?;
                form = form.part(name, part);
            }
            request.multipart(form).send().await?
        };
        expect_ok(response).await
    }

    /// Pushes the local camera catalog. The coordinator preserves the
    /// node-supplied device ids.
    pub async fn sync_cameras(
        &self,
        worker_id: &str,
        token: &str,
        cameras: &[CameraUpload],
    ) -> Result<CameraSyncResponse, PlatformError> {
        let response = self
            .http
            .post(self.url(&format!("/api/workers/{}/cameras", worker_id)))
            .header("X-Auth-Token", token)
            .json(cameras)
            .send()
            .await?;
        decode(response).await
    }

    pub async fn delete_camera(
        &self,
        worker_id: &str,
        token: &str,
        device_id: &str,
    ) -> Result<(), PlatformError> {
        let response = self
            .http
            .delete(self.url(&format!("/api/workers/{}/cameras/{}", worker_id, device_id)))
            .header("X-Auth-Token", token)
            .send()
            .await?;
        expect_ok(response).await
    }

    pub async fn wireguard_setup(
        &self,
        worker_id: &str,
        token: &str,
        public_key: &str,
    ) -> Result<WireGuardSetupResponse, PlatformError> {
        let response = self
            .http
            .post(self.url(&format!("/api/workers/{}/wireguard/setup", worker_id)))
            .header("X-Auth-Token", token)
            .json(&WireGuardSetupRequest {
                worker_id: worker_id.to_string(),
                public_key: public_key.to_string(),
            })
            .send()
            .await?;
        decode(response).await
    }
}

/// Maps a non-2xx status to [`PlatformError::Rejected`] with the response
/// body preserved for the caller.
async fn expect_ok(response: reqwest::Response) -> Result<(), PlatformError> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    let body = response.text().await.unwrap_or_default();
    debug!(status = %status, body = %body, "Coordinator rejected request");
    Err(PlatformError::Rejected {
        status: status.as_u16(),
        body,
    })
}

async fn decode<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, PlatformError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        debug!(status = %status, body = %body, "Coordinator rejected request");
        return Err(PlatformError::Rejected {
            status: status.as_u16(),
            body,
        });
    }
    Ok(response.json::<T>().await?)
}
