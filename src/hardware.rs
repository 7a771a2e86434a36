//! Decoder backend and accelerator detection
//!
//! Runs once at process start. Finds the ffmpeg / gstreamer executables,
//! classifies the hardware accelerator from filesystem sentinels and tool
//! queries, and records which hardware decoder tokens each backend
//! advertises. The resulting [`Capabilities`] drives decoder command
//! construction for every camera.

use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Decode backend preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Ffmpeg,
    Gstreamer,
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Backend::Ffmpeg => write!(f, "ffmpeg"),
            Backend::Gstreamer => write!(f, "gstreamer"),
        }
    }
}

/// Hardware accelerator category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HardwareType {
    /// Jetson-class SoC with V4L2 M2M decode units.
    NvidiaEmbedded,
    /// Discrete NVIDIA GPU with NVDEC.
    NvidiaDiscrete,
    /// Intel/AMD via VAAPI.
    Vaapi,
    /// Apple VideoToolbox.
    Apple,
    None,
}

impl std::fmt::Display for HardwareType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            HardwareType::NvidiaEmbedded => "nvidia_embedded",
            HardwareType::NvidiaDiscrete => "nvidia_discrete",
            HardwareType::Vaapi => "vaapi",
            HardwareType::Apple => "apple",
            HardwareType::None => "none",
        };
        write!(f, "{}", name)
    }
}

/// Capability descriptor produced by [`probe`].
#[derive(Debug, Clone, Serialize)]
pub struct Capabilities {
    /// Backend the decode pipeline should use.
    pub backend: Backend,

    pub hardware: HardwareType,

    /// GPU display name, when one could be identified.
    pub gpu_name: Option<String>,

    pub ffmpeg_path: Option<PathBuf>,

    pub gstreamer_path: Option<PathBuf>,

    /// Hardware decoder tokens advertised by `ffmpeg -decoders`.
    pub ffmpeg_decoders: Vec<String>,

    /// Hardware decoder elements advertised by gst-inspect.
    pub gstreamer_decoders: Vec<String>,
}

impl Capabilities {
    pub fn has_ffmpeg_decoder(&self, token: &str) -> bool {
        self.ffmpeg_decoders.iter().any(|d| d == token)
    }

    pub fn has_gstreamer_decoder(&self, element: &str) -> bool {
        self.gstreamer_decoders.iter().any(|d| d == element)
    }

    /// Software-only fallback used when no backend executable is found.
    pub fn software() -> Self {
        Self {
            backend: Backend::Ffmpeg,
            hardware: HardwareType::None,
            gpu_name: None,
            ffmpeg_path: Some(PathBuf::from("ffmpeg")),
            gstreamer_path: None,
            ffmpeg_decoders: Vec::new(),
            gstreamer_decoders: Vec::new(),
        }
    }
}

/// Probes the host once and returns the capability descriptor.
pub async fn probe() -> Capabilities {
    let ffmpeg_path = which("ffmpeg").await;
    let gstreamer_path = which("gst-launch-1.0").await;

    let (hardware, gpu_name) = detect_hardware().await;

    let ffmpeg_decoders = match &ffmpeg_path {
        Some(path) => ffmpeg_hw_decoders(path).await,
        None => Vec::new(),
    };
    let gstreamer_decoders = match &gstreamer_path {
        Some(_) => gstreamer_hw_decoders().await,
        None => Vec::new(),
    };

    let mut caps = Capabilities {
        backend: Backend::Ffmpeg,
        hardware,
        gpu_name,
        ffmpeg_path,
        gstreamer_path,
        ffmpeg_decoders,
        gstreamer_decoders,
    };
    caps.backend = preferred_backend(&caps);

    info!(
        backend = %caps.backend,
        hardware = %caps.hardware,
        gpu = %caps.gpu_name.as_deref().unwrap_or("-"),
        ffmpeg = caps.ffmpeg_path.is_some(),
        gstreamer = caps.gstreamer_path.is_some(),
        "Hardware probe complete"
    );

    caps
}

/// Backend preference policy.
///
/// Embedded NVIDIA prefers gstreamer with its native V4L2 M2M decoder;
/// discrete NVIDIA prefers ffmpeg with NVDEC; everything else prefers
/// ffmpeg. A preferred backend whose hardware decoder is absent falls back
/// to ffmpeg with software decode.
fn preferred_backend(caps: &Capabilities) -> Backend {
    match caps.hardware {
        HardwareType::NvidiaEmbedded => {
            if caps.gstreamer_path.is_some() && caps.has_gstreamer_decoder("nvv4l2decoder") {
                Backend::Gstreamer
            } else {
                Backend::Ffmpeg
            }
        }
        _ => Backend::Ffmpeg,
    }
}

async fn detect_hardware() -> (HardwareType, Option<String>) {
    if cfg!(target_os = "macos") {
        return (HardwareType::Apple, None);
    }

    // Jetson boards ship a tegra release file; older ones only expose the
    // device-tree model string.
    if Path::new("/etc/nv_tegra_release").exists() {
        let model = std::fs::read_to_string("/proc/device-tree/model")
            .ok()
            .map(|m| m.trim_matches(char::from(0)).trim().to_string());
        return (HardwareType::NvidiaEmbedded, model);
    }
    if let Ok(model) = std::fs::read_to_string("/proc/device-tree/model") {
        let model = model.trim_matches(char::from(0)).trim().to_string();
        if model.to_lowercase().contains("nvidia") {
            return (HardwareType::NvidiaEmbedded, Some(model));
        }
    }

    if let Some(name) = nvidia_smi_gpu_name().await {
        return (HardwareType::NvidiaDiscrete, Some(name));
    }

    if Path::new("/dev/dri/renderD128").exists() {
        let gpu = lspci_vga().await;
        return (HardwareType::Vaapi, gpu);
    }

    (HardwareType::None, None)
}

async fn nvidia_smi_gpu_name() -> Option<String> {
    let output = Command::new("nvidia-smi")
        .args(["--query-gpu=name", "--format=csv,noheader"])
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let name = String::from_utf8_lossy(&output.stdout)
        .lines()
        .next()?
        .trim()
        .to_string();
    if name.is_empty() {
        None
    } else {
        Some(name)
    }
}

async fn lspci_vga() -> Option<String> {
    let output = Command::new("lspci").output().await.ok()?;
    if !output.status.success() {
        return None;
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    stdout
        .lines()
        .find(|line| line.contains("VGA compatible controller") || line.contains("Display controller"))
        .and_then(|line| line.splitn(3, ": ").nth(1).map(|s| s.trim().to_string()))
}

/// Hardware H.264 decoder tokens we care about in `ffmpeg -decoders`.
const FFMPEG_HW_TOKENS: &[&str] = &["h264_cuvid", "h264_v4l2m2m", "h264_vaapi", "h264_qsv"];

async fn ffmpeg_hw_decoders(path: &Path) -> Vec<String> {
    let output = match Command::new(path)
        .args(["-hide_banner", "-decoders"])
        .output()
        .await
    {
        Ok(out) => out,
        Err(e) => {
            warn!(error = %e, "ffmpeg decoder query failed");
            return Vec::new();
        }
    };

    let stdout = String::from_utf8_lossy(&output.stdout);
    let mut found = Vec::new();
    for token in FFMPEG_HW_TOKENS {
        if stdout
            .lines()
            .any(|line| line.split_whitespace().nth(1) == Some(*token))
        {
            found.push(token.to_string());
        }
    }
    debug!(tokens = ?found, "ffmpeg hardware decoders");
    found
}

/// Accelerated H.264 elements we look for via gst-inspect.
const GST_HW_ELEMENTS: &[&str] = &["nvv4l2decoder", "nvdec", "vaapih264dec", "avdec_h264"];

async fn gstreamer_hw_decoders() -> Vec<String> {
    let mut found = Vec::new();
    for element in GST_HW_ELEMENTS {
        let ok = Command::new("gst-inspect-1.0")
            .arg(element)
            .output()
            .await
            .map(|out| out.status.success())
            .unwrap_or(false);
        if ok {
            found.push(element.to_string());
        }
    }
    debug!(elements = ?found, "gstreamer decoders");
    found
}

async fn which(program: &str) -> Option<PathBuf> {
    let output = Command::new("which").arg(program).output().await.ok()?;
    if !output.status.success() {
        return None;
    }
    let path = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if path.is_empty() {
        None
    } else {
        Some(PathBuf::from(path))
    }
}
