//! RTSP to JPEG decoder
//!
//! One decoder owns one camera stream. It spawns a child process of the
//! probed backend (ffmpeg or gst-launch-1.0) whose stdout is a
//! concatenated MJPEG stream at the configured rate and resolution,
//! segments that stream into frames, and hands each frame to the caller's
//! handler with a per-session monotonic sequence number. Any read error,
//! EOF, or child exit tears the child down and reconnects after a fixed
//! delay; the loop only exits on cancellation.

use crate::hardware::{Backend, Capabilities, HardwareType};
use crate::mjpeg::{jpeg_dimensions, MjpegSplitter};
use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Delay before a failed stream is retried.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum DecoderError {
    #[error("decoder already running")]
    AlreadyRunning,

    #[error("no usable decoder backend on this host")]
    NoBackend,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// One decoded JPEG frame. In-memory only.
#[derive(Debug, Clone)]
pub struct Frame {
    pub camera_id: String,
    /// Monotonic within one stream session, starting at 1.
    pub sequence: u64,
    /// Wall clock, milliseconds since the epoch.
    pub timestamp_ms: i64,
    pub width: u32,
    pub height: u32,
    pub jpeg: Bytes,
}

/// Synchronous frame sink invoked from the decode loop.
pub type FrameHandler = Arc<dyn Fn(Frame) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct DecoderConfig {
    pub camera_id: String,
    pub rtsp_url: String,
    pub fps: u32,
    /// Output scale; `None` keeps the stream's native size.
    pub resolution: Option<(u32, u32)>,
    /// JPEG quality 1-100.
    pub quality: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DecoderState {
    Idle,
    Starting,
    Connected,
    Reconnecting,
    Stopped,
}

/// Point-in-time decoder snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct DecoderStats {
    pub camera_id: String,
    pub backend: Backend,
    pub hardware_type: HardwareType,
    pub state: DecoderState,
    pub is_connected: bool,
    pub frames_decoded: u64,
    pub last_frame_time: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub current_fps: f64,
}

struct Shared {
    state: Mutex<DecoderState>,
    is_connected: AtomicBool,
    frames_decoded: AtomicU64,
    /// Milliseconds since epoch of the last frame; 0 when none yet.
    last_frame_ms: AtomicI64,
    last_error: Mutex<Option<String>>,
    /// Current throughput in millihertz to keep the field atomic.
    fps_millis: AtomicU64,
}

impl Shared {
    fn new() -> Self {
        Self {
            state: Mutex::new(DecoderState::Idle),
            is_connected: AtomicBool::new(false),
            frames_decoded: AtomicU64::new(0),
            last_frame_ms: AtomicI64::new(0),
            last_error: Mutex::new(None),
            fps_millis: AtomicU64::new(0),
        }
    }

    fn set_state(&self, state: DecoderState) {
        *self.state.lock() = state;
    }

    fn record_error(&self, error: String) {
        *self.last_error.lock() = Some(error);
        self.is_connected.store(false, Ordering::Relaxed);
        self.fps_millis.store(0, Ordering::Relaxed);
    }
}

/// RTSP stream decoder bound to one camera.
pub struct Decoder {
    config: DecoderConfig,
    caps: Arc<Capabilities>,
    shared: Arc<Shared>,
    shutdown_tx: Option<watch::Sender<bool>>,
    task: Option<JoinHandle<()>>,
}

impl Decoder {
    pub fn new(config: DecoderConfig, caps: Arc<Capabilities>) -> Self {
        Self {
            config,
            caps,
            shared: Arc::new(Shared::new()),
            shutdown_tx: None,
            task: None,
        }
    }

    pub fn camera_id(&self) -> &str {
        &self.config.camera_id
    }

    /// Begins the decode loop on a background task.
    pub fn start(&mut self, handler: FrameHandler) -> Result<(), DecoderError> {
        if self.task.is_some() {
            return Err(DecoderError::AlreadyRunning);
        }
        // Fail fast when neither backend executable was found.
        build_command(&self.caps, &self.config)?;

        info!(
            camera = %self.config.camera_id,
            backend = %self.caps.backend,
            fps = %self.config.fps,
            "Starting decoder"
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let config = self.config.clone();
        let caps = Arc::clone(&self.caps);
        let shared = Arc::clone(&self.shared);

        self.shutdown_tx = Some(shutdown_tx);
        self.task = Some(tokio::spawn(run_loop(
            config,
            caps,
            shared,
            handler,
            shutdown_rx,
        )));
        Ok(())
    }

    /// Cancels the loop, kills the child process, and waits for the task
    /// to exit. Idempotent.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(true);
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        self.shared.set_state(DecoderState::Stopped);
        self.shared.is_connected.store(false, Ordering::Relaxed);
        info!(camera = %self.config.camera_id, "Decoder stopped");
    }

    pub fn stats(&self) -> DecoderStats {
        let last_frame_ms = self.shared.last_frame_ms.load(Ordering::Relaxed);
        DecoderStats {
            camera_id: self.config.camera_id.clone(),
            backend: self.caps.backend,
            hardware_type: self.caps.hardware,
            state: *self.shared.state.lock(),
            is_connected: self.shared.is_connected.load(Ordering::Relaxed),
            frames_decoded: self.shared.frames_decoded.load(Ordering::Relaxed),
            last_frame_time: (last_frame_ms > 0)
                .then(|| Utc.timestamp_millis_opt(last_frame_ms).single())
                .flatten(),
            last_error: self.shared.last_error.lock().clone(),
            current_fps: self.shared.fps_millis.load(Ordering::Relaxed) as f64 / 1000.0,
        }
    }
}

async fn run_loop(
    config: DecoderConfig,
    caps: Arc<Capabilities>,
    shared: Arc<Shared>,
    handler: FrameHandler,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        shared.set_state(DecoderState::Starting);

        match run_stream(&config, &caps, &shared, &handler, &mut shutdown).await {
            StreamExit::Shutdown => break,
            StreamExit::Failed(error) => {
                warn!(camera = %config.camera_id, error = %error, "Stream lost, reconnecting");
                shared.record_error(error);
            }
        }

        shared.set_state(DecoderState::Reconnecting);
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tokio::time::sleep(RECONNECT_DELAY) => {}
        }
    }

    shared.set_state(DecoderState::Stopped);
    shared.is_connected.store(false, Ordering::Relaxed);
}

enum StreamExit {
    Shutdown,
    Failed(String),
}

/// Runs one child-process session to completion.
async fn run_stream(
    config: &DecoderConfig,
    caps: &Capabilities,
    shared: &Shared,
    handler: &FrameHandler,
    shutdown: &mut watch::Receiver<bool>,
) -> StreamExit {
    let (program, args) = match build_command(caps, config) {
        Ok(cmd) => cmd,
        Err(e) => return StreamExit::Failed(e.to_string()),
    };
    debug!(camera = %config.camera_id, program = %program, args = ?args, "Spawning decode child");

    let mut child = match Command::new(&program)
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
    {
        Ok(child) => child,
        Err(e) => return StreamExit::Failed(format!("spawn {}: {}", program, e)),
    };

    let mut stdout = match child.stdout.take() {
        Some(stdout) => stdout,
        None => return StreamExit::Failed("child stdout unavailable".to_string()),
    };

    // Lines containing "error" from the child are worth keeping; the rest
    // of its chatter is discarded.
    let stderr_task = child.stderr.take().map(|stderr| {
        let camera = config.camera_id.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line.to_lowercase().contains("error") {
                    warn!(camera = %camera, line = %line, "Decoder backend error");
                }
            }
        })
    });

    let mut splitter = MjpegSplitter::new();
    let mut buf = vec![0u8; 64 * 1024];
    // Fresh session: numbering restarts at 1.
    let mut sequence: u64 = 0;
    let mut window_start = Instant::now();
    let mut window_frames: u64 = 0;

    let exit = loop {
        let read = tokio::select! {
            _ = shutdown.changed() => break StreamExit::Shutdown,
            read = stdout.read(&mut buf) => read,
        };

        let n = match read {
            Ok(0) => break StreamExit::Failed("decoder stream ended".to_string()),
            Ok(n) => n,
            Err(e) => break StreamExit::Failed(format!("read: {}", e)),
        };

        splitter.push(&buf[..n]);
        while let Some(jpeg) = splitter.next_frame() {
            if sequence == 0 {
                info!(camera = %config.camera_id, "Stream connected");
                shared.set_state(DecoderState::Connected);
                shared.is_connected.store(true, Ordering::Relaxed);
                *shared.last_error.lock() = None;
            }
            sequence += 1;

            let (width, height) = jpeg_dimensions(&jpeg)
                .ok()
                .or(config.resolution)
                .unwrap_or((0, 0));

            let now_ms = Utc::now().timestamp_millis();
            handler(Frame {
                camera_id: config.camera_id.clone(),
                sequence,
                timestamp_ms: now_ms,
                width,
                height,
                jpeg,
            });

            shared.frames_decoded.fetch_add(1, Ordering::Relaxed);
            shared.last_frame_ms.store(now_ms, Ordering::Relaxed);

            window_frames += 1;
            let elapsed = window_start.elapsed();
            if elapsed >= Duration::from_secs(1) {
                let fps = window_frames as f64 / elapsed.as_secs_f64();
                shared
                    .fps_millis
                    .store((fps * 1000.0) as u64, Ordering::Relaxed);
                window_start = Instant::now();
                window_frames = 0;
            }
        }
    };

    let _ = child.kill().await;
    let _ = child.wait().await;
    if let Some(task) = stderr_task {
        task.abort();
    }
    shared.is_connected.store(false, Ordering::Relaxed);
    shared.fps_millis.store(0, Ordering::Relaxed);
    exit
}

/// Maps JPEG quality 1-100 onto ffmpeg `-q:v` 31-1.
fn ffmpeg_qscale(quality: u32) -> u32 {
    let quality = quality.clamp(1, 100);
    (31 - (quality - 1) * 30 / 99).clamp(1, 31)
}

/// Builds the child-process command line for the probed backend.
fn build_command(
    caps: &Capabilities,
    config: &DecoderConfig,
) -> Result<(String, Vec<String>), DecoderError> {
    match caps.backend {
        Backend::Gstreamer => {
            let path = caps.gstreamer_path.as_ref().ok_or(DecoderError::NoBackend)?;
            Ok((
                path.to_string_lossy().to_string(),
                gstreamer_args(caps, config),
            ))
        }
        Backend::Ffmpeg => {
            let path = caps.ffmpeg_path.as_ref().ok_or(DecoderError::NoBackend)?;
            Ok((
                path.to_string_lossy().to_string(),
                ffmpeg_args(caps, config),
            ))
        }
    }
}

fn ffmpeg_args(caps: &Capabilities, config: &DecoderConfig) -> Vec<String> {
    let mut args: Vec<String> = vec!["-hide_banner".into(), "-loglevel".into(), "warning".into()];

    match caps.hardware {
        HardwareType::NvidiaEmbedded if caps.has_ffmpeg_decoder("h264_v4l2m2m") => {
            args.extend(["-c:v".into(), "h264_v4l2m2m".into()]);
        }
        HardwareType::NvidiaDiscrete if caps.has_ffmpeg_decoder("h264_cuvid") => {
            args.extend(["-hwaccel".into(), "cuda".into(), "-c:v".into(), "h264_cuvid".into()]);
        }
        HardwareType::Vaapi => {
            args.extend([
                "-hwaccel".into(),
                "vaapi".into(),
                "-hwaccel_device".into(),
                "/dev/dri/renderD128".into(),
            ]);
        }
        HardwareType::Apple => {
            args.extend(["-hwaccel".into(), "videotoolbox".into()]);
        }
        _ => {}
    }

    args.extend([
        "-rtsp_transport".into(),
        "tcp".into(),
        "-i".into(),
        config.rtsp_url.clone(),
    ]);

    let mut vf = format!("fps={}", config.fps);
    if let Some((w, h)) = config.resolution {
        vf.push_str(&format!(",scale={}x{}", w, h));
    }
    args.extend([
        "-vf".into(),
        vf,
        "-f".into(),
        "image2pipe".into(),
        "-vcodec".into(),
        "mjpeg".into(),
        "-q:v".into(),
        ffmpeg_qscale(config.quality).to_string(),
        "-".into(),
    ]);

    args
}

fn gstreamer_args(caps: &Capabilities, config: &DecoderConfig) -> Vec<String> {
    let decoder = if caps.has_gstreamer_decoder("nvv4l2decoder") {
        "nvv4l2decoder"
    } else if caps.has_gstreamer_decoder("nvdec") {
        "nvdec"
    } else if caps.has_gstreamer_decoder("vaapih264dec") {
        "vaapih264dec"
    } else {
        "avdec_h264"
    };

    let mut args: Vec<String> = vec![
        "-q".into(),
        "rtspsrc".into(),
        format!("location={}", config.rtsp_url),
        "latency=100".into(),
        "protocols=tcp".into(),
        "!".into(),
        "rtph264depay".into(),
        "!".into(),
        "h264parse".into(),
        "!".into(),
        decoder.into(),
        "!".into(),
        "videoconvert".into(),
    ];

    if let Some((w, h)) = config.resolution {
        args.extend([
            "!".into(),
            "videoscale".into(),
            "!".into(),
            format!("video/x-raw,width={},height={}", w, h),
        ]);
    }

    args.extend([
        "!".into(),
        "videorate".into(),
        "!".into(),
        format!("video/x-raw,framerate={}/1", config.fps),
        "!".into(),
        "jpegenc".into(),
        format!("quality={}", config.quality.clamp(1, 100)),
        "!".into(),
        "fdsink".into(),
        "fd=1".into(),
    ]);

    args
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn caps(backend: Backend, hardware: HardwareType, ffmpeg_tokens: &[&str]) -> Capabilities {
        Capabilities {
            backend,
            hardware,
            gpu_name: None,
            ffmpeg_path: Some(PathBuf::from("ffmpeg")),
            gstreamer_path: Some(PathBuf::from("gst-launch-1.0")),
            ffmpeg_decoders: ffmpeg_tokens.iter().map(|s| s.to_string()).collect(),
            gstreamer_decoders: vec!["nvv4l2decoder".to_string()],
        }
    }

    fn config() -> DecoderConfig {
        DecoderConfig {
            camera_id: "cam_0011223344556677".to_string(),
            rtsp_url: "rtsp://10.0.0.2/stream".to_string(),
            fps: 15,
            resolution: Some((1280, 720)),
            quality: 80,
        }
    }

    #[test]
    fn test_qscale_mapping() {
        assert_eq!(ffmpeg_qscale(1), 31);
        assert_eq!(ffmpeg_qscale(100), 1);
        assert_eq!(ffmpeg_qscale(0), 31); // clamped up
        assert_eq!(ffmpeg_qscale(200), 1); // clamped down
        assert!(ffmpeg_qscale(50) > 1 && ffmpeg_qscale(50) < 31);
    }

    #[test]
    fn test_ffmpeg_software_args() {
        let caps = caps(Backend::Ffmpeg, HardwareType::None, &[]);
        let args = ffmpeg_args(&caps, &config());
        let joined = args.join(" ");
        assert!(joined.contains("-rtsp_transport tcp"));
        assert!(joined.contains("-i rtsp://10.0.0.2/stream"));
        assert!(joined.contains("-vf fps=15,scale=1280x720"));
        assert!(joined.contains("-f image2pipe -vcodec mjpeg"));
        assert!(!joined.contains("-hwaccel"));
        assert_eq!(args.last().unwrap(), "-");
    }

    #[test]
    fn test_ffmpeg_cuvid_args() {
        let caps = caps(Backend::Ffmpeg, HardwareType::NvidiaDiscrete, &["h264_cuvid"]);
        let joined = ffmpeg_args(&caps, &config()).join(" ");
        assert!(joined.contains("-hwaccel cuda -c:v h264_cuvid"));
    }

    #[test]
    fn test_ffmpeg_cuvid_token_missing_means_software() {
        let caps = caps(Backend::Ffmpeg, HardwareType::NvidiaDiscrete, &[]);
        let joined = ffmpeg_args(&caps, &config()).join(" ");
        assert!(!joined.contains("cuvid"));
    }

    #[test]
    fn test_gstreamer_pipeline_args() {
        let caps = caps(Backend::Gstreamer, HardwareType::NvidiaEmbedded, &[]);
        let joined = gstreamer_args(&caps, &config()).join(" ");
        assert!(joined.contains("rtspsrc location=rtsp://10.0.0.2/stream latency=100 protocols=tcp"));
        assert!(joined.contains("nvv4l2decoder"));
        assert!(joined.contains("video/x-raw,framerate=15/1"));
        assert!(joined.contains("jpegenc quality=80"));
        assert!(joined.ends_with("fdsink fd=1"));
    }

    #[test]
    fn test_no_backend_is_an_error() {
        let mut caps = caps(Backend::Ffmpeg, HardwareType::None, &[]);
        caps.ffmpeg_path = None;
        assert!(matches!(
            build_command(&caps, &config()),
            Err(DecoderError::NoBackend)
        ));
    }
}
