//! Host resource snapshot for heartbeats

use parking_lot::Mutex;
use serde::Serialize;
use sysinfo::System;
use tokio::process::Command;
use tracing::trace;

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSnapshot {
    pub cpu_percent: f32,
    pub memory_total: u64,
    pub memory_used: u64,
    pub memory_percent: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gpu_percent: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature_c: Option<f32>,
}

/// Keeps one [`System`] alive between heartbeats; CPU usage needs two
/// refreshes to produce a meaningful delta.
pub struct ResourceSampler {
    system: Mutex<System>,
}

impl ResourceSampler {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu_usage();
        system.refresh_memory();
        Self {
            system: Mutex::new(system),
        }
    }

    pub async fn snapshot(&self) -> ResourceSnapshot {
        let (cpu_percent, memory_total, memory_used) = {
            let mut system = self.system.lock();
            system.refresh_cpu_usage();
            system.refresh_memory();
            (
                system.global_cpu_usage(),
                system.total_memory(),
                system.used_memory(),
            )
        };

        let memory_percent = if memory_total > 0 {
            memory_used as f32 / memory_total as f32 * 100.0
        } else {
            0.0
        };

        ResourceSnapshot {
            cpu_percent,
            memory_total,
            memory_used,
            memory_percent,
            gpu_percent: gpu_utilisation().await,
            temperature_c: soc_temperature(),
        }
    }
}

impl Default for ResourceSampler {
    fn default() -> Self {
        Self::new()
    }
}

/// NVIDIA GPU utilisation, when nvidia-smi is available.
async fn gpu_utilisation() -> Option<f32> {
    let output = Command::new("nvidia-smi")
        .args(["--query-gpu=utilization.gpu", "--format=csv,noheader,nounits"])
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8_lossy(&output.stdout);
    let value = text.lines().next()?.trim().parse::<f32>().ok()?;
    trace!(gpu_percent = value, "GPU utilisation sampled");
    Some(value)
}

/// First thermal zone, in degrees Celsius. Jetson and most SBCs expose
/// millidegrees here.
fn soc_temperature() -> Option<f32> {
    let raw = std::fs::read_to_string("/sys/class/thermal/thermal_zone0/temp").ok()?;
    let millis = raw.trim().parse::<f32>().ok()?;
    Some(millis / 1000.0)
}
