//! Point-in-time view of free RAM and VRAM.
//!
//! Readings are advisory. Nothing is reserved between the check and the
//! launch; the orchestrator's swap lock is what keeps two launches apart.

use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use sysinfo::{MemoryRefreshKind, RefreshKind, System};
use tokio::process::Command;
use tracing::{debug, trace, warn};

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;
const MIB_PER_GB: f64 = 1024.0;

/// Upper bound on one `nvidia-smi` invocation.
const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Free memory at the time of the reading.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AvailableResources {
    pub ram_gb: f64,
    /// `None` when VRAM is unknown: unified memory, no GPU, or a failed query
    pub vram_gb: Option<f64>,
}

impl AvailableResources {
    /// Whether a backend with the given footprint fits. Unknown VRAM is not
    /// enforced; RAM always is.
    pub fn admits(&self, estimated_gb: f64) -> bool {
        if self.ram_gb < estimated_gb {
            return false;
        }
        match self.vram_gb {
            Some(vram) => vram >= estimated_gb,
            None => true,
        }
    }
}

/// Source of memory readings. Implemented by [`SystemResources`] in
/// production and by fixed readings in tests.
#[async_trait]
pub trait ResourceProbe: Send + Sync {
    async fn available_resources(&self) -> AvailableResources;

    async fn has_sufficient_memory(&self, estimated_gb: f64) -> bool {
        self.available_resources().await.admits(estimated_gb)
    }
}

/// How graphics memory relates to system memory on this host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryPlatform {
    /// RAM and VRAM are one pool (Apple silicon); RAM is the VRAM proxy
    Unified,
    /// A discrete accelerator may be present; VRAM is queried separately
    Discrete,
}

impl MemoryPlatform {
    pub fn detect() -> Self {
        if cfg!(target_os = "macos") {
            MemoryPlatform::Unified
        } else {
            MemoryPlatform::Discrete
        }
    }
}

/// Reads free RAM via `sysinfo` and free VRAM via `nvidia-smi`.
pub struct SystemResources {
    platform: MemoryPlatform,
    nvidia_smi: String,
    query_timeout: Duration,
}

impl Default for SystemResources {
    fn default() -> Self {
        Self::detect()
    }
}

impl SystemResources {
    pub fn detect() -> Self {
        Self::new(MemoryPlatform::detect(), "nvidia-smi")
    }

    pub fn new(platform: MemoryPlatform, nvidia_smi: impl Into<String>) -> Self {
        Self {
            platform,
            nvidia_smi: nvidia_smi.into(),
            query_timeout: DEFAULT_QUERY_TIMEOUT,
        }
    }

    pub fn with_query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = timeout;
        self
    }

    /// Reads /proc (or the platform equivalent) off the async workers.
    async fn available_ram_gb() -> f64 {
        let read = tokio::task::spawn_blocking(|| {
            let sys = System::new_with_specifics(
                RefreshKind::new().with_memory(MemoryRefreshKind::everything()),
            );
            sys.available_memory() as f64 / BYTES_PER_GB
        });
        match read.await {
            Ok(gb) => gb,
            Err(e) => {
                warn!(error = %e, "Memory reading task failed, reporting no free RAM");
                0.0
            }
        }
    }

    /// Free memory on the first visible accelerator. Any failure degrades to
    /// `None` rather than failing the caller.
    async fn available_vram_gb(&self) -> Option<f64> {
        let mut cmd = Command::new(&self.nvidia_smi);
        cmd.args(["--query-gpu=memory.free", "--format=csv,noheader,nounits"])
            .kill_on_drop(true);
        if let Some(device) = first_visible_device() {
            cmd.arg(format!("--id={}", device));
        }

        let output = match tokio::time::timeout(self.query_timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                trace!(error = %e, "nvidia-smi unavailable, VRAM unknown");
                return None;
            }
            Err(_) => {
                warn!(timeout = ?self.query_timeout, "nvidia-smi did not answer, VRAM unknown");
                return None;
            }
        };

        if !output.status.success() {
            debug!(
                status = %output.status,
                stderr = %String::from_utf8_lossy(&output.stderr).trim_end(),
                "nvidia-smi query failed, VRAM unknown"
            );
            return None;
        }

        parse_free_mib(&String::from_utf8_lossy(&output.stdout)).map(|mib| mib / MIB_PER_GB)
    }
}

#[async_trait]
impl ResourceProbe for SystemResources {
    async fn available_resources(&self) -> AvailableResources {
        let ram_gb = Self::available_ram_gb().await;
        let vram_gb = match self.platform {
            MemoryPlatform::Unified => None,
            MemoryPlatform::Discrete => self.available_vram_gb().await,
        };
        AvailableResources { ram_gb, vram_gb }
    }
}

/// First entry of `CUDA_VISIBLE_DEVICES`, if set and non-empty.
fn first_visible_device() -> Option<String> {
    let devices = std::env::var("CUDA_VISIBLE_DEVICES").ok()?;
    devices
        .split(',')
        .map(str::trim)
        .find(|d| !d.is_empty())
        .map(str::to_string)
}

/// Parse the first line of `nvidia-smi --query-gpu=memory.free` output (MiB).
fn parse_free_mib(output: &str) -> Option<f64> {
    output
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .and_then(|line| line.parse::<f64>().ok())
}
