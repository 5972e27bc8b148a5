//! Configuration for zoomux

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory scanned for one descriptor file (`*.json`) per installed model
    #[serde(default)]
    pub models_dir: Option<PathBuf>,

    /// Descriptors given inline, in addition to the ones in `models_dir`
    #[serde(default)]
    pub models: Vec<ModelConfig>,

    /// Proxy port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Metrics port (0 to disable)
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,

    /// Admin/control API port (None to disable)
    #[serde(default)]
    pub admin_port: Option<u16>,

    /// Memory estimate applied to descriptors that do not declare one.
    /// Deliberately large: a missing estimate must not slip past the guard.
    #[serde(default = "default_memory_gb")]
    pub default_memory_gb: f64,

    /// Swap timing
    #[serde(default)]
    pub swap: SwapConfig,
}

/// One installed model, as persisted in its descriptor file.
///
/// ```json
/// {
///   "model_id": "qwen3-8b",
///   "estimated_memory_gb": 9.5,
///   "command": ["llama-server", "-m", "/models/Qwen3-8B-Q8_0.gguf", "--port", "8081"],
///   "port": 8081
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub model_id: String,

    /// Peak resident memory of the backend, in GB
    #[serde(default)]
    pub estimated_memory_gb: Option<f64>,

    /// Program followed by its arguments
    pub command: Vec<String>,

    #[serde(default)]
    pub working_dir: Option<PathBuf>,

    /// Extra environment for the backend process
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Port the backend binds
    pub port: u16,

    /// Readiness endpoint on the backend
    #[serde(default = "default_health_path")]
    pub health_path: String,

    /// Alternative names that resolve to this model (e.g. content hashes)
    #[serde(default)]
    pub aliases: Vec<String>,

    /// Workload served, e.g. "chat", "embed", "image-generation"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,

    /// Serving engine, e.g. "gguf", "mlx-lm", "mlx-flux"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,
}

/// Timeouts and pauses used by the swap state machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwapConfig {
    /// How long a backend gets to exit after SIGTERM before SIGKILL
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,

    /// How long to wait for exit after SIGKILL before giving up
    #[serde(default = "default_kill_timeout_ms")]
    pub kill_timeout_ms: u64,

    /// Pause between a confirmed termination and the next launch
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,

    /// How long a freshly launched backend has to pass its health check
    #[serde(default = "default_launch_timeout_secs")]
    pub launch_timeout_secs: u64,

    #[serde(default = "default_health_poll_interval_ms")]
    pub health_poll_interval_ms: u64,

    /// Timeout of a single health request
    #[serde(default = "default_health_request_timeout_ms")]
    pub health_request_timeout_ms: u64,

    /// How long a caller waits for a swap before giving up (0 = forever).
    /// Giving up never cancels the swap itself.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for SwapConfig {
    fn default() -> Self {
        Self {
            grace_period_ms: default_grace_period_ms(),
            kill_timeout_ms: default_kill_timeout_ms(),
            cooldown_ms: default_cooldown_ms(),
            launch_timeout_secs: default_launch_timeout_secs(),
            health_poll_interval_ms: default_health_poll_interval_ms(),
            health_request_timeout_ms: default_health_request_timeout_ms(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl SwapConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn kill_timeout(&self) -> Duration {
        Duration::from_millis(self.kill_timeout_ms)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    pub fn launch_timeout(&self) -> Duration {
        Duration::from_secs(self.launch_timeout_secs)
    }

    pub fn health_poll_interval(&self) -> Duration {
        Duration::from_millis(self.health_poll_interval_ms)
    }

    pub fn health_request_timeout(&self) -> Duration {
        Duration::from_millis(self.health_request_timeout_ms)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        (self.request_timeout_secs > 0).then(|| Duration::from_secs(self.request_timeout_secs))
    }
}

fn default_port() -> u16 {
    3000
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_memory_gb() -> f64 {
    16.0
}

fn default_health_path() -> String {
    "/health".to_string()
}

fn default_grace_period_ms() -> u64 {
    10_000
}

fn default_kill_timeout_ms() -> u64 {
    5_000
}

fn default_cooldown_ms() -> u64 {
    5_000
}

fn default_launch_timeout_secs() -> u64 {
    600
}

fn default_health_poll_interval_ms() -> u64 {
    500
}

fn default_health_request_timeout_ms() -> u64 {
    5_000
}

fn default_request_timeout_secs() -> u64 {
    900
}

impl Config {
    /// Load configuration from a JSON file
    pub async fn from_file(path: &Path) -> Result<Self> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Reject settings that would make the swap machinery misbehave.
    pub fn validate(&self) -> Result<()> {
        if !(self.default_memory_gb.is_finite() && self.default_memory_gb > 0.0) {
            bail!(
                "default_memory_gb must be a positive number (got {})",
                self.default_memory_gb
            );
        }
        if self.swap.health_poll_interval_ms == 0 {
            bail!("swap.health_poll_interval_ms must be greater than zero");
        }
        if self.swap.launch_timeout_secs == 0 {
            bail!("swap.launch_timeout_secs must be greater than zero");
        }
        if self.models_dir.is_none() && self.models.is_empty() {
            tracing::warn!("No models_dir and no inline models configured; nothing can be served");
        }
        Ok(())
    }
}
