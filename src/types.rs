//! Shared domain types used across the codebase.

use serde::Serialize;
use std::time::{Duration, Instant};

/// Errors surfaced by a swap attempt.
///
/// `Clone` so that one terminal outcome can be delivered to every caller
/// waiting on the same attempt.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SwapError {
    #[error("model not found: {0}")]
    ModelNotFound(String),

    #[error("insufficient memory for {model}: {detail}")]
    InsufficientMemory { model: String, detail: String },

    #[error("{model} did not exit within the termination grace period")]
    TerminationTimeout { model: String },

    #[error("failed to launch {model}: {reason}")]
    LaunchFailure { model: String, reason: String },

    #[error("{model} did not become healthy within {timeout:?}")]
    HealthCheckTimeout { model: String, timeout: Duration },

    #[error("request timed out waiting for model")]
    RequestTimeout,

    #[error("zoomux is shutting down")]
    ShuttingDown,

    #[error("internal error: {0}")]
    Internal(String),
}

impl SwapError {
    /// Stable machine-readable code for the error.
    pub fn code(&self) -> &'static str {
        match self {
            SwapError::ModelNotFound(_) => "model_not_found",
            SwapError::InsufficientMemory { .. } => "insufficient_memory",
            SwapError::TerminationTimeout { .. } => "termination_timeout",
            SwapError::LaunchFailure { .. } => "launch_failure",
            SwapError::HealthCheckTimeout { .. } => "health_check_timeout",
            SwapError::RequestTimeout => "request_timeout",
            SwapError::ShuttingDown => "shutting_down",
            SwapError::Internal(_) => "internal",
        }
    }
}

/// Where the orchestrator currently is in the swap lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum SwapPhase {
    /// No swap running
    Idle,
    /// Deciding whether a swap is needed and whether memory allows it
    Checking { target: String },
    /// Retiring the previously active backend
    Terminating { model: String },
    /// Fixed pause after termination so the OS can reclaim resources
    CoolingDown { target: String },
    /// Spawning the target backend
    Launching { target: String },
    /// Polling the new backend's health endpoint
    Verifying { target: String, pid: u32 },
    /// Attempt finished successfully
    Active { model: String },
    /// Attempt finished with an error
    Failed { target: String, reason: String },
}

impl SwapPhase {
    /// Short label used in metrics and log fields.
    pub fn label(&self) -> &'static str {
        match self {
            SwapPhase::Idle => "idle",
            SwapPhase::Checking { .. } => "checking",
            SwapPhase::Terminating { .. } => "terminating",
            SwapPhase::CoolingDown { .. } => "cooling_down",
            SwapPhase::Launching { .. } => "launching",
            SwapPhase::Verifying { .. } => "verifying",
            SwapPhase::Active { .. } => "active",
            SwapPhase::Failed { .. } => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SwapOutcome {
    Pending,
    Success,
    Failed,
}

/// One swap attempt. Lives only as long as the attempt itself.
#[derive(Debug)]
pub struct SwapTicket {
    pub target_model_id: String,
    pub requested_at: Instant,
    pub outcome: SwapOutcome,
    pub failure_reason: Option<SwapError>,
}

impl SwapTicket {
    pub fn new(target_model_id: &str) -> Self {
        Self {
            target_model_id: target_model_id.to_string(),
            requested_at: Instant::now(),
            outcome: SwapOutcome::Pending,
            failure_reason: None,
        }
    }

    pub fn resolve(&mut self, result: &Result<(), SwapError>) {
        match result {
            Ok(()) => self.outcome = SwapOutcome::Success,
            Err(e) => {
                self.outcome = SwapOutcome::Failed;
                self.failure_reason = Some(e.clone());
            }
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.requested_at.elapsed()
    }
}
