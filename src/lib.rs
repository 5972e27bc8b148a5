//! # zoomux
//!
//! Swap orchestrator for memory-hungry inference backends. Exactly one
//! backend is resident at a time; a request for another model terminates the
//! current one, waits for the memory to come back and launches the next.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                            zoomux                            │
//! │  ┌────────────────────────────────────────────────────────┐  │
//! │  │ Gate middleware                                        │  │
//! │  │ - Extracts model from request, fast path if active     │  │
//! │  └────────────────────────────────────────────────────────┘  │
//! │                             │                                │
//! │  ┌────────────────────────────────────────────────────────┐  │
//! │  │ Swap orchestrator                                      │  │
//! │  │ - Checking → Terminating → CoolingDown → Launching     │  │
//! │  │   → Verifying → Active | Failed                        │  │
//! │  │ - Resource guard, process lifecycle, model registry    │  │
//! │  └────────────────────────────────────────────────────────┘  │
//! │                             │                                │
//! │  ┌────────────────────────────────────────────────────────┐  │
//! │  │ Proxy                                                  │  │
//! │  │ - Forwards to the active backend's port                │  │
//! │  └────────────────────────────────────────────────────────┘  │
//! │                             │                                │
//! │                             ▼                                │
//! │                   [one backend at a time]                    │
//! └──────────────────────────────────────────────────────────────┘
//! ```

mod config;
pub mod control;
mod gate;
mod middleware;
mod orchestrator;
mod process;
mod proxy;
mod registry;
mod resources;
pub mod telemetry;
#[cfg(test)]
mod testing;
mod types;

pub use config::{Config, ModelConfig, SwapConfig};
pub use gate::{Ready, RequestGate};
pub use middleware::{SwapGateLayer, SwapGateService};
pub use orchestrator::{SwapOrchestrator, SwapSettings};
pub use process::{Lifecycle, ProcessError, ProcessManager, Termination};
pub use proxy::{ProxyState, ProxyTarget, proxy_handler};
pub use registry::{LaunchCommand, ModelDescriptor, ModelRegistry, RegistryError, ServiceState};
pub use resources::{AvailableResources, MemoryPlatform, ResourceProbe, SystemResources};
pub use types::{SwapError, SwapOutcome, SwapPhase, SwapTicket};

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// How often a terminating backend is checked for exit.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Build the complete zoomux stack on top of the real process manager and
/// resource probe.
///
/// Returns:
/// - The main Axum router (gate middleware + proxy)
/// - An optional metrics router (when `config.metrics_port > 0`)
/// - The control API router (for the admin port)
/// - The orchestrator, for shutdown and one-off switches
pub fn build_app(
    config: Config,
) -> Result<(axum::Router, Option<axum::Router>, axum::Router, SwapOrchestrator)> {
    let lifecycle = Arc::new(process_manager(&config));
    build_app_with(config, lifecycle, Arc::new(SystemResources::detect()))
}

/// The process manager [`build_app`] runs backends with.
pub fn process_manager(config: &Config) -> ProcessManager {
    ProcessManager::new(
        config.swap.kill_timeout(),
        EXIT_POLL_INTERVAL,
        config.swap.health_request_timeout(),
    )
}

/// Like [`build_app`], with the process layer and resource probe supplied
/// by the caller.
pub fn build_app_with(
    config: Config,
    lifecycle: Arc<dyn Lifecycle>,
    resources: Arc<dyn ResourceProbe>,
) -> Result<(axum::Router, Option<axum::Router>, axum::Router, SwapOrchestrator)> {
    config.validate()?;

    let registry = Arc::new(ModelRegistry::load(&config).context("Failed to load model registry")?);
    info!(models = ?registry.model_ids(), "Building zoomux");

    let orchestrator = SwapOrchestrator::new(
        registry,
        lifecycle,
        resources,
        SwapSettings::from(&config.swap),
    );
    let gate = RequestGate::new(orchestrator.clone(), config.swap.request_timeout());

    // Build control API router (served on separate admin port)
    let control = control::control_router(orchestrator.clone());

    let app = axum::Router::new()
        .fallback(proxy_handler)
        .with_state(ProxyState::new())
        .layer(SwapGateLayer::new(gate));

    let metrics_router = if config.metrics_port > 0 {
        telemetry::install().map(telemetry::metrics_router)
    } else {
        None
    };

    Ok((app, metrics_router, control, orchestrator))
}
