//! zoomux - one inference backend at a time
//!
//! This binary fronts a set of installed models with an OpenAI-style proxy.
//! A request for a model that is not resident swaps it in: the current
//! backend is terminated, memory is given time to come back, and the
//! requested backend is launched and health-checked.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use zoomux::{Config, ProcessManager, SwapOrchestrator, SystemResources};

#[derive(Parser, Debug)]
#[command(name = "zoomux")]
#[command(about = "Swap orchestrator for memory-hungry inference backends")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.json", env = "ZOOMUX_CONFIG")]
    config: PathBuf,

    /// Port to listen on (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Swap the given model in, report the outcome, stop it again and exit
    #[arg(long, value_name = "MODEL")]
    check: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Backend process output is logged under the "backend" target at debug
    // level, so it can be enabled with e.g. RUST_LOG=info,backend=debug.
    let filter = if args.verbose {
        EnvFilter::new("zoomux=debug,backend=debug,tower_http=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    info!("Starting zoomux");

    let mut config = Config::from_file(&args.config)
        .await
        .with_context(|| format!("Failed to load config from {}", args.config.display()))?;

    if let Some(port) = args.port {
        config.port = port;
    }

    // Kept here as well so shutdown can reach every backend it spawned.
    let processes = Arc::new(zoomux::process_manager(&config));
    let (app, metrics_router, control_router, orchestrator) = zoomux::build_app_with(
        config.clone(),
        processes.clone(),
        Arc::new(SystemResources::detect()),
    )
    .context("Failed to build application")?;

    info!(
        models = ?orchestrator.registry().model_ids(),
        port = config.port,
        "Configuration loaded"
    );

    if let Some(model) = args.check {
        let result = orchestrator.switch_to(&model).await;
        match &result {
            Ok(()) => info!(model = %model, "Check passed: backend became active"),
            Err(e) => error!(model = %model, code = e.code(), error = %e, "Check failed"),
        }
        shutdown(&orchestrator, &processes, config.swap.grace_period()).await;
        std::process::exit(if result.is_ok() { 0 } else { 1 });
    }

    // Spawn metrics server if enabled
    if let Some(metrics_router) = metrics_router {
        let metrics_addr = format!("0.0.0.0:{}", config.metrics_port);
        let metrics_listener = TcpListener::bind(&metrics_addr)
            .await
            .with_context(|| format!("Failed to bind metrics to {}", metrics_addr))?;
        info!(addr = %metrics_addr, "Serving metrics");
        tokio::spawn(async move {
            if let Err(e) = axum::serve(metrics_listener, metrics_router).await {
                error!(error = %e, "Metrics server error");
            }
        });
    }

    // Spawn admin/control API server if enabled
    if let Some(admin_port) = config.admin_port {
        let admin_addr = format!("0.0.0.0:{}", admin_port);
        let admin_listener = TcpListener::bind(&admin_addr)
            .await
            .with_context(|| format!("Failed to bind admin API to {}", admin_addr))?;
        info!(addr = %admin_addr, "Serving control API");
        tokio::spawn(async move {
            if let Err(e) = axum::serve(admin_listener, control_router).await {
                error!(error = %e, "Admin server error");
            }
        });
    }

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    info!(addr = %addr, "Listening for requests");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Shutting down, stopping backends");
    shutdown(&orchestrator, &processes, config.swap.grace_period()).await;

    Ok(())
}

/// Stop the active backend, abandoning any launch in progress, then take
/// down whatever else the process manager still holds.
async fn shutdown(
    orchestrator: &SwapOrchestrator,
    processes: &ProcessManager,
    grace_period: std::time::Duration,
) {
    match orchestrator.shutdown().await {
        Ok(Some(model)) => info!(model = %model, "Backend stopped"),
        Ok(None) => {}
        Err(e) => warn!(error = %e, "Backend did not stop cleanly"),
    }
    processes.shutdown_all(grace_period).await;
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
