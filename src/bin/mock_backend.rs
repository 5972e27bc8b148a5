//! Mock inference backend for testing zoomux
//!
//! `mock-backend --port 8001 --model test-model`
//!
//! Serves `/health`, `/v1/models` and a canned `/v1/chat/completions`, and can
//! be told to misbehave the ways real backends do: slow startup, ignoring
//! SIGTERM, never becoming healthy, or crashing shortly after launch.

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::net::TcpListener;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "mock-backend")]
#[command(about = "Mock inference backend for testing")]
struct Args {
    /// Port to listen on (0 picks a free one)
    #[arg(short, long, default_value = "8001")]
    port: u16,

    /// Model name to serve
    #[arg(short, long, default_value = "test-model")]
    model: String,

    /// Time before /health starts answering 200 (ms)
    #[arg(long, default_value = "0")]
    startup_delay_ms: u64,

    /// Keep running after SIGTERM; only SIGKILL stops the process
    #[arg(long)]
    ignore_sigterm: bool,

    /// /health always answers 503
    #[arg(long)]
    never_healthy: bool,

    /// Exit with status 3 after this many ms
    #[arg(long)]
    exit_after_ms: Option<u64>,
}

struct MockState {
    model: String,
    ready: AtomicBool,
    request_count: AtomicU64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("mock_backend=debug")
        .init();

    let args = Args::parse();

    if args.ignore_sigterm {
        ignore_sigterm()?;
    }

    if let Some(ms) = args.exit_after_ms {
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            warn!(after_ms = ms, "Exiting as instructed");
            std::process::exit(3);
        });
    }

    let state = Arc::new(MockState {
        model: args.model.clone(),
        ready: AtomicBool::new(false),
        request_count: AtomicU64::new(0),
    });

    if !args.never_healthy {
        let state = state.clone();
        let delay = Duration::from_millis(args.startup_delay_ms);
        tokio::spawn(async move {
            if !delay.is_zero() {
                info!(delay = ?delay, "Simulating startup delay");
                tokio::time::sleep(delay).await;
            }
            state.ready.store(true, Ordering::SeqCst);
        });
    }

    let app = Router::new()
        .route("/health", get(health))
        .route("/v1/models", get(list_models))
        .route("/v1/chat/completions", post(chat_completions))
        .route("/stats", get(stats))
        .with_state(state);

    let addr = format!("127.0.0.1:{}", args.port);
    let listener = TcpListener::bind(&addr).await?;

    // Get the actual port (important when port=0 for dynamic allocation)
    let actual_port = listener.local_addr()?.port();

    info!(model = %args.model, port = actual_port, "Mock backend listening");

    // Signal readiness to stdout for test harness
    // Format: "READY <port>" on its own line
    println!("READY {}", actual_port);

    axum::serve(listener, app).await?;
    Ok(())
}

#[cfg(unix)]
fn ignore_sigterm() -> anyhow::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    // Registering a handler replaces the default terminate action.
    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::spawn(async move {
        while sigterm.recv().await.is_some() {
            warn!("Ignoring SIGTERM");
        }
    });
    Ok(())
}

#[cfg(not(unix))]
fn ignore_sigterm() -> anyhow::Result<()> {
    Ok(())
}

async fn health(State(state): State<Arc<MockState>>) -> StatusCode {
    if state.ready.load(Ordering::SeqCst) {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn list_models(State(state): State<Arc<MockState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "object": "list",
        "data": [{
            "id": state.model,
            "object": "model",
            "owned_by": "mock-backend"
        }]
    }))
}

#[derive(Deserialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<Message>,
}

#[derive(Deserialize, Serialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Serialize)]
struct ChatCompletionResponse {
    id: String,
    object: String,
    created: u64,
    model: String,
    choices: Vec<Choice>,
}

#[derive(Serialize)]
struct Choice {
    index: u32,
    message: Message,
    finish_reason: String,
}

async fn chat_completions(
    State(state): State<Arc<MockState>>,
    Json(request): Json<ChatCompletionRequest>,
) -> Result<Json<ChatCompletionResponse>, (StatusCode, String)> {
    if !state.ready.load(Ordering::SeqCst) {
        return Err((StatusCode::SERVICE_UNAVAILABLE, "Still loading".to_string()));
    }

    let count = state.request_count.fetch_add(1, Ordering::SeqCst) + 1;
    let last = request
        .messages
        .last()
        .map(|m| m.content.as_str())
        .unwrap_or("");
    info!(model = %request.model, count, "Chat completion");

    Ok(Json(ChatCompletionResponse {
        id: format!("chatcmpl-mock-{}", count),
        object: "chat.completion".to_string(),
        created: SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0),
        // Report the model actually loaded, so callers can tell who answered.
        model: state.model.clone(),
        choices: vec![Choice {
            index: 0,
            message: Message {
                role: "assistant".to_string(),
                content: format!("[{}] {}", state.model, last),
            },
            finish_reason: "stop".to_string(),
        }],
    }))
}

async fn stats(State(state): State<Arc<MockState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "model": state.model,
        "ready": state.ready.load(Ordering::SeqCst),
        "request_count": state.request_count.load(Ordering::SeqCst),
        "pid": std::process::id(),
    }))
}
