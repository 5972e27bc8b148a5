//! Request gate, the front door every request passes through.
//!
//! Requests for the active model take the fast path: one read of the
//! registry's active pointer, no locks. Everything else is handed to the
//! orchestrator and waits for the attempt's outcome, bounded by the
//! caller-side request timeout.

use crate::orchestrator::SwapOrchestrator;
use crate::types::SwapError;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// The backend a request may now be sent to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ready {
    pub model_id: String,
    pub port: u16,
}

#[derive(Clone)]
pub struct RequestGate {
    orchestrator: SwapOrchestrator,
    request_timeout: Option<Duration>,
}

impl RequestGate {
    /// `request_timeout` of `None` waits for the swap however long it takes.
    pub fn new(orchestrator: SwapOrchestrator, request_timeout: Option<Duration>) -> Self {
        Self {
            orchestrator,
            request_timeout,
        }
    }

    pub fn orchestrator(&self) -> &SwapOrchestrator {
        &self.orchestrator
    }

    /// Make sure `model` (id or alias) is serving, swapping if needed.
    pub async fn ensure_active(&self, model: &str) -> Result<Ready, SwapError> {
        let registry = self.orchestrator.registry();
        let Some(model_id) = registry.resolve(model) else {
            metrics::counter!("zoomux_requests_total", "outcome" => "model_not_found")
                .increment(1);
            return Err(SwapError::ModelNotFound(model.to_string()));
        };
        let descriptor = registry
            .descriptor(model_id)
            .ok_or_else(|| SwapError::Internal(format!("no descriptor for {}", model_id)))?;
        let ready = Ready {
            model_id: descriptor.model_id.clone(),
            port: descriptor.port,
        };

        if registry.is_active(&ready.model_id) {
            metrics::counter!("zoomux_requests_total", "outcome" => "hit").increment(1);
            return Ok(ready);
        }

        debug!(model = %ready.model_id, "Model not active, waiting for swap");
        let started = Instant::now();
        let swap = self.orchestrator.switch_to(&ready.model_id);
        let result = match self.request_timeout {
            // Dropping `swap` only detaches this caller; the attempt keeps going.
            Some(timeout) => match tokio::time::timeout(timeout, swap).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(model = %ready.model_id, timeout = ?timeout, "Gave up waiting for swap");
                    Err(SwapError::RequestTimeout)
                }
            },
            None => swap.await,
        };
        metrics::histogram!("zoomux_request_wait_seconds").record(started.elapsed().as_secs_f64());

        let outcome = match &result {
            Ok(()) => "swapped",
            Err(e) => e.code(),
        };
        metrics::counter!("zoomux_requests_total", "outcome" => outcome).increment(1);

        result.map(|()| ready)
    }
}
