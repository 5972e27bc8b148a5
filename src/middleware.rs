//! Axum middleware layer that puts the request gate in front of the proxy.
//!
//! Reads the `model` field from the JSON body, waits until that model's
//! backend is the active one (swapping if needed) and tells the proxy which
//! port to forward to.

use crate::gate::RequestGate;
use crate::proxy::ProxyTarget;
use crate::types::SwapError;
use axum::body::Body;
use axum::http::{Request, Response, StatusCode};
use bytes::Bytes;
use futures_util::future::BoxFuture;
use http_body_util::BodyExt;
use std::task::{Context, Poll};
use tower::{Layer, Service};
use tracing::{debug, error, trace, warn};

/// Layer that routes every model request through a [`RequestGate`].
#[derive(Clone)]
pub struct SwapGateLayer {
    gate: RequestGate,
}

impl SwapGateLayer {
    pub fn new(gate: RequestGate) -> Self {
        Self { gate }
    }
}

impl<S> Layer<S> for SwapGateLayer {
    type Service = SwapGateService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        SwapGateService {
            gate: self.gate.clone(),
            inner,
        }
    }
}

#[derive(Clone)]
pub struct SwapGateService<S> {
    gate: RequestGate,
    inner: S,
}

impl<S> Service<Request<Body>> for SwapGateService<S>
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response<Body>;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let gate = self.gate.clone();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let (mut parts, body) = req.into_parts();

            let body_bytes = match body.collect().await {
                Ok(collected) => collected.to_bytes(),
                Err(e) => {
                    error!(error = %e, "Failed to read request body");
                    return Ok(error_response(
                        StatusCode::BAD_REQUEST,
                        "Failed to read request body",
                        "invalid_request",
                    ));
                }
            };

            let Some(model) = extract_model(&body_bytes) else {
                // The proxy answers requests without a model itself.
                trace!("No model in request, passing through");
                let req = Request::from_parts(parts, Body::from(body_bytes));
                return inner.call(req).await;
            };

            debug!(model = %model, "Extracted model from request");

            let ready = match gate.ensure_active(&model).await {
                Ok(ready) => ready,
                Err(e) => {
                    warn!(model = %model, error = %e, "Model could not be made active");
                    return Ok(swap_error_response(&e));
                }
            };

            parts.extensions.insert(ProxyTarget {
                model_id: ready.model_id,
                port: ready.port,
            });
            let req = Request::from_parts(parts, Body::from(body_bytes));
            inner.call(req).await
        })
    }
}

/// Extract model name from the JSON request body.
fn extract_model(body: &Bytes) -> Option<String> {
    if let Ok(json) = serde_json::from_slice::<serde_json::Value>(body)
        && let Some(model) = json.get("model").and_then(|v| v.as_str())
    {
        return Some(model.to_string());
    }

    None
}

/// HTTP status a swap failure is reported with.
pub fn status_for(error: &SwapError) -> StatusCode {
    match error {
        SwapError::ModelNotFound(_) => StatusCode::NOT_FOUND,
        SwapError::InsufficientMemory { .. } => StatusCode::INSUFFICIENT_STORAGE,
        SwapError::TerminationTimeout { .. } | SwapError::ShuttingDown => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        SwapError::LaunchFailure { .. } => StatusCode::BAD_GATEWAY,
        SwapError::HealthCheckTimeout { .. } | SwapError::RequestTimeout => {
            StatusCode::GATEWAY_TIMEOUT
        }
        SwapError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub(crate) fn error_response(status: StatusCode, message: &str, code: &str) -> Response<Body> {
    let body = serde_json::json!({
        "error": {
            "message": message,
            "type": "zoomux_error",
            "code": code,
        }
    });

    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn swap_error_response(error: &SwapError) -> Response<Body> {
    error_response(status_for(error), &error.to_string(), error.code())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_extract_model_from_body() {
        let body = Bytes::from(r#"{"model": "qwen3-8b", "messages": []}"#);
        assert_eq!(extract_model(&body), Some("qwen3-8b".to_string()));
    }

    #[test]
    fn test_extract_model_none() {
        assert_eq!(extract_model(&Bytes::from(r#"{"messages": []}"#)), None);
        assert_eq!(extract_model(&Bytes::from("not json")), None);
        assert_eq!(extract_model(&Bytes::from(r#"{"model": 7}"#)), None);
    }

    #[test]
    fn test_status_mapping() {
        let cases = [
            (SwapError::ModelNotFound("x".into()), 404),
            (
                SwapError::InsufficientMemory {
                    model: "x".into(),
                    detail: "needs 9 GB".into(),
                },
                507,
            ),
            (SwapError::TerminationTimeout { model: "x".into() }, 503),
            (
                SwapError::LaunchFailure {
                    model: "x".into(),
                    reason: "spawn".into(),
                },
                502,
            ),
            (
                SwapError::HealthCheckTimeout {
                    model: "x".into(),
                    timeout: Duration::from_secs(1),
                },
                504,
            ),
            (SwapError::RequestTimeout, 504),
            (SwapError::ShuttingDown, 503),
            (SwapError::Internal("x".into()), 500),
        ];
        for (error, status) in cases {
            assert_eq!(status_for(&error).as_u16(), status, "{:?}", error);
        }
    }

    #[tokio::test]
    async fn test_error_body_carries_code() {
        let response = swap_error_response(&SwapError::RequestTimeout);
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"]["type"], "zoomux_error");
        assert_eq!(json["error"]["code"], "request_timeout");
    }
}
