//! Reverse proxy for forwarding requests to the active backend.

use crate::middleware::error_response;
use axum::body::Body;
use axum::extract::State;
use axum::http::{Request, Response, StatusCode, Uri};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use tracing::{debug, error};

/// Backend a proxied request goes to, set by the gate middleware as a
/// request extension.
#[derive(Debug, Clone)]
pub struct ProxyTarget {
    pub model_id: String,
    pub port: u16,
}

/// Shared state for the proxy handler.
#[derive(Clone)]
pub struct ProxyState {
    client: Client<HttpConnector, Body>,
}

impl Default for ProxyState {
    fn default() -> Self {
        let client = Client::builder(TokioExecutor::new()).build_http();
        Self { client }
    }
}

impl ProxyState {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Axum fallback handler that forwards requests to the backend named by the
/// [`ProxyTarget`] extension.
pub async fn proxy_handler(State(state): State<ProxyState>, req: Request<Body>) -> Response<Body> {
    let target = req.extensions().get::<ProxyTarget>().cloned();

    match target {
        Some(target) => match forward(state.client, req, target.port).await {
            Ok(resp) => resp,
            Err(e) => {
                error!(model = %target.model_id, port = target.port, error = %e, "Proxy error");
                error_response(
                    StatusCode::BAD_GATEWAY,
                    &format!("Backend error: {}", e),
                    "backend_unreachable",
                )
            }
        },
        None => error_response(
            StatusCode::NOT_FOUND,
            "No model specified in request",
            "model_not_specified",
        ),
    }
}

async fn forward(
    client: Client<HttpConnector, Body>,
    mut req: Request<Body>,
    port: u16,
) -> Result<Response<Body>, hyper_util::client::legacy::Error> {
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.to_string())
        .unwrap_or_else(|| "/".to_string());

    let uri: Uri = format!("http://127.0.0.1:{}{}", port, path_and_query)
        .parse()
        .expect("valid proxy URI");
    debug!(uri = %uri, "Forwarding request");

    *req.uri_mut() = uri;
    req.headers_mut().remove("host");
    // The body was re-buffered by the middleware; let hyper recompute framing.
    req.headers_mut().remove("content-length");
    req.headers_mut().remove("transfer-encoding");

    let resp = client.request(req).await?;
    let (parts, body) = resp.into_parts();
    Ok(Response::from_parts(parts, Body::new(body)))
}
