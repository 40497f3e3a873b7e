//! Admission middleware.

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, error, warn};

use crate::ratelimit::Admission;

/// Pick the identifier a request is limited by.
///
/// Prefers the first non-empty `X-Forwarded-For` entry, then `X-Real-IP`,
/// then the peer address of the connection.
pub fn client_identifier(headers: &HeaderMap, peer: Option<SocketAddr>) -> Option<String> {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
    };

    header("x-forwarded-for")
        .and_then(|list| list.split(',').map(str::trim).find(|ip| !ip.is_empty()))
        .or_else(|| header("x-real-ip").filter(|ip| !ip.is_empty()))
        .map(str::to_string)
        .or_else(|| peer.map(|addr| addr.ip().to_string()))
}

fn reject(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

/// Run the request only if the limiter admits its identifier.
///
/// Denied requests get 429; store errors that reach this layer get 503.
pub async fn admission(
    State(limiter): State<Arc<dyn Admission>>,
    req: Request,
    next: Next,
) -> Response {
    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0);

    let Some(identifier) = client_identifier(req.headers(), peer) else {
        warn!("Could not determine a client identifier");
        return reject(StatusCode::FORBIDDEN, "unable to identify client");
    };

    match limiter.allow(&identifier).await {
        Ok(true) => next.run(req).await,
        Ok(false) => {
            debug!(key = %identifier, "Request rejected by rate limiter");
            reject(StatusCode::TOO_MANY_REQUESTS, "rate limit exceeded")
        }
        Err(e) => {
            error!(key = %identifier, error = %e, "Rate limiter failed");
            reject(StatusCode::SERVICE_UNAVAILABLE, "rate limiter unavailable")
        }
    }
}
