//! HTTP surface: admission middleware and the demo route it guards.

mod middleware;
mod server;

pub use middleware::{admission, client_identifier};
pub use server::HttpServer;

use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use std::sync::Arc;

use crate::ratelimit::Admission;

#[derive(Debug, Serialize)]
struct HelloResponse {
    message: &'static str,
}

async fn hello() -> Json<HelloResponse> {
    Json(HelloResponse {
        message: "Hello, World!!",
    })
}

/// Build the application router with every route behind [`admission`].
pub fn router(limiter: Arc<dyn Admission>) -> Router {
    Router::new()
        .route("/hello", get(hello))
        .layer(axum::middleware::from_fn_with_state(limiter, admission))
}
