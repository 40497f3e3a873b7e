//! HTTP server implementation.

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

use super::router;
use crate::error::{Result, SlidelogError};
use crate::ratelimit::Admission;

/// HTTP server with every route behind the admission middleware.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    /// The admission decision maker
    limiter: Arc<dyn Admission>,
}

impl HttpServer {
    /// Create a new HTTP server.
    pub fn new(addr: SocketAddr, limiter: Arc<dyn Admission>) -> Self {
        Self { addr, limiter }
    }

    /// Start the HTTP server with graceful shutdown.
    ///
    /// The server will shut down when the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.addr).await?;
        info!(addr = %self.addr, "HTTP server listening");

        let app = router(self.limiter);
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .await
        .map_err(|e| {
            error!(error = %e, "HTTP server failed");
            SlidelogError::Io(e)
        })
    }
}
