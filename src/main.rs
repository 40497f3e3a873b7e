use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use slidelog::clock::{Clock, SystemClock};
use slidelog::config::{LoggingConfig, SlidelogConfig, StoreBackend};
use slidelog::http::HttpServer;
use slidelog::ratelimit::{Admission, FailurePolicyLimiter, RateLimiter};
use slidelog::store::{EventStore, InMemoryEventStore, RedisEventStore, RedisEventStoreConfig};

/// Sliding-window-log rate limiting service.
#[derive(Parser, Debug)]
#[command(name = "slidelog", version, about)]
struct Args {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// HTTP listen address (overrides the configuration)
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Event store backend (overrides the configuration)
    #[arg(long, value_enum)]
    backend: Option<StoreBackend>,

    /// Redis URL (overrides the configuration)
    #[arg(long)]
    redis_url: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = SlidelogConfig::load(args.config.as_deref())?;
    if let Some(listen) = args.listen {
        config.server.http_addr = listen;
    }
    if let Some(backend) = args.backend {
        config.store.backend = backend;
    }
    if let Some(redis_url) = args.redis_url {
        config.store.redis_url = redis_url;
    }

    init_tracing(&config.logging);

    info!("Starting Slidelog Rate Limiting Service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!(
        http_addr = %config.server.http_addr,
        backend = ?config.store.backend,
        window_ms = config.rate_limiting.window_ms,
        limit = config.rate_limiting.limit,
        "Configuration loaded"
    );

    let window = config.rate_limiting.window_config()?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());

    // The store is built once here and handed to everything that needs it.
    let store: Arc<dyn EventStore> = match config.store.backend {
        StoreBackend::Redis => {
            let store_config = RedisEventStoreConfig {
                key_prefix: config.store.key_prefix.clone(),
                response_timeout: config.store.response_timeout(),
            };
            let store =
                RedisEventStore::connect_with_config(&config.store.redis_url, store_config)
                    .await?;
            Arc::new(store)
        }
        StoreBackend::Memory => {
            let store = Arc::new(InMemoryEventStore::new(Arc::clone(&clock)));
            Arc::clone(&store).spawn_purger(window.window());
            store
        }
    };
    store.ping().await?;
    info!("Event store reachable");

    let limiter =
        RateLimiter::with_count_mode(window, clock, store, config.rate_limiting.count_mode)?;
    info!(mode = ?limiter.count_mode(), "Rate limiter initialized");

    let admission: Arc<dyn Admission> = Arc::new(FailurePolicyLimiter::new(
        limiter,
        config.rate_limiting.failure_policy,
    ));

    HttpServer::new(config.server.http_addr, admission)
        .serve_with_shutdown(shutdown_signal())
        .await?;

    info!("Slidelog Rate Limiting Service stopped");
    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    if logging.json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
