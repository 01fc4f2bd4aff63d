//! Coalescing HTTP proxy library.
//!
//! Concurrent identical requests arriving within one flush window are
//! collapsed into a single upstream call whose response is replayed to
//! every caller.
//!
//! The core lives in [`coalescer`] and has no HTTP dependency beyond the
//! response type; [`middleware`] and [`routes`] put it in front of an
//! upstream reached through [`upstream::UpstreamClient`].

use axum::{handler::Handler, middleware::from_fn_with_state, routing::get, Router};
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};

pub mod coalescer;
pub mod error;
pub mod metrics;
pub mod middleware;
pub mod routes;
pub mod state;
pub mod upstream;

pub use coalescer::{Coalescer, CoalescerConfig};
pub use state::{AppState, ProxyConfig};

/// Server configuration for the proxy
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Proxy and coalescer settings
    pub proxy: ProxyConfig,
    /// Whether to print the banner on startup
    pub print_banner: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { proxy: ProxyConfig::default(), print_banner: true }
    }
}

impl ServerConfig {
    /// Create config from environment variables
    pub fn from_env() -> Self {
        Self { proxy: ProxyConfig::from_env(), ..Self::default() }
    }
}

/// Initialize Prometheus metrics registry.
/// Should be called once before starting the server.
pub fn init_metrics() {
    if let Err(e) = metrics::register_metrics() {
        warn!("Failed to register Prometheus metrics: {}", e);
    }
}

/// Build the proxy router.
///
/// Health and metrics routes are served directly; every other request goes
/// through the coalescing middleware to the forwarding handler.
pub fn build_router(state: Arc<AppState>) -> Router {
    let forward = routes::forward.layer(from_fn_with_state(
        state.coalescer.clone(),
        middleware::coalesce_requests,
    ));

    Router::new()
        // Health endpoints
        .route("/health", get(routes::health))
        .route("/ready", get(routes::ready))
        .route("/live", get(routes::live))
        .route("/metrics", get(routes::metrics))
        .route("/metrics/prometheus", get(routes::metrics_prometheus))
        // Everything else is proxied
        .fallback(forward)
        // Middleware
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the coalescing proxy server.
///
/// Starts the flush scheduler and the HTTP server, and blocks until a
/// shutdown signal arrives. Callers still waiting at shutdown are served by
/// a final flush before this returns.
///
/// # Example
/// ```no_run
/// use coalesce_proxy::{run_server, ServerConfig};
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     run_server(ServerConfig::from_env()).await
/// }
/// ```
pub async fn run_server(config: ServerConfig) -> anyhow::Result<()> {
    // Initialize Prometheus metrics
    init_metrics();

    let proxy_config = config.proxy.clone();

    info!(
        port = proxy_config.port,
        upstream_url = %proxy_config.upstream_url,
        flush_interval_ms = proxy_config.coalescer.effective_flush_interval().as_millis() as u64,
        "Starting coalescing proxy v{}",
        env!("CARGO_PKG_VERSION")
    );

    // Create application state
    let state = Arc::new(AppState::new(proxy_config.clone())?);

    // Check upstream connectivity
    match state.upstream.health_check().await {
        Ok(_) => {
            metrics::set_backend_healthy(true);
            info!("Connected to upstream at {}", proxy_config.upstream_url);
        }
        Err(e) => {
            metrics::set_backend_healthy(false);
            warn!(
                "Could not reach upstream at {}: {}. \
                 Proxy will start anyway and retry on requests.",
                proxy_config.upstream_url, e
            );
        }
    }

    let scheduler = state.coalescer.start();
    let app = build_router(state.clone());

    // Start server
    let addr = format!("0.0.0.0:{}", proxy_config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!("Coalescing proxy listening on http://{}", addr);
    info!("Health:     http://{}/health", addr);

    if config.print_banner {
        print_banner(&config, &state);
    }

    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;

    info!("Server stopped, flushing pending requests");
    scheduler.shutdown().await;

    Ok(())
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C");
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
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}

/// Print the startup banner
fn print_banner(config: &ServerConfig, state: &Arc<AppState>) {
    let addr = format!("0.0.0.0:{}", config.proxy.port);
    let coalescer = state.coalescer.config();

    println!();
    println!("==================================================");
    println!("  Coalescing Proxy v{}", env!("CARGO_PKG_VERSION"));
    println!("==================================================");
    println!("  Listening on: http://{}", addr);
    println!(
        "  Upstream: {} (timeout {}s)",
        state.upstream.base_url(),
        config.proxy.upstream_timeout.as_secs()
    );
    println!();
    println!("  Coalescer configuration:");
    println!("    Flush interval: {}ms", coalescer.effective_flush_interval().as_millis());
    match coalescer.wait_timeout {
        Some(timeout) => println!("    Wait timeout: {}ms", timeout.as_millis()),
        None => println!("    Wait timeout: none"),
    }
    println!(
        "    Methods: {}",
        coalescer.methods.iter().map(|m| m.as_str()).collect::<Vec<_>>().join(", ")
    );
    println!(
        "    Query normalization: {}",
        if coalescer.normalize_query {
            "enabled"
        } else {
            "disabled"
        }
    );
    println!(
        "    Max body: {} bytes, max key: {} bytes",
        coalescer.max_body_bytes, coalescer.max_key_len
    );
    println!();
    println!("  Endpoints:");
    println!("    Proxy:  ANY  /*");
    println!("    Health: GET  /health, /ready, /live, /metrics");
    println!("    Prometheus: GET /metrics/prometheus");
    println!("==================================================");
    println!();
}
