//! Coalescing proxy - collapses concurrent identical requests into one
//! upstream call.
//!
//! ## Quick Start
//!
//! ```bash
//! # Start with defaults (port 8080, upstream https://httpbin.org, 3s window)
//! coalesce-proxy
//!
//! # Custom configuration
//! COALESCE_UPSTREAM_URL=http://localhost:9000 COALESCE_FLUSH_INTERVAL_MS=100 coalesce-proxy
//! ```
//!
//! Five clients fetching `GET /get` within the same window receive the same
//! response while the upstream sees a single request.

use coalesce_proxy::{run_server, ServerConfig};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServerConfig::from_env();

    // Initialize logging
    let default_filter = if config.proxy.verbose {
        "coalesce_proxy=debug,tower_http=debug"
    } else {
        "coalesce_proxy=info,tower_http=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();

    run_server(config).await
}
