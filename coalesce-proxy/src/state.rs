//! Application state for the coalescing proxy.

use std::sync::Arc;
use std::time::Duration;

use crate::coalescer::{Coalescer, CoalescerConfig};
use crate::error::ProxyError;
use crate::upstream::UpstreamClient;

/// Application state shared across all handlers
pub struct AppState {
    /// Upstream client used by the forwarding handler
    pub upstream: UpstreamClient,

    /// Coalescing engine shared with the middleware and the flush scheduler
    pub coalescer: Arc<Coalescer>,

    /// Configuration
    pub config: ProxyConfig,
}

impl AppState {
    /// Create new application state
    pub fn new(config: ProxyConfig) -> Result<Self, ProxyError> {
        let upstream = UpstreamClient::new(&config.upstream_url, config.upstream_timeout)?;
        let coalescer = Arc::new(Coalescer::new(config.coalescer.clone()));

        Ok(Self { upstream, coalescer, config })
    }
}

/// Proxy configuration
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Port to listen on
    pub port: u16,

    /// Upstream base URL
    pub upstream_url: String,

    /// Timeout for a single upstream request
    pub upstream_timeout: Duration,

    /// Enable verbose logging
    pub verbose: bool,

    /// Coalescing settings
    pub coalescer: CoalescerConfig,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            upstream_url: "https://httpbin.org".to_string(),
            upstream_timeout: Duration::from_secs(30),
            verbose: false,
            coalescer: CoalescerConfig::default(),
        }
    }
}

impl ProxyConfig {
    /// Create config from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            port: std::env::var("COALESCE_PORT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.port),
            upstream_url: std::env::var("COALESCE_UPSTREAM_URL").unwrap_or(defaults.upstream_url),
            upstream_timeout: std::env::var("COALESCE_UPSTREAM_TIMEOUT_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.upstream_timeout),
            verbose: std::env::var("COALESCE_VERBOSE")
                .map(|v| v == "1" || v.to_lowercase() == "true")
                .unwrap_or(false),
            coalescer: CoalescerConfig::from_env(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ProxyConfig::default();
        assert_eq!(config.port, 8080);
        assert_eq!(config.upstream_url, "https://httpbin.org");
        assert_eq!(config.upstream_timeout, Duration::from_secs(30));
        assert_eq!(config.coalescer.flush_interval, Duration::from_secs(3));
    }

    #[test]
    fn test_state_shares_coalescer_config() {
        let config = ProxyConfig {
            coalescer: CoalescerConfig::low_latency(),
            ..ProxyConfig::default()
        };
        let state = AppState::new(config).unwrap();

        assert_eq!(state.upstream.base_url(), "https://httpbin.org");
        assert_eq!(state.coalescer.config().flush_interval, Duration::from_millis(50));
    }
}
