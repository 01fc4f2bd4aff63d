//! Metrics module for the coalescing proxy
//!
//! Provides Prometheus metrics for monitoring and observability.

pub mod prometheus;

// Re-export commonly used items
pub use self::prometheus::{
    encode_metrics, record_fanout, record_timeout, record_upstream_call, register_metrics,
    set_backend_healthy, set_pending, RequestMode, RequestTimer,
};
