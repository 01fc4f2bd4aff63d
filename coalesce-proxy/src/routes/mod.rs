//! HTTP route handlers for the coalescing proxy.
//!
//! This module organizes all route handlers:
//! - `health`: Health check and metrics endpoints
//! - `forward`: Catch-all forwarding to the upstream

pub mod forward;
pub mod health;

// Re-export handlers for convenience
pub use forward::forward;
pub use health::{health, live, metrics, metrics_prometheus, ready};
