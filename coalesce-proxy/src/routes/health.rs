//! Health check and metrics endpoints.

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};
use serde_json::json;
use std::sync::Arc;

use crate::metrics::{encode_metrics, set_backend_healthy, set_pending};
use crate::state::AppState;

/// Health check endpoint
///
/// GET /health
pub async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let result = state.upstream.health_check().await;
    set_backend_healthy(result.is_ok());

    match result {
        Ok(_) => (
            StatusCode::OK,
            Json(json!({
                "status": "healthy",
                "upstream": "connected",
                "version": env!("CARGO_PKG_VERSION")
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "unhealthy",
                "upstream": "disconnected",
                "error": e.to_string(),
                "version": env!("CARGO_PKG_VERSION")
            })),
        ),
    }
}

/// Metrics endpoint with coalescer configuration, pending work and totals
///
/// GET /metrics
pub async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let coalescer = &state.coalescer;
    let config = coalescer.config();
    let pending_groups = coalescer.registry().len().await;
    let pending_waiters = coalescer.registry().total_waiters().await;
    set_pending(pending_groups, pending_waiters);

    let snapshot = coalescer.metrics().snapshot();

    Json(json!({
        "upstream": {
            "url": state.upstream.base_url(),
            "timeout_secs": state.config.upstream_timeout.as_secs()
        },
        "coalescer": {
            "config": {
                "flush_interval_ms": config.effective_flush_interval().as_millis() as u64,
                "wait_timeout_ms": config.wait_timeout.map(|t| t.as_millis() as u64),
                "max_body_bytes": config.max_body_bytes,
                "normalize_query": config.normalize_query,
                "max_key_len": config.max_key_len,
                "methods": config.methods.iter().map(|m| m.as_str()).collect::<Vec<_>>()
            },
            "pending": {
                "groups": pending_groups,
                "waiters": pending_waiters
            },
            "totals": snapshot
        }
    }))
}

/// Prometheus text exposition
///
/// GET /metrics/prometheus
pub async fn metrics_prometheus() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        encode_metrics(),
    )
}

/// Ready check (for Kubernetes)
///
/// GET /ready
pub async fn ready(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let result = state.upstream.health_check().await;
    set_backend_healthy(result.is_ok());

    match result {
        Ok(_) => StatusCode::OK,
        Err(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

/// Live check (for Kubernetes)
///
/// GET /live
pub async fn live() -> impl IntoResponse {
    StatusCode::OK
}
