//! Forwarding handler.
//!
//! Catch-all route that relays a request to the upstream. Behind the
//! coalescing middleware it only runs once per group.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderMap, Method, Uri},
    response::IntoResponse,
};
use tracing::debug;

use crate::error::ProxyError;
use crate::state::AppState;

/// Forward the request to the upstream and return its response verbatim.
///
/// ANY /*
pub async fn forward(
    State(state): State<Arc<AppState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, ProxyError> {
    let target = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    debug!(method = %method, target = %target, "Forwarding request");

    let content_type = headers.get(header::CONTENT_TYPE).cloned();
    let response = state.upstream.forward(method, target, content_type, body).await?;

    Ok(response)
}
