//! Error types for the coalescing proxy.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::coalescer::{CoalesceError, KeyError};

/// Proxy error types
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// Failed to connect to the upstream
    #[error("Failed to connect to upstream: {0}")]
    UpstreamConnection(String),

    /// Upstream failed while producing a response
    #[error("Upstream error: {0}")]
    Upstream(String),

    /// Request cannot be coalesced
    #[error("Invalid request: {0}")]
    InvalidRequest(#[from] KeyError),

    /// Waiting for a coalesced response failed
    #[error(transparent)]
    Coalesce(#[from] CoalesceError),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl ProxyError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::UpstreamConnection(_) => StatusCode::BAD_GATEWAY,
            ProxyError::Upstream(_) => StatusCode::BAD_GATEWAY,
            ProxyError::InvalidRequest(KeyError::TooLong { .. }) => StatusCode::URI_TOO_LONG,
            ProxyError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ProxyError::Coalesce(CoalesceError::Timeout { .. }) => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::Coalesce(CoalesceError::Dropped { .. }) => StatusCode::BAD_GATEWAY,
            ProxyError::Http(e) if e.is_timeout() => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::Http(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(json!({
            "error": {
                "message": self.to_string(),
                "type": format!("{:?}", self).split('(').next().unwrap_or("Unknown"),
            }
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coalescer::RequestKey;
    use std::time::Duration;

    #[test]
    fn test_status_codes() {
        assert_eq!(
            ProxyError::UpstreamConnection("refused".into()).status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ProxyError::from(KeyError::TooLong { len: 10, max: 5 }).status_code(),
            StatusCode::URI_TOO_LONG
        );
        assert_eq!(ProxyError::from(KeyError::MissingPath).status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(
            ProxyError::from(CoalesceError::Timeout { waited: Duration::from_secs(1) })
                .status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            ProxyError::from(CoalesceError::Dropped { key: RequestKey::new("/get") }).status_code(),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn test_into_response_status() {
        let response = ProxyError::from(KeyError::MissingPath).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
