//! Coalescing middleware.
//!
//! Wraps the forwarding handler. Coalescible requests are keyed and parked
//! in the coalescer until the next flush; the first caller's request runs
//! the inner handler and its captured response is replayed to every caller
//! of the group. Other methods go straight through.

use std::sync::Arc;

use axum::{
    body::{self, Body},
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::{debug, warn};

use crate::coalescer::{CoalescedResponse, Coalescer, RequestKey, UpstreamResult};
use crate::error::ProxyError;
use crate::metrics::{RequestMode, RequestTimer};

/// Coalesce identical requests into one run of the inner handler.
pub async fn coalesce_requests(
    State(coalescer): State<Arc<Coalescer>>,
    request: Request,
    next: Next,
) -> Response {
    let metrics = coalescer.metrics();
    metrics.record_received();
    let config = coalescer.config();

    if !config.is_coalescible(request.method()) {
        metrics.record_bypassed();
        debug!(method = %request.method(), uri = %request.uri(), "Bypassing coalescer");

        let timer = RequestTimer::new(RequestMode::Bypass);
        let response = next.run(request).await;
        timer.finish(response.status());
        return response;
    }

    let key = match RequestKey::from_request(request.method(), request.uri(), config) {
        Ok(key) => key,
        Err(e) => {
            metrics.record_rejected();
            warn!(uri = %request.uri(), error = %e, "Rejecting request");

            let timer = RequestTimer::new(RequestMode::Rejected);
            let response = ProxyError::from(e).into_response();
            timer.finish(response.status());
            return response;
        }
    };

    let timer = RequestTimer::new(RequestMode::Coalesced);
    let limit = config.max_body_bytes;

    let response = match coalescer.handle(key, move || capture(next, request, limit)).await {
        Ok(result) => result.into_response(),
        Err(e) => ProxyError::from(e).into_response(),
    };

    timer.finish(response.status());
    response
}

/// Run the inner handler and buffer its response for replay.
async fn capture(next: Next, request: Request<Body>, limit: usize) -> UpstreamResult {
    let response = next.run(request).await;
    let (parts, body) = response.into_parts();

    let body = body::to_bytes(body, limit)
        .await
        .map_err(|e| ProxyError::Upstream(format!("failed to buffer response body: {}", e)))?;

    let mut captured = CoalescedResponse::new(parts.status, body);
    if let Some(content_type) = parts.headers.get(header::CONTENT_TYPE) {
        captured = captured.with_content_type(content_type.clone());
    }
    Ok(captured)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coalescer::CoalescerConfig;
    use axum::{
        handler::Handler,
        http::{Method, StatusCode},
        middleware::from_fn_with_state,
        Router,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tower::ServiceExt;

    fn app(coalescer: Arc<Coalescer>, hits: Arc<AtomicUsize>) -> Router {
        let handler = move |request: Request| {
            let hits = hits.clone();
            async move {
                let n = hits.fetch_add(1, Ordering::SeqCst) + 1;
                (
                    [(header::CONTENT_TYPE, "application/json")],
                    format!("{{\"uri\":\"{}\",\"hit\":{}}}", request.uri(), n),
                )
            }
        };

        Router::new().fallback(handler.layer(from_fn_with_state(coalescer, coalesce_requests)))
    }

    fn request(method: Method, uri: &str) -> Request {
        axum::http::Request::builder().method(method).uri(uri).body(Body::empty()).unwrap()
    }

    async fn body_string(response: Response) -> String {
        let bytes = body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_gets_share_one_handler_run() {
        let config = CoalescerConfig::default().with_flush_interval(Duration::from_millis(100));
        let coalescer = Arc::new(Coalescer::new(config));
        let scheduler = coalescer.start();
        let hits = Arc::new(AtomicUsize::new(0));
        let app = app(coalescer.clone(), hits.clone());

        let responses = futures::future::join_all(
            (0..5).map(|_| app.clone().oneshot(request(Method::GET, "/get"))),
        )
        .await;

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        for response in responses {
            let response = response.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(response.headers()[header::CONTENT_TYPE], "application/json");
            assert_eq!(body_string(response).await, "{\"uri\":\"/get\",\"hit\":1}");
        }

        let snapshot = coalescer.metrics().snapshot();
        assert_eq!(snapshot.requests_received, 5);
        assert_eq!(snapshot.groups_created, 1);
        assert_eq!(snapshot.requests_coalesced, 4);

        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_post_bypasses_coalescer() {
        let coalescer = Arc::new(Coalescer::new(CoalescerConfig::default()));
        let hits = Arc::new(AtomicUsize::new(0));
        let app = app(coalescer.clone(), hits.clone());

        // No scheduler is running: a coalesced request would never complete.
        let response = app.clone().oneshot(request(Method::POST, "/post")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let response = app.oneshot(request(Method::POST, "/post")).await.unwrap();
        assert_eq!(body_string(response).await, "{\"uri\":\"/post\",\"hit\":2}");

        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(coalescer.metrics().snapshot().requests_bypassed, 2);
        assert!(coalescer.registry().is_empty().await);
    }

    #[tokio::test]
    async fn test_overlong_key_is_rejected() {
        let config = CoalescerConfig { max_key_len: 16, ..CoalescerConfig::default() };
        let coalescer = Arc::new(Coalescer::new(config));
        let hits = Arc::new(AtomicUsize::new(0));
        let app = app(coalescer.clone(), hits.clone());

        let response = app
            .oneshot(request(Method::GET, "/a/very/long/path/indeed"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::URI_TOO_LONG);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(coalescer.metrics().snapshot().requests_rejected, 1);
        assert!(coalescer.registry().is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_timeout_returns_gateway_timeout() {
        let config = CoalescerConfig::default()
            .with_flush_interval(Duration::from_secs(10))
            .with_wait_timeout(Duration::from_millis(200));
        let coalescer = Arc::new(Coalescer::new(config));
        let hits = Arc::new(AtomicUsize::new(0));
        let app = app(coalescer.clone(), hits.clone());

        let response = app.oneshot(request(Method::GET, "/slow")).await.unwrap();
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);

        let outcomes = coalescer.flush().await.join().await;
        assert_eq!(outcomes[0].waiters, 0);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }
}
