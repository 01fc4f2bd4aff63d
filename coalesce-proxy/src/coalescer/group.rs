//! Coalescing groups and the response they fan out.

use std::fmt;
use std::future::Future;
use std::time::{Duration, Instant};

use axum::{
    body::Body,
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt};
use tokio::sync::oneshot;

use super::key::RequestKey;
use crate::error::ProxyError;

/// Outcome of one upstream invocation
pub type UpstreamResult = Result<CoalescedResponse, ProxyError>;

/// Capability that performs the real upstream call for a group.
/// Captured from the first caller and run at most once.
pub type UpstreamInvoker = Box<dyn FnOnce() -> BoxFuture<'static, UpstreamResult> + Send>;

/// Box a closure producing the upstream call as an [`UpstreamInvoker`]
pub fn invoker<F, Fut>(f: F) -> UpstreamInvoker
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = UpstreamResult> + Send + 'static,
{
    Box::new(move || f().boxed())
}

/// Response replayed verbatim to every waiter of a group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoalescedResponse {
    pub status: StatusCode,
    pub body: Bytes,
    pub content_type: Option<HeaderValue>,
}

impl CoalescedResponse {
    pub fn new(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self { status, body: body.into(), content_type: None }
    }

    pub fn with_content_type(mut self, content_type: HeaderValue) -> Self {
        self.content_type = Some(content_type);
        self
    }

    /// Failure-shaped result handed to waiters when the upstream call fails
    pub fn failure(status: StatusCode, message: impl fmt::Display) -> Self {
        Self::new(status, format!("upstream request failed: {}", message))
            .with_content_type(HeaderValue::from_static("text/plain; charset=utf-8"))
    }
}

impl IntoResponse for CoalescedResponse {
    fn into_response(self) -> Response {
        let mut response = Response::new(Body::from(self.body));
        *response.status_mut() = self.status;
        if let Some(content_type) = self.content_type {
            response.headers_mut().insert(header::CONTENT_TYPE, content_type);
        }
        response
    }
}

/// Receiving side held by one caller
pub struct Waiter {
    pub key: RequestKey,
    rx: oneshot::Receiver<CoalescedResponse>,
}

impl Waiter {
    /// Wait for the group's result. `None` when the group was dropped
    /// without delivering. Dropping the future abandons the slot.
    pub async fn recv(self) -> Option<CoalescedResponse> {
        self.rx.await.ok()
    }
}

/// Callers waiting on the same request key within one flush window
pub struct CoalescingGroup {
    key: RequestKey,
    invoker: UpstreamInvoker,
    waiters: Vec<oneshot::Sender<CoalescedResponse>>,
    created_at: Instant,
}

impl CoalescingGroup {
    /// Create a group whose first waiter is the creating caller
    pub fn new(key: RequestKey, invoker: UpstreamInvoker) -> (Self, Waiter) {
        let mut group =
            Self { key, invoker, waiters: Vec::with_capacity(1), created_at: Instant::now() };
        let waiter = group.join();
        (group, waiter)
    }

    /// Add a waiter to this group
    pub fn join(&mut self) -> Waiter {
        let (tx, rx) = oneshot::channel();
        self.waiters.push(tx);
        Waiter { key: self.key.clone(), rx }
    }

    pub fn key(&self) -> &RequestKey {
        &self.key
    }

    /// Number of deliveries currently owed
    pub fn waiter_count(&self) -> usize {
        self.waiters.len()
    }

    /// Time since the group was created
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Drop waiters whose receiver is gone (deadline expired or the caller
    /// was cancelled). Returns how many were removed.
    pub fn prune_abandoned(&mut self) -> usize {
        let before = self.waiters.len();
        self.waiters.retain(|tx| !tx.is_closed());
        before - self.waiters.len()
    }

    pub(crate) fn into_parts(
        self,
    ) -> (RequestKey, UpstreamInvoker, Vec<oneshot::Sender<CoalescedResponse>>) {
        (self.key, self.invoker, self.waiters)
    }
}

impl fmt::Debug for CoalescingGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoalescingGroup")
            .field("key", &self.key)
            .field("waiters", &self.waiters.len())
            .field("age", &self.age())
            .finish()
    }
}
