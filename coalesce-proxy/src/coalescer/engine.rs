//! Caller-facing coalescing engine.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::config::CoalescerConfig;
use super::dispatch::{dispatch, DispatchOutcome};
use super::group::{self, CoalescedResponse, UpstreamResult, Waiter};
use super::key::RequestKey;
use super::metrics::CoalescerMetrics;
use super::registry::PendingRegistry;
use super::scheduler::{FlushScheduler, SchedulerHandle};
use crate::metrics as prom;

/// Error types for a coalesced wait
#[derive(Debug, thiserror::Error)]
pub enum CoalesceError {
    #[error("No response after waiting {waited:?}")]
    Timeout { waited: Duration },

    #[error("Group for {key} was dropped before delivering a response")]
    Dropped { key: RequestKey },
}

/// Request coalescer: registry, flush and dispatch behind one handle
pub struct Coalescer {
    config: CoalescerConfig,
    registry: PendingRegistry,
    metrics: Arc<CoalescerMetrics>,
}

impl Coalescer {
    pub fn new(config: CoalescerConfig) -> Self {
        Self::with_metrics(config, Arc::new(CoalescerMetrics::new()))
    }

    pub fn with_metrics(config: CoalescerConfig, metrics: Arc<CoalescerMetrics>) -> Self {
        Self { config, registry: PendingRegistry::new(), metrics }
    }

    /// Start the periodic flush loop for this coalescer
    #[must_use = "dropping the handle detaches the loop; keep it to shut down with a final flush"]
    pub fn start(self: &Arc<Self>) -> SchedulerHandle {
        FlushScheduler::spawn(self.clone())
    }

    pub fn config(&self) -> &CoalescerConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<CoalescerMetrics> {
        &self.metrics
    }

    pub fn registry(&self) -> &PendingRegistry {
        &self.registry
    }

    /// Register interest in `key` and wait for the group's result.
    ///
    /// `invoke` runs only if this caller opens the group; callers joining an
    /// existing group share the first caller's upstream call.
    pub async fn handle<F, Fut>(
        &self,
        key: RequestKey,
        invoke: F,
    ) -> Result<CoalescedResponse, CoalesceError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = UpstreamResult> + Send + 'static,
    {
        let registration = self.registry.register(key, group::invoker(invoke)).await;
        self.metrics.record_registered(registration.created);
        self.wait(registration.waiter).await
    }

    async fn wait(&self, waiter: Waiter) -> Result<CoalescedResponse, CoalesceError> {
        let key = waiter.key.clone();

        let Some(limit) = self.config.wait_timeout else {
            return waiter.recv().await.ok_or(CoalesceError::Dropped { key });
        };

        match tokio::time::timeout(limit, waiter.recv()).await {
            Ok(Some(response)) => Ok(response),
            Ok(None) => Err(CoalesceError::Dropped { key }),
            Err(_) => {
                // Dropping the receiver closes this waiter's slot; the next
                // drain prunes it so the group only counts live callers.
                self.metrics.record_timeout();
                prom::record_timeout();
                warn!(
                    key = %key,
                    waited_ms = limit.as_millis() as u64,
                    "Coalesced request timed out"
                );
                Err(CoalesceError::Timeout { waited: limit })
            }
        }
    }

    /// Drain every pending group and dispatch each one on its own task.
    ///
    /// Returns without waiting for the dispatches; use [`FlushHandle::join`]
    /// to wait for them.
    pub async fn flush(&self) -> FlushHandle {
        let (groups, pruned) = self.registry.drain_all().await;
        self.metrics.record_tick();

        if pruned > 0 {
            self.metrics.record_delivered(0, pruned);
            debug!(pruned, "Pruned abandoned waiters");
        }

        let handles = groups
            .into_iter()
            .map(|group| {
                let metrics = self.metrics.clone();
                tokio::spawn(async move { dispatch(group, &metrics).await })
            })
            .collect();

        FlushHandle { handles }
    }
}

/// Dispatches started by one flush
pub struct FlushHandle {
    handles: Vec<JoinHandle<DispatchOutcome>>,
}

impl FlushHandle {
    /// Number of groups dispatched
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Wait for every dispatch of this flush to finish
    pub async fn join(self) -> Vec<DispatchOutcome> {
        let mut outcomes = Vec::with_capacity(self.handles.len());
        for handle in self.handles {
            match handle.await {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => warn!(error = %e, "Dispatch task did not complete"),
            }
        }
        outcomes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProxyError;
    use axum::http::StatusCode;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn wait_for_waiters(coalescer: &Coalescer, key: &RequestKey, expected: usize) {
        while coalescer.registry().waiter_count(key).await < expected {
            tokio::task::yield_now().await;
        }
    }

    fn spawn_caller(
        coalescer: &Arc<Coalescer>,
        key: &'static str,
        calls: &Arc<AtomicUsize>,
        body: &'static str,
    ) -> JoinHandle<Result<CoalescedResponse, CoalesceError>> {
        let coalescer = coalescer.clone();
        let calls = calls.clone();
        tokio::spawn(async move {
            coalescer
                .handle(RequestKey::new(key), move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(CoalescedResponse::new(StatusCode::OK, body))
                })
                .await
        })
    }

    #[tokio::test]
    async fn test_single_upstream_call_for_identical_requests() {
        let coalescer = Arc::new(Coalescer::new(CoalescerConfig::default()));
        let calls = Arc::new(AtomicUsize::new(0));
        let key = RequestKey::new("/get");

        let callers: Vec<_> =
            (0..5).map(|_| spawn_caller(&coalescer, "/get", &calls, "OK")).collect();
        wait_for_waiters(&coalescer, &key, 5).await;

        let outcomes = coalescer.flush().await.join().await;
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].delivered, 5);

        for caller in callers {
            let response = caller.await.unwrap().unwrap();
            assert_eq!(response, CoalescedResponse::new(StatusCode::OK, "OK"));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(coalescer.registry().is_empty().await);
    }

    #[tokio::test]
    async fn test_distinct_identities_fan_out_separately() {
        let coalescer = Arc::new(Coalescer::new(CoalescerConfig::default()));
        let calls = Arc::new(AtomicUsize::new(0));

        let gets: Vec<_> =
            (0..2).map(|_| spawn_caller(&coalescer, "/get", &calls, "get")).collect();
        let post = spawn_caller(&coalescer, "/post", &calls, "post");
        wait_for_waiters(&coalescer, &RequestKey::new("/get"), 2).await;
        wait_for_waiters(&coalescer, &RequestKey::new("/post"), 1).await;

        let mut outcomes = coalescer.flush().await.join().await;
        outcomes.sort_by(|a, b| a.key.cmp(&b.key));

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(outcomes[0].key, RequestKey::new("/get"));
        assert_eq!(outcomes[0].delivered, 2);
        assert_eq!(outcomes[1].key, RequestKey::new("/post"));
        assert_eq!(outcomes[1].delivered, 1);

        for get in gets {
            assert_eq!(get.await.unwrap().unwrap().body, "get");
        }
        assert_eq!(post.await.unwrap().unwrap().body, "post");
    }

    #[tokio::test]
    async fn test_caller_after_drain_waits_for_next_flush() {
        let coalescer = Arc::new(Coalescer::new(CoalescerConfig::default()));
        let calls = Arc::new(AtomicUsize::new(0));
        let key = RequestKey::new("/get");

        let early = spawn_caller(&coalescer, "/get", &calls, "OK");
        wait_for_waiters(&coalescer, &key, 1).await;

        let first_flush = coalescer.flush().await;

        let late = spawn_caller(&coalescer, "/get", &calls, "OK");
        wait_for_waiters(&coalescer, &key, 1).await;

        let outcomes = first_flush.join().await;
        assert_eq!(outcomes[0].delivered, 1);
        assert!(early.await.unwrap().is_ok());
        assert!(!late.is_finished());
        assert_eq!(coalescer.registry().waiter_count(&key).await, 1);

        let outcomes = coalescer.flush().await.join().await;
        assert_eq!(outcomes[0].delivered, 1);
        assert!(late.await.unwrap().is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failure_is_contained_to_its_group() {
        let coalescer = Arc::new(Coalescer::new(CoalescerConfig::default()));
        let calls = Arc::new(AtomicUsize::new(0));

        let failing = {
            let coalescer = coalescer.clone();
            tokio::spawn(async move {
                coalescer
                    .handle(RequestKey::new("/a"), || async {
                        Err(ProxyError::UpstreamConnection("connection reset".into()))
                    })
                    .await
            })
        };
        let healthy = spawn_caller(&coalescer, "/b", &calls, "OK");
        wait_for_waiters(&coalescer, &RequestKey::new("/a"), 1).await;
        wait_for_waiters(&coalescer, &RequestKey::new("/b"), 1).await;

        coalescer.flush().await.join().await;

        assert_eq!(failing.await.unwrap().unwrap().status, StatusCode::BAD_GATEWAY);
        assert_eq!(healthy.await.unwrap().unwrap().status, StatusCode::OK);
        assert_eq!(coalescer.metrics().snapshot().upstream_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_caller_is_not_counted_at_dispatch() {
        let config = CoalescerConfig::default().with_wait_timeout(Duration::from_millis(50));
        let coalescer = Arc::new(Coalescer::new(config));
        let calls = Arc::new(AtomicUsize::new(0));

        let caller = spawn_caller(&coalescer, "/get", &calls, "OK");

        let result = caller.await.unwrap();
        assert!(matches!(result, Err(CoalesceError::Timeout { .. })));

        let outcomes = coalescer.flush().await.join().await;
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].waiters, 0);
        assert!(!outcomes[0].upstream_called);
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let snapshot = coalescer.metrics().snapshot();
        assert_eq!(snapshot.requests_timed_out, 1);
        assert_eq!(snapshot.waiters_abandoned, 1);
        assert_eq!(snapshot.empty_dispatches, 1);
    }

    #[tokio::test]
    async fn test_flush_of_empty_registry() {
        let coalescer = Coalescer::new(CoalescerConfig::default());
        let flush = coalescer.flush().await;
        assert!(flush.is_empty());
        assert!(flush.join().await.is_empty());
        assert_eq!(coalescer.metrics().snapshot().flush_ticks, 1);
    }
}
