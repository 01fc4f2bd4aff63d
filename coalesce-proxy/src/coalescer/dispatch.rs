//! Dispatcher: one upstream call per group, fanned out to every waiter.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::time::{Duration, Instant};

use axum::http::StatusCode;
use futures::FutureExt;
use tracing::{debug, error, info, warn};

use super::group::{CoalescedResponse, CoalescingGroup};
use super::key::RequestKey;
use super::metrics::CoalescerMetrics;
use crate::metrics as prom;

/// What happened to a single dispatched group
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    pub key: RequestKey,
    /// Waiters counted when the group was drained
    pub waiters: usize,
    /// Results handed to a live receiver
    pub delivered: usize,
    /// Waiters whose receiver was gone at delivery time
    pub abandoned: usize,
    pub upstream_called: bool,
    pub upstream_failed: bool,
    /// Time spent in the upstream call
    pub elapsed: Duration,
}

/// Run the upstream call of `group` once and deliver the result to each of
/// its waiters. Upstream errors and panics become a 502 result for this
/// group only.
pub async fn dispatch(group: CoalescingGroup, metrics: &CoalescerMetrics) -> DispatchOutcome {
    let (key, invoker, waiters) = group.into_parts();
    let waiter_count = waiters.len();
    metrics.record_dispatched(waiter_count);

    if waiters.is_empty() {
        debug!(key = %key, "Skipping group with no waiters");
        return DispatchOutcome {
            key,
            waiters: 0,
            delivered: 0,
            abandoned: 0,
            upstream_called: false,
            upstream_failed: false,
            elapsed: Duration::ZERO,
        };
    }

    info!(key = %key, waiters = waiter_count, "Coalescing requests");

    let started = Instant::now();
    let result = AssertUnwindSafe(async move { invoker().await })
        .catch_unwind()
        .await;
    let elapsed = started.elapsed();

    let (response, upstream_failed) = match result {
        Ok(Ok(response)) => (response, false),
        Ok(Err(e)) => {
            warn!(key = %key, error = %e, "Upstream request failed");
            (CoalescedResponse::failure(StatusCode::BAD_GATEWAY, &e), true)
        }
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            error!(key = %key, panic = message, "Upstream invoker panicked");
            (CoalescedResponse::failure(StatusCode::BAD_GATEWAY, "upstream handler panicked"), true)
        }
    };

    metrics.record_upstream(elapsed, upstream_failed);
    prom::record_upstream_call(elapsed, upstream_failed);

    let mut delivered = 0;
    let mut abandoned = 0;
    for tx in waiters {
        match tx.send(response.clone()) {
            Ok(()) => delivered += 1,
            Err(_) => abandoned += 1,
        }
    }

    metrics.record_delivered(delivered, abandoned);
    prom::record_fanout(delivered, abandoned);

    debug!(
        key = %key,
        status = response.status.as_u16(),
        delivered,
        abandoned,
        elapsed_ms = elapsed.as_millis() as u64,
        "Group dispatched"
    );

    DispatchOutcome {
        key,
        waiters: waiter_count,
        delivered,
        abandoned,
        upstream_called: true,
        upstream_failed,
        elapsed,
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}
