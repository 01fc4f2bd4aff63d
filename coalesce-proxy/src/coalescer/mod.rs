//! Request coalescing for the proxy.
//!
//! Concurrent callers asking for the same resource inside one flush window
//! share a single upstream call. The result is fanned out to each of them.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    Incoming Requests                     │
//! └───────────────────────────┬─────────────────────────────┘
//!                             │ RequestKey
//!                    ┌────────▼────────┐
//!                    │ PendingRegistry │ ← one group per key
//!                    │  ┌───────────┐  │
//!                    │  │ GET /get  │  │
//!                    │  │ GET /ip   │  │
//!                    │  │ ...       │  │
//!                    │  └───────────┘  │
//!                    └────────┬────────┘
//!                             │ drain_all (every flush interval)
//!                    ┌────────▼────────┐
//!                    │ FlushScheduler  │
//!                    └────────┬────────┘
//!                             │ one task per group
//!                    ┌────────▼────────┐
//!                    │   dispatch()    │ ← one upstream call, N deliveries
//!                    └─────────────────┘
//! ```
//!
//! # Guarantees
//!
//! - **Single upstream call**: every group invokes its upstream exactly once
//! - **Exactly-once delivery**: each waiter counted at drain gets one result
//! - **Window isolation**: a caller arriving after a drain joins the next window
//! - **Failure containment**: upstream errors and panics become a 502 for the
//!   affected group only; the scheduler keeps ticking

mod config;
mod dispatch;
mod engine;
mod group;
mod key;
mod metrics;
mod registry;
mod scheduler;

pub use config::CoalescerConfig;
pub use dispatch::{dispatch, DispatchOutcome};
pub use engine::{CoalesceError, Coalescer, FlushHandle};
pub use group::{
    invoker, CoalescedResponse, CoalescingGroup, UpstreamInvoker, UpstreamResult, Waiter,
};
pub use key::{KeyError, RequestKey};
pub use metrics::{CoalescerMetrics, MetricsSnapshot};
pub use registry::{PendingRegistry, Registration};
pub use scheduler::{FlushScheduler, SchedulerHandle};
