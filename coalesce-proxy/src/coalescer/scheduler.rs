//! Periodic flush loop.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::engine::Coalescer;

/// Spawns the background task that flushes a [`Coalescer`] every interval
pub struct FlushScheduler;

impl FlushScheduler {
    /// Start flushing `coalescer` on its configured interval.
    ///
    /// The first flush happens one full interval after the call. Each flush
    /// dispatches its groups on separate tasks, so a slow upstream never
    /// delays the next tick.
    #[must_use = "dropping the handle detaches the loop; keep it to shut down with a final flush"]
    pub fn spawn(coalescer: Arc<Coalescer>) -> SchedulerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run(coalescer, shutdown_rx));
        SchedulerHandle { shutdown_tx, task }
    }
}

/// Handle to a running flush loop.
///
/// Dropping it detaches the loop, which keeps flushing for as long as the
/// runtime lives. Only [`SchedulerHandle::shutdown`] stops it.
#[must_use = "dropping the handle detaches the loop; keep it to shut down with a final flush"]
pub struct SchedulerHandle {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Stop the loop, flush whatever is still pending and wait for those
    /// dispatches to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.task.await {
            warn!(error = %e, "Coalescing scheduler task failed");
        }
    }
}

async fn run(coalescer: Arc<Coalescer>, mut shutdown: watch::Receiver<bool>) {
    let period = coalescer.config().effective_flush_interval();
    info!(interval_ms = period.as_millis() as u64, "Starting coalescing scheduler");

    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut detached = false;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let flush = coalescer.flush().await;
                if !flush.is_empty() {
                    debug!(groups = flush.len(), "Processing coalesce queue");
                }
            }
            changed = shutdown.changed(), if !detached => match changed {
                Ok(()) => break,
                Err(_) => {
                    // Handle dropped: nobody can ask for shutdown any more.
                    debug!("Scheduler handle dropped, loop detached");
                    detached = true;
                }
            },
        }
    }

    let outcomes = coalescer.flush().await.join().await;
    info!(final_groups = outcomes.len(), "Coalescing scheduler stopped");
}
