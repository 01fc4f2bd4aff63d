//! Pending-request registry.
//!
//! A single lock guards registration, pruning and draining, so a caller can
//! never join a group that a flush has already taken.

use std::collections::HashMap;

use tokio::sync::Mutex;

use super::group::{CoalescingGroup, UpstreamInvoker, Waiter};
use super::key::RequestKey;

/// Result of registering a caller
pub struct Registration {
    pub waiter: Waiter,
    /// True when this caller opened the group (its invoker will be used)
    pub created: bool,
}

/// Map from request key to the group currently collecting waiters
#[derive(Default)]
pub struct PendingRegistry {
    groups: Mutex<HashMap<RequestKey, CoalescingGroup>>,
}

impl PendingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the pending group for `key`, creating it with `invoker` when none
    /// exists. The invoker of a caller that joins an existing group is dropped.
    pub async fn register(&self, key: RequestKey, invoker: UpstreamInvoker) -> Registration {
        let mut groups = self.groups.lock().await;

        if let Some(group) = groups.get_mut(&key) {
            let waiter = group.join();
            tracing::trace!(key = %key, waiters = group.waiter_count(), "Joined pending group");
            return Registration { waiter, created: false };
        }

        let (group, waiter) = CoalescingGroup::new(key.clone(), invoker);
        groups.insert(key, group);
        Registration { waiter, created: true }
    }

    /// Take every pending group out of the registry.
    ///
    /// Abandoned waiters are pruned under the same lock, so the returned
    /// counts are exactly the deliveries owed. Returns the groups and the
    /// number of pruned waiters.
    pub async fn drain_all(&self) -> (Vec<CoalescingGroup>, usize) {
        let mut groups = self.groups.lock().await;
        let mut pruned = 0;

        let drained: Vec<CoalescingGroup> = groups
            .drain()
            .map(|(_, mut group)| {
                pruned += group.prune_abandoned();
                group
            })
            .collect();

        (drained, pruned)
    }

    /// Number of pending groups
    pub async fn len(&self) -> usize {
        self.groups.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.groups.lock().await.is_empty()
    }

    /// Waiters currently registered for `key` (0 when no group is pending)
    pub async fn waiter_count(&self, key: &RequestKey) -> usize {
        self.groups
            .lock()
            .await
            .get(key)
            .map(CoalescingGroup::waiter_count)
            .unwrap_or(0)
    }

    /// Total waiters across all pending groups
    pub async fn total_waiters(&self) -> usize {
        self.groups
            .lock()
            .await
            .values()
            .map(CoalescingGroup::waiter_count)
            .sum()
    }
}
