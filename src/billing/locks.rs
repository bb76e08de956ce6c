//! Per-subscription serialization.
//!
//! Events for the same subscription are reconciled one at a time; events for
//! different subscriptions never wait on each other. Slots are created on
//! demand and removed once nobody holds or waits for them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

type Slots = Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>;

/// Keyed async locks, one per subscription id.
#[derive(Clone, Default)]
pub struct SubscriptionLocks {
    slots: Slots,
}

impl SubscriptionLocks {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until no other task holds the lock for `subscription_id`.
    ///
    /// The lock is released when the guard is dropped, on every exit path.
    pub async fn acquire(&self, subscription_id: &str) -> SubscriptionLockGuard {
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            slots
                .entry(subscription_id.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };

        let guard = slot.clone().lock_owned().await;
        SubscriptionLockGuard {
            guard: Some(guard),
            slot,
            subscription_id: subscription_id.to_string(),
            slots: self.slots.clone(),
        }
    }

    /// Number of subscription ids currently held or waited on.
    #[must_use]
    pub fn active(&self) -> usize {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// Holds one subscription's lock.
pub struct SubscriptionLockGuard {
    guard: Option<OwnedMutexGuard<()>>,
    slot: Arc<AsyncMutex<()>>,
    subscription_id: String,
    slots: Slots,
}

impl SubscriptionLockGuard {
    #[must_use]
    pub fn subscription_id(&self) -> &str {
        &self.subscription_id
    }
}

impl Drop for SubscriptionLockGuard {
    fn drop(&mut self) {
        drop(self.guard.take());

        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        // The map and this guard hold the only references: nobody is waiting.
        if Arc::strong_count(&self.slot) == 2 {
            slots.remove(&self.subscription_id);
        }
    }
}
