//! Storage traits for billing data.
//!
//! The store owns two entities: subscription records and the per-user plan
//! flag. Reconciliation changes both in a single [`BillingStore::commit_sync`]
//! call, which implementations must apply atomically.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::error::BillingResult;
use super::plans::PlanName;

/// Trait for storing billing data.
///
/// An in-memory implementation is provided in [`memory`]; a SeaORM-backed
/// one is available with the `billing-seaorm` feature.
#[async_trait]
pub trait BillingStore: Send + Sync + 'static {
    // Users

    /// Get a user's plan flag.
    async fn get_user(&self, user_id: &str) -> BillingResult<Option<UserRecord>>;

    // Subscriptions

    /// Get a subscription by its external id.
    async fn get_subscription(&self, subscription_id: &str)
        -> BillingResult<Option<StoredSubscription>>;

    /// All subscriptions owned by a user, canceled ones included.
    async fn list_subscriptions_for_user(
        &self,
        reference_id: &str,
    ) -> BillingResult<Vec<StoredSubscription>>;

    /// Write a subscription record and its owner's plan flag as one unit.
    ///
    /// When `write.expected_version` is `None` the subscription must not exist
    /// yet; otherwise its stored version must equal the expected one. The
    /// owner's version must also still equal `write.expected_user_version`:
    /// any commit for a sibling subscription bumps it, and the new plan flag
    /// was resolved from siblings read at that version. A mismatch on either
    /// returns [`BillingError::ConcurrentModification`] and writes nothing.
    /// A successful commit bumps the owner's version. Any failure after the
    /// first write must roll back and return
    /// [`BillingError::PartialUpdate`]; the two entities are never left
    /// disagreeing.
    ///
    /// [`BillingError::ConcurrentModification`]: super::BillingError::ConcurrentModification
    /// [`BillingError::PartialUpdate`]: super::BillingError::PartialUpdate
    async fn commit_sync(&self, write: &SyncWrite) -> BillingResult<()>;

    // Webhook idempotency

    /// Check if a webhook event has already been processed.
    async fn is_event_processed(&self, event_id: &str) -> BillingResult<bool>;

    /// Mark a webhook event as processed.
    async fn mark_event_processed(&self, event_id: &str) -> BillingResult<()>;

    /// Remove processed event records older than the given number of days.
    ///
    /// Returns the number of records removed.
    async fn cleanup_old_events(&self, _older_than_days: u32) -> BillingResult<usize> {
        Ok(0)
    }
}

/// A subscription as mirrored from the payment provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredSubscription {
    /// The provider's subscription id.
    pub id: String,
    /// Owning user. Never changes after creation.
    pub reference_id: String,
    pub plan: PlanName,
    pub status: SubscriptionStatus,
    /// End of the current billing period (unix seconds).
    pub period_end: Option<u64>,
    /// The provider's customer id, used to open portal sessions.
    pub external_customer_id: Option<String>,
    /// Provider timestamp of the last event applied to this record.
    pub last_event_at: Option<u64>,
    /// Bumped on every committed write.
    pub version: u64,
    pub created_at: u64,
    pub updated_at: u64,
}

impl StoredSubscription {
    /// Whether this subscription entitles its owner to its plan.
    #[must_use]
    pub fn is_entitled(&self) -> bool {
        self.status.is_entitled()
    }

    #[must_use]
    pub fn is_canceled(&self) -> bool {
        self.status == SubscriptionStatus::Canceled
    }
}

/// The slice of the user record this crate reads and writes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: String,
    /// Denormalized plan flag read by the rest of the application.
    pub subscription_type: PlanName,
    pub email: Option<String>,
    /// Bumped on every committed change to the plan flag's inputs.
    #[serde(default)]
    pub version: u64,
}

impl UserRecord {
    /// A freshly signed-up user.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            subscription_type: PlanName::Free,
            email: None,
            version: 0,
        }
    }

    #[must_use]
    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }
}

/// One atomic reconciliation write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncWrite {
    /// The record to store, with its version already bumped.
    pub subscription: StoredSubscription,
    /// Version the record had when it was read; `None` for a new record.
    pub expected_version: Option<u64>,
    /// The owner's version when it and its subscriptions were read.
    pub expected_user_version: u64,
    /// The owner's new plan flag.
    pub subscription_type: PlanName,
}

/// Subscription status as reported by the payment provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    /// Subscription is active and paid.
    Active,
    /// Subscription is in trial period.
    Trialing,
    /// Payment failed, the provider is retrying.
    PastDue,
    /// Retries exhausted, invoices left open.
    Unpaid,
    /// Subscription has ended. Terminal.
    Canceled,
    /// First payment has not succeeded yet.
    Incomplete,
    /// First payment never succeeded. Terminal.
    IncompleteExpired,
    /// Collection is paused.
    Paused,
}

impl SubscriptionStatus {
    /// Parse the provider's status string.
    #[must_use]
    pub fn from_provider(status: &str) -> Option<Self> {
        match status {
            "active" => Some(Self::Active),
            "trialing" => Some(Self::Trialing),
            "past_due" => Some(Self::PastDue),
            "unpaid" => Some(Self::Unpaid),
            "canceled" | "cancelled" => Some(Self::Canceled),
            "incomplete" => Some(Self::Incomplete),
            "incomplete_expired" => Some(Self::IncompleteExpired),
            "paused" => Some(Self::Paused),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Trialing => "trialing",
            Self::PastDue => "past_due",
            Self::Unpaid => "unpaid",
            Self::Canceled => "canceled",
            Self::Incomplete => "incomplete",
            Self::IncompleteExpired => "incomplete_expired",
            Self::Paused => "paused",
        }
    }

    /// Only active and trialing subscriptions grant their plan.
    #[must_use]
    pub fn is_entitled(&self) -> bool {
        matches!(self, Self::Active | Self::Trialing)
    }

    /// Terminal statuses are never left.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Canceled | Self::IncompleteExpired)
    }

    /// Whether the lifecycle allows moving from `self` to `next`.
    ///
    /// Staying in the same status is always allowed.
    #[must_use]
    pub fn can_transition_to(&self, next: Self) -> bool {
        use SubscriptionStatus::*;

        if *self == next {
            return true;
        }
        match self {
            Incomplete => matches!(next, Active | IncompleteExpired),
            Trialing => matches!(next, Active | PastDue | Canceled),
            Active => matches!(next, PastDue | Canceled | Paused),
            PastDue => matches!(next, Active | Unpaid | Canceled),
            Unpaid => matches!(next, PastDue | Active),
            Paused => matches!(next, Active),
            Canceled | IncompleteExpired => false,
        }
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// In-memory billing store.
///
/// All state sits behind one lock, so `commit_sync` is trivially atomic.
/// Supports fault injection for exercising the rollback path.
pub mod memory {
    use super::*;
    use crate::billing::error::BillingError;
    use crate::utils::unix_now;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, PoisonError, RwLock};

    /// In-memory billing store. Cloning shares the underlying state.
    #[derive(Default, Clone)]
    pub struct InMemoryBillingStore {
        inner: Arc<Inner>,
    }

    #[derive(Default)]
    struct Inner {
        state: RwLock<State>,
        failing_commits: AtomicUsize,
        commits: AtomicUsize,
    }

    #[derive(Default)]
    struct State {
        users: HashMap<String, UserRecord>,
        subscriptions: HashMap<String, StoredSubscription>,
        processed_events: HashMap<String, u64>,
    }

    impl InMemoryBillingStore {
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Insert or replace a user record.
        pub fn insert_user(&self, user: UserRecord) {
            self.write().users.insert(user.id.clone(), user);
        }

        /// Insert or replace a subscription without touching its owner.
        pub fn insert_subscription(&self, subscription: StoredSubscription) {
            self.write()
                .subscriptions
                .insert(subscription.id.clone(), subscription);
        }

        /// Snapshot of a user record.
        #[must_use]
        pub fn user(&self, user_id: &str) -> Option<UserRecord> {
            self.read().users.get(user_id).cloned()
        }

        /// Snapshot of a subscription record.
        #[must_use]
        pub fn subscription(&self, subscription_id: &str) -> Option<StoredSubscription> {
            self.read().subscriptions.get(subscription_id).cloned()
        }

        #[must_use]
        pub fn subscription_count(&self) -> usize {
            self.read().subscriptions.len()
        }

        /// Number of successful `commit_sync` calls.
        #[must_use]
        pub fn commit_count(&self) -> usize {
            self.inner.commits.load(Ordering::SeqCst)
        }

        /// Make the next `n` commits fail after the subscription write.
        pub fn fail_next_commits(&self, n: usize) {
            self.inner.failing_commits.store(n, Ordering::SeqCst);
        }

        /// Backdate a processed event (for retention tests).
        pub fn set_event_processed_at(&self, event_id: &str, processed_at: u64) {
            self.write()
                .processed_events
                .insert(event_id.to_string(), processed_at);
        }

        fn read(&self) -> std::sync::RwLockReadGuard<'_, State> {
            self.inner.state.read().unwrap_or_else(PoisonError::into_inner)
        }

        fn write(&self) -> std::sync::RwLockWriteGuard<'_, State> {
            self.inner.state.write().unwrap_or_else(PoisonError::into_inner)
        }

        fn take_injected_failure(&self) -> bool {
            self.inner
                .failing_commits
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        }
    }

    #[async_trait]
    impl BillingStore for InMemoryBillingStore {
        async fn get_user(&self, user_id: &str) -> BillingResult<Option<UserRecord>> {
            Ok(self.user(user_id))
        }

        async fn get_subscription(
            &self,
            subscription_id: &str,
        ) -> BillingResult<Option<StoredSubscription>> {
            Ok(self.subscription(subscription_id))
        }

        async fn list_subscriptions_for_user(
            &self,
            reference_id: &str,
        ) -> BillingResult<Vec<StoredSubscription>> {
            let mut subscriptions: Vec<_> = self
                .read()
                .subscriptions
                .values()
                .filter(|s| s.reference_id == reference_id)
                .cloned()
                .collect();
            subscriptions.sort_by(|a, b| a.id.cmp(&b.id));
            Ok(subscriptions)
        }

        async fn commit_sync(&self, write: &SyncWrite) -> BillingResult<()> {
            let subscription = &write.subscription;
            let mut state = self.write();

            let stored_version = state.subscriptions.get(&subscription.id).map(|s| s.version);
            if stored_version != write.expected_version {
                return Err(BillingError::ConcurrentModification {
                    subscription_id: subscription.id.clone(),
                });
            }

            let stored_user_version = state.users.get(&subscription.reference_id).map(|u| u.version);
            if stored_user_version.is_some_and(|v| v != write.expected_user_version) {
                return Err(BillingError::ConcurrentModification {
                    subscription_id: subscription.id.clone(),
                });
            }

            let previous = state
                .subscriptions
                .insert(subscription.id.clone(), subscription.clone());

            let user_missing = stored_user_version.is_none();
            if user_missing || self.take_injected_failure() {
                match previous {
                    Some(previous) => {
                        state.subscriptions.insert(previous.id.clone(), previous);
                    }
                    None => {
                        state.subscriptions.remove(&subscription.id);
                    }
                }
                let message = if user_missing {
                    format!("user {} does not exist", subscription.reference_id)
                } else {
                    "injected failure".to_string()
                };
                return Err(BillingError::PartialUpdate {
                    subscription_id: subscription.id.clone(),
                    message,
                });
            }

            if let Some(user) = state.users.get_mut(&subscription.reference_id) {
                user.subscription_type = write.subscription_type;
                user.version += 1;
            }
            self.inner.commits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn is_event_processed(&self, event_id: &str) -> BillingResult<bool> {
            Ok(self.read().processed_events.contains_key(event_id))
        }

        async fn mark_event_processed(&self, event_id: &str) -> BillingResult<()> {
            self.write()
                .processed_events
                .insert(event_id.to_string(), unix_now());
            Ok(())
        }

        async fn cleanup_old_events(&self, older_than_days: u32) -> BillingResult<usize> {
            let cutoff = unix_now().saturating_sub(u64::from(older_than_days) * 24 * 60 * 60);
            let mut state = self.write();
            let before = state.processed_events.len();
            state.processed_events.retain(|_, processed_at| *processed_at >= cutoff);
            Ok(before - state.processed_events.len())
        }
    }
}
