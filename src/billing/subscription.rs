//! Reconciliation of billing events into local state.
//!
//! [`Reconciler::reconcile`] is the only writer of subscription records and
//! of the user plan flag. For each event it:
//!
//! 1. serializes on the subscription id,
//! 2. reads the current record,
//! 3. decides with [`decide`] whether anything changes,
//! 4. commits the record and the owner's plan flag in one store call,
//! 5. hands the resulting [`Transition`] to the [`Dispatcher`].
//!
//! Redelivered and out-of-order events are no-ops. Events that cannot be
//! interpreted are dropped and audited without touching state.

use std::sync::Arc;

use serde::Serialize;

use super::audit::{BillingAuditEvent, BillingAuditLogger, NoOpAuditLogger};
use super::dispatch::Dispatcher;
use super::error::{BillingError, BillingResult};
use super::event::{BillingEvent, BillingEventKind};
use super::locks::SubscriptionLocks;
use super::plans::{PlanCatalog, PlanName};
use super::storage::{BillingStore, StoredSubscription, SubscriptionStatus, SyncWrite};
use crate::utils::unix_now;

/// Plan, status and period of a subscription at one point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SubscriptionSnapshot {
    pub plan: PlanName,
    pub status: SubscriptionStatus,
    pub period_end: Option<u64>,
}

impl From<&StoredSubscription> for SubscriptionSnapshot {
    fn from(sub: &StoredSubscription) -> Self {
        Self {
            plan: sub.plan,
            status: sub.status,
            period_end: sub.period_end,
        }
    }
}

/// A committed change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Transition {
    pub event_kind: BillingEventKind,
    pub subscription_id: String,
    pub reference_id: String,
    /// `None` on the first sighting of the subscription.
    pub previous: Option<SubscriptionSnapshot>,
    pub current: SubscriptionSnapshot,
    pub user_plan_before: PlanName,
    pub user_plan_after: PlanName,
    pub user_email: Option<String>,
}

impl Transition {
    #[must_use]
    pub fn is_first_sighting(&self) -> bool {
        self.previous.is_none()
    }

    #[must_use]
    pub fn user_plan_changed(&self) -> bool {
        self.user_plan_before != self.user_plan_after
    }
}

/// Result of reconciling one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// State changed.
    Applied(Transition),
    /// The event restates what is already stored.
    Unchanged,
    /// The event is older than what is already stored.
    Stale { reason: String },
    /// The event could not be interpreted; nothing was written.
    Dropped { reason: BillingError },
}

impl ReconcileOutcome {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Applied(_) => "applied",
            Self::Unchanged => "unchanged",
            Self::Stale { .. } => "stale",
            Self::Dropped { .. } => "dropped",
        }
    }

    #[must_use]
    pub fn transition(&self) -> Option<&Transition> {
        match self {
            Self::Applied(transition) => Some(transition),
            _ => None,
        }
    }
}

/// What to do with an event, given the current record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Unchanged,
    Stale(String),
    Write {
        record: StoredSubscription,
        expected_version: Option<u64>,
    },
}

/// Decide how an event changes a subscription record.
///
/// Pure: reads nothing but its arguments. `now` stamps new and updated
/// records.
pub fn decide(
    current: Option<&StoredSubscription>,
    event: &BillingEvent,
    catalog: &PlanCatalog,
    now: u64,
) -> BillingResult<Decision> {
    let subscription_id = &event.external_subscription_id;

    let (plan, status) = if event.kind == BillingEventKind::SubscriptionCanceled {
        // Cancellation needs no catalog entry: keep what we knew.
        let plan = match current {
            Some(cur) => cur.plan,
            None => event
                .external_price_id
                .as_deref()
                .and_then(|price| catalog.resolve_by_external_price_id(price).ok())
                .map_or(PlanName::Free, |p| p.name),
        };
        (plan, SubscriptionStatus::Canceled)
    } else {
        let plan = match (event.external_price_id.as_deref(), current) {
            (Some(price), _) => catalog.resolve_by_external_price_id(price)?.name,
            (None, Some(cur)) => cur.plan,
            (None, None) => {
                return Err(BillingError::UnresolvablePlan {
                    price_id: String::new(),
                });
            }
        };
        let status = event
            .status
            .or_else(|| event.kind.implied_status())
            .or(current.map(|cur| cur.status))
            .unwrap_or(SubscriptionStatus::Active);
        (plan, status)
    };

    let reference_id = match (current, event.reference_id.as_deref()) {
        (Some(cur), Some(claimed)) if cur.reference_id != claimed => {
            return Err(BillingError::OwnershipMismatch {
                subscription_id: subscription_id.clone(),
                owner: cur.reference_id.clone(),
                claimed: claimed.to_string(),
            });
        }
        (Some(cur), _) => cur.reference_id.clone(),
        (None, Some(claimed)) if !claimed.is_empty() => claimed.to_string(),
        (None, _) => {
            return Err(BillingError::UnknownOwner {
                subscription_id: subscription_id.clone(),
            });
        }
    };

    let Some(cur) = current else {
        return Ok(Decision::Write {
            record: StoredSubscription {
                id: subscription_id.clone(),
                reference_id,
                plan,
                status,
                period_end: event.period_end,
                external_customer_id: event.external_customer_id.clone(),
                last_event_at: event.occurred_at,
                version: 1,
                created_at: now,
                updated_at: now,
            },
            expected_version: None,
        });
    };

    if cur.status.is_terminal() && status != cur.status {
        return Ok(Decision::Stale(format!(
            "subscription is already {}",
            cur.status
        )));
    }
    if let (Some(at), Some(last)) = (event.occurred_at, cur.last_event_at) {
        if at < last {
            return Ok(Decision::Stale(format!(
                "event at {} predates last applied event at {}",
                at, last
            )));
        }
    }

    let same_period = event.period_end.is_none_or(|end| cur.period_end == Some(end));
    if cur.plan == plan && cur.status == status && same_period {
        return Ok(Decision::Unchanged);
    }

    if !cur.status.can_transition_to(status) {
        tracing::warn!(
            target: "plansync::billing::reconcile",
            subscription_id = %subscription_id,
            from = %cur.status,
            to = %status,
            "Unexpected status transition reported by provider, applying"
        );
    }

    Ok(Decision::Write {
        record: StoredSubscription {
            id: cur.id.clone(),
            reference_id,
            plan,
            status,
            period_end: event.period_end.or(cur.period_end),
            external_customer_id: event
                .external_customer_id
                .clone()
                .or_else(|| cur.external_customer_id.clone()),
            last_event_at: event.occurred_at.max(cur.last_event_at),
            version: cur.version + 1,
            created_at: cur.created_at,
            updated_at: now,
        },
        expected_version: Some(cur.version),
    })
}

/// The plan a user should have, given one updated subscription and the rest.
///
/// An entitled `record` wins. Otherwise the most recently updated other
/// entitled subscription decides, and FREE if there is none.
#[must_use]
pub fn resolve_user_plan(record: &StoredSubscription, others: &[StoredSubscription]) -> PlanName {
    if record.is_entitled() {
        return record.plan;
    }
    entitled_plan(others.iter().filter(|s| s.id != record.id))
}

fn entitled_plan<'a>(subscriptions: impl Iterator<Item = &'a StoredSubscription>) -> PlanName {
    subscriptions
        .filter(|s| s.is_entitled())
        .max_by_key(|s| s.updated_at)
        .map_or(PlanName::Free, |s| s.plan)
}

/// Whether a user's plan flag agrees with their subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsistencyCheck {
    InSync { plan: PlanName },
    Diverged { stored: PlanName, expected: PlanName },
}

/// Applies billing events to the store.
pub struct Reconciler<S: BillingStore> {
    store: S,
    catalog: PlanCatalog,
    locks: SubscriptionLocks,
    dispatcher: Dispatcher,
    audit: Arc<dyn BillingAuditLogger>,
    max_conflict_retries: u32,
}

impl<S: BillingStore> Reconciler<S> {
    #[must_use]
    pub fn new(store: S, catalog: PlanCatalog, dispatcher: Dispatcher) -> Self {
        Self {
            store,
            catalog,
            locks: SubscriptionLocks::new(),
            dispatcher,
            audit: Arc::new(NoOpAuditLogger),
            max_conflict_retries: 3,
        }
    }

    #[must_use]
    pub fn with_audit_logger(mut self, audit: Arc<dyn BillingAuditLogger>) -> Self {
        self.audit = audit;
        self
    }

    /// Re-reads allowed after a version conflict before giving up.
    #[must_use]
    pub fn with_max_conflict_retries(mut self, retries: u32) -> Self {
        self.max_conflict_retries = retries;
        self
    }

    #[must_use]
    pub fn store(&self) -> &S {
        &self.store
    }

    #[must_use]
    pub fn catalog(&self) -> &PlanCatalog {
        &self.catalog
    }

    #[must_use]
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Apply one billing event and run its side effects.
    ///
    /// Equivalent to [`apply`](Self::apply) followed by
    /// [`settle`](Self::settle).
    ///
    /// # Errors
    ///
    /// Storage failures, partial commits and exhausted conflict retries are
    /// returned so the event can be redelivered. Unresolvable plans and
    /// ownership mismatches are not errors: they come back as
    /// [`ReconcileOutcome::Dropped`].
    pub async fn reconcile(&self, event: &BillingEvent) -> BillingResult<ReconcileOutcome> {
        let outcome = self.apply(event).await?;
        self.settle(event, &outcome).await;
        Ok(outcome)
    }

    /// Lock, read, decide and commit. Sends nothing.
    ///
    /// Dropping this future before it resolves leaves the store untouched or
    /// fully committed, never in between. A committed change still needs
    /// [`settle`](Self::settle) for its audit entries and notification.
    pub async fn apply(&self, event: &BillingEvent) -> BillingResult<ReconcileOutcome> {
        let _guard = self.locks.acquire(&event.external_subscription_id).await;
        self.reconcile_with_retry(event).await
    }

    /// Log, audit and dispatch for an outcome returned by [`apply`](Self::apply).
    pub async fn settle(&self, event: &BillingEvent, outcome: &ReconcileOutcome) {
        match outcome {
            ReconcileOutcome::Applied(transition) => {
                self.audit_transition(transition).await;
                self.dispatcher.dispatch(transition).await;
            }
            ReconcileOutcome::Dropped { reason } => {
                tracing::warn!(
                    target: "plansync::billing::reconcile",
                    subscription_id = %event.external_subscription_id,
                    kind = %event.kind,
                    reason = %reason,
                    "Dropping billing event"
                );
                self.audit
                    .log(BillingAuditEvent::EventDropped {
                        subscription_id: event.external_subscription_id.clone(),
                        event_kind: event.kind.to_string(),
                        reason: reason.to_string(),
                    })
                    .await;
            }
            ReconcileOutcome::Unchanged => {
                tracing::debug!(
                    target: "plansync::billing::reconcile",
                    subscription_id = %event.external_subscription_id,
                    kind = %event.kind,
                    "Billing event changes nothing"
                );
            }
            ReconcileOutcome::Stale { reason } => {
                tracing::info!(
                    target: "plansync::billing::reconcile",
                    subscription_id = %event.external_subscription_id,
                    kind = %event.kind,
                    reason = %reason,
                    "Ignoring stale billing event"
                );
            }
        }
    }

    /// The user's stored plan flag.
    pub async fn current_plan(&self, user_id: &str) -> BillingResult<PlanName> {
        self.store
            .get_user(user_id)
            .await?
            .map(|user| user.subscription_type)
            .ok_or_else(|| BillingError::UserNotFound {
                user_id: user_id.to_string(),
            })
    }

    /// Whether any of the user's subscriptions is active or trialing.
    pub async fn has_active_subscription(&self, user_id: &str) -> BillingResult<bool> {
        let subscriptions = self.store.list_subscriptions_for_user(user_id).await?;
        Ok(subscriptions.iter().any(StoredSubscription::is_entitled))
    }

    /// Compare the user's plan flag with what their subscriptions imply.
    pub async fn check_consistency(&self, user_id: &str) -> BillingResult<ConsistencyCheck> {
        let stored = self.current_plan(user_id).await?;
        let subscriptions = self.store.list_subscriptions_for_user(user_id).await?;
        let expected = entitled_plan(subscriptions.iter());

        if stored == expected {
            Ok(ConsistencyCheck::InSync { plan: stored })
        } else {
            tracing::warn!(
                target: "plansync::billing::reconcile",
                user_id = %user_id,
                stored = %stored,
                expected = %expected,
                "User plan flag disagrees with subscriptions"
            );
            Ok(ConsistencyCheck::Diverged { stored, expected })
        }
    }

    async fn reconcile_with_retry(&self, event: &BillingEvent) -> BillingResult<ReconcileOutcome> {
        let mut attempt = 0;
        loop {
            match self.try_reconcile(event).await {
                Err(BillingError::ConcurrentModification { subscription_id }) => {
                    if attempt >= self.max_conflict_retries {
                        return Err(BillingError::RetryLimitExceeded {
                            operation: format!("reconcile {}", subscription_id),
                        });
                    }
                    attempt += 1;
                    tracing::warn!(
                        target: "plansync::billing::reconcile",
                        subscription_id = %subscription_id,
                        attempt,
                        "Concurrent modification, re-reading"
                    );
                }
                Err(err) if err.is_non_fatal_anomaly() => {
                    return Ok(ReconcileOutcome::Dropped { reason: err });
                }
                other => return other,
            }
        }
    }

    async fn try_reconcile(&self, event: &BillingEvent) -> BillingResult<ReconcileOutcome> {
        let current = self
            .store
            .get_subscription(&event.external_subscription_id)
            .await?;

        let (record, expected_version) =
            match decide(current.as_ref(), event, &self.catalog, unix_now())? {
                Decision::Unchanged => return Ok(ReconcileOutcome::Unchanged),
                Decision::Stale(reason) => return Ok(ReconcileOutcome::Stale { reason }),
                Decision::Write {
                    record,
                    expected_version,
                } => (record, expected_version),
            };

        let user = self
            .store
            .get_user(&record.reference_id)
            .await?
            .ok_or_else(|| BillingError::UserNotFound {
                user_id: record.reference_id.clone(),
            })?;
        let others = self
            .store
            .list_subscriptions_for_user(&record.reference_id)
            .await?;
        let user_plan_after = resolve_user_plan(&record, &others);

        self.store
            .commit_sync(&SyncWrite {
                subscription: record.clone(),
                expected_version,
                expected_user_version: user.version,
                subscription_type: user_plan_after,
            })
            .await?;

        tracing::info!(
            target: "plansync::billing::reconcile",
            subscription_id = %record.id,
            reference_id = %record.reference_id,
            kind = %event.kind,
            plan = %record.plan,
            status = %record.status,
            user_plan = %user_plan_after,
            "Subscription reconciled"
        );

        Ok(ReconcileOutcome::Applied(Transition {
            event_kind: event.kind,
            subscription_id: record.id.clone(),
            reference_id: record.reference_id.clone(),
            previous: current.as_ref().map(SubscriptionSnapshot::from),
            current: SubscriptionSnapshot::from(&record),
            user_plan_before: user.subscription_type,
            user_plan_after,
            user_email: user.email,
        }))
    }

    async fn audit_transition(&self, transition: &Transition) {
        let user_id = transition.reference_id.clone();
        let subscription_id = transition.subscription_id.clone();
        let current = transition.current;

        let event = if current.status == SubscriptionStatus::Canceled {
            BillingAuditEvent::SubscriptionCanceled {
                user_id: user_id.clone(),
                subscription_id,
            }
        } else if transition.is_first_sighting() {
            BillingAuditEvent::SubscriptionCreated {
                user_id: user_id.clone(),
                subscription_id,
                plan: current.plan.to_string(),
                status: current.status.to_string(),
            }
        } else {
            BillingAuditEvent::SubscriptionUpdated {
                user_id: user_id.clone(),
                subscription_id,
                plan: current.plan.to_string(),
                status: current.status.to_string(),
            }
        };
        self.audit.log(event).await;

        if transition.user_plan_changed() {
            self.audit
                .log(BillingAuditEvent::UserPlanChanged {
                    user_id,
                    from: transition.user_plan_before.to_string(),
                    to: transition.user_plan_after.to_string(),
                })
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::storage::UserRecord;
    use crate::billing::storage::memory::InMemoryBillingStore;
    use crate::billing::{MemoryAuditLogger, NotificationKind};
    use crate::testing::{RecordingNotificationSender, sample_catalog};

    const NOW: u64 = 1_750_000_000;

    fn record(plan: PlanName, status: SubscriptionStatus) -> StoredSubscription {
        StoredSubscription {
            id: "sub_1".to_string(),
            reference_id: "u1".to_string(),
            plan,
            status,
            period_end: Some(1_800_000_000),
            external_customer_id: Some("cus_1".to_string()),
            last_event_at: Some(1_700_000_000),
            version: 4,
            created_at: 1_690_000_000,
            updated_at: 1_700_000_000,
        }
    }

    fn setup() -> (InMemoryBillingStore, RecordingNotificationSender, Reconciler<InMemoryBillingStore>) {
        let store = InMemoryBillingStore::new();
        store.insert_user(UserRecord::new("u1").with_email("u1@example.com"));
        let sender = RecordingNotificationSender::new();
        let reconciler = Reconciler::new(
            store.clone(),
            sample_catalog(),
            Dispatcher::new(Arc::new(sender.clone())),
        );
        (store, sender, reconciler)
    }

    fn checkout(price: &str) -> BillingEvent {
        BillingEvent::new(BillingEventKind::CheckoutCompleted, "sub_1")
            .price(price)
            .reference("u1")
            .customer("cus_1")
    }

    // decide

    #[test]
    fn test_decide_first_sighting_creates_record() {
        let decision = decide(None, &checkout("price_monthly"), &sample_catalog(), NOW).unwrap();
        let Decision::Write {
            record,
            expected_version,
        } = decision
        else {
            panic!("expected a write");
        };
        assert_eq!(expected_version, None);
        assert_eq!(record.plan, PlanName::Monthly);
        assert_eq!(record.status, SubscriptionStatus::Active);
        assert_eq!(record.reference_id, "u1");
        assert_eq!(record.version, 1);
    }

    #[test]
    fn test_decide_same_facts_is_unchanged() {
        let current = record(PlanName::Monthly, SubscriptionStatus::Active);
        let event = BillingEvent::new(BillingEventKind::SubscriptionUpdated, "sub_1")
            .price("price_monthly")
            .status(SubscriptionStatus::Active)
            .period_end(1_800_000_000);
        assert_eq!(
            decide(Some(&current), &event, &sample_catalog(), NOW).unwrap(),
            Decision::Unchanged
        );
    }

    #[test]
    fn test_decide_new_period_is_a_change() {
        let current = record(PlanName::Monthly, SubscriptionStatus::Active);
        let event = BillingEvent::new(BillingEventKind::InvoicePaid, "sub_1")
            .price("price_monthly")
            .period_end(1_802_592_000);
        let Decision::Write {
            record,
            expected_version,
        } = decide(Some(&current), &event, &sample_catalog(), NOW).unwrap()
        else {
            panic!("expected a write");
        };
        assert_eq!(expected_version, Some(4));
        assert_eq!(record.version, 5);
        assert_eq!(record.period_end, Some(1_802_592_000));
    }

    #[test]
    fn test_decide_unknown_price_is_unresolvable() {
        let err = decide(None, &checkout("price_legacy"), &sample_catalog(), NOW).unwrap_err();
        assert!(matches!(err, BillingError::UnresolvablePlan { .. }));
    }

    #[test]
    fn test_decide_never_reassigns_owner() {
        let current = record(PlanName::Monthly, SubscriptionStatus::Active);
        let event = BillingEvent::new(BillingEventKind::SubscriptionUpdated, "sub_1")
            .price("price_yearly")
            .reference("u2");
        let err = decide(Some(&current), &event, &sample_catalog(), NOW).unwrap_err();
        assert!(matches!(err, BillingError::OwnershipMismatch { .. }));
    }

    #[test]
    fn test_decide_unknown_owner() {
        let event = BillingEvent::new(BillingEventKind::InvoicePaid, "sub_9").price("price_monthly");
        let err = decide(None, &event, &sample_catalog(), NOW).unwrap_err();
        assert!(matches!(err, BillingError::UnknownOwner { .. }));
    }

    #[test]
    fn test_decide_canceled_is_terminal() {
        let current = record(PlanName::Monthly, SubscriptionStatus::Canceled);
        let event = BillingEvent::new(BillingEventKind::SubscriptionUpdated, "sub_1")
            .price("price_monthly")
            .status(SubscriptionStatus::Active);
        assert!(matches!(
            decide(Some(&current), &event, &sample_catalog(), NOW).unwrap(),
            Decision::Stale(_)
        ));
    }

    #[test]
    fn test_decide_older_event_is_stale() {
        let current = record(PlanName::Monthly, SubscriptionStatus::PastDue);
        let event = BillingEvent::new(BillingEventKind::InvoicePaid, "sub_1")
            .price("price_monthly")
            .occurred_at(1_600_000_000);
        assert!(matches!(
            decide(Some(&current), &event, &sample_catalog(), NOW).unwrap(),
            Decision::Stale(_)
        ));
    }

    #[test]
    fn test_decide_cancel_keeps_plan_without_catalog() {
        let current = record(PlanName::Yearly, SubscriptionStatus::Active);
        let event = BillingEvent::new(BillingEventKind::SubscriptionCanceled, "sub_1")
            .price("price_retired");
        let Decision::Write { record, .. } =
            decide(Some(&current), &event, &sample_catalog(), NOW).unwrap()
        else {
            panic!("expected a write");
        };
        assert_eq!(record.plan, PlanName::Yearly);
        assert_eq!(record.status, SubscriptionStatus::Canceled);
    }

    #[test]
    fn test_resolve_user_plan_prefers_other_active_subscription() {
        let mut canceled = record(PlanName::Monthly, SubscriptionStatus::Canceled);
        canceled.id = "sub_old".to_string();
        let mut other = record(PlanName::Yearly, SubscriptionStatus::Active);
        other.id = "sub_other".to_string();

        assert_eq!(resolve_user_plan(&canceled, &[other.clone()]), PlanName::Yearly);
        assert_eq!(resolve_user_plan(&canceled, &[]), PlanName::Free);

        let active = record(PlanName::Monthly, SubscriptionStatus::Active);
        assert_eq!(resolve_user_plan(&active, &[other]), PlanName::Monthly);
    }

    // Reconciler

    #[tokio::test]
    async fn test_checkout_then_redelivery() {
        let (store, sender, reconciler) = setup();

        let outcome = reconciler.reconcile(&checkout("price_monthly")).await.unwrap();
        let transition = outcome.transition().unwrap();
        assert!(transition.is_first_sighting());
        assert_eq!(transition.user_plan_after, PlanName::Monthly);
        assert_eq!(store.user("u1").unwrap().subscription_type, PlanName::Monthly);

        let again = reconciler.reconcile(&checkout("price_monthly")).await.unwrap();
        assert_eq!(again, ReconcileOutcome::Unchanged);
        assert_eq!(store.commit_count(), 1);

        let sent = sender.sent().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, NotificationKind::Welcome);
    }

    #[tokio::test]
    async fn test_unresolvable_plan_is_dropped_and_audited() {
        let (store, sender, reconciler) = setup();
        let audit = MemoryAuditLogger::new();
        let reconciler = reconciler.with_audit_logger(Arc::new(audit.clone()));

        let outcome = reconciler.reconcile(&checkout("price_legacy")).await.unwrap();
        assert!(matches!(outcome, ReconcileOutcome::Dropped { .. }));
        assert_eq!(store.subscription_count(), 0);
        assert_eq!(store.user("u1").unwrap().subscription_type, PlanName::Free);
        assert!(sender.sent().await.is_empty());

        let events = audit.events().await;
        assert!(matches!(events[0], BillingAuditEvent::EventDropped { .. }));
    }

    #[tokio::test]
    async fn test_past_due_downgrades_flag() {
        let (store, _sender, reconciler) = setup();
        reconciler.reconcile(&checkout("price_monthly")).await.unwrap();

        let failed = BillingEvent::new(BillingEventKind::PaymentFailed, "sub_1");
        let outcome = reconciler.reconcile(&failed).await.unwrap();
        let transition = outcome.transition().unwrap();
        assert_eq!(transition.current.status, SubscriptionStatus::PastDue);
        assert_eq!(store.user("u1").unwrap().subscription_type, PlanName::Free);
        assert!(!reconciler.has_active_subscription("u1").await.unwrap());

        let paid = BillingEvent::new(BillingEventKind::InvoicePaid, "sub_1");
        reconciler.reconcile(&paid).await.unwrap();
        assert_eq!(reconciler.current_plan("u1").await.unwrap(), PlanName::Monthly);
    }

    #[tokio::test]
    async fn test_partial_failure_leaves_state_and_can_be_retried() {
        let (store, sender, reconciler) = setup();
        store.fail_next_commits(1);

        let err = reconciler.reconcile(&checkout("price_yearly")).await.unwrap_err();
        assert!(matches!(err, BillingError::PartialUpdate { .. }));
        assert!(store.subscription("sub_1").is_none());
        assert_eq!(store.user("u1").unwrap().subscription_type, PlanName::Free);
        assert!(sender.sent().await.is_empty());

        reconciler.reconcile(&checkout("price_yearly")).await.unwrap();
        assert_eq!(store.user("u1").unwrap().subscription_type, PlanName::Yearly);
    }

    #[tokio::test]
    async fn test_missing_user_is_an_error() {
        let (store, _sender, reconciler) = setup();
        let event = BillingEvent::new(BillingEventKind::CheckoutCompleted, "sub_x")
            .price("price_monthly")
            .reference("nobody");
        let err = reconciler.reconcile(&event).await.unwrap_err();
        assert!(matches!(err, BillingError::UserNotFound { .. }));
        assert_eq!(store.subscription_count(), 0);
    }

    #[tokio::test]
    async fn test_consistency_check() {
        let (store, _sender, reconciler) = setup();
        reconciler.reconcile(&checkout("price_monthly")).await.unwrap();
        assert_eq!(
            reconciler.check_consistency("u1").await.unwrap(),
            ConsistencyCheck::InSync {
                plan: PlanName::Monthly
            }
        );

        store.insert_user(UserRecord::new("u1"));
        assert_eq!(
            reconciler.check_consistency("u1").await.unwrap(),
            ConsistencyCheck::Diverged {
                stored: PlanName::Free,
                expected: PlanName::Monthly
            }
        );
    }
}
