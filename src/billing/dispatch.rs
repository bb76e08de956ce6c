//! Side effects of subscription transitions.
//!
//! The reconciler hands every committed [`Transition`] to the [`Dispatcher`],
//! which decides whether it deserves a notification and sends at most one.
//! Delivery failures are logged, audited and queued for a later
//! [`Dispatcher::retry_failed`]; they never undo the state change.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Mutex;

use super::audit::{BillingAuditEvent, BillingAuditLogger, NoOpAuditLogger};
use super::error::{BillingError, BillingResult};
use super::event::BillingEventKind;
use super::plans::PlanName;
use super::storage::SubscriptionStatus;
use super::subscription::Transition;
use crate::email::{Email, Mailer};

/// Queued notifications are abandoned after this many failed attempts.
const MAX_DELIVERY_ATTEMPTS: u32 = 5;

/// The notifications a transition can trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Welcome,
    PaymentReceipt,
    PaymentFailed,
    Cancellation,
}

impl NotificationKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Welcome => "welcome",
            Self::PaymentReceipt => "payment_receipt",
            Self::PaymentFailed => "payment_failed",
            Self::Cancellation => "cancellation",
        }
    }

    #[must_use]
    pub fn subject(&self) -> &'static str {
        match self {
            Self::Welcome => "Welcome to your new plan",
            Self::PaymentReceipt => "Your payment receipt",
            Self::PaymentFailed => "We couldn't process your payment",
            Self::Cancellation => "Your subscription has been canceled",
        }
    }
}

impl std::fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delivers notifications to users.
#[async_trait]
pub trait NotificationSender: Send + Sync {
    async fn send(
        &self,
        kind: NotificationKind,
        user_id: &str,
        payload: &serde_json::Value,
    ) -> BillingResult<()>;
}

/// Pick the notification for a transition, if any.
#[must_use]
pub fn classify(transition: &Transition) -> Option<NotificationKind> {
    let became_paid = transition.user_plan_before == PlanName::Free
        && transition.user_plan_after.is_paid();
    // A subscription that has never been entitled is starting, not recovering.
    let never_entitled = transition
        .previous
        .as_ref()
        .is_none_or(|prev| prev.status == SubscriptionStatus::Incomplete);
    let starts_subscription =
        never_entitled || transition.event_kind == BillingEventKind::CheckoutCompleted;

    if became_paid && starts_subscription {
        return Some(NotificationKind::Welcome);
    }

    match transition.event_kind {
        BillingEventKind::InvoicePaid if transition.current.status.is_entitled() => {
            Some(NotificationKind::PaymentReceipt)
        }
        BillingEventKind::PaymentFailed => Some(NotificationKind::PaymentFailed),
        BillingEventKind::SubscriptionCanceled => transition
            .previous
            .as_ref()
            .filter(|prev| prev.plan.is_paid() && prev.status != SubscriptionStatus::Canceled)
            .map(|_| NotificationKind::Cancellation),
        _ => None,
    }
}

/// A notification waiting for another delivery attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingNotification {
    pub kind: NotificationKind,
    pub user_id: String,
    pub payload: serde_json::Value,
    pub attempts: u32,
}

/// What [`Dispatcher::dispatch`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchReport {
    /// The transition warrants no notification.
    Skipped,
    Sent(NotificationKind),
    /// Delivery failed and was queued for retry.
    Failed(NotificationKind),
}

/// Turns transitions into notifications.
#[derive(Clone)]
pub struct Dispatcher {
    sender: Arc<dyn NotificationSender>,
    audit: Arc<dyn BillingAuditLogger>,
    pending: Arc<Mutex<VecDeque<PendingNotification>>>,
    max_pending: usize,
}

impl Dispatcher {
    #[must_use]
    pub fn new(sender: Arc<dyn NotificationSender>) -> Self {
        Self {
            sender,
            audit: Arc::new(NoOpAuditLogger),
            pending: Arc::new(Mutex::new(VecDeque::new())),
            max_pending: 1000,
        }
    }

    #[must_use]
    pub fn with_audit_logger(mut self, audit: Arc<dyn BillingAuditLogger>) -> Self {
        self.audit = audit;
        self
    }

    /// Cap on queued failures; the oldest is discarded beyond it.
    #[must_use]
    pub fn with_max_pending(mut self, max_pending: usize) -> Self {
        self.max_pending = max_pending;
        self
    }

    /// Send the notification a transition calls for.
    pub async fn dispatch(&self, transition: &Transition) -> DispatchReport {
        let Some(kind) = classify(transition) else {
            return DispatchReport::Skipped;
        };

        let notification = PendingNotification {
            kind,
            user_id: transition.reference_id.clone(),
            payload: notification_payload(transition),
            attempts: 0,
        };

        if self.deliver(notification).await {
            DispatchReport::Sent(kind)
        } else {
            DispatchReport::Failed(kind)
        }
    }

    /// Retry every queued notification once.
    ///
    /// Returns how many were delivered. Failures go back on the queue until
    /// they run out of attempts.
    pub async fn retry_failed(&self) -> usize {
        let queued: Vec<_> = self.pending.lock().await.drain(..).collect();
        let mut delivered = 0;
        for notification in queued {
            if self.deliver(notification).await {
                delivered += 1;
            }
        }
        delivered
    }

    /// Number of notifications waiting for a retry.
    pub async fn pending(&self) -> usize {
        self.pending.lock().await.len()
    }

    async fn deliver(&self, mut notification: PendingNotification) -> bool {
        let result = self
            .sender
            .send(notification.kind, &notification.user_id, &notification.payload)
            .await;

        let err = match result {
            Ok(()) => {
                tracing::info!(
                    target: "plansync::billing::dispatch",
                    user_id = %notification.user_id,
                    kind = %notification.kind,
                    "Notification sent"
                );
                return true;
            }
            Err(err) => err,
        };

        notification.attempts += 1;
        tracing::error!(
            target: "plansync::billing::dispatch",
            user_id = %notification.user_id,
            kind = %notification.kind,
            attempts = notification.attempts,
            error = %err,
            "Notification delivery failed"
        );
        self.audit
            .log(BillingAuditEvent::NotificationFailed {
                user_id: notification.user_id.clone(),
                kind: notification.kind.to_string(),
                error: err.to_string(),
            })
            .await;

        if notification.attempts >= MAX_DELIVERY_ATTEMPTS {
            tracing::error!(
                target: "plansync::billing::dispatch",
                user_id = %notification.user_id,
                kind = %notification.kind,
                "Giving up on notification"
            );
            return false;
        }

        let mut pending = self.pending.lock().await;
        if self.max_pending == 0 {
            return false;
        }
        if pending.len() >= self.max_pending {
            if let Some(dropped) = pending.pop_front() {
                tracing::warn!(
                    target: "plansync::billing::dispatch",
                    user_id = %dropped.user_id,
                    kind = %dropped.kind,
                    "Retry queue full, discarding oldest notification"
                );
            }
        }
        pending.push_back(notification);
        false
    }
}

fn notification_payload(transition: &Transition) -> serde_json::Value {
    json!({
        "subscription_id": transition.subscription_id,
        "plan": transition.current.plan,
        "status": transition.current.status,
        "period_end": transition.current.period_end,
        "previous_plan": transition.previous.as_ref().map(|p| p.plan),
        "email": transition.user_email,
    })
}

/// Sends notifications as email through a [`Mailer`].
pub struct MailerNotificationSender<M> {
    mailer: M,
    from: String,
}

impl<M: Mailer> MailerNotificationSender<M> {
    pub fn new(mailer: M, from: impl Into<String>) -> Self {
        Self {
            mailer,
            from: from.into(),
        }
    }
}

#[async_trait]
impl<M: Mailer> NotificationSender for MailerNotificationSender<M> {
    async fn send(
        &self,
        kind: NotificationKind,
        user_id: &str,
        payload: &serde_json::Value,
    ) -> BillingResult<()> {
        let to = payload
            .get("email")
            .and_then(serde_json::Value::as_str)
            .filter(|email| !email.is_empty())
            .ok_or_else(|| BillingError::NotificationDispatch {
                kind: kind.to_string(),
                message: format!("no email address on file for user {}", user_id),
            })?;

        let plan = payload
            .get("plan")
            .and_then(serde_json::Value::as_str)
            .unwrap_or("FREE");
        let body = match kind {
            NotificationKind::Welcome => format!("You're now on the {} plan.", plan),
            NotificationKind::PaymentReceipt => format!("We received your {} payment.", plan),
            NotificationKind::PaymentFailed => {
                "Your last payment failed. Update your payment method to keep your plan.".to_string()
            }
            NotificationKind::Cancellation => {
                "Your subscription has been canceled. You're back on the FREE plan.".to_string()
            }
        };

        let email = Email::new(&self.from, to, kind.subject()).text(body);
        self.mailer
            .send(&email)
            .await
            .map_err(|e| BillingError::NotificationDispatch {
                kind: kind.to_string(),
                message: e.to_string(),
            })
    }
}
