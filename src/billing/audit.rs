//! Audit trail for billing operations.
//!
//! Every state change, every dropped event and every failed notification is
//! reported here, so anomalies are visible without digging through debug logs.

use std::fmt;

use async_trait::async_trait;

/// Audit event types for billing operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BillingAuditEvent {
    /// Checkout session created.
    CheckoutCreated {
        user_id: String,
        plan: String,
        session_id: String,
    },
    /// First sighting of a subscription.
    SubscriptionCreated {
        user_id: String,
        subscription_id: String,
        plan: String,
        status: String,
    },
    /// Existing subscription changed plan, status or period.
    SubscriptionUpdated {
        user_id: String,
        subscription_id: String,
        plan: String,
        status: String,
    },
    /// Subscription reached `canceled`.
    SubscriptionCanceled {
        user_id: String,
        subscription_id: String,
    },
    /// The user's plan flag changed.
    UserPlanChanged {
        user_id: String,
        from: String,
        to: String,
    },
    /// An event was discarded without touching state.
    EventDropped {
        subscription_id: String,
        event_kind: String,
        reason: String,
    },
    /// A notification could not be delivered.
    NotificationFailed {
        user_id: String,
        kind: String,
        error: String,
    },
    /// Portal session created.
    PortalSessionCreated { user_id: String, session_id: String },
    /// Webhook processed.
    WebhookProcessed {
        event_id: String,
        event_type: String,
        outcome: String,
    },
}

impl fmt::Display for BillingAuditEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CheckoutCreated { user_id, plan, session_id } => {
                write!(f, "Checkout created: user={}, plan={}, session={}", user_id, plan, session_id)
            }
            Self::SubscriptionCreated { user_id, subscription_id, plan, status } => {
                write!(f, "Subscription created: user={}, sub={}, plan={}, status={}", user_id, subscription_id, plan, status)
            }
            Self::SubscriptionUpdated { user_id, subscription_id, plan, status } => {
                write!(f, "Subscription updated: user={}, sub={}, plan={}, status={}", user_id, subscription_id, plan, status)
            }
            Self::SubscriptionCanceled { user_id, subscription_id } => {
                write!(f, "Subscription canceled: user={}, sub={}", user_id, subscription_id)
            }
            Self::UserPlanChanged { user_id, from, to } => {
                write!(f, "User plan changed: user={}, from={}, to={}", user_id, from, to)
            }
            Self::EventDropped { subscription_id, event_kind, reason } => {
                write!(f, "Event dropped: sub={}, kind={}, reason={}", subscription_id, event_kind, reason)
            }
            Self::NotificationFailed { user_id, kind, error } => {
                write!(f, "Notification failed: user={}, kind={}, error={}", user_id, kind, error)
            }
            Self::PortalSessionCreated { user_id, session_id } => {
                write!(f, "Portal session created: user={}, session={}", user_id, session_id)
            }
            Self::WebhookProcessed { event_id, event_type, outcome } => {
                write!(f, "Webhook processed: event={}, type={}, outcome={}", event_id, event_type, outcome)
            }
        }
    }
}

/// Trait for audit logging backends.
///
/// Implementations should swallow their own failures; auditing never
/// interrupts billing.
#[async_trait]
pub trait BillingAuditLogger: Send + Sync {
    async fn log(&self, event: BillingAuditEvent);
}

/// Audit logger that discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpAuditLogger;

#[async_trait]
impl BillingAuditLogger for NoOpAuditLogger {
    async fn log(&self, _event: BillingAuditEvent) {}
}

/// Logs audit events through `tracing`.
///
/// Dropped events and failed notifications are logged at WARN, everything
/// else at INFO.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditLogger;

#[async_trait]
impl BillingAuditLogger for TracingAuditLogger {
    async fn log(&self, event: BillingAuditEvent) {
        match event {
            BillingAuditEvent::EventDropped { .. } | BillingAuditEvent::NotificationFailed { .. } => {
                tracing::warn!(
                    target: "plansync::billing::audit",
                    event_type = %event_kind(&event),
                    "{}", event
                );
            }
            _ => {
                tracing::info!(
                    target: "plansync::billing::audit",
                    event_type = %event_kind(&event),
                    "{}", event
                );
            }
        }
    }
}

fn event_kind(event: &BillingAuditEvent) -> &'static str {
    match event {
        BillingAuditEvent::CheckoutCreated { .. } => "checkout_created",
        BillingAuditEvent::SubscriptionCreated { .. } => "subscription_created",
        BillingAuditEvent::SubscriptionUpdated { .. } => "subscription_updated",
        BillingAuditEvent::SubscriptionCanceled { .. } => "subscription_canceled",
        BillingAuditEvent::UserPlanChanged { .. } => "user_plan_changed",
        BillingAuditEvent::EventDropped { .. } => "event_dropped",
        BillingAuditEvent::NotificationFailed { .. } => "notification_failed",
        BillingAuditEvent::PortalSessionCreated { .. } => "portal_session_created",
        BillingAuditEvent::WebhookProcessed { .. } => "webhook_processed",
    }
}

/// Audit logger that keeps events in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryAuditLogger {
    events: std::sync::Arc<tokio::sync::Mutex<Vec<BillingAuditEvent>>>,
}

impl MemoryAuditLogger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<BillingAuditEvent> {
        self.events.lock().await.clone()
    }
}

#[async_trait]
impl BillingAuditLogger for MemoryAuditLogger {
    async fn log(&self, event: BillingAuditEvent) {
        self.events.lock().await.push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_logger_captures_events() {
        let logger = MemoryAuditLogger::new();

        logger
            .log(BillingAuditEvent::EventDropped {
                subscription_id: "sub_1".to_string(),
                event_kind: "invoice-paid".to_string(),
                reason: "No plan matches external price id 'price_x'".to_string(),
            })
            .await;

        let events = logger.events().await;
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], BillingAuditEvent::EventDropped { .. }));
    }

    #[tokio::test]
    async fn test_loggers_accept_events() {
        let event = BillingAuditEvent::UserPlanChanged {
            user_id: "u1".to_string(),
            from: "FREE".to_string(),
            to: "MONTHLY".to_string(),
        };
        NoOpAuditLogger.log(event.clone()).await;
        TracingAuditLogger.log(event).await;
    }

    #[test]
    fn test_display() {
        let event = BillingAuditEvent::SubscriptionCanceled {
            user_id: "u1".to_string(),
            subscription_id: "sub_1".to_string(),
        };
        assert_eq!(event.to_string(), "Subscription canceled: user=u1, sub=sub_1");
        assert_eq!(event_kind(&event), "subscription_canceled");
    }
}
