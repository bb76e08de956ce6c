//! Billing facts, decoupled from the provider's wire format.

use serde::{Deserialize, Serialize};

use super::storage::SubscriptionStatus;

/// What happened at the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BillingEventKind {
    CheckoutCompleted,
    SubscriptionUpdated,
    InvoicePaid,
    PaymentFailed,
    SubscriptionCanceled,
}

impl BillingEventKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CheckoutCompleted => "checkout-completed",
            Self::SubscriptionUpdated => "subscription-updated",
            Self::InvoicePaid => "invoice-paid",
            Self::PaymentFailed => "payment-failed",
            Self::SubscriptionCanceled => "subscription-canceled",
        }
    }

    /// Status implied by the fact itself, for events that carry none.
    ///
    /// `None` means the fact says nothing about status.
    #[must_use]
    pub fn implied_status(&self) -> Option<SubscriptionStatus> {
        match self {
            Self::CheckoutCompleted | Self::InvoicePaid => Some(SubscriptionStatus::Active),
            Self::PaymentFailed => Some(SubscriptionStatus::PastDue),
            Self::SubscriptionCanceled => Some(SubscriptionStatus::Canceled),
            Self::SubscriptionUpdated => None,
        }
    }
}

impl std::fmt::Display for BillingEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One billing fact about one subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BillingEvent {
    pub kind: BillingEventKind,
    /// Provider delivery id, when known.
    pub event_id: Option<String>,
    pub external_subscription_id: String,
    pub external_price_id: Option<String>,
    /// Owning user id, carried in the subscription metadata.
    pub reference_id: Option<String>,
    pub external_customer_id: Option<String>,
    pub status: Option<SubscriptionStatus>,
    pub period_end: Option<u64>,
    /// When the provider says the fact happened (unix seconds).
    pub occurred_at: Option<u64>,
    pub payload: serde_json::Value,
}

impl BillingEvent {
    #[must_use]
    pub fn new(kind: BillingEventKind, external_subscription_id: impl Into<String>) -> Self {
        Self {
            kind,
            event_id: None,
            external_subscription_id: external_subscription_id.into(),
            external_price_id: None,
            reference_id: None,
            external_customer_id: None,
            status: None,
            period_end: None,
            occurred_at: None,
            payload: serde_json::Value::Null,
        }
    }

    #[must_use]
    pub fn event_id(mut self, id: impl Into<String>) -> Self {
        self.event_id = Some(id.into());
        self
    }

    #[must_use]
    pub fn price(mut self, price_id: impl Into<String>) -> Self {
        self.external_price_id = Some(price_id.into());
        self
    }

    #[must_use]
    pub fn reference(mut self, user_id: impl Into<String>) -> Self {
        self.reference_id = Some(user_id.into());
        self
    }

    #[must_use]
    pub fn customer(mut self, customer_id: impl Into<String>) -> Self {
        self.external_customer_id = Some(customer_id.into());
        self
    }

    #[must_use]
    pub fn status(mut self, status: SubscriptionStatus) -> Self {
        self.status = Some(status);
        self
    }

    #[must_use]
    pub fn period_end(mut self, period_end: u64) -> Self {
        self.period_end = Some(period_end);
        self
    }

    #[must_use]
    pub fn occurred_at(mut self, timestamp: u64) -> Self {
        self.occurred_at = Some(timestamp);
        self
    }

    #[must_use]
    pub fn payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_implied_status() {
        assert_eq!(
            BillingEventKind::PaymentFailed.implied_status(),
            Some(SubscriptionStatus::PastDue)
        );
        assert_eq!(BillingEventKind::SubscriptionUpdated.implied_status(), None);
    }

    #[test]
    fn test_kind_wire_names() {
        assert_eq!(
            serde_json::to_string(&BillingEventKind::SubscriptionCanceled).unwrap(),
            "\"subscription-canceled\""
        );
        assert_eq!(BillingEventKind::InvoicePaid.to_string(), "invoice-paid");
    }
}
