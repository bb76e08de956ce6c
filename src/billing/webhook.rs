//! Provider webhook handling.
//!
//! Verifies signatures, translates provider payloads into [`BillingEvent`]s,
//! and feeds them to the [`Reconciler`]. The processing deadline covers the
//! commit only; notifications for a committed change always run.

use std::sync::Arc;
use std::time::Duration;

use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use sha2::Sha256;
use subtle::ConstantTimeEq;

use super::audit::{BillingAuditEvent, BillingAuditLogger, NoOpAuditLogger};
use super::error::{BillingError, BillingResult};
use super::event::{BillingEvent, BillingEventKind};
use super::plans::{PlanCatalog, PlanName};
use super::storage::{BillingStore, SubscriptionStatus};
use super::subscription::{ReconcileOutcome, Reconciler};
use crate::utils::unix_now;

/// Header carrying the webhook signature.
pub const SIGNATURE_HEADER: &str = "stripe-signature";

/// Webhook handler for provider events.
///
/// The webhook secret is stored using [`SecretString`] to prevent accidental
/// exposure in logs or debug output.
pub struct WebhookHandler<S: BillingStore> {
    reconciler: Arc<Reconciler<S>>,
    webhook_secret: SecretString,
    tolerance_secs: u64,
    processing_timeout: Duration,
    retention_days: u32,
    audit: Arc<dyn BillingAuditLogger>,
}

impl<S: BillingStore> WebhookHandler<S> {
    #[must_use]
    pub fn new(reconciler: Arc<Reconciler<S>>, webhook_secret: impl Into<SecretString>) -> Self {
        Self {
            reconciler,
            webhook_secret: webhook_secret.into(),
            tolerance_secs: 300,
            processing_timeout: Duration::from_secs(20),
            retention_days: 30,
            audit: Arc::new(NoOpAuditLogger),
        }
    }

    /// Maximum accepted age of a signature timestamp.
    #[must_use]
    pub fn with_tolerance_secs(mut self, secs: u64) -> Self {
        self.tolerance_secs = secs;
        self
    }

    #[must_use]
    pub fn with_processing_timeout(mut self, timeout: Duration) -> Self {
        self.processing_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_retention_days(mut self, days: u32) -> Self {
        self.retention_days = days;
        self
    }

    #[must_use]
    pub fn with_audit_logger(mut self, audit: Arc<dyn BillingAuditLogger>) -> Self {
        self.audit = audit;
        self
    }

    /// Verify the signature against the current time and parse the event.
    pub fn verify_signature(&self, payload: &[u8], signature: &str) -> BillingResult<WebhookEvent> {
        self.verify_signature_at(payload, signature, unix_now())
    }

    /// Verify the signature as of `now` (unix seconds) and parse the event.
    ///
    /// # Errors
    ///
    /// `InvalidWebhookSignature` for a malformed header or a mismatch,
    /// `WebhookTimestampExpired` outside the tolerance window,
    /// `InvalidWebhookPayload` if the verified body is not an event.
    pub fn verify_signature_at(
        &self,
        payload: &[u8],
        signature: &str,
        now: u64,
    ) -> BillingResult<WebhookEvent> {
        let parts = parse_signature_header(signature)?;

        let age = now.abs_diff(parts.timestamp);
        if age > self.tolerance_secs {
            return Err(BillingError::WebhookTimestampExpired { age_seconds: age });
        }

        let mut signed_payload = format!("{}.", parts.timestamp).into_bytes();
        signed_payload.extend_from_slice(payload);
        let expected = compute_signature(self.webhook_secret.expose_secret(), &signed_payload)?;
        let expected = hex::decode(expected).map_err(|_| BillingError::InvalidWebhookSignature)?;

        // Any v1 entry may match; the provider sends several while rolling secrets.
        let matched = parts.signatures.iter().any(|candidate| {
            hex::decode(candidate)
                .map(|provided| expected.ct_eq(&provided).unwrap_u8() == 1)
                .unwrap_or(false)
        });
        if !matched {
            return Err(BillingError::InvalidWebhookSignature);
        }

        serde_json::from_slice(payload).map_err(|e| {
            tracing::warn!(
                target: "plansync::billing::webhook",
                error = %e,
                "Failed to parse webhook payload"
            );
            BillingError::InvalidWebhookPayload {
                message: "malformed JSON payload".to_string(),
            }
        })
    }

    /// Verify and process a raw delivery.
    pub async fn handle(&self, payload: &[u8], signature: &str) -> BillingResult<WebhookOutcome> {
        let event = self.verify_signature(payload, signature)?;
        self.handle_event(event).await
    }

    /// Process a verified webhook event.
    ///
    /// A delivery id is recorded only after its event has been reconciled
    /// (or deliberately dropped), so failed deliveries are retried in full.
    ///
    /// # Errors
    ///
    /// Fatal reconciliation errors and `ProcessingTimeout` are returned for the
    /// caller to answer with a 5xx, which makes the provider redeliver.
    pub async fn handle_event(&self, event: WebhookEvent) -> BillingResult<WebhookOutcome> {
        let store = self.reconciler.store();

        if store.is_event_processed(&event.id).await? {
            tracing::debug!(
                target: "plansync::billing::webhook",
                event_id = %event.id,
                "Webhook event already processed"
            );
            return Ok(WebhookOutcome::AlreadyProcessed);
        }

        let Some(billing_event) = translate(&event, self.reconciler.catalog())? else {
            tracing::debug!(
                target: "plansync::billing::webhook",
                event_id = %event.id,
                event_type = %event.event_type,
                "Ignoring webhook event"
            );
            return Ok(WebhookOutcome::Ignored);
        };

        let reconciled =
            tokio::time::timeout(self.processing_timeout, self.reconciler.apply(&billing_event))
                .await
                .map_err(|_| {
                    tracing::error!(
                        target: "plansync::billing::webhook",
                        event_id = %event.id,
                        subscription_id = %billing_event.external_subscription_id,
                        timeout_ms = u64::try_from(self.processing_timeout.as_millis()).unwrap_or(u64::MAX),
                        "Webhook processing timed out"
                    );
                    BillingError::ProcessingTimeout {
                        subscription_id: billing_event.external_subscription_id.clone(),
                    }
                })??;

        // Runs on its own task so a cancelled request cannot drop the notification.
        let settled = {
            let reconciler = Arc::clone(&self.reconciler);
            let billing_event = billing_event.clone();
            let reconciled = reconciled.clone();
            tokio::spawn(async move { reconciler.settle(&billing_event, &reconciled).await })
        };
        if let Err(err) = settled.await {
            tracing::error!(
                target: "plansync::billing::webhook",
                event_id = %event.id,
                error = %err,
                "Side effects of a reconciled event did not complete"
            );
        }

        let outcome = WebhookOutcome::from(&reconciled);
        store.mark_event_processed(&event.id).await?;

        tracing::info!(
            target: "plansync::billing::webhook",
            event_id = %event.id,
            event_type = %event.event_type,
            subscription_id = %billing_event.external_subscription_id,
            outcome = outcome.as_str(),
            "Webhook event handled"
        );
        self.audit
            .log(BillingAuditEvent::WebhookProcessed {
                event_id: event.id,
                event_type: event.event_type,
                outcome: outcome.as_str().to_string(),
            })
            .await;

        Ok(outcome)
    }

    /// Forget delivery ids older than the retention window.
    pub async fn cleanup_processed_events(&self) -> BillingResult<usize> {
        let removed = self
            .reconciler
            .store()
            .cleanup_old_events(self.retention_days)
            .await?;
        if removed > 0 {
            tracing::info!(
                target: "plansync::billing::webhook",
                removed,
                retention_days = self.retention_days,
                "Cleaned up processed webhook events"
            );
        }
        Ok(removed)
    }
}

/// Parsed webhook event.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct WebhookEvent {
    pub id: String,
    /// Event type (e.g., "customer.subscription.updated").
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: WebhookEventData,
    /// Timestamp when the event was created.
    pub created: u64,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct WebhookEventData {
    /// The object that triggered the event.
    pub object: Value,
}

/// Outcome of webhook processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookOutcome {
    /// State changed.
    Processed,
    /// The event restated stored state.
    Unchanged,
    /// The event was older than stored state.
    Stale,
    /// The event could not be interpreted and was acknowledged without effect.
    Dropped,
    /// Not a billing event we handle.
    Ignored,
    /// Delivery id seen before.
    AlreadyProcessed,
}

impl WebhookOutcome {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Processed => "processed",
            Self::Unchanged => "unchanged",
            Self::Stale => "stale",
            Self::Dropped => "dropped",
            Self::Ignored => "ignored",
            Self::AlreadyProcessed => "already_processed",
        }
    }
}

impl From<&ReconcileOutcome> for WebhookOutcome {
    fn from(outcome: &ReconcileOutcome) -> Self {
        match outcome {
            ReconcileOutcome::Applied(_) => Self::Processed,
            ReconcileOutcome::Unchanged => Self::Unchanged,
            ReconcileOutcome::Stale { .. } => Self::Stale,
            ReconcileOutcome::Dropped { .. } => Self::Dropped,
        }
    }
}

/// Translate a provider event into a billing event.
///
/// Returns `Ok(None)` for event types that carry no subscription fact, and
/// for checkouts and invoices not tied to a subscription.
pub fn translate(event: &WebhookEvent, catalog: &PlanCatalog) -> BillingResult<Option<BillingEvent>> {
    let object = &event.data.object;

    let translated = match event.event_type.as_str() {
        "checkout.session.completed" => {
            let Some(subscription_id) = object.get("subscription").and_then(id_of) else {
                return Ok(None);
            };
            let mut billing = BillingEvent::new(BillingEventKind::CheckoutCompleted, subscription_id);
            if let Some(reference) = str_at(object, "/client_reference_id")
                .or_else(|| str_at(object, "/metadata/reference_id"))
            {
                billing = billing.reference(reference);
            }
            // Sessions carry line items only when expanded; fall back to the plan we stamped.
            let price = str_at(object, "/line_items/data/0/price/id")
                .map(str::to_string)
                .or_else(|| {
                    str_at(object, "/metadata/plan")
                        .and_then(|p| p.parse::<PlanName>().ok())
                        .and_then(|p| catalog.resolve_by_name(p).external_price_id.clone())
                });
            if let Some(price) = price {
                billing = billing.price(price);
            }
            billing
        }
        "customer.subscription.created" | "customer.subscription.updated" => {
            subscription_event(BillingEventKind::SubscriptionUpdated, object)?
        }
        "customer.subscription.deleted" => {
            subscription_event(BillingEventKind::SubscriptionCanceled, object)?
        }
        "invoice.paid" | "invoice.payment_failed" => {
            let subscription_id = object
                .get("subscription")
                .and_then(id_of)
                .or_else(|| str_at(object, "/parent/subscription_details/subscription").map(str::to_string));
            let Some(subscription_id) = subscription_id else {
                return Ok(None);
            };
            let kind = if event.event_type == "invoice.paid" {
                BillingEventKind::InvoicePaid
            } else {
                BillingEventKind::PaymentFailed
            };
            let mut billing = BillingEvent::new(kind, subscription_id);
            if let Some(price) = str_at(object, "/lines/data/0/price/id")
                .or_else(|| str_at(object, "/lines/data/0/pricing/price_details/price"))
            {
                billing = billing.price(price);
            }
            if let Some(reference) = str_at(object, "/subscription_details/metadata/reference_id")
                .or_else(|| str_at(object, "/parent/subscription_details/metadata/reference_id"))
                .or_else(|| str_at(object, "/lines/data/0/metadata/reference_id"))
            {
                billing = billing.reference(reference);
            }
            if let Some(end) = object.pointer("/lines/data/0/period/end").and_then(Value::as_u64) {
                billing = billing.period_end(end);
            }
            billing
        }
        _ => return Ok(None),
    };

    let mut translated = translated
        .event_id(event.id.clone())
        .occurred_at(event.created)
        .payload(object.clone());
    if translated.external_customer_id.is_none() {
        if let Some(customer) = object.get("customer").and_then(id_of) {
            translated = translated.customer(customer);
        }
    }
    Ok(Some(translated))
}

fn subscription_event(kind: BillingEventKind, object: &Value) -> BillingResult<BillingEvent> {
    let id = str_at(object, "/id").ok_or_else(|| BillingError::InvalidWebhookPayload {
        message: "missing subscription id".to_string(),
    })?;
    let mut billing = BillingEvent::new(kind, id);

    if let Some(price) = str_at(object, "/items/data/0/price/id") {
        billing = billing.price(price);
    }
    if let Some(reference) = str_at(object, "/metadata/reference_id") {
        billing = billing.reference(reference);
    }
    if let Some(raw) = str_at(object, "/status") {
        match SubscriptionStatus::from_provider(raw) {
            Some(status) => billing = billing.status(status),
            None => tracing::warn!(
                target: "plansync::billing::webhook",
                subscription_id = %id,
                status = %raw,
                "Unknown subscription status, keeping stored status"
            ),
        }
    }
    let period_end = object
        .get("current_period_end")
        .and_then(Value::as_u64)
        .or_else(|| object.pointer("/items/data/0/current_period_end").and_then(Value::as_u64));
    if let Some(end) = period_end {
        billing = billing.period_end(end);
    }
    Ok(billing)
}

fn str_at<'a>(value: &'a Value, pointer: &str) -> Option<&'a str> {
    value
        .pointer(pointer)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
}

/// An id that may be sent bare or as an expanded object.
fn id_of(value: &Value) -> Option<String> {
    match value {
        Value::String(id) if !id.is_empty() => Some(id.clone()),
        Value::Object(_) => str_at(value, "/id").map(str::to_string),
        _ => None,
    }
}

/// Parsed signature header parts.
struct SignatureParts {
    timestamp: u64,
    signatures: Vec<String>,
}

/// Parse a `t=…,v1=…` signature header.
fn parse_signature_header(header: &str) -> BillingResult<SignatureParts> {
    let mut timestamp = None;
    let mut signatures = Vec::new();

    for part in header.split(',') {
        let (key, value) = part
            .split_once('=')
            .ok_or(BillingError::InvalidWebhookSignature)?;

        match key.trim() {
            "t" => timestamp = value.trim().parse().ok(),
            "v1" => signatures.push(value.trim().to_string()),
            _ => {} // Ignore other versions
        }
    }

    if signatures.is_empty() {
        return Err(BillingError::InvalidWebhookSignature);
    }
    Ok(SignatureParts {
        timestamp: timestamp.ok_or(BillingError::InvalidWebhookSignature)?,
        signatures,
    })
}

/// Compute a hex HMAC-SHA256 signature.
pub(crate) fn compute_signature(secret: &str, payload: &[u8]) -> BillingResult<String> {
    type HmacSha256 = Hmac<Sha256>;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| BillingError::Internal {
        message: "HMAC key error".to_string(),
    })?;

    mac.update(payload);
    Ok(hex::encode(mac.finalize().into_bytes()))
}
