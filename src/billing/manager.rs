//! Unified billing facade.
//!
//! [`BillingManager`] wires the reconciler, the webhook handler and both
//! gateways around one store, and is what the HTTP layer and the rest of the
//! application talk to.

use std::sync::Arc;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};

use super::audit::{BillingAuditLogger, NoOpAuditLogger};
use super::checkout::{CheckoutConfig, CheckoutGateway, CheckoutSession};
use super::client::BillingProviderClient;
use super::dispatch::{Dispatcher, NotificationSender};
use super::error::{BillingError, BillingResult};
use super::event::BillingEvent;
use super::guard::{CurrentUser, PlanOverrides};
use super::live_client::{LiveClientConfig, LiveProviderClient};
use super::plans::{PlanCatalog, PlanName};
use super::portal::{PortalConfig, PortalGateway, PortalSession};
use super::storage::BillingStore;
use super::subscription::{ConsistencyCheck, ReconcileOutcome, Reconciler};
use super::webhook::{WebhookEvent, WebhookHandler, WebhookOutcome};
use crate::config::Config;

/// Unified billing manager.
pub struct BillingManager<S: BillingStore> {
    reconciler: Arc<Reconciler<S>>,
    webhooks: WebhookHandler<S>,
    portal: PortalGateway<S>,
    checkout: CheckoutGateway<S>,
    overrides: PlanOverrides,
}

impl<S: BillingStore + Clone> BillingManager<S> {
    #[must_use]
    pub fn builder(store: S, catalog: PlanCatalog) -> BillingManagerBuilder<S> {
        BillingManagerBuilder::new(store, catalog)
    }

    /// Build a manager from validated configuration.
    ///
    /// # Errors
    ///
    /// Fails if the catalog or the webhook secret is invalid.
    pub fn from_config(
        store: S,
        config: &Config,
        provider: Arc<dyn BillingProviderClient>,
        sender: Arc<dyn NotificationSender>,
        audit: Arc<dyn BillingAuditLogger>,
    ) -> BillingResult<Self> {
        let billing = &config.billing;
        let mut builder = Self::builder(store, PlanCatalog::from_config(&config.catalog)?)
            .provider(provider)
            .notifications(sender)
            .audit_logger(audit)
            .overrides(PlanOverrides::new(billing.plan_overrides.clone()))
            .portal(PortalConfig::new(&billing.portal_return_url))
            .checkout(CheckoutConfig::new(
                &billing.checkout_success_url,
                &billing.checkout_cancel_url,
            ))
            .webhook_tolerance_secs(billing.webhook_tolerance_secs)
            .processing_timeout(billing.processing_timeout())
            .processed_event_retention_days(billing.processed_event_retention_days)
            .max_conflict_retries(billing.max_conflict_retries)
            .max_pending_notifications(config.notifications.max_pending_retries);
        if let Some(secret) = &billing.webhook_secret {
            builder = builder.webhook_secret(SecretString::from(secret.expose_secret().to_owned()));
        }
        builder.build()
    }
}

impl<S: BillingStore> BillingManager<S> {
    /// The plan a user is treated as having: their stored flag, raised by any
    /// explicit grant.
    pub async fn current_plan(&self, user_id: &str) -> BillingResult<PlanName> {
        let stored = self.reconciler.current_plan(user_id).await?;
        Ok(self.overrides.effective_plan(user_id, stored))
    }

    /// The stored plan flag, ignoring grants.
    pub async fn stored_plan(&self, user_id: &str) -> BillingResult<PlanName> {
        self.reconciler.current_plan(user_id).await
    }

    pub async fn has_active_subscription(&self, user_id: &str) -> BillingResult<bool> {
        self.reconciler.has_active_subscription(user_id).await
    }

    pub async fn open_portal(&self, caller: Option<&CurrentUser>) -> BillingResult<PortalSession> {
        self.portal.open_portal(caller).await
    }

    pub async fn create_checkout(
        &self,
        caller: Option<&CurrentUser>,
        plan: PlanName,
    ) -> BillingResult<CheckoutSession> {
        self.checkout.create_checkout(caller, plan).await
    }

    pub async fn reconcile(&self, event: &BillingEvent) -> BillingResult<ReconcileOutcome> {
        self.reconciler.reconcile(event).await
    }

    /// Verify and process a raw webhook delivery.
    pub async fn handle_webhook(
        &self,
        payload: &[u8],
        signature: &str,
    ) -> BillingResult<WebhookOutcome> {
        self.webhooks.handle(payload, signature).await
    }

    pub async fn handle_webhook_event(&self, event: WebhookEvent) -> BillingResult<WebhookOutcome> {
        self.webhooks.handle_event(event).await
    }

    pub async fn cleanup_processed_events(&self) -> BillingResult<usize> {
        self.webhooks.cleanup_processed_events().await
    }

    /// Retry queued notifications; returns how many were delivered.
    pub async fn retry_failed_notifications(&self) -> usize {
        self.reconciler.dispatcher().retry_failed().await
    }

    pub async fn check_consistency(&self, user_id: &str) -> BillingResult<ConsistencyCheck> {
        self.reconciler.check_consistency(user_id).await
    }

    #[must_use]
    pub fn catalog(&self) -> &PlanCatalog {
        self.reconciler.catalog()
    }

    #[must_use]
    pub fn overrides(&self) -> &PlanOverrides {
        &self.overrides
    }
}

/// Builder for [`BillingManager`].
#[must_use = "builder does nothing until you call build()"]
pub struct BillingManagerBuilder<S> {
    store: S,
    catalog: PlanCatalog,
    provider: Option<Arc<dyn BillingProviderClient>>,
    sender: Option<Arc<dyn NotificationSender>>,
    audit: Arc<dyn BillingAuditLogger>,
    webhook_secret: Option<SecretString>,
    overrides: PlanOverrides,
    portal: PortalConfig,
    checkout: CheckoutConfig,
    webhook_tolerance_secs: u64,
    processing_timeout: Duration,
    retention_days: u32,
    max_conflict_retries: u32,
    max_pending_notifications: usize,
}

impl<S: BillingStore + Clone> BillingManagerBuilder<S> {
    pub fn new(store: S, catalog: PlanCatalog) -> Self {
        Self {
            store,
            catalog,
            provider: None,
            sender: None,
            audit: Arc::new(NoOpAuditLogger),
            webhook_secret: None,
            overrides: PlanOverrides::default(),
            portal: PortalConfig::new("http://localhost:8000/account"),
            checkout: CheckoutConfig::new(
                "http://localhost:8000/account?checkout=success",
                "http://localhost:8000/pricing",
            ),
            webhook_tolerance_secs: 300,
            processing_timeout: Duration::from_secs(20),
            retention_days: 30,
            max_conflict_retries: 3,
            max_pending_notifications: 1000,
        }
    }

    pub fn provider(mut self, provider: Arc<dyn BillingProviderClient>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn notifications(mut self, sender: Arc<dyn NotificationSender>) -> Self {
        self.sender = Some(sender);
        self
    }

    pub fn audit_logger(mut self, audit: Arc<dyn BillingAuditLogger>) -> Self {
        self.audit = audit;
        self
    }

    pub fn webhook_secret(mut self, secret: impl Into<SecretString>) -> Self {
        self.webhook_secret = Some(secret.into());
        self
    }

    pub fn overrides(mut self, overrides: PlanOverrides) -> Self {
        self.overrides = overrides;
        self
    }

    pub fn portal(mut self, config: PortalConfig) -> Self {
        self.portal = config;
        self
    }

    pub fn checkout(mut self, config: CheckoutConfig) -> Self {
        self.checkout = config;
        self
    }

    pub fn webhook_tolerance_secs(mut self, secs: u64) -> Self {
        self.webhook_tolerance_secs = secs;
        self
    }

    pub fn processing_timeout(mut self, timeout: Duration) -> Self {
        self.processing_timeout = timeout;
        self
    }

    pub fn processed_event_retention_days(mut self, days: u32) -> Self {
        self.retention_days = days;
        self
    }

    pub fn max_conflict_retries(mut self, retries: u32) -> Self {
        self.max_conflict_retries = retries;
        self
    }

    pub fn max_pending_notifications(mut self, max: usize) -> Self {
        self.max_pending_notifications = max;
        self
    }

    /// # Errors
    ///
    /// Fails without a provider, a notification sender or a webhook secret,
    /// or if the catalog does not validate.
    pub fn build(self) -> BillingResult<BillingManager<S>> {
        let missing = |what: &str| BillingError::Internal {
            message: format!("billing manager requires {}", what),
        };
        let provider = self.provider.ok_or_else(|| missing("a provider client"))?;
        let sender = self.sender.ok_or_else(|| missing("a notification sender"))?;
        let webhook_secret = self.webhook_secret.ok_or_else(|| missing("a webhook secret"))?;
        self.catalog.validate()?;

        let dispatcher = Dispatcher::new(sender)
            .with_audit_logger(self.audit.clone())
            .with_max_pending(self.max_pending_notifications);
        let reconciler = Arc::new(
            Reconciler::new(self.store.clone(), self.catalog.clone(), dispatcher)
                .with_audit_logger(self.audit.clone())
                .with_max_conflict_retries(self.max_conflict_retries),
        );
        let webhooks = WebhookHandler::new(reconciler.clone(), webhook_secret)
            .with_tolerance_secs(self.webhook_tolerance_secs)
            .with_processing_timeout(self.processing_timeout)
            .with_retention_days(self.retention_days)
            .with_audit_logger(self.audit.clone());
        let portal = PortalGateway::new(self.store.clone(), provider.clone(), self.portal)
            .with_audit_logger(self.audit.clone());
        let checkout = CheckoutGateway::new(self.store, provider, self.catalog, self.checkout)
            .with_audit_logger(self.audit);

        Ok(BillingManager {
            reconciler,
            webhooks,
            portal,
            checkout,
            overrides: self.overrides,
        })
    }
}

/// Build the live provider client from configuration.
///
/// # Errors
///
/// Fails if no API key is configured or it has an unexpected format.
pub fn live_provider(config: &Config) -> BillingResult<LiveProviderClient> {
    let key = config
        .billing
        .provider_api_key
        .as_ref()
        .map(|key| SecretString::from(key.expose_secret().to_owned()))
        .ok_or_else(|| BillingError::Internal {
            message: "provider API key is not configured".to_string(),
        })?;
    LiveProviderClient::new(
        key,
        LiveClientConfig::new().base_url(&config.billing.provider_base_url),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::event::BillingEventKind;
    use crate::billing::storage::UserRecord;
    use crate::billing::storage::memory::InMemoryBillingStore;
    use crate::testing::{MockBillingProvider, RecordingNotificationSender, sample_catalog};

    fn manager(store: InMemoryBillingStore) -> BillingManager<InMemoryBillingStore> {
        BillingManager::builder(store, sample_catalog())
            .provider(Arc::new(MockBillingProvider::new()))
            .notifications(Arc::new(RecordingNotificationSender::new()))
            .webhook_secret("whsec_test")
            .overrides(PlanOverrides::default().grant("staff", PlanName::Yearly))
            .build()
            .unwrap()
    }

    #[test]
    fn test_builder_requires_collaborators() {
        let result = BillingManager::builder(InMemoryBillingStore::new(), sample_catalog())
            .provider(Arc::new(MockBillingProvider::new()))
            .webhook_secret("whsec_test")
            .build();
        assert!(matches!(result, Err(BillingError::Internal { .. })));
    }

    #[tokio::test]
    async fn test_current_plan_applies_overrides() {
        let store = InMemoryBillingStore::new();
        store.insert_user(UserRecord::new("staff"));
        store.insert_user(UserRecord::new("u1"));
        let manager = manager(store);

        assert_eq!(manager.current_plan("staff").await.unwrap(), PlanName::Yearly);
        assert_eq!(manager.stored_plan("staff").await.unwrap(), PlanName::Free);
        assert_eq!(manager.current_plan("u1").await.unwrap(), PlanName::Free);
        assert!(matches!(
            manager.current_plan("ghost").await,
            Err(BillingError::UserNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_reconcile_through_manager() {
        let store = InMemoryBillingStore::new();
        store.insert_user(UserRecord::new("u1"));
        let manager = manager(store.clone());

        let event = BillingEvent::new(BillingEventKind::CheckoutCompleted, "sub_1")
            .reference("u1")
            .price("price_monthly");
        let outcome = manager.reconcile(&event).await.unwrap();

        assert!(matches!(outcome, ReconcileOutcome::Applied(_)));
        assert_eq!(manager.current_plan("u1").await.unwrap(), PlanName::Monthly);
        assert!(manager.has_active_subscription("u1").await.unwrap());
        assert_eq!(
            manager.check_consistency("u1").await.unwrap(),
            ConsistencyCheck::InSync { plan: PlanName::Monthly }
        );
    }

    #[test]
    fn test_live_provider_requires_key() {
        let config = Config::default();
        assert!(live_provider(&config).is_err());
    }
}
