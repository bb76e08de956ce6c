//! Checkout session management.
//!
//! Starts a provider checkout for a paid plan. The caller's id travels with
//! the session as metadata, so the events the provider later emits for the
//! new subscription name their owner.

use std::sync::Arc;

use super::audit::{BillingAuditEvent, BillingAuditLogger, NoOpAuditLogger};
use super::client::{BillingProviderClient, CreateCheckoutSessionRequest, ProviderSession};
use super::error::{BillingError, BillingResult};
use super::guard::{CurrentUser, require_owner};
use super::plans::{PlanCatalog, PlanName};
use super::storage::BillingStore;

/// A checkout session to redirect the user to.
pub type CheckoutSession = ProviderSession;

/// Configuration for checkout sessions.
#[derive(Debug, Clone)]
pub struct CheckoutConfig {
    pub success_url: String,
    pub cancel_url: String,
}

impl CheckoutConfig {
    #[must_use]
    pub fn new(success_url: impl Into<String>, cancel_url: impl Into<String>) -> Self {
        Self {
            success_url: success_url.into(),
            cancel_url: cancel_url.into(),
        }
    }
}

/// Creates checkout sessions for paid plans.
pub struct CheckoutGateway<S: BillingStore> {
    store: S,
    client: Arc<dyn BillingProviderClient>,
    catalog: PlanCatalog,
    config: CheckoutConfig,
    audit: Arc<dyn BillingAuditLogger>,
}

impl<S: BillingStore> CheckoutGateway<S> {
    #[must_use]
    pub fn new(
        store: S,
        client: Arc<dyn BillingProviderClient>,
        catalog: PlanCatalog,
        config: CheckoutConfig,
    ) -> Self {
        Self {
            store,
            client,
            catalog,
            config,
            audit: Arc::new(NoOpAuditLogger),
        }
    }

    #[must_use]
    pub fn with_audit_logger(mut self, audit: Arc<dyn BillingAuditLogger>) -> Self {
        self.audit = audit;
        self
    }

    /// Start a checkout for the caller.
    pub async fn create_checkout(
        &self,
        caller: Option<&CurrentUser>,
        plan: PlanName,
    ) -> BillingResult<CheckoutSession> {
        let caller = caller.ok_or(BillingError::Unauthorized)?;
        self.create_checkout_for(Some(caller), &caller.id, plan).await
    }

    /// Start a checkout for `reference_id`, which must be the caller.
    ///
    /// # Errors
    ///
    /// `PlanNotPurchasable` for FREE or a plan without a provider price,
    /// `AlreadySubscribed` when the user's flag is already `plan`.
    pub async fn create_checkout_for(
        &self,
        caller: Option<&CurrentUser>,
        reference_id: &str,
        plan: PlanName,
    ) -> BillingResult<CheckoutSession> {
        let caller = require_owner(caller, reference_id)?;

        let external_price_id = self
            .catalog
            .resolve_by_name(plan)
            .external_price_id
            .clone()
            .filter(|_| plan.is_paid())
            .ok_or(BillingError::PlanNotPurchasable { plan })?;

        let user = self
            .store
            .get_user(&caller.id)
            .await?
            .ok_or_else(|| BillingError::UserNotFound {
                user_id: caller.id.clone(),
            })?;
        if user.subscription_type == plan {
            return Err(BillingError::AlreadySubscribed {
                user_id: user.id,
                plan,
            });
        }

        let external_customer_id = self
            .store
            .list_subscriptions_for_user(&user.id)
            .await?
            .into_iter()
            .filter(|s| s.external_customer_id.is_some())
            .max_by_key(|s| s.updated_at)
            .and_then(|s| s.external_customer_id);

        let session = self
            .client
            .create_checkout_session(CreateCheckoutSessionRequest {
                reference_id: user.id.clone(),
                plan,
                external_price_id,
                external_customer_id,
                email: user.email.clone(),
                success_url: self.config.success_url.clone(),
                cancel_url: self.config.cancel_url.clone(),
            })
            .await?;

        tracing::info!(
            target: "plansync::billing::checkout",
            user_id = %user.id,
            plan = %plan,
            session_id = %session.id,
            "Created checkout session"
        );
        self.audit
            .log(BillingAuditEvent::CheckoutCreated {
                user_id: user.id,
                plan: plan.to_string(),
                session_id: session.id.clone(),
            })
            .await;

        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::audit::MemoryAuditLogger;
    use crate::billing::storage::UserRecord;
    use crate::billing::storage::memory::InMemoryBillingStore;
    use crate::testing::{MockBillingProvider, sample_catalog};

    fn setup() -> (CheckoutGateway<InMemoryBillingStore>, MockBillingProvider) {
        let store = InMemoryBillingStore::new();
        store.insert_user(UserRecord::new("u1").with_email("u1@example.com"));
        let mut yearly = UserRecord::new("u2");
        yearly.subscription_type = PlanName::Yearly;
        store.insert_user(yearly);

        let provider = MockBillingProvider::new();
        let gateway = CheckoutGateway::new(
            store,
            Arc::new(provider.clone()),
            sample_catalog(),
            CheckoutConfig::new("https://app.example.com/welcome", "https://app.example.com/pricing"),
        );
        (gateway, provider)
    }

    #[tokio::test]
    async fn test_checkout_embeds_reference_and_price() {
        let (gateway, provider) = setup();
        let caller = CurrentUser::new("u1", PlanName::Free);

        gateway
            .create_checkout(Some(&caller), PlanName::Monthly)
            .await
            .unwrap();

        let requests = provider.checkout_requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].reference_id, "u1");
        assert_eq!(requests[0].external_price_id, "price_monthly");
        assert_eq!(requests[0].email.as_deref(), Some("u1@example.com"));
    }

    #[tokio::test]
    async fn test_checkout_is_audited() {
        let (gateway, _provider) = setup();
        let audit = MemoryAuditLogger::new();
        let gateway = gateway.with_audit_logger(Arc::new(audit.clone()));
        let caller = CurrentUser::new("u1", PlanName::Free);

        let session = gateway
            .create_checkout(Some(&caller), PlanName::Yearly)
            .await
            .unwrap();

        assert_eq!(
            audit.events().await,
            vec![BillingAuditEvent::CheckoutCreated {
                user_id: "u1".to_string(),
                plan: "YEARLY".to_string(),
                session_id: session.id,
            }]
        );
    }

    #[tokio::test]
    async fn test_free_plan_is_not_purchasable() {
        let (gateway, provider) = setup();
        let caller = CurrentUser::new("u1", PlanName::Free);

        let err = gateway
            .create_checkout(Some(&caller), PlanName::Free)
            .await
            .unwrap_err();
        assert_eq!(err, BillingError::PlanNotPurchasable { plan: PlanName::Free });
        assert_eq!(provider.call_count(), 0);
    }

    #[tokio::test]
    async fn test_same_plan_is_rejected_but_switch_is_allowed() {
        let (gateway, _provider) = setup();
        let caller = CurrentUser::new("u2", PlanName::Yearly);

        assert!(matches!(
            gateway.create_checkout(Some(&caller), PlanName::Yearly).await,
            Err(BillingError::AlreadySubscribed { .. })
        ));
        assert!(
            gateway
                .create_checkout(Some(&caller), PlanName::Monthly)
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn test_checkout_for_someone_else_is_forbidden() {
        let (gateway, provider) = setup();
        let caller = CurrentUser::new("u1", PlanName::Free);

        assert!(matches!(
            gateway
                .create_checkout_for(Some(&caller), "u2", PlanName::Monthly)
                .await,
            Err(BillingError::Forbidden { .. })
        ));
        assert_eq!(
            gateway.create_checkout(None, PlanName::Monthly).await.unwrap_err(),
            BillingError::Unauthorized
        );
        assert_eq!(provider.call_count(), 0);
    }
}
