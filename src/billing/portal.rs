//! Billing portal session management.
//!
//! Paid users manage or cancel their subscription on the provider's hosted
//! portal. Free users have nothing to manage there and are sent to pricing.

use std::sync::Arc;

use super::audit::{BillingAuditEvent, BillingAuditLogger, NoOpAuditLogger};
use super::client::{BillingProviderClient, CreatePortalSessionRequest, ProviderSession};
use super::error::{BillingError, BillingResult};
use super::guard::{CurrentUser, require_owner};
use super::plans::PlanName;
use super::storage::BillingStore;

/// A portal session. The URL is a bearer credential for the user's billing
/// account; hand it to the browser and drop it.
pub type PortalSession = ProviderSession;

/// Configuration for the portal gateway.
#[derive(Debug, Clone)]
pub struct PortalConfig {
    /// Where the provider sends the user when they leave the portal.
    pub return_url: String,
}

impl PortalConfig {
    #[must_use]
    pub fn new(return_url: impl Into<String>) -> Self {
        Self {
            return_url: return_url.into(),
        }
    }
}

/// Opens billing-portal sessions for paying users.
pub struct PortalGateway<S: BillingStore> {
    store: S,
    client: Arc<dyn BillingProviderClient>,
    config: PortalConfig,
    audit: Arc<dyn BillingAuditLogger>,
}

impl<S: BillingStore> PortalGateway<S> {
    #[must_use]
    pub fn new(store: S, client: Arc<dyn BillingProviderClient>, config: PortalConfig) -> Self {
        Self {
            store,
            client,
            config,
            audit: Arc::new(NoOpAuditLogger),
        }
    }

    #[must_use]
    pub fn with_audit_logger(mut self, audit: Arc<dyn BillingAuditLogger>) -> Self {
        self.audit = audit;
        self
    }

    /// Open a portal session for the caller's own billing identity.
    ///
    /// # Errors
    ///
    /// `Unauthorized` without a caller, `NoActiveSubscription` for a free
    /// user (no provider call is made), `ProviderApi` if the provider fails.
    pub async fn open_portal(&self, caller: Option<&CurrentUser>) -> BillingResult<PortalSession> {
        let caller = caller.ok_or(BillingError::Unauthorized)?;
        self.open_portal_for(Some(caller), &caller.id).await
    }

    /// Open a portal session for `reference_id`, which must be the caller.
    pub async fn open_portal_for(
        &self,
        caller: Option<&CurrentUser>,
        reference_id: &str,
    ) -> BillingResult<PortalSession> {
        let caller = require_owner(caller, reference_id)?;

        let user = self
            .store
            .get_user(&caller.id)
            .await?
            .ok_or_else(|| BillingError::UserNotFound {
                user_id: caller.id.clone(),
            })?;
        if user.subscription_type == PlanName::Free {
            return Err(BillingError::NoActiveSubscription { user_id: user.id });
        }

        let customer_id = self
            .store
            .list_subscriptions_for_user(&user.id)
            .await?
            .into_iter()
            .filter(|s| s.external_customer_id.is_some())
            .max_by_key(|s| s.updated_at)
            .and_then(|s| s.external_customer_id);
        let Some(external_customer_id) = customer_id else {
            tracing::warn!(
                target: "plansync::billing::portal",
                user_id = %user.id,
                plan = %user.subscription_type,
                "Paid user has no provider customer on record"
            );
            return Err(BillingError::NoActiveSubscription { user_id: user.id });
        };

        let session = self
            .client
            .create_portal_session(CreatePortalSessionRequest {
                reference_id: user.id.clone(),
                external_customer_id,
                return_url: self.config.return_url.clone(),
            })
            .await?;

        tracing::info!(
            target: "plansync::billing::portal",
            user_id = %user.id,
            session_id = %session.id,
            "Opened billing portal session"
        );
        self.audit
            .log(BillingAuditEvent::PortalSessionCreated {
                user_id: user.id,
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
    use crate::billing::storage::memory::InMemoryBillingStore;
    use crate::billing::storage::{StoredSubscription, SubscriptionStatus, UserRecord};
    use crate::testing::MockBillingProvider;

    fn paid_store() -> InMemoryBillingStore {
        let store = InMemoryBillingStore::new();
        let mut user = UserRecord::new("u1");
        user.subscription_type = PlanName::Monthly;
        store.insert_user(user);
        store.insert_user(UserRecord::new("u2"));
        store.insert_subscription(StoredSubscription {
            id: "sub_1".to_string(),
            reference_id: "u1".to_string(),
            plan: PlanName::Monthly,
            status: SubscriptionStatus::Active,
            period_end: None,
            external_customer_id: Some("cus_1".to_string()),
            last_event_at: None,
            version: 1,
            created_at: 1,
            updated_at: 1,
        });
        store
    }

    fn gateway(store: InMemoryBillingStore, provider: &MockBillingProvider) -> PortalGateway<InMemoryBillingStore> {
        PortalGateway::new(
            store,
            Arc::new(provider.clone()),
            PortalConfig::new("https://app.example.com/settings"),
        )
    }

    #[tokio::test]
    async fn test_paid_user_gets_session() {
        let provider = MockBillingProvider::new();
        let audit = MemoryAuditLogger::new();
        let gateway = gateway(paid_store(), &provider).with_audit_logger(Arc::new(audit.clone()));
        let caller = CurrentUser::new("u1", PlanName::Monthly);

        let session = gateway.open_portal(Some(&caller)).await.unwrap();

        assert!(session.url.starts_with("https://"));
        let requests = provider.portal_requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].external_customer_id, "cus_1");
        assert_eq!(requests[0].return_url, "https://app.example.com/settings");
        assert!(matches!(
            audit.events().await.as_slice(),
            [BillingAuditEvent::PortalSessionCreated { .. }]
        ));
    }

    #[tokio::test]
    async fn test_free_user_never_reaches_provider() {
        let provider = MockBillingProvider::new();
        let gateway = gateway(paid_store(), &provider);
        let caller = CurrentUser::new("u2", PlanName::Free);

        let err = gateway.open_portal(Some(&caller)).await.unwrap_err();

        assert!(matches!(err, BillingError::NoActiveSubscription { .. }));
        assert_eq!(provider.call_count(), 0);
    }

    #[tokio::test]
    async fn test_unauthenticated_and_foreign_callers() {
        let provider = MockBillingProvider::new();
        let gateway = gateway(paid_store(), &provider);

        assert_eq!(
            gateway.open_portal(None).await.unwrap_err(),
            BillingError::Unauthorized
        );

        let intruder = CurrentUser::new("u2", PlanName::Free);
        assert!(matches!(
            gateway.open_portal_for(Some(&intruder), "u1").await.unwrap_err(),
            BillingError::Forbidden { .. }
        ));
        assert_eq!(provider.call_count(), 0);
    }

    #[tokio::test]
    async fn test_provider_failure_propagates() {
        let provider = MockBillingProvider::new();
        provider.fail_next(1);
        let gateway = gateway(paid_store(), &provider);
        let caller = CurrentUser::new("u1", PlanName::Monthly);

        let err = gateway.open_portal(Some(&caller)).await.unwrap_err();
        assert!(matches!(err, BillingError::ProviderApi { .. }));
    }
}
