//! Outbound calls to the payment provider.
//!
//! Only two calls are needed: starting a checkout and opening the hosted
//! billing portal. Both return a short-lived URL that must reach the user's
//! browser and nothing else, so [`ProviderSession`] keeps it out of `Debug`.

use std::fmt;

use async_trait::async_trait;

use super::error::BillingResult;
use super::plans::PlanName;

/// Request to create a checkout session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateCheckoutSessionRequest {
    /// Owning user id, attached to the subscription as metadata.
    pub reference_id: String,
    pub plan: PlanName,
    pub external_price_id: String,
    /// Reuse an existing provider customer when one is known.
    pub external_customer_id: Option<String>,
    pub email: Option<String>,
    pub success_url: String,
    pub cancel_url: String,
}

/// Request to create a billing-portal session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatePortalSessionRequest {
    pub reference_id: String,
    pub external_customer_id: String,
    pub return_url: String,
}

/// A provider-hosted session the user is redirected to.
#[derive(Clone, PartialEq, Eq)]
#[must_use]
pub struct ProviderSession {
    pub id: String,
    /// Grants access to the user's billing account until it expires.
    pub url: String,
}

impl fmt::Debug for ProviderSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderSession")
            .field("id", &self.id)
            .field("url", &"[REDACTED]")
            .finish()
    }
}

/// The payment provider's session API.
#[async_trait]
pub trait BillingProviderClient: Send + Sync {
    async fn create_checkout_session(
        &self,
        request: CreateCheckoutSessionRequest,
    ) -> BillingResult<ProviderSession>;

    async fn create_portal_session(
        &self,
        request: CreatePortalSessionRequest,
    ) -> BillingResult<ProviderSession>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_redacts_url() {
        let session = ProviderSession {
            id: "bps_1".to_string(),
            url: "https://billing.example.com/p/session/secret-token".to_string(),
        };
        let debug = format!("{:?}", session);
        assert!(debug.contains("bps_1"));
        assert!(!debug.contains("secret-token"));
    }
}
