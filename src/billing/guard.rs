//! Ownership checks for billing actions.
//!
//! A user may only start a checkout or open a portal for their own billing
//! identity. There is no default-allow path: a missing caller is
//! `Unauthorized`, a different caller is `Forbidden`.

use std::collections::HashMap;

use async_trait::async_trait;
use axum::http::HeaderMap;

use super::error::{BillingError, BillingResult};
use super::plans::PlanName;

/// The authenticated user making a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentUser {
    pub id: String,
    pub subscription_type: PlanName,
}

impl CurrentUser {
    #[must_use]
    pub fn new(id: impl Into<String>, subscription_type: PlanName) -> Self {
        Self {
            id: id.into(),
            subscription_type,
        }
    }
}

/// Resolves the current user from request headers.
///
/// Implemented by the application's session layer.
#[async_trait]
pub trait SessionResolver: Send + Sync {
    async fn current_user(&self, headers: &HeaderMap) -> Option<CurrentUser>;
}

/// `true` exactly when the caller is the owner.
#[must_use]
pub fn authorize(caller_id: &str, reference_id: &str) -> bool {
    caller_id == reference_id
}

/// Require an authenticated caller who owns `reference_id`.
pub fn require_owner<'a>(
    caller: Option<&'a CurrentUser>,
    reference_id: &str,
) -> BillingResult<&'a CurrentUser> {
    let caller = caller.ok_or(BillingError::Unauthorized)?;
    if !authorize(&caller.id, reference_id) {
        tracing::warn!(
            target: "plansync::billing::guard",
            caller_id = %caller.id,
            reference_id = %reference_id,
            "Rejected billing action on another user's identity"
        );
        return Err(BillingError::Forbidden {
            caller_id: caller.id.clone(),
            reference_id: reference_id.to_string(),
        });
    }
    Ok(caller)
}

/// Explicit plan grants for specific users (staff, testers).
///
/// Read-only: a grant changes what [`effective_plan`](Self::effective_plan)
/// reports, never the stored plan flag.
#[derive(Debug, Clone, Default)]
pub struct PlanOverrides {
    grants: HashMap<String, PlanName>,
}

impl PlanOverrides {
    #[must_use]
    pub fn new(grants: HashMap<String, PlanName>) -> Self {
        Self { grants }
    }

    #[must_use]
    pub fn grant(mut self, user_id: impl Into<String>, plan: PlanName) -> Self {
        self.grants.insert(user_id.into(), plan);
        self
    }

    #[must_use]
    pub fn get(&self, user_id: &str) -> Option<PlanName> {
        self.grants.get(user_id).copied()
    }

    /// The better of the stored plan and any grant.
    #[must_use]
    pub fn effective_plan(&self, user_id: &str, stored: PlanName) -> PlanName {
        match self.get(user_id) {
            Some(granted) if granted > stored => granted,
            _ => stored,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.grants.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_authorize_is_equality() {
        let ids = ["u1", "u2", "", "U1", "u1 "];
        for caller in ids {
            for reference in ids {
                assert_eq!(authorize(caller, reference), caller == reference);
            }
        }
    }

    #[test]
    fn test_require_owner() {
        let user = CurrentUser::new("u1", PlanName::Monthly);

        assert_eq!(require_owner(Some(&user), "u1").unwrap().id, "u1");
        assert_eq!(
            require_owner(None, "u1").unwrap_err(),
            BillingError::Unauthorized
        );
        assert!(matches!(
            require_owner(Some(&user), "u2").unwrap_err(),
            BillingError::Forbidden { .. }
        ));
        assert!(matches!(
            require_owner(Some(&user), "does-not-exist").unwrap_err(),
            BillingError::Forbidden { .. }
        ));
    }

    #[test]
    fn test_overrides_only_upgrade() {
        let overrides = PlanOverrides::default()
            .grant("staff", PlanName::Yearly)
            .grant("tester", PlanName::Free);

        assert_eq!(overrides.effective_plan("staff", PlanName::Free), PlanName::Yearly);
        assert_eq!(overrides.effective_plan("tester", PlanName::Monthly), PlanName::Monthly);
        assert_eq!(overrides.effective_plan("someone", PlanName::Free), PlanName::Free);
    }
}
