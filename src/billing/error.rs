//! Billing-specific error types.
//!
//! Errors are split by who can act on them: anomalies in provider data are
//! dropped and recorded, storage failures are surfaced so the provider
//! redelivers, and authorization failures go back to the caller untouched.

use std::fmt;

use super::plans::PlanName;

/// Result alias used throughout the billing module.
pub type BillingResult<T> = std::result::Result<T, BillingError>;

/// Billing-specific errors.
///
/// Convert to [`AppError`](crate::error::AppError) at the HTTP boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BillingError {
    // Provider data anomalies
    /// The price id on an event is not in the plan catalog.
    UnresolvablePlan { price_id: String },
    /// The event names a different owner than the stored subscription.
    OwnershipMismatch {
        subscription_id: String,
        owner: String,
        claimed: String,
    },

    /// First sighting of a subscription with no owner on the event.
    ///
    /// Usually an invoice that overtook its checkout; redelivery resolves it.
    UnknownOwner { subscription_id: String },

    // Write path
    /// The two-entity write did not commit as a unit.
    PartialUpdate { subscription_id: String, message: String },
    /// The subscription changed between read and write.
    ConcurrentModification { subscription_id: String },
    /// Reconciliation did not finish within the processing window.
    ProcessingTimeout { subscription_id: String },
    /// Operation gave up after repeated conflicts.
    RetryLimitExceeded { operation: String },
    /// The store itself failed.
    Storage { message: String },

    // Caller errors
    /// No authenticated caller.
    Unauthorized,
    /// The caller does not own the billing identity they asked for.
    Forbidden { caller_id: String, reference_id: String },
    /// The user is on FREE and has nothing to manage.
    NoActiveSubscription { user_id: String },
    /// The user already holds the plan they are trying to buy.
    AlreadySubscribed { user_id: String, plan: PlanName },
    /// FREE, or a paid plan without a configured price.
    PlanNotPurchasable { plan: PlanName },
    /// No user record for the id.
    UserNotFound { user_id: String },

    // Notifications
    /// A notification could not be delivered.
    NotificationDispatch { kind: String, message: String },

    // Webhook errors
    /// Signature header missing, malformed or wrong.
    InvalidWebhookSignature,
    /// Signature timestamp outside the tolerance window.
    WebhookTimestampExpired { age_seconds: u64 },
    /// The payload could not be interpreted.
    InvalidWebhookPayload { message: String },

    // Provider API
    /// The payment provider rejected or failed a request.
    ProviderApi {
        operation: String,
        message: String,
        http_status: Option<u16>,
    },

    /// Anything else.
    Internal { message: String },
}

impl fmt::Display for BillingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnresolvablePlan { price_id } => {
                write!(f, "No plan matches external price id '{}'", price_id)
            }
            Self::OwnershipMismatch {
                subscription_id,
                owner,
                claimed,
            } => write!(
                f,
                "Subscription {} belongs to {}, event claims {}",
                subscription_id, owner, claimed
            ),
            Self::UnknownOwner { subscription_id } => {
                write!(f, "Subscription {} is unknown and the event names no owner", subscription_id)
            }
            Self::PartialUpdate {
                subscription_id,
                message,
            } => write!(
                f,
                "Update of subscription {} did not commit: {}",
                subscription_id, message
            ),
            Self::ConcurrentModification { subscription_id } => {
                write!(f, "Subscription {} was modified concurrently", subscription_id)
            }
            Self::ProcessingTimeout { subscription_id } => {
                write!(f, "Processing of subscription {} timed out", subscription_id)
            }
            Self::RetryLimitExceeded { operation } => {
                write!(f, "Operation '{}' failed after multiple retries", operation)
            }
            Self::Storage { message } => write!(f, "Billing store error: {}", message),
            Self::Unauthorized => write!(f, "Authentication required"),
            Self::Forbidden {
                caller_id,
                reference_id,
            } => write!(
                f,
                "User {} may not manage billing for {}",
                caller_id, reference_id
            ),
            Self::NoActiveSubscription { user_id } => {
                write!(f, "User {} has no active subscription", user_id)
            }
            Self::AlreadySubscribed { user_id, plan } => {
                write!(f, "User {} is already on the {} plan", user_id, plan)
            }
            Self::PlanNotPurchasable { plan } => {
                write!(f, "Plan {} cannot be purchased", plan)
            }
            Self::UserNotFound { user_id } => write!(f, "User not found: {}", user_id),
            Self::NotificationDispatch { kind, message } => {
                write!(f, "Failed to send {} notification: {}", kind, message)
            }
            Self::InvalidWebhookSignature => write!(f, "Invalid webhook signature"),
            Self::WebhookTimestampExpired { age_seconds } => {
                write!(f, "Webhook timestamp too old ({} seconds)", age_seconds)
            }
            Self::InvalidWebhookPayload { message } => {
                write!(f, "Invalid webhook payload: {}", message)
            }
            Self::ProviderApi {
                operation,
                message,
                http_status,
            } => {
                write!(f, "Provider error during {}: {}", operation, message)?;
                if let Some(status) = http_status {
                    write!(f, " [HTTP {}]", status)?;
                }
                Ok(())
            }
            Self::Internal { message } => write!(f, "Internal billing error: {}", message),
        }
    }
}

impl std::error::Error for BillingError {}

impl From<BillingError> for crate::error::AppError {
    fn from(err: BillingError) -> Self {
        use crate::error::AppError;

        match &err {
            BillingError::Unauthorized => AppError::Unauthorized(err.to_string()),

            BillingError::Forbidden { .. } => AppError::Forbidden(err.to_string()),

            BillingError::UserNotFound { .. } | BillingError::NoActiveSubscription { .. } => {
                AppError::NotFound(err.to_string())
            }

            BillingError::AlreadySubscribed { .. } => AppError::Conflict(err.to_string()),

            BillingError::UnresolvablePlan { .. }
            | BillingError::OwnershipMismatch { .. }
            | BillingError::PlanNotPurchasable { .. }
            | BillingError::InvalidWebhookSignature
            | BillingError::WebhookTimestampExpired { .. }
            | BillingError::InvalidWebhookPayload { .. } => AppError::BadRequest(err.to_string()),

            BillingError::ProcessingTimeout { .. } | BillingError::UnknownOwner { .. } => {
                AppError::ServiceUnavailable(err.to_string())
            }

            BillingError::ProviderApi { http_status, .. } => match http_status {
                Some(429) | Some(500..=599) | None => {
                    AppError::ServiceUnavailable(err.to_string())
                }
                Some(400..=499) => AppError::BadRequest(err.to_string()),
                _ => AppError::Internal(err.to_string()),
            },

            BillingError::PartialUpdate { .. }
            | BillingError::ConcurrentModification { .. }
            | BillingError::RetryLimitExceeded { .. }
            | BillingError::Storage { .. }
            | BillingError::NotificationDispatch { .. }
            | BillingError::Internal { .. } => AppError::Internal(err.to_string()),
        }
    }
}

impl BillingError {
    /// Check if this is a client error (4xx).
    #[must_use]
    pub fn is_client_error(&self) -> bool {
        match self {
            Self::Unauthorized
            | Self::Forbidden { .. }
            | Self::NoActiveSubscription { .. }
            | Self::AlreadySubscribed { .. }
            | Self::PlanNotPurchasable { .. }
            | Self::UserNotFound { .. }
            | Self::InvalidWebhookSignature
            | Self::WebhookTimestampExpired { .. }
            | Self::InvalidWebhookPayload { .. } => true,
            Self::ProviderApi { http_status, .. } => {
                matches!(http_status, Some(400..=428) | Some(430..=499))
            }
            _ => false,
        }
    }

    /// Check if this error is retryable.
    ///
    /// Retryable errors during event processing are surfaced to the provider
    /// so that the event is redelivered.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::PartialUpdate { .. }
            | Self::UnknownOwner { .. }
            | Self::ConcurrentModification { .. }
            | Self::ProcessingTimeout { .. }
            | Self::RetryLimitExceeded { .. }
            | Self::Storage { .. } => true,
            Self::ProviderApi { http_status, .. } => {
                matches!(http_status, Some(429) | Some(500..=599))
            }
            _ => false,
        }
    }

    /// Problems with the event's content rather than with processing it.
    ///
    /// These drop the event without touching state. Redelivering the same
    /// event would fail the same way.
    #[must_use]
    pub fn is_non_fatal_anomaly(&self) -> bool {
        matches!(
            self,
            Self::UnresolvablePlan { .. } | Self::OwnershipMismatch { .. }
        )
    }

    pub(crate) fn storage(err: impl fmt::Display) -> Self {
        Self::Storage {
            message: err.to_string(),
        }
    }
}
