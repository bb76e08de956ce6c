//! Subscription lifecycle synchronization.
//!
//! Keeps each user's plan flag (`FREE`, `MONTHLY`, `YEARLY`) in agreement
//! with what the payment provider says about their subscriptions. Provider
//! events are reconciled idempotently, one subscription at a time, and each
//! committed change produces at most one notification.
//!
//! # Example
//!
//! ```rust,ignore
//! use plansync::billing::{BillingManager, PlanCatalog, PlanName};
//!
//! let catalog = PlanCatalog::builder()
//!     .plan(PlanName::Monthly)
//!         .external_price("price_monthly")
//!         .price(1499)
//!         .done()
//!     .plan(PlanName::Yearly)
//!         .external_price("price_yearly")
//!         .price(11988)
//!         .popular()
//!         .done()
//!     .build();
//!
//! let billing = BillingManager::builder(store, catalog)
//!     .provider(Arc::new(provider))
//!     .notifications(Arc::new(sender))
//!     .webhook_secret(secret)
//!     .build()?;
//!
//! if billing.current_plan(&user.id).await?.is_paid() {
//!     // unlock premium features
//! }
//! ```

pub mod audit;
pub mod checkout;
pub mod client;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod guard;
pub mod live_client;
pub mod locks;
pub mod manager;
pub mod plans;
pub mod portal;
pub mod routes;
#[cfg(feature = "billing-seaorm")]
pub mod sea_orm_store;
pub mod storage;
pub mod subscription;
pub mod webhook;

// Plan exports
pub use plans::{Plan, PlanBuilder, PlanCatalog, PlanCatalogBuilder, PlanInterval, PlanName};

// Storage exports
pub use storage::{BillingStore, StoredSubscription, SubscriptionStatus, SyncWrite, UserRecord};
pub use storage::memory::InMemoryBillingStore;

#[cfg(feature = "billing-seaorm")]
pub use sea_orm_store::SeaOrmBillingStore;

// Reconciliation exports
pub use event::{BillingEvent, BillingEventKind};
pub use locks::{SubscriptionLockGuard, SubscriptionLocks};
pub use subscription::{
    ConsistencyCheck, Decision, ReconcileOutcome, Reconciler, SubscriptionSnapshot, Transition,
    decide, resolve_user_plan,
};

// Notification exports
pub use dispatch::{
    DispatchReport, Dispatcher, MailerNotificationSender, NotificationKind, NotificationSender,
    PendingNotification, classify,
};

// Access exports
pub use guard::{CurrentUser, PlanOverrides, SessionResolver, authorize, require_owner};

// Provider exports
pub use checkout::{CheckoutConfig, CheckoutGateway, CheckoutSession};
pub use client::{
    BillingProviderClient, CreateCheckoutSessionRequest, CreatePortalSessionRequest,
    ProviderSession,
};
pub use live_client::{LiveClientConfig, LiveProviderClient};
pub use portal::{PortalConfig, PortalGateway, PortalSession};

// Webhook exports
pub use webhook::{WebhookEvent, WebhookEventData, WebhookHandler, WebhookOutcome, translate};

// Facade and HTTP exports
pub use manager::{BillingManager, BillingManagerBuilder, live_provider};
pub use routes::{BillingState, billing_routes};

// Audit exports
pub use audit::{
    BillingAuditEvent, BillingAuditLogger, MemoryAuditLogger, NoOpAuditLogger, TracingAuditLogger,
};

// Error exports
pub use error::{BillingError, BillingResult};
