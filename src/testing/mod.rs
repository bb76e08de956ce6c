//! Testing utilities for plansync.
//!
//! In-process doubles for every outside collaborator, plus a scenario
//! builder for driving the HTTP routes without starting a server.
//!
//! # Example
//!
//! ```rust,ignore
//! use plansync::testing::{self, HeaderSessionResolver};
//!
//! let response = testing::post(app, "/billing/portal")
//!     .user("u1")
//!     .execute()
//!     .await
//!     .assert_status(StatusCode::SEE_OTHER);
//! ```

mod doubles;
mod scenario;

pub use crate::billing::storage::memory::InMemoryBillingStore;
pub use doubles::{
    HeaderSessionResolver, MockBillingProvider, RecordingNotificationSender, SentNotification,
    USER_ID_HEADER,
};
pub use scenario::{Scenario, ScenarioAssert, get, post};

use crate::billing::{PlanCatalog, PlanName};

/// A catalog with `price_monthly` at 14.99 and `price_yearly` at 119.88.
#[must_use]
pub fn sample_catalog() -> PlanCatalog {
    PlanCatalog::builder()
        .plan(PlanName::Free)
            .features(["profile", "daily_likes"])
            .done()
        .plan(PlanName::Monthly)
            .external_price("price_monthly")
            .price(1499)
            .features(["profile", "unlimited_likes", "see_who_liked"])
            .done()
        .plan(PlanName::Yearly)
            .external_price("price_yearly")
            .price(11988)
            .popular()
            .features(["profile", "unlimited_likes", "see_who_liked"])
            .done()
        .build()
}

/// Build a `t=…,v1=…` signature header for `payload` signed at `timestamp`.
#[must_use]
pub fn sign_payload(secret: &str, payload: &[u8], timestamp: u64) -> String {
    let mut signed = format!("{}.", timestamp).into_bytes();
    signed.extend_from_slice(payload);
    let signature = crate::billing::webhook::compute_signature(secret, &signed)
        .unwrap_or_default();
    format!("t={},v1={}", timestamp, signature)
}
