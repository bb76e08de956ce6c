//! Test doubles for the provider, the notifier and the session layer.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use axum::http::HeaderMap;

use crate::billing::client::{
    BillingProviderClient, CreateCheckoutSessionRequest, CreatePortalSessionRequest,
    ProviderSession,
};
use crate::billing::dispatch::{NotificationKind, NotificationSender};
use crate::billing::error::{BillingError, BillingResult};
use crate::billing::guard::{CurrentUser, SessionResolver};
use crate::billing::storage::BillingStore;

/// A notification captured by [`RecordingNotificationSender`].
#[derive(Debug, Clone, PartialEq)]
pub struct SentNotification {
    pub kind: NotificationKind,
    pub user_id: String,
    pub payload: serde_json::Value,
}

/// Records every notification instead of sending it.
#[derive(Debug, Clone, Default)]
pub struct RecordingNotificationSender {
    sent: Arc<tokio::sync::Mutex<Vec<SentNotification>>>,
    failures: Arc<AtomicUsize>,
}

impl RecordingNotificationSender {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` sends fail.
    pub fn fail_next(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    pub async fn sent(&self) -> Vec<SentNotification> {
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl NotificationSender for RecordingNotificationSender {
    async fn send(
        &self,
        kind: NotificationKind,
        user_id: &str,
        payload: &serde_json::Value,
    ) -> BillingResult<()> {
        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(BillingError::NotificationDispatch {
                kind: kind.to_string(),
                message: "injected failure".to_string(),
            });
        }
        self.sent.lock().await.push(SentNotification {
            kind,
            user_id: user_id.to_string(),
            payload: payload.clone(),
        });
        Ok(())
    }
}

#[derive(Debug, Default)]
struct ProviderState {
    checkouts: Vec<CreateCheckoutSessionRequest>,
    portals: Vec<CreatePortalSessionRequest>,
}

/// Provider client that hands out fake session URLs.
#[derive(Debug, Clone, Default)]
pub struct MockBillingProvider {
    state: Arc<Mutex<ProviderState>>,
    session_counter: Arc<AtomicU64>,
    failures: Arc<AtomicUsize>,
}

impl MockBillingProvider {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` calls fail with a provider 500.
    pub fn fail_next(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    /// Calls that reached the provider, failed ones included.
    #[must_use]
    pub fn call_count(&self) -> u64 {
        self.session_counter.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn checkout_requests(&self) -> Vec<CreateCheckoutSessionRequest> {
        self.state().checkouts.clone()
    }

    #[must_use]
    pub fn portal_requests(&self) -> Vec<CreatePortalSessionRequest> {
        self.state().portals.clone()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, ProviderState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_session(&self, operation: &str, prefix: &str, host: &str) -> BillingResult<ProviderSession> {
        let n = self.session_counter.fetch_add(1, Ordering::SeqCst);
        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(BillingError::ProviderApi {
                operation: operation.to_string(),
                message: "injected failure".to_string(),
                http_status: Some(500),
            });
        }
        let id = format!("{}_test_{}", prefix, n);
        Ok(ProviderSession {
            url: format!("https://{}/session/{}", host, id),
            id,
        })
    }
}

#[async_trait]
impl BillingProviderClient for MockBillingProvider {
    async fn create_checkout_session(
        &self,
        request: CreateCheckoutSessionRequest,
    ) -> BillingResult<ProviderSession> {
        self.state().checkouts.push(request);
        self.next_session("create_checkout_session", "cs", "checkout.example.com")
    }

    async fn create_portal_session(
        &self,
        request: CreatePortalSessionRequest,
    ) -> BillingResult<ProviderSession> {
        self.state().portals.push(request);
        self.next_session("create_portal_session", "bps", "billing.example.com")
    }
}

/// Header naming the signed-in user for [`HeaderSessionResolver`].
pub const USER_ID_HEADER: &str = "x-user-id";

/// Trusts an `x-user-id` header and looks the user up in a store.
#[derive(Debug, Clone)]
pub struct HeaderSessionResolver<S> {
    store: S,
}

impl<S: BillingStore> HeaderSessionResolver<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }
}

#[async_trait]
impl<S: BillingStore> SessionResolver for HeaderSessionResolver<S> {
    async fn current_user(&self, headers: &HeaderMap) -> Option<CurrentUser> {
        let user_id = headers.get(USER_ID_HEADER)?.to_str().ok()?;
        let user = self.store.get_user(user_id).await.ok()??;
        Some(CurrentUser::new(user.id, user.subscription_type))
    }
}
