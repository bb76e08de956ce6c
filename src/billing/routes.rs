//! HTTP routes for billing.
//!
//! | Route | Purpose |
//! |---|---|
//! | `POST /webhooks/billing` | provider webhook deliveries |
//! | `POST /billing/portal` | redirect to the billing portal, or to pricing for free users |
//! | `POST /billing/checkout` | start a checkout for `{"plan": "MONTHLY" \| "YEARLY"}` |
//! | `GET /billing/plan` | the caller's plan |

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, State},
    http::HeaderMap,
    response::{IntoResponse, Redirect, Response},
    routing::{get, post},
};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::error::BillingError;
use super::guard::SessionResolver;
use super::manager::BillingManager;
use super::plans::PlanName;
use super::storage::BillingStore;
use super::webhook::SIGNATURE_HEADER;
use crate::error::{AppError, Result};

/// Shared state for the billing routes.
pub struct BillingState<S: BillingStore> {
    manager: Arc<BillingManager<S>>,
    sessions: Arc<dyn SessionResolver>,
    pricing_url: Arc<str>,
}

impl<S: BillingStore> Clone for BillingState<S> {
    fn clone(&self) -> Self {
        Self {
            manager: self.manager.clone(),
            sessions: self.sessions.clone(),
            pricing_url: self.pricing_url.clone(),
        }
    }
}

impl<S: BillingStore> BillingState<S> {
    pub fn new(
        manager: Arc<BillingManager<S>>,
        sessions: Arc<dyn SessionResolver>,
        pricing_url: impl Into<String>,
    ) -> Self {
        Self {
            manager,
            sessions,
            pricing_url: Arc::from(pricing_url.into()),
        }
    }

    #[must_use]
    pub fn manager(&self) -> &BillingManager<S> {
        &self.manager
    }
}

/// Build the billing router.
pub fn billing_routes<S: BillingStore + 'static>(state: BillingState<S>, max_body_size: usize) -> Router {
    Router::new()
        .route("/webhooks/billing", post(webhook_handler::<S>))
        .route("/billing/portal", post(portal_handler::<S>))
        .route("/billing/checkout", post(checkout_handler::<S>))
        .route("/billing/plan", get(plan_handler::<S>))
        .layer(DefaultBodyLimit::max(max_body_size))
        .with_state(state)
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WebhookAck {
    pub received: bool,
    pub outcome: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CheckoutBody {
    pub plan: PlanName,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CheckoutResponse {
    pub session_id: String,
    pub url: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PlanResponse {
    pub user_id: String,
    pub plan: PlanName,
    pub has_active_subscription: bool,
}

async fn webhook_handler<S: BillingStore + 'static>(
    State(state): State<BillingState<S>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookAck>> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or(BillingError::InvalidWebhookSignature)?;

    let outcome = state.manager.handle_webhook(&body, signature).await?;
    Ok(Json(WebhookAck {
        received: true,
        outcome: outcome.as_str().to_string(),
    }))
}

async fn portal_handler<S: BillingStore + 'static>(
    State(state): State<BillingState<S>>,
    headers: HeaderMap,
) -> Result<Response> {
    let caller = state.sessions.current_user(&headers).await;
    match state.manager.open_portal(caller.as_ref()).await {
        Ok(session) => Ok(Redirect::to(&session.url).into_response()),
        Err(BillingError::NoActiveSubscription { .. }) => {
            Ok(Redirect::to(&state.pricing_url).into_response())
        }
        Err(err) => Err(AppError::from(err)),
    }
}

async fn checkout_handler<S: BillingStore + 'static>(
    State(state): State<BillingState<S>>,
    headers: HeaderMap,
    Json(body): Json<CheckoutBody>,
) -> Result<Json<CheckoutResponse>> {
    let caller = state.sessions.current_user(&headers).await;
    let session = state.manager.create_checkout(caller.as_ref(), body.plan).await?;
    Ok(Json(CheckoutResponse {
        session_id: session.id,
        url: session.url,
    }))
}

async fn plan_handler<S: BillingStore + 'static>(
    State(state): State<BillingState<S>>,
    headers: HeaderMap,
) -> Result<Json<PlanResponse>> {
    let caller = state
        .sessions
        .current_user(&headers)
        .await
        .ok_or(BillingError::Unauthorized)?;

    let plan = state.manager.current_plan(&caller.id).await?;
    let has_active_subscription = state.manager.has_active_subscription(&caller.id).await?;
    Ok(Json(PlanResponse {
        user_id: caller.id,
        plan,
        has_active_subscription,
    }))
}
