//! HTTP tests for the billing routes: signed webhook deliveries, checkout,
//! portal and plan lookups.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::Router;
use axum::http::StatusCode;
use plansync::billing::{
    BillingManager, BillingState, CheckoutConfig, PlanName, PortalConfig, SubscriptionStatus,
    UserRecord, billing_routes,
};
use plansync::testing::{
    self, HeaderSessionResolver, InMemoryBillingStore, MockBillingProvider,
    RecordingNotificationSender, sample_catalog, sign_payload,
};
use serde_json::{Value, json};

const SECRET: &str = "whsec_routes_test";

struct TestApp {
    store: InMemoryBillingStore,
    provider: MockBillingProvider,
    sender: RecordingNotificationSender,
    router: Router,
}

impl TestApp {
    fn new() -> Self {
        let store = InMemoryBillingStore::new();
        store.insert_user(UserRecord::new("u1").with_email("u1@example.com"));
        store.insert_user(UserRecord::new("u2"));
        let provider = MockBillingProvider::new();
        let sender = RecordingNotificationSender::new();

        let manager = BillingManager::builder(store.clone(), sample_catalog())
            .provider(Arc::new(provider.clone()))
            .notifications(Arc::new(sender.clone()))
            .webhook_secret(SECRET)
            .portal(PortalConfig::new("https://app.example.com/settings"))
            .checkout(CheckoutConfig::new(
                "https://app.example.com/welcome",
                "https://app.example.com/pricing",
            ))
            .build()
            .unwrap();
        let state = BillingState::new(
            Arc::new(manager),
            Arc::new(HeaderSessionResolver::new(store.clone())),
            "/pricing",
        );

        Self {
            store,
            provider,
            sender,
            router: billing_routes(state, 64 * 1024),
        }
    }

    fn app(&self) -> Router {
        self.router.clone()
    }

    async fn deliver(&self, event: &Value) -> testing::ScenarioAssert {
        let payload = serde_json::to_vec(event).unwrap();
        let signature = sign_payload(SECRET, &payload, now());
        testing::post(self.app(), "/webhooks/billing")
            .header("stripe-signature", &signature)
            .header("content-type", "application/json")
            .raw_body(payload)
            .execute()
            .await
    }
}

fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs()
}

fn subscription_event(id: &str, event_type: &str, status: &str, price: &str, created: u64) -> Value {
    json!({
        "id": id,
        "type": event_type,
        "created": created,
        "data": {
            "object": {
                "id": "sub_1",
                "customer": "cus_1",
                "status": status,
                "current_period_end": created + 30 * 86_400,
                "items": {"data": [{"id": "si_1", "price": {"id": price}, "quantity": 1}]},
                "metadata": {"reference_id": "u1"}
            }
        }
    })
}

fn checkout_completed(id: &str, created: u64) -> Value {
    json!({
        "id": id,
        "type": "checkout.session.completed",
        "created": created,
        "data": {
            "object": {
                "id": "cs_1",
                "mode": "subscription",
                "client_reference_id": "u1",
                "customer": "cus_1",
                "subscription": "sub_1",
                "metadata": {"reference_id": "u1", "plan": "YEARLY"}
            }
        }
    })
}

#[tokio::test]
async fn test_checkout_webhook_upgrades_user() {
    let app = TestApp::new();

    let ack: Value = app
        .deliver(&checkout_completed("evt_1", now()))
        .await
        .assert_ok()
        .json()
        .await;
    assert_eq!(ack["received"], true);
    assert_eq!(ack["outcome"], "processed");

    assert_eq!(app.store.user("u1").unwrap().subscription_type, PlanName::Yearly);
    let sub = app.store.subscription("sub_1").unwrap();
    assert_eq!(sub.external_customer_id.as_deref(), Some("cus_1"));
    assert_eq!(app.sender.sent().await.len(), 1);
}

#[tokio::test]
async fn test_redelivered_webhook_is_acknowledged_once() {
    let app = TestApp::new();
    let event = checkout_completed("evt_1", now());

    app.deliver(&event).await.assert_ok();
    let ack: Value = app.deliver(&event).await.assert_ok().json().await;

    assert_eq!(ack["outcome"], "already_processed");
    assert_eq!(app.store.commit_count(), 1);
    assert_eq!(app.sender.sent().await.len(), 1);
}

#[tokio::test]
async fn test_tampered_webhook_is_rejected() {
    let app = TestApp::new();
    let payload = serde_json::to_vec(&checkout_completed("evt_1", now())).unwrap();
    let signature = sign_payload(SECRET, &payload, now());

    let mut tampered = payload.clone();
    tampered.extend_from_slice(b" ");
    testing::post(app.app(), "/webhooks/billing")
        .header("stripe-signature", &signature)
        .raw_body(tampered)
        .execute()
        .await
        .assert_status(StatusCode::BAD_REQUEST);

    let wrong_secret = sign_payload("whsec_other", &payload, now());
    testing::post(app.app(), "/webhooks/billing")
        .header("stripe-signature", &wrong_secret)
        .raw_body(payload)
        .execute()
        .await
        .assert_status(StatusCode::BAD_REQUEST);

    assert_eq!(app.store.user("u1").unwrap().subscription_type, PlanName::Free);
    assert_eq!(app.store.commit_count(), 0);
}

#[tokio::test]
async fn test_expired_webhook_timestamp_is_rejected() {
    let app = TestApp::new();
    let payload = serde_json::to_vec(&checkout_completed("evt_1", now())).unwrap();
    let signature = sign_payload(SECRET, &payload, now() - 3600);

    testing::post(app.app(), "/webhooks/billing")
        .header("stripe-signature", &signature)
        .raw_body(payload)
        .execute()
        .await
        .assert_status(StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_unhandled_event_type_is_acknowledged() {
    let app = TestApp::new();
    let event = json!({
        "id": "evt_x",
        "type": "customer.created",
        "created": now(),
        "data": {"object": {"id": "cus_9"}}
    });

    let ack: Value = app.deliver(&event).await.assert_ok().json().await;
    assert_eq!(ack["outcome"], "ignored");
    assert_eq!(app.store.commit_count(), 0);
}

#[tokio::test]
async fn test_subscription_webhooks_drive_plan() {
    let app = TestApp::new();
    let t0 = now() - 120;

    app.deliver(&subscription_event(
        "evt_1",
        "customer.subscription.created",
        "active",
        "price_monthly",
        t0,
    ))
    .await
    .assert_ok();

    let plan: Value = testing::get(app.app(), "/billing/plan")
        .user("u1")
        .execute()
        .await
        .assert_ok()
        .json()
        .await;
    assert_eq!(plan["plan"], "MONTHLY");
    assert_eq!(plan["has_active_subscription"], true);

    app.deliver(&subscription_event(
        "evt_2",
        "customer.subscription.updated",
        "active",
        "price_yearly",
        t0 + 60,
    ))
    .await
    .assert_ok();
    assert_eq!(app.store.user("u1").unwrap().subscription_type, PlanName::Yearly);

    // Arrives late: older than the update already applied.
    let ack: Value = app
        .deliver(&subscription_event(
            "evt_0",
            "customer.subscription.updated",
            "past_due",
            "price_monthly",
            t0 + 30,
        ))
        .await
        .assert_ok()
        .json()
        .await;
    assert_eq!(ack["outcome"], "stale");

    app.deliver(&subscription_event(
        "evt_3",
        "customer.subscription.deleted",
        "canceled",
        "price_yearly",
        t0 + 90,
    ))
    .await
    .assert_ok();

    let sub = app.store.subscription("sub_1").unwrap();
    assert_eq!(sub.status, SubscriptionStatus::Canceled);
    assert_eq!(app.store.user("u1").unwrap().subscription_type, PlanName::Free);
}

#[tokio::test]
async fn test_webhook_for_unknown_price_is_dropped() {
    let app = TestApp::new();
    let ack: Value = app
        .deliver(&subscription_event(
            "evt_1",
            "customer.subscription.created",
            "active",
            "price_legacy",
            now(),
        ))
        .await
        .assert_ok()
        .json()
        .await;

    assert_eq!(ack["outcome"], "dropped");
    assert_eq!(app.store.subscription_count(), 0);
}

#[tokio::test]
async fn test_checkout_route_creates_session() {
    let app = TestApp::new();

    let body: Value = testing::post(app.app(), "/billing/checkout")
        .user("u1")
        .json_body(&json!({"plan": "MONTHLY"}))
        .execute()
        .await
        .assert_ok()
        .json()
        .await;
    assert!(body["session_id"].as_str().unwrap().starts_with("cs_test_"));

    let requests = app.provider.checkout_requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].reference_id, "u1");
    assert_eq!(requests[0].external_price_id, "price_monthly");
    assert_eq!(requests[0].email.as_deref(), Some("u1@example.com"));
    assert_eq!(requests[0].success_url, "https://app.example.com/welcome");
}

#[tokio::test]
async fn test_checkout_route_rejects_free_plan_and_anonymous_callers() {
    let app = TestApp::new();

    testing::post(app.app(), "/billing/checkout")
        .user("u1")
        .json_body(&json!({"plan": "FREE"}))
        .execute()
        .await
        .assert_status(StatusCode::BAD_REQUEST);

    testing::post(app.app(), "/billing/checkout")
        .json_body(&json!({"plan": "MONTHLY"}))
        .execute()
        .await
        .assert_status(StatusCode::UNAUTHORIZED);

    assert_eq!(app.provider.call_count(), 0);
}

#[tokio::test]
async fn test_checkout_for_current_plan_conflicts() {
    let app = TestApp::new();
    app.deliver(&checkout_completed("evt_1", now())).await.assert_ok();

    testing::post(app.app(), "/billing/checkout")
        .user("u1")
        .json_body(&json!({"plan": "YEARLY"}))
        .execute()
        .await
        .assert_status(StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_portal_redirects_paid_user_to_provider() {
    let app = TestApp::new();
    app.deliver(&checkout_completed("evt_1", now())).await.assert_ok();

    let response = testing::post(app.app(), "/billing/portal")
        .user("u1")
        .execute()
        .await
        .assert_status(StatusCode::SEE_OTHER);
    let location = response
        .response()
        .headers()
        .get("location")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert!(location.starts_with("https://billing.example.com/session/"));

    let requests = app.provider.portal_requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].external_customer_id, "cus_1");
}

#[tokio::test]
async fn test_portal_sends_free_and_anonymous_users_away() {
    let app = TestApp::new();

    testing::post(app.app(), "/billing/portal")
        .user("u2")
        .execute()
        .await
        .assert_status(StatusCode::SEE_OTHER)
        .assert_header("location", "/pricing");

    testing::post(app.app(), "/billing/portal")
        .execute()
        .await
        .assert_status(StatusCode::UNAUTHORIZED);

    assert_eq!(app.provider.call_count(), 0);
}

#[tokio::test]
async fn test_provider_outage_surfaces_as_unavailable() {
    let app = TestApp::new();
    app.deliver(&checkout_completed("evt_1", now())).await.assert_ok();
    app.provider.fail_next(1);

    testing::post(app.app(), "/billing/portal")
        .user("u1")
        .execute()
        .await
        .assert_status(StatusCode::SERVICE_UNAVAILABLE);
}
