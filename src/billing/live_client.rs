//! Live provider client over the Stripe-compatible HTTP API.
//!
//! Requests are form-encoded, authenticated with a secret key, carry an
//! idempotency key, and are retried with exponential backoff on rate limits,
//! server errors and timeouts.

use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use super::client::{
    BillingProviderClient, CreateCheckoutSessionRequest, CreatePortalSessionRequest,
    ProviderSession,
};
use super::error::{BillingError, BillingResult};

/// Metadata key carrying the owning user id.
pub const META_REFERENCE_ID: &str = "reference_id";
/// Metadata key carrying the plan name.
pub const META_PLAN: &str = "plan";

/// Configuration for the live client.
#[derive(Debug, Clone)]
pub struct LiveClientConfig {
    pub base_url: String,
    /// Maximum number of retry attempts for transient failures.
    pub max_retries: u32,
    /// Base delay for exponential backoff in milliseconds.
    pub base_delay_ms: u64,
    /// Maximum delay between retries in milliseconds.
    pub max_delay_ms: u64,
    /// Request timeout in seconds.
    pub timeout_seconds: u64,
}

impl Default for LiveClientConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.stripe.com".to_string(),
            max_retries: 3,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            timeout_seconds: 30,
        }
    }
}

impl LiveClientConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    #[must_use]
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    #[must_use]
    pub fn base_delay_ms(mut self, ms: u64) -> Self {
        self.base_delay_ms = ms;
        self
    }

    #[must_use]
    pub fn timeout_seconds(mut self, seconds: u64) -> Self {
        self.timeout_seconds = seconds;
        self
    }
}

/// Accepts `sk_test_`, `sk_live_`, `rk_test_` and `rk_live_` keys.
fn validate_api_key(key: &str) -> BillingResult<()> {
    const PREFIXES: [&str; 4] = ["sk_test_", "sk_live_", "rk_test_", "rk_live_"];

    if key.is_empty() {
        return Err(BillingError::Internal {
            message: "provider API key is empty".to_string(),
        });
    }
    if !PREFIXES.iter().any(|p| key.starts_with(p)) {
        return Err(BillingError::Internal {
            message: "provider API key must start with sk_test_, sk_live_, rk_test_ or rk_live_"
                .to_string(),
        });
    }
    Ok(())
}

/// Production provider client.
#[derive(Clone)]
pub struct LiveProviderClient {
    http: reqwest::Client,
    api_key: std::sync::Arc<SecretString>,
    config: LiveClientConfig,
}

impl std::fmt::Debug for LiveProviderClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveProviderClient")
            .field("api_key", &"[REDACTED]")
            .field("config", &self.config)
            .finish()
    }
}

#[derive(Deserialize)]
struct SessionResponse {
    id: String,
    url: Option<String>,
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: Option<String>,
}

/// A failed attempt, before mapping to [`BillingError`].
enum AttemptError {
    Status { status: u16, message: String },
    Transport(reqwest::Error),
}

impl LiveProviderClient {
    /// Create a client, validating the key format.
    pub fn new(api_key: SecretString, config: LiveClientConfig) -> BillingResult<Self> {
        validate_api_key(api_key.expose_secret())?;

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| BillingError::Internal {
                message: format!("failed to build HTTP client: {}", e),
            })?;

        Ok(Self {
            http,
            api_key: std::sync::Arc::new(api_key),
            config,
        })
    }

    #[must_use]
    pub fn is_test_mode(&self) -> bool {
        let key = self.api_key.expose_secret();
        key.starts_with("sk_test_") || key.starts_with("rk_test_")
    }

    async fn post_form(
        &self,
        operation: &str,
        path: &str,
        form: &[(String, String)],
    ) -> BillingResult<ProviderSession> {
        let url = format!("{}{}", self.config.base_url, path);
        let idempotency_key = format!("plansync_{}_{}", operation, uuid::Uuid::new_v4());
        let mut attempts = 0;

        loop {
            let error = match self.attempt(&url, &idempotency_key, form).await {
                Ok(session) => return Ok(session),
                Err(error) => error,
            };

            let retryable = match &error {
                AttemptError::Status { status, .. } => *status == 429 || (500..600).contains(status),
                AttemptError::Transport(e) => e.is_timeout() || e.is_connect(),
            };
            if !retryable || attempts >= self.config.max_retries {
                return Err(map_attempt_error(error, operation));
            }

            let delay = calculate_backoff_delay(
                attempts,
                self.config.base_delay_ms,
                self.config.max_delay_ms,
            );
            tracing::warn!(
                target: "plansync::billing::provider",
                operation = operation,
                attempt = attempts + 1,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "Retrying provider API call after transient error"
            );
            tokio::time::sleep(delay).await;
            attempts += 1;
        }
    }

    async fn attempt(
        &self,
        url: &str,
        idempotency_key: &str,
        form: &[(String, String)],
    ) -> Result<ProviderSession, AttemptError> {
        let response = self
            .http
            .post(url)
            .bearer_auth(self.api_key.expose_secret())
            .header("Idempotency-Key", idempotency_key)
            .form(form)
            .send()
            .await
            .map_err(AttemptError::Transport)?;

        let status = response.status();
        if !status.is_success() {
            let message = response
                .json::<ErrorEnvelope>()
                .await
                .ok()
                .and_then(|e| e.error.message)
                .unwrap_or_else(|| status.to_string());
            return Err(AttemptError::Status {
                status: status.as_u16(),
                message,
            });
        }

        let body: SessionResponse = response.json().await.map_err(AttemptError::Transport)?;
        let url = body.url.ok_or(AttemptError::Status {
            status: status.as_u16(),
            message: "session response has no url".to_string(),
        })?;
        Ok(ProviderSession { id: body.id, url })
    }
}

fn map_attempt_error(error: AttemptError, operation: &str) -> BillingError {
    match error {
        AttemptError::Status { status, message } => BillingError::ProviderApi {
            operation: operation.to_string(),
            message,
            http_status: Some(status),
        },
        AttemptError::Transport(e) if e.is_timeout() => BillingError::ProviderApi {
            operation: operation.to_string(),
            message: "Request timed out".to_string(),
            http_status: Some(408),
        },
        AttemptError::Transport(e) => BillingError::ProviderApi {
            operation: operation.to_string(),
            message: format!("HTTP client error: {}", e),
            http_status: e.status().map(|s| s.as_u16()),
        },
    }
}

/// Exponential backoff with up to 25% jitter.
fn calculate_backoff_delay(attempt: u32, base_ms: u64, max_ms: u64) -> Duration {
    let delay_ms = base_ms.saturating_mul(2_u64.saturating_pow(attempt));
    let delay_ms = delay_ms.min(max_ms);

    let jitter = if delay_ms > 0 {
        fastrand::u64(0..=delay_ms / 4)
    } else {
        0
    };
    Duration::from_millis(delay_ms.saturating_add(jitter))
}

fn checkout_form(request: &CreateCheckoutSessionRequest) -> Vec<(String, String)> {
    let mut form = vec![
        ("mode".to_string(), "subscription".to_string()),
        ("line_items[0][price]".to_string(), request.external_price_id.clone()),
        ("line_items[0][quantity]".to_string(), "1".to_string()),
        ("client_reference_id".to_string(), request.reference_id.clone()),
        ("success_url".to_string(), request.success_url.clone()),
        ("cancel_url".to_string(), request.cancel_url.clone()),
        (
            format!("metadata[{}]", META_REFERENCE_ID),
            request.reference_id.clone(),
        ),
        (format!("metadata[{}]", META_PLAN), request.plan.to_string()),
        (
            format!("subscription_data[metadata][{}]", META_REFERENCE_ID),
            request.reference_id.clone(),
        ),
        (
            format!("subscription_data[metadata][{}]", META_PLAN),
            request.plan.to_string(),
        ),
    ];
    match (&request.external_customer_id, &request.email) {
        (Some(customer), _) => form.push(("customer".to_string(), customer.clone())),
        (None, Some(email)) => form.push(("customer_email".to_string(), email.clone())),
        (None, None) => {}
    }
    form
}

#[async_trait]
impl BillingProviderClient for LiveProviderClient {
    async fn create_checkout_session(
        &self,
        request: CreateCheckoutSessionRequest,
    ) -> BillingResult<ProviderSession> {
        self.post_form(
            "create_checkout_session",
            "/v1/checkout/sessions",
            &checkout_form(&request),
        )
        .await
    }

    async fn create_portal_session(
        &self,
        request: CreatePortalSessionRequest,
    ) -> BillingResult<ProviderSession> {
        let form = vec![
            ("customer".to_string(), request.external_customer_id),
            ("return_url".to_string(), request.return_url),
        ];
        self.post_form("create_portal_session", "/v1/billing_portal/sessions", &form)
            .await
    }
}
