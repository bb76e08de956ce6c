use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use secrecy::SecretString;

use crate::billing::PlanName;
use crate::error::AppError;
use crate::utils::{get_env_parsed, get_env_with_prefix};

/// Main configuration for a plansync deployment
#[derive(Debug, Default)]
pub struct Config {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub billing: BillingConfig,
    pub catalog: CatalogConfig,
    pub notifications: NotificationConfig,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Maximum request body size in bytes (default: 1MB)
    pub max_body_size: usize,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

/// Webhook, provider and reconciliation settings.
#[derive(Debug)]
pub struct BillingConfig {
    /// Shared secret used to verify webhook signatures.
    pub webhook_secret: Option<SecretString>,
    /// Maximum age of a webhook signature timestamp.
    pub webhook_tolerance_secs: u64,
    /// Upper bound on reconciling a single event.
    pub processing_timeout_secs: u64,
    /// Re-reads allowed after an optimistic-concurrency conflict.
    pub max_conflict_retries: u32,
    /// How long processed webhook event ids are remembered.
    pub processed_event_retention_days: u32,
    pub provider_api_key: Option<SecretString>,
    pub provider_base_url: String,
    pub portal_return_url: String,
    pub checkout_success_url: String,
    pub checkout_cancel_url: String,
    /// Where users without a subscription are sent when they open the portal.
    pub pricing_url: String,
    /// Explicit plan grants by user id.
    pub plan_overrides: HashMap<String, PlanName>,
}

/// Prices and features of the three plans.
#[derive(Debug, Clone)]
pub struct CatalogConfig {
    pub currency: String,
    pub monthly_price_id: String,
    pub monthly_price: u64,
    pub yearly_price_id: String,
    pub yearly_price: u64,
    pub free_features: Vec<String>,
    pub paid_features: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct NotificationConfig {
    pub from_address: String,
    /// Failed notifications kept for a later retry.
    pub max_pending_retries: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            max_body_size: 1024 * 1024,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            webhook_secret: None,
            webhook_tolerance_secs: 300,
            processing_timeout_secs: 20,
            max_conflict_retries: 3,
            processed_event_retention_days: 30,
            provider_api_key: None,
            provider_base_url: "https://api.stripe.com".to_string(),
            portal_return_url: "http://localhost:8000/account".to_string(),
            checkout_success_url: "http://localhost:8000/account?checkout=success".to_string(),
            checkout_cancel_url: "http://localhost:8000/pricing".to_string(),
            pricing_url: "/pricing".to_string(),
            plan_overrides: HashMap::new(),
        }
    }
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            currency: "usd".to_string(),
            monthly_price_id: String::new(),
            monthly_price: 1499,
            yearly_price_id: String::new(),
            yearly_price: 11988,
            free_features: vec!["Public profile".to_string(), "Up to 3 photos".to_string()],
            paid_features: vec![
                "Unlimited photos".to_string(),
                "See who liked you".to_string(),
                "Priority in search".to_string(),
            ],
        }
    }
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            from_address: "billing@localhost".to_string(),
            max_pending_retries: 1000,
        }
    }
}

impl ServerConfig {
    pub fn addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        format!("{}:{}", self.host, self.port).parse()
    }
}

impl BillingConfig {
    pub fn processing_timeout(&self) -> Duration {
        Duration::from_secs(self.processing_timeout_secs)
    }
}

/// Parse `user_a:YEARLY,user_b:MONTHLY`.
fn parse_plan_overrides(raw: &str) -> Result<HashMap<String, PlanName>, AppError> {
    let mut overrides = HashMap::new();
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (user_id, plan) = entry.split_once(':').ok_or_else(|| {
            AppError::bad_request(format!("Invalid plan override '{}', expected user:PLAN", entry))
        })?;
        let plan: PlanName = plan
            .parse()
            .map_err(|e| AppError::bad_request(format!("Invalid plan override '{}': {}", entry, e)))?;
        overrides.insert(user_id.trim().to_string(), plan);
    }
    Ok(overrides)
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Builder for Config with environment variable support
#[must_use = "builder does nothing until you call build()"]
pub struct ConfigBuilder {
    config: Config,
    raw_overrides: Option<String>,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
            raw_overrides: None,
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.config.server.host = host.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.config.server.port = port;
        self
    }

    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.config.logging.level = level.into();
        self
    }

    pub fn with_json_logging(mut self, enabled: bool) -> Self {
        self.config.logging.json = enabled;
        self
    }

    pub fn with_webhook_secret(mut self, secret: impl Into<String>) -> Self {
        self.config.billing.webhook_secret = Some(SecretString::from(secret.into()));
        self
    }

    pub fn with_provider_api_key(mut self, key: impl Into<String>) -> Self {
        self.config.billing.provider_api_key = Some(SecretString::from(key.into()));
        self
    }

    pub fn with_processing_timeout_secs(mut self, secs: u64) -> Self {
        self.config.billing.processing_timeout_secs = secs;
        self
    }

    pub fn with_max_conflict_retries(mut self, retries: u32) -> Self {
        self.config.billing.max_conflict_retries = retries;
        self
    }

    pub fn with_pricing_url(mut self, url: impl Into<String>) -> Self {
        self.config.billing.pricing_url = url.into();
        self
    }

    pub fn with_plan_override(mut self, user_id: impl Into<String>, plan: PlanName) -> Self {
        self.config.billing.plan_overrides.insert(user_id.into(), plan);
        self
    }

    pub fn with_monthly_price(mut self, price_id: impl Into<String>, amount: u64) -> Self {
        self.config.catalog.monthly_price_id = price_id.into();
        self.config.catalog.monthly_price = amount;
        self
    }

    pub fn with_yearly_price(mut self, price_id: impl Into<String>, amount: u64) -> Self {
        self.config.catalog.yearly_price_id = price_id.into();
        self.config.catalog.yearly_price = amount;
        self
    }

    pub fn with_from_address(mut self, address: impl Into<String>) -> Self {
        self.config.notifications.from_address = address.into();
        self
    }

    /// Load configuration from environment variables with PLANSYNC_ prefix
    pub fn from_env(mut self) -> Self {
        if let Some(host) = get_env_with_prefix("HOST") {
            self.config.server.host = host;
        }
        if let Some(port) = get_env_parsed("PORT") {
            self.config.server.port = port;
        }
        if let Some(size) = get_env_parsed("MAX_BODY_SIZE") {
            self.config.server.max_body_size = size;
        }
        if let Some(level) = get_env_with_prefix("LOG_LEVEL") {
            self.config.logging.level = level;
        }
        if let Some(json) = get_env_with_prefix("LOG_JSON") {
            self.config.logging.json = json.parse().unwrap_or(false);
        }

        let billing = &mut self.config.billing;
        if let Some(secret) = get_env_with_prefix("WEBHOOK_SECRET") {
            billing.webhook_secret = Some(SecretString::from(secret));
        }
        if let Some(secs) = get_env_parsed("WEBHOOK_TOLERANCE_SECS") {
            billing.webhook_tolerance_secs = secs;
        }
        if let Some(secs) = get_env_parsed("PROCESSING_TIMEOUT_SECS") {
            billing.processing_timeout_secs = secs;
        }
        if let Some(retries) = get_env_parsed("MAX_CONFLICT_RETRIES") {
            billing.max_conflict_retries = retries;
        }
        if let Some(days) = get_env_parsed("EVENT_RETENTION_DAYS") {
            billing.processed_event_retention_days = days;
        }
        if let Some(key) = get_env_with_prefix("PROVIDER_API_KEY") {
            billing.provider_api_key = Some(SecretString::from(key));
        }
        if let Some(url) = get_env_with_prefix("PROVIDER_BASE_URL") {
            billing.provider_base_url = url;
        }
        if let Some(url) = get_env_with_prefix("PORTAL_RETURN_URL") {
            billing.portal_return_url = url;
        }
        if let Some(url) = get_env_with_prefix("CHECKOUT_SUCCESS_URL") {
            billing.checkout_success_url = url;
        }
        if let Some(url) = get_env_with_prefix("CHECKOUT_CANCEL_URL") {
            billing.checkout_cancel_url = url;
        }
        if let Some(url) = get_env_with_prefix("PRICING_URL") {
            billing.pricing_url = url;
        }
        if let Some(raw) = get_env_with_prefix("PLAN_OVERRIDES") {
            self.raw_overrides = Some(raw);
        }

        let catalog = &mut self.config.catalog;
        if let Some(currency) = get_env_with_prefix("CURRENCY") {
            catalog.currency = currency.to_lowercase();
        }
        if let Some(id) = get_env_with_prefix("MONTHLY_PRICE_ID") {
            catalog.monthly_price_id = id;
        }
        if let Some(amount) = get_env_parsed("MONTHLY_PRICE") {
            catalog.monthly_price = amount;
        }
        if let Some(id) = get_env_with_prefix("YEARLY_PRICE_ID") {
            catalog.yearly_price_id = id;
        }
        if let Some(amount) = get_env_parsed("YEARLY_PRICE") {
            catalog.yearly_price = amount;
        }
        if let Some(features) = get_env_with_prefix("FREE_FEATURES") {
            catalog.free_features = split_list(&features);
        }
        if let Some(features) = get_env_with_prefix("PAID_FEATURES") {
            catalog.paid_features = split_list(&features);
        }

        if let Some(address) = get_env_with_prefix("MAIL_FROM") {
            self.config.notifications.from_address = address;
        }
        if let Some(max) = get_env_parsed("MAX_PENDING_NOTIFICATIONS") {
            self.config.notifications.max_pending_retries = max;
        }

        self
    }

    /// Build the configuration, validating all settings
    ///
    /// # Errors
    ///
    /// Returns an error if the server address, log level, webhook secret,
    /// timeouts, redirect URLs, plan overrides or catalog are invalid.
    pub fn build(mut self) -> crate::error::Result<Config> {
        self.config.server.addr().map_err(|e| {
            AppError::bad_request(format!(
                "Invalid server address {}:{} - {}",
                self.config.server.host, self.config.server.port, e
            ))
        })?;

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.config.logging.level.to_lowercase().as_str()) {
            return Err(AppError::bad_request(format!(
                "Invalid log level: {}. Must be one of: {}",
                self.config.logging.level,
                valid_log_levels.join(", ")
            )));
        }

        if self.config.server.max_body_size == 0 {
            return Err(AppError::bad_request("max_body_size must be greater than 0"));
        }

        let billing = &self.config.billing;
        match &billing.webhook_secret {
            Some(secret) if !secrecy::ExposeSecret::expose_secret(secret).is_empty() => {}
            _ => return Err(AppError::bad_request("A webhook secret is required")),
        }
        if billing.webhook_tolerance_secs == 0 {
            return Err(AppError::bad_request("webhook_tolerance_secs must be greater than 0"));
        }
        if billing.processing_timeout_secs == 0 {
            return Err(AppError::bad_request("processing_timeout_secs must be greater than 0"));
        }

        for (name, value) in [
            ("provider_base_url", &billing.provider_base_url),
            ("portal_return_url", &billing.portal_return_url),
            ("checkout_success_url", &billing.checkout_success_url),
            ("checkout_cancel_url", &billing.checkout_cancel_url),
        ] {
            url::Url::parse(value)
                .map_err(|e| AppError::bad_request(format!("Invalid {}: {} - {}", name, value, e)))?;
        }
        if billing.pricing_url.is_empty() {
            return Err(AppError::bad_request("pricing_url must not be empty"));
        }

        if let Some(raw) = self.raw_overrides.take() {
            let parsed = parse_plan_overrides(&raw)?;
            self.config.billing.plan_overrides.extend(parsed);
        }

        crate::billing::PlanCatalog::from_config(&self.config.catalog)
            .map_err(|e| AppError::bad_request(format!("Invalid plan catalog: {}", e)))?;

        Ok(self.config)
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> ConfigBuilder {
        ConfigBuilder::new()
            .with_webhook_secret("whsec_test")
            .with_monthly_price("price_monthly", 1499)
            .with_yearly_price("price_yearly", 11988)
    }

    #[test]
    fn test_defaults() {
        let config = valid().build().unwrap();
        assert_eq!(config.server.port, 8000);
        assert_eq!(config.billing.webhook_tolerance_secs, 300);
        assert_eq!(config.billing.processing_timeout(), Duration::from_secs(20));
        assert_eq!(config.billing.max_conflict_retries, 3);
    }

    #[test]
    fn test_requires_webhook_secret() {
        let result = ConfigBuilder::new()
            .with_monthly_price("price_monthly", 1499)
            .with_yearly_price("price_yearly", 11988)
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_rejects_missing_price_ids() {
        let result = ConfigBuilder::new().with_webhook_secret("whsec_test").build();
        assert!(result.is_err());
    }

    #[test]
    fn test_rejects_invalid_log_level() {
        assert!(valid().with_log_level("loud").build().is_err());
    }

    #[test]
    fn test_rejects_zero_timeout() {
        assert!(valid().with_processing_timeout_secs(0).build().is_err());
    }

    #[test]
    fn test_parse_plan_overrides() {
        let parsed = parse_plan_overrides("staff_1:YEARLY, tester:monthly").unwrap();
        assert_eq!(parsed.get("staff_1"), Some(&PlanName::Yearly));
        assert_eq!(parsed.get("tester"), Some(&PlanName::Monthly));

        assert!(parse_plan_overrides("staff_1").is_err());
        assert!(parse_plan_overrides("staff_1:PLATINUM").is_err());
    }

    #[test]
    fn test_explicit_override() {
        let config = valid().with_plan_override("staff_1", PlanName::Yearly).build().unwrap();
        assert_eq!(config.billing.plan_overrides.get("staff_1"), Some(&PlanName::Yearly));
    }
}
