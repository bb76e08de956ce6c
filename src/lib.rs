//! plansync - subscription lifecycle synchronization
//!
//! Keeps a per-user plan flag in step with a payment provider's subscription
//! records, and serves the billing endpoints around it.
//!
//! # Features
//!
//! - **Reconciliation**: idempotent, per-subscription serialized event handling
//! - **Webhooks**: signature verification, delivery-id bookkeeping, timeouts
//! - **Access**: ownership-checked checkout and billing-portal sessions
//! - **Notifications**: at most one per state transition, with retry
//! - **Storage**: in-memory store, SeaORM store behind `billing-seaorm`
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use plansync::billing::{BillingManager, BillingState, PlanCatalog, billing_routes};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     plansync::init_tracing();
//!
//!     let config = plansync::ConfigBuilder::new().from_env().build()?;
//!     let manager = BillingManager::from_config(store, &config, provider, sender, audit)?;
//!     let state = BillingState::new(Arc::new(manager), sessions, &config.billing.pricing_url);
//!     let app = billing_routes(state, config.server.max_body_size);
//!
//!     let listener = tokio::net::TcpListener::bind(config.server.addr()?).await?;
//!     axum::serve(listener, app).await?;
//!     Ok(())
//! }
//! ```

pub mod billing;
mod config;
pub mod email;
mod error;
pub mod testing;
mod utils;

// Re-exports for public API
pub use config::{
    BillingConfig, CatalogConfig, Config, ConfigBuilder, LoggingConfig, NotificationConfig,
    ServerConfig,
};
pub use error::{AppError, Result};

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize tracing/logging with sensible defaults
///
/// # Environment Variables
///
/// - `RUST_LOG`: Set log level (e.g., "info", "debug", "plansync=debug")
/// - `PLANSYNC_LOG_JSON`: Set to "true" for JSON formatted logs
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let json_logs = std::env::var("PLANSYNC_LOG_JSON")
        .map(|v| v.parse::<bool>().unwrap_or(false))
        .unwrap_or(false);

    if json_logs {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

/// Initialize tracing with a custom configuration
pub fn init_tracing_with_config(config: &Config) {
    let env_filter = EnvFilter::new(&config.logging.level);

    if config.logging.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}
