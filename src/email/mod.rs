//! Outbound email.
//!
//! Billing notifications go out through the [`Mailer`] trait. The crate ships
//! a [`LogMailer`] for development; production deployments implement
//! `Mailer` over their provider of choice.

mod log;

pub use log::LogMailer;

use crate::error::{AppError, Result};
use async_trait::async_trait;

/// An email message to be sent
#[derive(Debug, Clone)]
pub struct Email {
    pub from: String,
    pub to: Vec<String>,
    pub subject: String,
    /// Plain text body (optional if html is provided)
    pub text: Option<String>,
    /// HTML body (optional if text is provided)
    pub html: Option<String>,
    pub reply_to: Option<String>,
}

impl Email {
    pub fn new(from: impl Into<String>, to: impl Into<String>, subject: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: vec![to.into()],
            subject: subject.into(),
            text: None,
            html: None,
            reply_to: None,
        }
    }

    pub fn text(mut self, body: impl Into<String>) -> Self {
        self.text = Some(body.into());
        self
    }

    pub fn html(mut self, body: impl Into<String>) -> Self {
        self.html = Some(body.into());
        self
    }

    pub fn reply_to(mut self, address: impl Into<String>) -> Self {
        self.reply_to = Some(address.into());
        self
    }

    /// Validate the email has required fields
    pub fn validate(&self) -> Result<()> {
        if self.from.is_empty() {
            return Err(AppError::bad_request("Email 'from' is required"));
        }
        if self.to.iter().all(|to| to.is_empty()) {
            return Err(AppError::bad_request("Email 'to' is required"));
        }
        if self.subject.is_empty() {
            return Err(AppError::bad_request("Email 'subject' is required"));
        }
        if self.text.is_none() && self.html.is_none() {
            return Err(AppError::bad_request("Email must have either 'text' or 'html' body"));
        }
        Ok(())
    }
}

/// Email sending backend.
#[async_trait]
pub trait Mailer: Send + Sync {
    /// Send an email
    async fn send(&self, email: &Email) -> Result<()>;

    /// Check if the mailer backend is healthy/connected
    fn is_healthy(&self) -> bool;
}
