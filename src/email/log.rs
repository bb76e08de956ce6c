//! Mailer that writes to the log instead of sending.
//!
//! Intended for development. Bodies are redacted unless full output is
//! switched on, since logs are often shipped elsewhere.

use super::{Email, Mailer};
use crate::error::Result;
use async_trait::async_trait;

/// A mailer that logs emails through `tracing` instead of sending them.
#[derive(Debug, Clone, Default)]
pub struct LogMailer {
    show_full_content: bool,
}

impl LogMailer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Log bodies in full. Development only.
    pub fn with_full_output(mut self, enabled: bool) -> Self {
        if enabled {
            tracing::warn!(
                "LogMailer: full output enabled - email content will be visible in logs"
            );
        }
        self.show_full_content = enabled;
        self
    }
}

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, email: &Email) -> Result<()> {
        email.validate()?;

        if self.show_full_content {
            tracing::info!(
                target: "plansync::email",
                from = %email.from,
                recipients = email.to.len(),
                subject = %email.subject,
                text = email.text.as_deref().unwrap_or(""),
                "Email (not sent)"
            );
        } else {
            tracing::info!(
                target: "plansync::email",
                from = %email.from,
                recipients = email.to.len(),
                subject = %email.subject,
                text_bytes = email.text.as_ref().map_or(0, String::len),
                html_bytes = email.html.as_ref().map_or(0, String::len),
                "Email (not sent, body redacted)"
            );
        }
        Ok(())
    }

    fn is_healthy(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_log_mailer_sends_without_error() {
        let mailer = LogMailer::new();
        let email = Email::new("from@test.com", "to@test.com", "Test Subject").text("Test body");
        assert!(mailer.send(&email).await.is_ok());
    }

    #[tokio::test]
    async fn test_log_mailer_validates_email() {
        let mailer = LogMailer::new();
        let email = Email::new("from@test.com", "to@test.com", "Test Subject");
        assert!(mailer.send(&email).await.is_err());
    }
}
