//! Notification sink for operator facing alerts.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

#[derive(Debug, Clone)]
pub struct Notification {
    pub resource_identifier: String,
    pub message: String,
    pub additional_text: Option<String>,
    pub documentation_text: Option<String>,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl Notification {
    pub fn new(resource_identifier: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            resource_identifier: resource_identifier.into(),
            message: message.into(),
            additional_text: None,
            documentation_text: None,
            error: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_additional_text(mut self, text: impl Into<String>) -> Self {
        self.additional_text = Some(text.into());
        self
    }

    pub fn with_documentation(mut self, text: impl Into<String>) -> Self {
        self.documentation_text = Some(text.into());
        self
    }

    pub fn with_error(mut self, error: &dyn std::error::Error) -> Self {
        self.error = Some(error.to_string());
        self
    }
}

/// Receives notifications. Delivery is fire-and-forget: implementations
/// must not fail the caller.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: Notification);
}

/// Writes notifications to the log. Failures are warnings, everything
/// else (request summaries included) is a debug trace.
#[derive(Debug, Default, Clone)]
pub struct TracingNotifier;

impl TracingNotifier {
    pub fn level(notification: &Notification) -> tracing::Level {
        if notification.error.is_some() {
            tracing::Level::WARN
        } else {
            tracing::Level::DEBUG
        }
    }
}

#[async_trait]
impl Notifier for TracingNotifier {
    async fn notify(&self, notification: Notification) {
        let additional = notification.additional_text.as_deref().unwrap_or("");
        if Self::level(&notification) == tracing::Level::WARN {
            tracing::warn!(
                resource = %notification.resource_identifier,
                additional,
                at = %notification.timestamp,
                "{}: {}",
                notification.message,
                notification.error.as_deref().unwrap_or("")
            );
        } else {
            tracing::debug!(
                resource = %notification.resource_identifier,
                additional,
                at = %notification.timestamp,
                "{}",
                notification.message
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PoolError;

    #[test]
    fn test_summaries_are_debug_traces() {
        let summary = Notification::new("Apartment/Room", "MediaFileCheck")
            .with_additional_text("S1");
        assert_eq!(TracingNotifier::level(&summary), tracing::Level::DEBUG);

        let failure = Notification::new("Apartment/Room", "Replication command failed")
            .with_error(&PoolError::Processing("disk full".to_string()));
        assert_eq!(TracingNotifier::level(&failure), tracing::Level::WARN);
    }
}
