//! Delivery transport seam.
//!
//! The dispatcher hands each due notification to a `DeliveryTransport`.
//! Real channel integrations live outside this crate; `LogTransport`
//! accepts everything and records it through the log facade.

use crate::{documents::ProviderResponse, notification_subsystem::NotificationRow};

#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryReceipt {
    pub response: ProviderResponse,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryFailure {
    pub code: String,
    pub message: String,
    /// False for permanent rejections (bad address, unsubscribed).
    pub retryable: bool,
}

impl DeliveryFailure {
    pub fn transient(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            retryable: true,
        }
    }

    pub fn permanent(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            retryable: false,
        }
    }

    pub fn response(&self) -> ProviderResponse {
        ProviderResponse {
            provider_message_id: None,
            code: Some(self.code.clone()),
            detail: Some(self.message.clone()),
        }
    }
}

pub trait DeliveryTransport: Send {
    /// Recorded in `notification_delivery_logs.provider`.
    fn provider(&self) -> &str;

    fn deliver(&mut self, notification: &NotificationRow) -> Result<DeliveryReceipt, DeliveryFailure>;
}

/// Accepts every notification. Used by the runner and as the default.
#[derive(Debug, Default)]
pub struct LogTransport {
    sent: u64,
}

impl DeliveryTransport for LogTransport {
    fn provider(&self) -> &str {
        "log"
    }

    fn deliver(&mut self, notification: &NotificationRow) -> Result<DeliveryReceipt, DeliveryFailure> {
        self.sent += 1;
        log::info!(
            "[{}] to {}: {}",
            notification.channel,
            notification.user_id,
            notification.title
        );
        Ok(DeliveryReceipt {
            response: ProviderResponse {
                provider_message_id: Some(format!("log-{}", self.sent)),
                code: Some("accepted".into()),
                detail: None,
            },
        })
    }
}
