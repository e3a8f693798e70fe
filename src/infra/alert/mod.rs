//! Operator alert delivery.
//!
//! Alerts are fire-and-forget by contract: a settlement attempt must
//! never fail because the alert channel is down. Delivery problems are
//! logged and swallowed. Without a webhook URL the sink degrades to
//! structured log lines.

use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use tracing::{error, instrument, warn};

use crate::domain::AlertSink;

/// Alert sink posting to an operator webhook (e.g. a chat channel)
pub struct WebhookAlertSink {
    http_client: Client,
    webhook_url: Option<String>,
}

impl WebhookAlertSink {
    /// Create a new alert sink
    ///
    /// # Arguments
    /// * `webhook_url` - Webhook endpoint. If None, alerts go to the log only.
    #[must_use]
    pub fn new(webhook_url: Option<String>) -> Self {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            http_client,
            webhook_url,
        }
    }

    async fn deliver(&self, channel: &str, message: &str) {
        let Some(url) = &self.webhook_url else {
            return;
        };
        let payload = serde_json::json!({
            "channel": channel,
            "text": message,
        });
        if let Err(e) = self
            .http_client
            .post(url)
            .json(&payload)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
        {
            warn!(channel = channel, error = %e, "Alert delivery failed");
        }
    }
}

#[async_trait]
impl AlertSink for WebhookAlertSink {
    #[instrument(skip(self, message))]
    async fn error(&self, message: &str) {
        error!(alert = "error", "{}", message);
        self.deliver("errors", message).await;
    }

    #[instrument(skip(self, message))]
    async fn withdrawal(&self, message: &str) {
        warn!(alert = "withdrawal", "{}", message);
        self.deliver("withdrawals", message).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sink_without_url_never_fails() {
        let sink = WebhookAlertSink::new(None);
        sink.error("database on fire").await;
        sink.withdrawal("withdrawal tx_1 exhausted retries").await;
    }
}
