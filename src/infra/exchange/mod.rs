//! Custodial exchange withdrawal client.
//!
//! Delegates withdrawals of exchange-routed assets to the configured
//! venue's withdrawal API. Without an API key the client runs in mock
//! mode and fabricates order ids, which keeps local development off
//! real venues.

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

use crate::domain::{AppError, ExchangeClient, ExchangeError, ExchangeWithdrawal};

/// Withdrawal acceptance response from the venue
#[derive(Debug, Deserialize)]
struct WithdrawResponse {
    /// Venue-assigned order id
    order_id: Option<String>,
    /// Error code for rejected requests
    code: Option<String>,
    #[serde(default)]
    message: String,
}

/// HTTP client for exchange-routed withdrawals
pub struct HttpExchangeClient {
    http_client: Client,
    api_key: Option<SecretString>,
    base_url: String,
}

impl HttpExchangeClient {
    /// Create a new exchange client
    ///
    /// # Arguments
    /// * `base_url` - Venue withdrawal API base URL
    /// * `api_key` - API key for the venue. If None, uses mock mode.
    pub fn new(base_url: String, api_key: Option<SecretString>) -> Result<Self, AppError> {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| AppError::Exchange(ExchangeError::Unavailable(e.to_string())))?;

        Ok(Self {
            http_client,
            api_key,
            base_url,
        })
    }

    /// Check if running in mock mode (no API key configured)
    fn is_mock_mode(&self) -> bool {
        self.api_key.is_none()
    }

    /// Fabricate a deterministic order id from the remark
    fn mock_withdraw(&self, request: &ExchangeWithdrawal) -> String {
        warn!(venue = %request.venue, remark = %request.remark, "Exchange client in mock mode, fabricating order id");
        format!("mock-order-{}", request.remark)
    }
}

#[async_trait]
impl ExchangeClient for HttpExchangeClient {
    #[instrument(skip(self, request), fields(venue = %request.venue, currency = %request.currency, amount = %request.amount))]
    async fn withdraw(&self, request: &ExchangeWithdrawal) -> Result<String, AppError> {
        if self.is_mock_mode() {
            return Ok(self.mock_withdraw(request));
        }
        let api_key = self
            .api_key
            .as_ref()
            .ok_or_else(|| AppError::Exchange(ExchangeError::Unavailable("No API key".to_string())))?;

        let url = format!("{}/v1/{}/withdrawals", self.base_url, request.venue);
        debug!(url = %url, "Submitting exchange withdrawal");

        let response = self
            .http_client
            .post(&url)
            .header("Authorization", format!("Bearer {}", api_key.expose_secret()))
            .json(&serde_json::json!({
                "currency": request.currency,
                "chain": request.chain,
                "address": request.address,
                "tag": request.tag,
                "amount": request.amount,
                // Idempotency key: the venue deduplicates on it
                "remark": request.remark,
            }))
            .send()
            .await
            .map_err(|e| {
                error!(error = %e, "Exchange withdrawal request failed");
                if e.is_timeout() {
                    AppError::Exchange(ExchangeError::Timeout(e.to_string()))
                } else {
                    AppError::Exchange(ExchangeError::Unavailable(e.to_string()))
                }
            })?;

        let status = response.status();
        if status.is_server_error() {
            let body = response.text().await.unwrap_or_default();
            error!(status = %status, body = %body, "Exchange API unavailable");
            return Err(AppError::Exchange(ExchangeError::Unavailable(format!(
                "HTTP {}: {}",
                status, body
            ))));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(status = %status, body = %body, "Exchange rejected the withdrawal");
            return Err(AppError::Exchange(ExchangeError::Rejected(format!(
                "HTTP {}: {}",
                status, body
            ))));
        }

        let body: WithdrawResponse = response
            .json()
            .await
            .map_err(|e| AppError::Exchange(ExchangeError::Unavailable(e.to_string())))?;

        match body.order_id {
            Some(order_id) => {
                info!(order_id = %order_id, "Exchange withdrawal accepted");
                Ok(order_id)
            }
            None => Err(AppError::Exchange(ExchangeError::Rejected(format!(
                "{}: {}",
                body.code.unwrap_or_else(|| "unknown".to_string()),
                body.message
            )))),
        }
    }
}
