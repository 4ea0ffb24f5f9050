//! Webhook delivery with bounded exponential backoff.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::{ExecutionError, Result};
use crate::runtime::RetryPolicy;

/// Outbound payload: `{event, data, timestamp, request_id}`. Duplicate
/// deliveries carry the same `request_id`, so receivers can deduplicate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub event: String,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

pub struct WebhookNotifier {
    client: reqwest::Client,
    policy: RetryPolicy,
}

impl WebhookNotifier {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
            policy,
        }
    }

    /// Deliver one event. Failures exhaust the retry schedule and surface as
    /// `WebhookDeliveryFailed`; callers log the error without altering the
    /// entity's terminal status.
    pub async fn deliver(
        &self,
        url: &str,
        event: &str,
        data: Value,
        request_id: Option<String>,
    ) -> Result<()> {
        let payload = WebhookEvent {
            event: event.to_string(),
            data,
            timestamp: Utc::now(),
            request_id,
        };
        let mut last_error = String::new();
        for attempt in 0..self.policy.max_attempts {
            if attempt > 0 {
                tokio::time::sleep(self.policy.delay(attempt - 1)).await;
            }
            match self.client.post(url).json(&payload).send().await {
                Ok(response) if response.status().is_success() => {
                    info!(url, event, attempt, "webhook delivered");
                    return Ok(());
                }
                Ok(response) => {
                    last_error = format!("status {}", response.status());
                }
                Err(e) => {
                    last_error = e.to_string();
                }
            }
            warn!(url, event, attempt, error = %last_error, "webhook attempt failed");
        }
        Err(ExecutionError::WebhookDeliveryFailed(format!(
            "{} after {} attempts: {}",
            url, self.policy.max_attempts, last_error
        )))
    }
}

impl Default for WebhookNotifier {
    fn default() -> Self {
        Self::new(RetryPolicy::webhook())
    }
}
