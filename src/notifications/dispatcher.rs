//! Signed webhook delivery with bounded retry.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use crate::config::schema::NotificationConfig;
use crate::notifications::merchants::{MerchantDirectory, WebhookEndpoint};
use crate::notifications::signer;
use crate::notifications::transport::{WebhookRequest, WebhookTransport};
use crate::notifications::types::{
    DeliveryStatus, NotificationError, NotificationEvent, NotificationResult, TestDelivery,
    HEADER_DELIVERY, HEADER_EVENT, HEADER_SIGNATURE, WEBHOOK_TEST,
};
use crate::observability::metrics;
use crate::payments::store::SettlementStore;
use crate::payments::types::unix_now;
use crate::resilience::retries::RetryPolicy;

pub struct Notifier {
    store: Arc<dyn SettlementStore>,
    merchants: Arc<dyn MerchantDirectory>,
    transport: Arc<dyn WebhookTransport>,
    retry: RetryPolicy,
    timeout: Duration,
}

impl Notifier {
    pub fn new(
        store: Arc<dyn SettlementStore>,
        merchants: Arc<dyn MerchantDirectory>,
        transport: Arc<dyn WebhookTransport>,
        config: &NotificationConfig,
    ) -> Self {
        Self {
            store,
            merchants,
            transport,
            retry: RetryPolicy::from(config),
            timeout: Duration::from_secs(config.request_timeout_secs),
        }
    }

    /// Persist and deliver an event to `owner_id`'s webhook.
    ///
    /// Returns `None` when the owner has no endpoint configured. Otherwise the
    /// returned event is DELIVERED or FAILED; delivery failures are not errors.
    pub async fn deliver(
        &self,
        owner_id: &str,
        event_type: &str,
        payload: Value,
    ) -> NotificationResult<Option<NotificationEvent>> {
        let Some(endpoint) = self.merchants.webhook_endpoint(owner_id).await? else {
            tracing::debug!(owner = %owner_id, event_type = %event_type, "No webhook configured");
            return Ok(None);
        };

        let mut event = NotificationEvent::new(owner_id, event_type, payload);
        self.store.save_notification(&event).await?;
        let request = build_request(&event, &endpoint)?;

        loop {
            event.attempts += 1;
            match self.transport.post(&request, self.timeout).await {
                Ok(status) if (200..300).contains(&status) => {
                    event.last_status_code = Some(status);
                    event.last_error = None;
                    event.status = DeliveryStatus::Delivered;
                    metrics::record_webhook_attempt(true);
                }
                Ok(status) => {
                    event.last_status_code = Some(status);
                    event.last_error = Some(format!("receiver answered {status}"));
                    metrics::record_webhook_attempt(false);
                }
                Err(e) => {
                    event.last_error = Some(e);
                    metrics::record_webhook_attempt(false);
                }
            }

            if event.status != DeliveryStatus::Delivered && !self.retry.should_retry(event.attempts)
            {
                event.status = DeliveryStatus::Failed;
            }
            event.updated_at = unix_now();
            if let Err(e) = self.store.save_notification(&event).await {
                tracing::warn!(event_id = %event.id, error = %e, "Failed to persist delivery state");
            }

            match event.status {
                DeliveryStatus::Delivered => {
                    tracing::info!(
                        event_id = %event.id,
                        owner = %owner_id,
                        event_type = %event.event_type,
                        attempts = event.attempts,
                        "Webhook delivered"
                    );
                    metrics::record_webhook_outcome("delivered");
                    return Ok(Some(event));
                }
                DeliveryStatus::Failed => {
                    tracing::warn!(
                        event_id = %event.id,
                        owner = %owner_id,
                        event_type = %event.event_type,
                        attempts = event.attempts,
                        last_error = ?event.last_error,
                        "Webhook delivery failed"
                    );
                    metrics::record_webhook_outcome("failed");
                    return Ok(Some(event));
                }
                DeliveryStatus::Pending => {
                    tracing::debug!(
                        event_id = %event.id,
                        attempt = event.attempts,
                        error = ?event.last_error,
                        "Webhook attempt failed, retrying"
                    );
                    tokio::time::sleep(self.retry.delay).await;
                }
            }
        }
    }

    /// Single unpersisted attempt against the owner's endpoint.
    pub async fn send_test(&self, owner_id: &str) -> NotificationResult<TestDelivery> {
        let endpoint = self
            .merchants
            .webhook_endpoint(owner_id)
            .await?
            .ok_or_else(|| NotificationError::NoEndpoint(owner_id.to_string()))?;

        let event = NotificationEvent::new(
            owner_id,
            WEBHOOK_TEST,
            json!({ "message": "Webhook endpoint test" }),
        );
        let request = build_request(&event, &endpoint)?;
        let result = self.transport.post(&request, self.timeout).await;
        tracing::info!(owner = %owner_id, result = ?result, "Webhook test sent");

        Ok(match result {
            Ok(status) => TestDelivery {
                success: (200..300).contains(&status),
                status_code: Some(status),
                error: None,
            },
            Err(e) => TestDelivery {
                success: false,
                status_code: None,
                error: Some(e),
            },
        })
    }
}

fn build_request(
    event: &NotificationEvent,
    endpoint: &WebhookEndpoint,
) -> NotificationResult<WebhookRequest> {
    let body = event.body()?;
    let signature = signer::sign(endpoint.secret.as_bytes(), &body)?;
    Ok(WebhookRequest {
        url: endpoint.url.clone(),
        headers: vec![
            (HEADER_EVENT, event.event_type.clone()),
            (HEADER_DELIVERY, event.id.to_string()),
            (HEADER_SIGNATURE, signature),
        ],
        body,
    })
}
