//! Notification events and delivery errors.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::payments::store::StoreError;
use crate::payments::types::unix_now;

pub const PAYMENT_PENDING: &str = "payment.pending";
pub const PAYMENT_CONFIRMED: &str = "payment.confirmed";
pub const PAYMENT_FAILED: &str = "payment.failed";
pub const CONTRACT_FUNDED: &str = "contract.funded";
pub const WEBHOOK_TEST: &str = "webhook.test";

pub const HEADER_EVENT: &str = "X-Webhook-Event";
pub const HEADER_DELIVERY: &str = "X-Webhook-Delivery";
pub const HEADER_SIGNATURE: &str = "X-Webhook-Signature";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryStatus {
    Pending,
    Delivered,
    Failed,
}

/// A persisted outbound webhook and its delivery state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationEvent {
    pub id: Uuid,
    pub owner_id: String,
    pub event_type: String,
    pub payload: Value,
    pub status: DeliveryStatus,
    pub attempts: u32,
    pub last_status_code: Option<u16>,
    pub last_error: Option<String>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl NotificationEvent {
    pub fn new(owner_id: &str, event_type: &str, payload: Value) -> Self {
        let now = unix_now();
        Self {
            id: Uuid::new_v4(),
            owner_id: owner_id.to_string(),
            event_type: event_type.to_string(),
            payload,
            status: DeliveryStatus::Pending,
            attempts: 0,
            last_status_code: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// The exact bytes POSTed and signed.
    pub fn body(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&WebhookEnvelope {
            id: self.id,
            event_type: &self.event_type,
            created_at: self.created_at,
            data: &self.payload,
        })
    }
}

#[derive(Serialize)]
struct WebhookEnvelope<'a> {
    id: Uuid,
    #[serde(rename = "type")]
    event_type: &'a str,
    created_at: u64,
    data: &'a Value,
}

/// A request to notify an owner, queued by the reconciler.
#[derive(Debug, Clone, PartialEq)]
pub struct NotificationRequest {
    pub owner_id: String,
    pub event_type: String,
    pub payload: Value,
}

/// Outcome of a single-attempt test delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestDelivery {
    pub success: bool,
    pub status_code: Option<u16>,
    pub error: Option<String>,
}

#[derive(Debug, Error)]
pub enum NotificationError {
    #[error("no webhook configured for owner {0}")]
    NoEndpoint(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("merchant directory error: {0}")]
    Directory(String),

    #[error("signing error: {0}")]
    Signing(String),
}

pub type NotificationResult<T> = Result<T, NotificationError>;
