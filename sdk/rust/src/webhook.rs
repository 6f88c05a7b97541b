use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

pub const HEADER_EVENT: &str = "X-Webhook-Event";
pub const HEADER_DELIVERY: &str = "X-Webhook-Delivery";
pub const HEADER_SIGNATURE: &str = "X-Webhook-Signature";

/// Body of every webhook POST.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEnvelope {
    /// Delivery id, also sent as `X-Webhook-Delivery`. Use it to dedupe retries.
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub created_at: u64,
    pub data: serde_json::Value,
}

/// Payload of `payment.*` and `contract.funded` events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentData {
    pub tx_id: String,
    pub address: String,
    pub amount: u64,
    pub confirmations: u32,
    pub status: String,
    pub block_height: Option<u64>,
    pub expected_amount: Option<u64>,
    pub underpaid: Option<bool>,
}

#[derive(Debug)]
pub enum WebhookError {
    BadSignature,
    Malformed(serde_json::Error),
}

impl std::fmt::Display for WebhookError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WebhookError::BadSignature => write!(f, "signature mismatch"),
            WebhookError::Malformed(e) => write!(f, "malformed body: {}", e),
        }
    }
}

impl std::error::Error for WebhookError {}

/// Check an `X-Webhook-Signature` header (`sha256=<hex>`) against the raw body.
pub fn verify_signature(secret: &str, body: &[u8], header: &str) -> bool {
    let Some(hex_sig) = header.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(expected) = hex::decode(hex_sig) else {
        return false;
    };
    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

/// Verify and decode a delivery in one step.
pub fn parse_verified(secret: &str, body: &[u8], header: &str) -> Result<WebhookEnvelope, WebhookError> {
    if !verify_signature(secret, body, header) {
        return Err(WebhookError::BadSignature);
    }
    serde_json::from_slice(body).map_err(WebhookError::Malformed)
}

impl WebhookEnvelope {
    pub fn payment(&self) -> Option<PaymentData> {
        serde_json::from_value(self.data.clone()).ok()
    }
}
