//! Webhook body signatures.
//!
//! Header format: `sha256=<lowercase hex HMAC-SHA256(secret, body)>`.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::notifications::types::{NotificationError, NotificationResult};

type HmacSha256 = Hmac<Sha256>;

const PREFIX: &str = "sha256=";

pub fn sign(secret: &[u8], body: &[u8]) -> NotificationResult<String> {
    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|e| NotificationError::Signing(e.to_string()))?;
    mac.update(body);
    Ok(format!("{PREFIX}{}", hex::encode(mac.finalize().into_bytes())))
}

/// Constant-time check of a received signature header.
pub fn verify(secret: &[u8], body: &[u8], header: &str) -> bool {
    let Some(hex_sig) = header.strip_prefix(PREFIX) else {
        return false;
    };
    let Ok(expected) = hex::decode(hex_sig) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}
