//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (timeouts > 0, fee rate > 0)
//! - Check endpoints parse as URLs with the right scheme
//! - Detect duplicate merchant ids
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: SettlementConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::collections::HashSet;
use std::fmt;
use std::net::SocketAddr;

use url::Url;

use crate::config::schema::{IndexerKind, SettlementConfig};

/// A single semantic problem with a loaded config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

impl std::error::Error for ValidationError {}

/// Validate a parsed configuration.
pub fn validate_config(config: &SettlementConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.indexer.kind == IndexerKind::Electrum {
        let urls = std::iter::once(&config.indexer.url).chain(config.indexer.failover_urls.iter());
        for (i, raw) in urls.enumerate() {
            let field = if i == 0 {
                "indexer.url".to_string()
            } else {
                format!("indexer.failover_urls[{}]", i - 1)
            };
            match Url::parse(raw) {
                Ok(url) if matches!(url.scheme(), "ws" | "wss") => {}
                Ok(url) => errors.push(ValidationError::new(
                    field,
                    format!("unsupported scheme '{}', expected ws or wss", url.scheme()),
                )),
                Err(e) => errors.push(ValidationError::new(field, e.to_string())),
            }
        }
    }
    if config.indexer.request_timeout_secs == 0 {
        errors.push(ValidationError::new(
            "indexer.request_timeout_secs",
            "must be greater than zero",
        ));
    }
    if config.indexer.reconnect_base_delay_ms > config.indexer.reconnect_max_delay_ms {
        errors.push(ValidationError::new(
            "indexer.reconnect_base_delay_ms",
            "must not exceed reconnect_max_delay_ms",
        ));
    }

    if config.watch.poll_interval_ms == 0 {
        errors.push(ValidationError::new(
            "watch.poll_interval_ms",
            "must be greater than zero",
        ));
    }
    if config.watch.finality_confirmations == 0 {
        errors.push(ValidationError::new(
            "watch.finality_confirmations",
            "must be at least 1",
        ));
    }

    if config.signing.fee_rate == 0 {
        errors.push(ValidationError::new("signing.fee_rate", "must be at least 1 sat/byte"));
    }

    if config.notifications.max_attempts == 0 {
        errors.push(ValidationError::new(
            "notifications.max_attempts",
            "must be at least 1",
        ));
    }
    if config.notifications.request_timeout_secs == 0 {
        errors.push(ValidationError::new(
            "notifications.request_timeout_secs",
            "must be greater than zero",
        ));
    }
    if config.notifications.max_concurrent == 0 {
        errors.push(ValidationError::new(
            "notifications.max_concurrent",
            "must be greater than zero",
        ));
    }

    let mut seen = HashSet::new();
    for (i, merchant) in config.merchants.iter().enumerate() {
        if merchant.id.is_empty() {
            errors.push(ValidationError::new(format!("merchants[{i}].id"), "must not be empty"));
        } else if !seen.insert(merchant.id.as_str()) {
            errors.push(ValidationError::new(
                format!("merchants[{i}].id"),
                format!("duplicate merchant id '{}'", merchant.id),
            ));
        }
        match Url::parse(&merchant.webhook_url) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => {}
            Ok(_) => errors.push(ValidationError::new(
                format!("merchants[{i}].webhook_url"),
                "expected an http or https URL",
            )),
            Err(e) => errors.push(ValidationError::new(
                format!("merchants[{i}].webhook_url"),
                e.to_string(),
            )),
        }
        if merchant.webhook_secret.is_empty() {
            errors.push(ValidationError::new(
                format!("merchants[{i}].webhook_secret"),
                "must not be empty",
            ));
        }
    }

    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            "not a socket address",
        ));
    }

    if config.admin.enabled {
        if config.admin.bind_address.parse::<SocketAddr>().is_err() {
            errors.push(ValidationError::new("admin.bind_address", "not a socket address"));
        }
        if config.admin.api_key.is_empty() {
            errors.push(ValidationError::new("admin.api_key", "must not be empty"));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
