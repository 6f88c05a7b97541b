//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the engine.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};

use crate::blockchain::types::Network;

/// Root configuration for the settlement engine.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct SettlementConfig {
    /// Key derivation settings.
    pub wallet: WalletConfig,

    /// Remote ledger indexer connection.
    pub indexer: IndexerConfig,

    /// Chain watch and reconciliation policy.
    pub watch: WatchConfig,

    /// Outgoing transaction settings.
    pub signing: SigningConfig,

    /// Webhook delivery settings.
    pub notifications: NotificationConfig,

    /// Merchant webhook endpoints.
    pub merchants: Vec<MerchantConfig>,

    /// Settlement store settings.
    pub store: StoreConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,

    /// Operator API.
    pub admin: AdminConfig,
}

/// Key derivation configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WalletConfig {
    pub network: Network,

    /// Environment variable holding the hex master seed.
    pub seed_env: String,

    /// BIP44 account number.
    pub account: u32,

    /// Fall back to an in-process index counter when the store cannot
    /// allocate. Unsafe with more than one engine instance.
    pub allow_degraded_allocation: bool,
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self {
            network: Network::Mainnet,
            seed_env: crate::blockchain::wallet::SEED_ENV_VAR.to_string(),
            account: 0,
            allow_degraded_allocation: true,
        }
    }
}

/// Which indexer implementation to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum IndexerKind {
    #[default]
    Electrum,
    Memory,
}

/// Indexer connection configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct IndexerConfig {
    pub kind: IndexerKind,

    /// Primary WebSocket endpoint.
    pub url: String,

    /// Secondary endpoints tried in order.
    pub failover_urls: Vec<String>,

    /// Per-request timeout in seconds.
    pub request_timeout_secs: u64,

    /// Base delay for reconnect backoff in milliseconds.
    pub reconnect_base_delay_ms: u64,

    /// Maximum delay for reconnect backoff in milliseconds.
    pub reconnect_max_delay_ms: u64,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            kind: IndexerKind::Electrum,
            url: "wss://bch.imaginary.cash:50004".to_string(),
            failover_urls: Vec::new(),
            request_timeout_secs: 10,
            reconnect_base_delay_ms: 1_000,
            reconnect_max_delay_ms: 60_000,
        }
    }
}

/// Reconciliation policy.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WatchConfig {
    /// Fallback sweep interval in milliseconds.
    pub poll_interval_ms: u64,

    /// Largest amount (satoshis) accepted at zero confirmations for targets
    /// that opt in.
    pub zero_conf_max_amount: u64,

    /// Depth after which a closed target's address stops being watched.
    pub finality_confirmations: u32,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 30_000,
            zero_conf_max_amount: 1_000_000,
            finality_confirmations: 6,
        }
    }
}

/// Transaction construction configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SigningConfig {
    /// Fee rate in satoshis per byte.
    pub fee_rate: u64,
}

impl Default for SigningConfig {
    fn default() -> Self {
        Self { fee_rate: 1 }
    }
}

/// Webhook delivery configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct NotificationConfig {
    pub enabled: bool,

    /// Delivery attempts before an event is marked FAILED.
    pub max_attempts: u32,

    /// Fixed delay between attempts in milliseconds.
    pub retry_delay_ms: u64,

    /// Per-attempt timeout in seconds.
    pub request_timeout_secs: u64,

    /// Deliveries in flight at once.
    pub max_concurrent: usize,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 3,
            retry_delay_ms: 2_000,
            request_timeout_secs: 10,
            max_concurrent: 16,
        }
    }
}

/// A merchant's webhook endpoint.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MerchantConfig {
    pub id: String,
    pub webhook_url: String,
    pub webhook_secret: String,
}

/// Settlement store configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct StoreConfig {
    /// JSON snapshot written after every change. In-memory only when unset.
    pub persistence_path: Option<String>,
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    pub log_format: LogFormat,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: true,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

/// Admin API configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Enable admin API.
    pub enabled: bool,

    /// API key for authentication (Bearer token).
    pub api_key: String,

    /// Admin API bind address.
    pub bind_address: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            // WARNING: This is a placeholder! Change this in production.
            api_key: "CHANGE_ME_IN_PRODUCTION".to_string(),
            bind_address: "127.0.0.1:8081".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SettlementConfig::default();
        assert_eq!(config.notifications.max_attempts, 3);
        assert_eq!(config.watch.finality_confirmations, 6);
        assert_eq!(config.indexer.kind, IndexerKind::Electrum);
        assert!(config.merchants.is_empty());
    }

    #[test]
    fn test_minimal_toml() {
        let config: SettlementConfig = toml::from_str(
            r#"
            [wallet]
            network = "testnet"

            [indexer]
            kind = "memory"

            [[merchants]]
            id = "m1"
            webhook_url = "https://shop.example/hooks"
            webhook_secret = "s3cret"
            "#,
        )
        .unwrap();
        assert_eq!(config.wallet.network, Network::Testnet);
        assert_eq!(config.indexer.kind, IndexerKind::Memory);
        assert_eq!(config.indexer.request_timeout_secs, 10);
        assert_eq!(config.merchants[0].id, "m1");
        assert_eq!(config.observability.log_format, LogFormat::Pretty);
    }
}
