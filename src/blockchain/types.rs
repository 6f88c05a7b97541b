//! Chain-specific types and error definitions.

use serde::{Deserialize, Serialize};
use thiserror::Error;

// Re-export IndexerConfig from config module to avoid duplication
pub use crate::config::schema::IndexerConfig;

/// Network the engine derives addresses for and signs against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    #[default]
    Mainnet,
    Testnet,
    Regtest,
}

impl Network {
    /// CashAddr human-readable prefix.
    pub fn cashaddr_prefix(&self) -> &'static str {
        match self {
            Network::Mainnet => "bitcoincash",
            Network::Testnet => "bchtest",
            Network::Regtest => "bchreg",
        }
    }

    /// Legacy base58check version bytes as (p2pkh, p2sh).
    pub fn legacy_versions(&self) -> (u8, u8) {
        match self {
            Network::Mainnet => (0x00, 0x05),
            Network::Testnet | Network::Regtest => (0x6f, 0xc4),
        }
    }

    /// SLIP-44 coin type used in the derivation path.
    pub fn coin_type(&self) -> u32 {
        match self {
            Network::Mainnet => 145,
            Network::Testnet | Network::Regtest => 1,
        }
    }
}

/// Errors that can occur during ledger and signing operations.
#[derive(Debug, Error)]
pub enum BlockchainError {
    /// Indexer connection or request failed.
    #[error("RPC error: {0}")]
    Rpc(String),

    /// Indexer request timed out.
    #[error("RPC timeout after {0} seconds")]
    Timeout(u64),

    /// Indexer not connected.
    #[error("Indexer not available: {0}")]
    NotAvailable(String),

    /// Malformed hex, script, or raw transaction.
    #[error("Decode error: {0}")]
    Decode(String),

    /// Address failed to parse or belongs to another network.
    #[error("Invalid address '{0}'")]
    InvalidAddress(String),

    /// Available outputs cannot cover amount plus fee.
    #[error("Insufficient funds: available {available} sat, required {required} sat")]
    InsufficientFunds { available: u64, required: u64 },

    /// Requested output would be rejected as dust.
    #[error("Output of {value} sat is below the dust threshold of {threshold} sat")]
    OutputBelowDust { value: u64, threshold: u64 },

    /// Key derivation or seed error.
    #[error("Wallet error: {0}")]
    Wallet(String),

    /// ECDSA signing failed.
    #[error("Signing error: {0}")]
    Signing(String),

    /// Broadcast was rejected by the indexer.
    #[error("Broadcast rejected: {0}")]
    Broadcast(String),
}

/// Result type for blockchain operations.
pub type BlockchainResult<T> = Result<T, BlockchainError>;

/// A spendable output as reported by the indexer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnspentOutput {
    /// Display-order (big-endian hex) transaction id.
    pub tx_id: String,
    pub output_index: u32,
    /// Value in satoshis.
    pub value: u64,
    /// Locking script of the output being spent.
    #[serde(with = "hex_bytes")]
    pub script_pubkey: Vec<u8>,
}

/// Funds received by one address in one ledger transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressTransfer {
    pub tx_id: String,
    /// Sum of outputs paying the address, in satoshis.
    pub amount: u64,
    pub confirmations: u32,
    pub block_height: Option<u64>,
}

/// Unsolicited events pushed by an indexer connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexerEvent {
    /// The status of a subscribed address changed.
    AddressActivity { address: String },
    /// A new block tip was announced.
    NewTip { height: u64 },
    /// The connection dropped; no further events follow.
    Disconnected { reason: String },
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_prefixes() {
        assert_eq!(Network::Mainnet.cashaddr_prefix(), "bitcoincash");
        assert_eq!(Network::Testnet.legacy_versions(), (0x6f, 0xc4));
        assert_eq!(Network::Mainnet.coin_type(), 145);
    }

    #[test]
    fn test_error_display() {
        let err = BlockchainError::Timeout(10);
        assert_eq!(err.to_string(), "RPC timeout after 10 seconds");

        let err = BlockchainError::InsufficientFunds {
            available: 600,
            required: 900,
        };
        assert!(err.to_string().contains("900"));
    }

    #[test]
    fn test_unspent_output_serde() {
        let utxo = UnspentOutput {
            tx_id: "aa".repeat(32),
            output_index: 1,
            value: 1000,
            script_pubkey: vec![0x76, 0xa9],
        };
        let json = serde_json::to_string(&utxo).unwrap();
        assert!(json.contains("\"76a9\""));
        let decoded: UnspentOutput = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, utxo);
    }
}
