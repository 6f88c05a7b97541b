//! Settlement domain types.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Seconds since the unix epoch.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    PaymentLink,
    Contract,
}

/// Reference to the settlement target an address pays into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TargetRef {
    #[serde(rename = "type")]
    pub kind: TargetKind,
    pub id: Uuid,
}

impl TargetRef {
    pub fn payment_link(id: Uuid) -> Self {
        Self {
            kind: TargetKind::PaymentLink,
            id,
        }
    }

    pub fn contract(id: Uuid) -> Self {
        Self {
            kind: TargetKind::Contract,
            id,
        }
    }
}

impl fmt::Display for TargetRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            TargetKind::PaymentLink => "payment_link",
            TargetKind::Contract => "contract",
        };
        write!(f, "{}:{}", kind, self.id)
    }
}

/// An entry in the watch table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchedAddress {
    pub address: String,
    pub target: TargetRef,
    pub owner_id: String,
    pub expected_amount: Option<u64>,
    pub accept_zero_conf: bool,
    pub registered_at: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TxStatus {
    Pending,
    Confirmed,
    Failed,
}

impl TxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxStatus::Pending => "PENDING",
            TxStatus::Confirmed => "CONFIRMED",
            TxStatus::Failed => "FAILED",
        }
    }
}

/// An observed incoming transfer, unique per ledger txid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub tx_id: String,
    pub address: String,
    pub amount: u64,
    pub confirmations: u32,
    pub status: TxStatus,
    pub block_height: Option<u64>,
    pub target: TargetRef,
    /// Set once the target transition and confirmation notification for a
    /// CONFIRMED record have gone through.
    #[serde(default)]
    pub settled: bool,
    pub created_at: u64,
    pub updated_at: u64,
}

/// A transfer as seen by the reconciler, before it becomes a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    pub tx_id: String,
    pub address: String,
    pub amount: u64,
    pub confirmations: u32,
    pub block_height: Option<u64>,
    pub status: TxStatus,
    pub target: TargetRef,
}

/// Result of the store's atomic upsert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created(TransactionRecord),
    /// `promoted` is set when this update moved the record to CONFIRMED.
    Updated {
        record: TransactionRecord,
        promoted: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LinkKind {
    Single,
    Multi,
    Recurring,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentLink {
    pub id: Uuid,
    pub owner_id: String,
    pub kind: LinkKind,
    pub address: Option<String>,
    pub derivation_index: Option<u32>,
    pub amount: Option<u64>,
    #[serde(default)]
    pub accept_zero_conf: bool,
    pub active: bool,
    pub created_at: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContractStatus {
    Active,
    Funded,
    Released,
    Refunded,
    Disputed,
    Completed,
    Expired,
}

impl ContractStatus {
    /// No further payments are expected.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ContractStatus::Released
                | ContractStatus::Refunded
                | ContractStatus::Completed
                | ContractStatus::Expired
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractInstance {
    pub id: Uuid,
    pub owner_id: String,
    pub address: String,
    pub status: ContractStatus,
    pub created_at: u64,
}

/// Transition the store should apply after a first-time confirmed payment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettlementAction {
    CloseLink,
    MarkFunded,
    Unchanged,
}

/// Anything a watched address can settle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SettlementTarget {
    PaymentLink(PaymentLink),
    Contract(ContractInstance),
}

impl SettlementTarget {
    pub fn target_ref(&self) -> TargetRef {
        match self {
            SettlementTarget::PaymentLink(link) => TargetRef::payment_link(link.id),
            SettlementTarget::Contract(contract) => TargetRef::contract(contract.id),
        }
    }

    pub fn owner_id(&self) -> &str {
        match self {
            SettlementTarget::PaymentLink(link) => &link.owner_id,
            SettlementTarget::Contract(contract) => &contract.owner_id,
        }
    }

    pub fn address(&self) -> Option<&str> {
        match self {
            SettlementTarget::PaymentLink(link) => link.address.as_deref(),
            SettlementTarget::Contract(contract) => Some(&contract.address),
        }
    }

    /// Whether the target still expects incoming payments.
    pub fn is_open(&self) -> bool {
        match self {
            SettlementTarget::PaymentLink(link) => link.active,
            SettlementTarget::Contract(contract) => !contract.status.is_terminal(),
        }
    }

    pub fn on_confirmed_payment(&self) -> SettlementAction {
        match self {
            SettlementTarget::PaymentLink(link) if link.active && link.kind == LinkKind::Single => {
                SettlementAction::CloseLink
            }
            SettlementTarget::Contract(contract) if contract.status == ContractStatus::Active => {
                SettlementAction::MarkFunded
            }
            _ => SettlementAction::Unchanged,
        }
    }
}
