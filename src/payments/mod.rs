//! Chain watch and reconciliation.
//!
//! # Data Flow
//! ```text
//! indexer push / polling sweep / check_address
//!     → monitor.rs (ChainWatcher: connection, subscriptions, history queries)
//!     → cache.rs (WatchTable lookup, unwatched → no-op)
//!     → processor.rs (classify, atomic upsert, target transition)
//!     → store.rs (SettlementStore)
//!     → NotificationQueue (webhook events)
//! ```

pub mod cache;
pub mod monitor;
pub mod processor;
pub mod store;
pub mod types;

pub use cache::WatchTable;
pub use monitor::ChainWatcher;
pub use processor::{ProcessOutcome, ReconcilePolicy, Reconciler};
pub use store::{MemoryStore, SettlementStore, StoreError, StoreResult};
pub use types::{
    ContractInstance, ContractStatus, LinkKind, PaymentLink, SettlementTarget, TargetKind,
    TargetRef, TransactionRecord, TxStatus, WatchedAddress,
};
