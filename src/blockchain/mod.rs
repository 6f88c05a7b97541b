//! Ledger integration subsystem.
//!
//! # Data Flow
//! ```text
//! Environment variable (master seed)
//!     → wallet.rs (BIP32 derivation, per-index key sets)
//!     → allocator.rs (next free derivation index)
//!     → address.rs (CashAddr / legacy, locking scripts)
//!
//! indexer.rs (capability trait)
//!     → client.rs (Electrum over WebSocket, timeouts, failover)
//!     → memory.rs (in-process ledger)
//!
//! transaction/ (select, digest, sign, serialize, broadcast)
//! ```
//!
//! # Security Constraints
//! - Seeds ONLY from environment variables
//! - Never log private keys or seeds
//! - Every indexer request has a timeout
//! - Indexer outages degrade to "no activity", never to a crash

pub mod address;
pub mod allocator;
pub mod client;
pub mod indexer;
pub mod memory;
pub mod transaction;
pub mod types;
pub mod wallet;

pub use address::{Address, AddressKind};
pub use allocator::IndexAllocator;
pub use client::ElectrumClient;
pub use indexer::{build_indexer, LedgerIndexer};
pub use memory::MemoryIndexer;
pub use types::{AddressTransfer, BlockchainError, BlockchainResult, IndexerEvent, Network, UnspentOutput};
pub use wallet::{HdWallet, KeySet};
