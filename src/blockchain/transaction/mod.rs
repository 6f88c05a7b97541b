//! Transaction construction and signing.
//!
//! # Data Flow
//! ```text
//! unspent outputs + destinations
//!     → builder.rs (coin selection, fee, change)
//!     → sighash.rs (per-input fork-id digest)
//!     → builder.rs (ECDSA sign, unlock scripts)
//!     → encode.rs (raw bytes, txid)
//!     → payout.rs (broadcast through the indexer)
//! ```
//!
//! Everything except `payout.rs` is pure and holds no state.

pub mod builder;
pub mod encode;
pub mod payout;
pub mod sighash;

pub use builder::{
    build_and_sign, build_and_sign_transaction, estimate_fee, select_coins, Destination,
    SignedTransaction, DUST_THRESHOLD,
};
pub use encode::Transaction;
pub use payout::Payout;
