//! Payment settlement engine for Bitcoin Cash.
//!
//! Watches receiving addresses for incoming payments, reconciles them against
//! payment links and escrow contracts, signs outgoing payouts and notifies
//! merchants through signed webhooks.

pub mod admin;
pub mod blockchain;
pub mod config;
pub mod lifecycle;
pub mod notifications;
pub mod observability;
pub mod payments;
pub mod resilience;

pub use config::schema::SettlementConfig;
pub use lifecycle::Shutdown;
pub use payments::ChainWatcher;
