//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (main.rs):
//!     Load config → Validate → Store → Indexer → Watcher → Notifier → Admin API
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Shutdown::trigger
//!
//! Shutdown (shutdown.rs):
//!     Stop polling → Close indexer → Drain webhook queue → Exit
//! ```
//!
//! # Design Decisions
//! - Fail fast: a missing seed or bad config is fatal at startup
//! - Indexer unavailability at startup is not fatal; the supervisor retries
//! - In-flight webhook deliveries get a bounded drain window

pub mod shutdown;
pub mod signals;

pub use shutdown::Shutdown;
