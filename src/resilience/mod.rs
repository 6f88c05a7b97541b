//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Indexer connection lost:
//!     → backoff.rs (exponential delay with jitter between reconnects)
//!
//! Webhook delivery failed:
//!     → retries.rs (fixed delay, bounded attempts)
//! ```

pub mod backoff;
pub mod retries;

pub use backoff::Backoff;
pub use retries::RetryPolicy;
