//! Merchant-side helpers for the settlement engine.
//!
//! - [`webhook`]: verify and decode incoming webhook deliveries
//! - [`client`]: small client for the operator API

pub mod client;
pub mod webhook;

pub use client::AdminClient;
pub use webhook::{verify_signature, WebhookEnvelope, WebhookError};
