//! Metrics collection and exposition.
//!
//! # Metrics
//! - `settlement_indexer_connected` (gauge): 1=connected, 0=disconnected
//! - `settlement_watched_addresses` (gauge): size of the watch table
//! - `settlement_reconciliations_total` (counter): by outcome
//! - `settlement_target_transitions_total` (counter): by transition
//! - `settlement_webhook_attempts_total` (counter): by result
//! - `settlement_webhook_deliveries_total` (counter): final status
//! - `settlement_allocator_degraded` (gauge): 1 while on the fallback counter
//! - `settlement_payouts_total` (counter): broadcast payouts

use std::net::SocketAddr;

use metrics_exporter_prometheus::PrometheusBuilder;

/// Start the Prometheus scrape endpoint.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint listening"),
        Err(e) => tracing::error!(error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_indexer_connected(connected: bool) {
    ::metrics::gauge!("settlement_indexer_connected").set(if connected { 1.0 } else { 0.0 });
}

pub fn record_watched_addresses(count: usize) {
    ::metrics::gauge!("settlement_watched_addresses").set(count as f64);
}

/// `outcome` is one of created, updated, promoted, not_watched, failed.
pub fn record_reconciliation(outcome: &'static str) {
    ::metrics::counter!("settlement_reconciliations_total", "outcome" => outcome).increment(1);
}

pub fn record_target_transition(transition: &'static str) {
    ::metrics::counter!("settlement_target_transitions_total", "transition" => transition)
        .increment(1);
}

pub fn record_webhook_attempt(success: bool) {
    let result = if success { "success" } else { "error" };
    ::metrics::counter!("settlement_webhook_attempts_total", "result" => result).increment(1);
}

pub fn record_webhook_outcome(status: &'static str) {
    ::metrics::counter!("settlement_webhook_deliveries_total", "status" => status).increment(1);
}

pub fn record_allocator_degraded(degraded: bool) {
    ::metrics::gauge!("settlement_allocator_degraded").set(if degraded { 1.0 } else { 0.0 });
}

pub fn record_payout() {
    ::metrics::counter!("settlement_payouts_total").increment(1);
}
