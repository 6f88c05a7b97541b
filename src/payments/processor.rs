//! Reconciliation of observed transfers against settlement targets.
//!
//! Every observation, whether pushed by the indexer, found by a sweep or
//! requested on demand, goes through `Reconciler::process`. Processing the same
//! `(address, txid)` any number of times, in any order, yields one record, at
//! most one target transition and one confirmation notification.
//!
//! A CONFIRMED record stays unsettled until its transition and notification
//! have gone through, so a failed settlement is retried by the next
//! observation of the same txid.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashSet;
use serde_json::{json, Value};

use crate::config::schema::WatchConfig;
use crate::notifications::queue::NotificationQueue;
use crate::notifications::types::{
    CONTRACT_FUNDED, PAYMENT_CONFIRMED, PAYMENT_FAILED, PAYMENT_PENDING,
};
use crate::observability::metrics;
use crate::payments::cache::WatchTable;
use crate::payments::store::{SettlementStore, StoreResult};
use crate::payments::types::{
    Observation, SettlementAction, TransactionRecord, TxStatus, UpsertOutcome, WatchedAddress,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcilePolicy {
    /// Largest zero-confirmation amount accepted for opted-in targets.
    pub zero_conf_max_amount: u64,
    pub finality_confirmations: u32,
}

impl From<&WatchConfig> for ReconcilePolicy {
    fn from(config: &WatchConfig) -> Self {
        Self {
            zero_conf_max_amount: config.zero_conf_max_amount,
            finality_confirmations: config.finality_confirmations,
        }
    }
}

impl Default for ReconcilePolicy {
    fn default() -> Self {
        Self::from(&WatchConfig::default())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Address not in the watch table; nothing was touched.
    NotWatched,
    Created(TransactionRecord),
    /// Known txid, confirmations refreshed.
    Updated(TransactionRecord),
    /// Known txid that just reached CONFIRMED.
    Promoted(TransactionRecord),
}

impl ProcessOutcome {
    pub fn record(&self) -> Option<&TransactionRecord> {
        match self {
            ProcessOutcome::NotWatched => None,
            ProcessOutcome::Created(r) | ProcessOutcome::Updated(r) | ProcessOutcome::Promoted(r) => {
                Some(r)
            }
        }
    }
}

#[derive(Clone)]
pub struct Reconciler {
    table: WatchTable,
    store: Arc<dyn SettlementStore>,
    notifications: NotificationQueue,
    policy: ReconcilePolicy,
    /// Txids with a settlement in flight in this process.
    settling: Arc<DashSet<String>>,
}

impl Reconciler {
    pub fn new(
        table: WatchTable,
        store: Arc<dyn SettlementStore>,
        notifications: NotificationQueue,
        policy: ReconcilePolicy,
    ) -> Self {
        Self {
            table,
            store,
            notifications,
            policy,
            settling: Arc::new(DashSet::new()),
        }
    }

    pub fn policy(&self) -> ReconcilePolicy {
        self.policy
    }

    /// Status a transfer would get if first seen now.
    pub fn classify(&self, watched: &WatchedAddress, amount: u64, confirmations: u32) -> TxStatus {
        if confirmations >= 1
            || (watched.accept_zero_conf && amount <= self.policy.zero_conf_max_amount)
        {
            TxStatus::Confirmed
        } else {
            TxStatus::Pending
        }
    }

    pub async fn process(
        &self,
        address: &str,
        tx_id: &str,
        amount: u64,
        confirmations: u32,
        block_height: Option<u64>,
    ) -> StoreResult<ProcessOutcome> {
        let Some(watched) = self.table.get(address) else {
            tracing::debug!(address = %address, tx_id = %tx_id, "Ignoring activity on unwatched address");
            metrics::record_reconciliation("not_watched");
            return Ok(ProcessOutcome::NotWatched);
        };

        let status = self.classify(&watched, amount, confirmations);
        let outcome = self
            .store
            .upsert_transaction(Observation {
                tx_id: tx_id.to_string(),
                address: address.to_string(),
                amount,
                confirmations,
                block_height,
                status,
                target: watched.target,
            })
            .await?;

        match outcome {
            UpsertOutcome::Created(mut record) => {
                tracing::info!(
                    address = %address,
                    tx_id = %tx_id,
                    amount = amount,
                    confirmations = confirmations,
                    status = record.status.as_str(),
                    target = %watched.target,
                    "New payment recorded"
                );
                metrics::record_reconciliation("created");
                if record.status == TxStatus::Confirmed {
                    record.settled = self.settle(&watched, &record).await?;
                } else {
                    self.notifications.enqueue(
                        &watched.owner_id,
                        PAYMENT_PENDING,
                        payment_payload(&watched, &record),
                    );
                }
                Ok(ProcessOutcome::Created(record))
            }
            UpsertOutcome::Updated {
                mut record,
                promoted: true,
            } => {
                tracing::info!(
                    address = %address,
                    tx_id = %tx_id,
                    confirmations = confirmations,
                    target = %watched.target,
                    "Pending payment confirmed"
                );
                metrics::record_reconciliation("promoted");
                record.settled = self.settle(&watched, &record).await?;
                Ok(ProcessOutcome::Promoted(record))
            }
            UpsertOutcome::Updated { mut record, .. }
                if record.status == TxStatus::Confirmed && !record.settled =>
            {
                tracing::info!(
                    address = %address,
                    tx_id = %tx_id,
                    target = %watched.target,
                    "Retrying settlement of confirmed payment"
                );
                metrics::record_reconciliation("settle_retry");
                if self.settle(&watched, &record).await? {
                    record.settled = true;
                    Ok(ProcessOutcome::Promoted(record))
                } else {
                    Ok(ProcessOutcome::Updated(record))
                }
            }
            UpsertOutcome::Updated { record, .. } => {
                tracing::debug!(
                    tx_id = %tx_id,
                    confirmations = confirmations,
                    "Confirmations updated"
                );
                metrics::record_reconciliation("updated");
                Ok(ProcessOutcome::Updated(record))
            }
        }
    }

    /// Apply the target's transition for a confirmed payment, mark the record
    /// settled and queue the notification. Returns false when another caller
    /// settled it first.
    async fn settle(&self, watched: &WatchedAddress, record: &TransactionRecord) -> StoreResult<bool> {
        if !self.settling.insert(record.tx_id.clone()) {
            tracing::debug!(tx_id = %record.tx_id, "Settlement already in flight");
            return Ok(false);
        }
        let result = self.apply_settlement(watched, record).await;
        self.settling.remove(&record.tx_id);
        if let Err(e) = &result {
            tracing::warn!(tx_id = %record.tx_id, target = %watched.target, error = %e, "Settlement failed, will retry on next observation");
        }
        result
    }

    async fn apply_settlement(
        &self,
        watched: &WatchedAddress,
        record: &TransactionRecord,
    ) -> StoreResult<bool> {
        let mut event_type = PAYMENT_CONFIRMED;
        match self.store.find_target(&watched.target).await? {
            Some(target) => match target.on_confirmed_payment() {
                SettlementAction::CloseLink => {
                    if self.store.close_payment_link(watched.target.id).await? {
                        tracing::info!(target = %watched.target, tx_id = %record.tx_id, "Payment link closed");
                        metrics::record_target_transition("link_closed");
                    }
                }
                SettlementAction::MarkFunded => {
                    if self.store.mark_contract_funded(watched.target.id).await? {
                        tracing::info!(target = %watched.target, tx_id = %record.tx_id, "Contract funded");
                        metrics::record_target_transition("contract_funded");
                        event_type = CONTRACT_FUNDED;
                    }
                }
                SettlementAction::Unchanged => {}
            },
            None => {
                tracing::warn!(target = %watched.target, tx_id = %record.tx_id, "Watched target missing from store");
            }
        }

        // Transitions above are idempotent; the marker decides who notifies.
        if !self.store.mark_transaction_settled(&record.tx_id).await? {
            return Ok(false);
        }
        let mut record = record.clone();
        record.settled = true;
        self.notifications.enqueue(
            &watched.owner_id,
            event_type,
            payment_payload(watched, &record),
        );
        Ok(true)
    }

    /// Mark PENDING records for `address` that no longer appear in its
    /// history as FAILED (double-spent or evicted from the mempool).
    pub async fn fail_dropped(
        &self,
        address: &str,
        seen: &HashSet<&str>,
    ) -> StoreResult<Vec<TransactionRecord>> {
        let Some(watched) = self.table.get(address) else {
            return Ok(Vec::new());
        };
        let mut failed = Vec::new();
        for mut record in self.store.pending_transactions(address).await? {
            if seen.contains(record.tx_id.as_str()) {
                continue;
            }
            if self.store.mark_transaction_failed(&record.tx_id).await? {
                record.status = TxStatus::Failed;
                tracing::warn!(address = %address, tx_id = %record.tx_id, "Pending payment dropped from ledger");
                metrics::record_reconciliation("failed");
                self.notifications.enqueue(
                    &watched.owner_id,
                    PAYMENT_FAILED,
                    payment_payload(&watched, &record),
                );
                failed.push(record);
            }
        }
        Ok(failed)
    }

    /// Whether the address can stop being watched: its target takes no more
    /// payments and this record is buried deep enough.
    pub async fn should_release(
        &self,
        watched: &WatchedAddress,
        record: &TransactionRecord,
    ) -> StoreResult<bool> {
        if record.status != TxStatus::Confirmed
            || record.confirmations < self.policy.finality_confirmations
        {
            return Ok(false);
        }
        Ok(self
            .store
            .find_target(&watched.target)
            .await?
            .map_or(true, |target| !target.is_open()))
    }
}

fn payment_payload(watched: &WatchedAddress, record: &TransactionRecord) -> Value {
    json!({
        "tx_id": record.tx_id,
        "address": record.address,
        "amount": record.amount,
        "confirmations": record.confirmations,
        "status": record.status,
        "block_height": record.block_height,
        "target": record.target,
        "expected_amount": watched.expected_amount,
        "underpaid": watched.expected_amount.map(|expected| record.amount < expected),
    })
}
