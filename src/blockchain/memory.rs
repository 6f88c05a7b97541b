//! In-process ledger standing in for a remote indexer.
//!
//! Used for local development (`indexer.kind = "memory"`) and tests. Transfers
//! and spendable outputs are seeded by the caller; subscribed addresses get
//! activity events exactly like a remote connection would push them.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::blockchain::address::Address;
use crate::blockchain::indexer::LedgerIndexer;
use crate::blockchain::transaction::{encode::tx_hash_from_hex, Transaction};
use crate::blockchain::types::{
    AddressTransfer, BlockchainError, BlockchainResult, IndexerEvent, Network, UnspentOutput,
};

#[derive(Default)]
struct Ledger {
    transfers: HashMap<String, Vec<AddressTransfer>>,
    unspent: HashMap<String, Vec<UnspentOutput>>,
    subscriptions: HashSet<String>,
    broadcasts: Vec<Vec<u8>>,
    events: Option<mpsc::UnboundedSender<IndexerEvent>>,
}

pub struct MemoryIndexer {
    network: Network,
    connected: AtomicBool,
    unavailable: AtomicBool,
    ledger: Mutex<Ledger>,
}

impl MemoryIndexer {
    pub fn new(network: Network) -> Self {
        Self {
            network,
            connected: AtomicBool::new(false),
            unavailable: AtomicBool::new(false),
            ledger: Mutex::new(Ledger::default()),
        }
    }

    pub fn network(&self) -> Network {
        self.network
    }

    /// Make subsequent `connect` calls fail.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Record (or update by txid) a transfer into `address`, notifying
    /// subscribers.
    pub fn record_transfer(&self, address: &Address, transfer: AddressTransfer) {
        let key = address.to_cashaddr();
        let Ok(mut ledger) = self.ledger.lock() else {
            return;
        };
        let entries = ledger.transfers.entry(key.clone()).or_default();
        match entries.iter_mut().find(|t| t.tx_id == transfer.tx_id) {
            Some(existing) => *existing = transfer,
            None => entries.push(transfer),
        }
        if ledger.subscriptions.contains(&key) {
            if let Some(events) = &ledger.events {
                let _ = events.send(IndexerEvent::AddressActivity { address: key });
            }
        }
    }

    pub fn add_unspent(&self, address: &Address, utxo: UnspentOutput) {
        if let Ok(mut ledger) = self.ledger.lock() {
            ledger
                .unspent
                .entry(address.to_cashaddr())
                .or_default()
                .push(utxo);
        }
    }

    /// Simulate the remote end dropping the connection.
    pub fn drop_connection(&self, reason: &str) {
        self.connected.store(false, Ordering::SeqCst);
        if let Ok(mut ledger) = self.ledger.lock() {
            ledger.subscriptions.clear();
            if let Some(events) = ledger.events.take() {
                let _ = events.send(IndexerEvent::Disconnected {
                    reason: reason.to_string(),
                });
            }
        }
    }

    pub fn subscriptions(&self) -> HashSet<String> {
        self.ledger
            .lock()
            .map(|l| l.subscriptions.clone())
            .unwrap_or_default()
    }

    pub fn broadcasts(&self) -> Vec<Vec<u8>> {
        self.ledger
            .lock()
            .map(|l| l.broadcasts.clone())
            .unwrap_or_default()
    }

    fn ensure_connected(&self) -> BlockchainResult<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(BlockchainError::NotAvailable("indexer disconnected".to_string()))
        }
    }

    fn lock(&self) -> BlockchainResult<std::sync::MutexGuard<'_, Ledger>> {
        self.ledger
            .lock()
            .map_err(|_| BlockchainError::Rpc("ledger lock poisoned".to_string()))
    }
}

#[async_trait]
impl LedgerIndexer for MemoryIndexer {
    async fn connect(&self) -> BlockchainResult<mpsc::UnboundedReceiver<IndexerEvent>> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(BlockchainError::Rpc("All indexer endpoints failed".to_string()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let mut ledger = self.lock()?;
        ledger.subscriptions.clear();
        ledger.events = Some(tx);
        self.connected.store(true, Ordering::SeqCst);
        Ok(rx)
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        if let Ok(mut ledger) = self.ledger.lock() {
            ledger.subscriptions.clear();
            ledger.events = None;
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn subscribe_address(&self, address: &Address) -> BlockchainResult<()> {
        self.ensure_connected()?;
        self.lock()?.subscriptions.insert(address.to_cashaddr());
        Ok(())
    }

    async fn unsubscribe_address(&self, address: &Address) -> BlockchainResult<()> {
        self.ensure_connected()?;
        self.lock()?.subscriptions.remove(&address.to_cashaddr());
        Ok(())
    }

    async fn address_history(&self, address: &Address) -> BlockchainResult<Vec<AddressTransfer>> {
        self.ensure_connected()?;
        Ok(self
            .lock()?
            .transfers
            .get(&address.to_cashaddr())
            .cloned()
            .unwrap_or_default())
    }

    async fn list_unspent(&self, address: &Address) -> BlockchainResult<Vec<UnspentOutput>> {
        self.ensure_connected()?;
        Ok(self
            .lock()?
            .unspent
            .get(&address.to_cashaddr())
            .cloned()
            .unwrap_or_default())
    }

    async fn broadcast(&self, raw_tx: &[u8]) -> BlockchainResult<String> {
        self.ensure_connected()?;
        let tx = Transaction::deserialize(raw_tx)
            .map_err(|e| BlockchainError::Broadcast(e.to_string()))?;

        let mut ledger = self.lock()?;
        for input in &tx.inputs {
            for outputs in ledger.unspent.values_mut() {
                outputs.retain(|u| {
                    tx_hash_from_hex(&u.tx_id).map(|h| h != input.prev_tx_hash).unwrap_or(true)
                        || u.output_index != input.prev_index
                });
            }
        }
        ledger.broadcasts.push(raw_tx.to_vec());
        Ok(tx.tx_id())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn address() -> Address {
        Address::from_legacy("1BpEi6DfDAUFd7GtittLSdBeYJvcoaVggu", Network::Mainnet).unwrap()
    }

    #[tokio::test]
    async fn test_queries_require_connection() {
        let indexer = MemoryIndexer::new(Network::Mainnet);
        assert!(indexer.address_history(&address()).await.is_err());

        indexer.set_unavailable(true);
        assert!(indexer.connect().await.is_err());
        indexer.set_unavailable(false);
        let _events = indexer.connect().await.unwrap();
        assert!(indexer.address_history(&address()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_subscribed_activity_is_pushed() {
        let indexer = MemoryIndexer::new(Network::Mainnet);
        let mut events = indexer.connect().await.unwrap();
        indexer.subscribe_address(&address()).await.unwrap();

        let transfer = AddressTransfer {
            tx_id: "ab".repeat(32),
            amount: 1_000,
            confirmations: 0,
            block_height: None,
        };
        indexer.record_transfer(&address(), transfer.clone());
        assert_eq!(
            events.recv().await.unwrap(),
            IndexerEvent::AddressActivity { address: address().to_cashaddr() }
        );

        indexer.record_transfer(&address(), AddressTransfer { confirmations: 2, ..transfer });
        let history = indexer.address_history(&address()).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].confirmations, 2);
    }

    #[tokio::test]
    async fn test_drop_connection_emits_disconnect() {
        let indexer = MemoryIndexer::new(Network::Mainnet);
        let mut events = indexer.connect().await.unwrap();
        indexer.drop_connection("test");
        assert!(matches!(events.recv().await, Some(IndexerEvent::Disconnected { .. })));
        assert!(!indexer.is_connected());
    }
}
