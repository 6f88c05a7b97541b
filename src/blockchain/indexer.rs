//! Remote ledger indexer capability.
//!
//! The watcher and payout flow only talk to this trait. The concrete
//! implementation is chosen at startup from `indexer.kind`.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::blockchain::address::Address;
use crate::blockchain::client::ElectrumClient;
use crate::blockchain::memory::MemoryIndexer;
use crate::blockchain::types::{
    AddressTransfer, BlockchainResult, IndexerConfig, IndexerEvent, Network, UnspentOutput,
};
use crate::config::schema::IndexerKind;

#[async_trait]
pub trait LedgerIndexer: Send + Sync {
    /// Open the connection. Events for subscribed addresses and the final
    /// disconnect notice arrive on the returned channel.
    async fn connect(&self) -> BlockchainResult<mpsc::UnboundedReceiver<IndexerEvent>>;

    /// Close the connection. Subscriptions are forgotten.
    async fn disconnect(&self);

    fn is_connected(&self) -> bool;

    async fn subscribe_address(&self, address: &Address) -> BlockchainResult<()>;

    async fn unsubscribe_address(&self, address: &Address) -> BlockchainResult<()>;

    /// Every transaction paying the address, with received amount and depth.
    async fn address_history(&self, address: &Address) -> BlockchainResult<Vec<AddressTransfer>>;

    async fn list_unspent(&self, address: &Address) -> BlockchainResult<Vec<UnspentOutput>>;

    /// Broadcast a raw transaction, returning its txid.
    async fn broadcast(&self, raw_tx: &[u8]) -> BlockchainResult<String>;

    /// Short label for logs and metrics.
    fn name(&self) -> &'static str;
}

/// Build the indexer named by the configuration.
pub fn build_indexer(config: &IndexerConfig, network: Network) -> Arc<dyn LedgerIndexer> {
    match config.kind {
        IndexerKind::Electrum => Arc::new(ElectrumClient::new(config.clone(), network)),
        IndexerKind::Memory => {
            tracing::warn!("Using in-memory indexer; no real ledger activity will be observed");
            Arc::new(MemoryIndexer::new(network))
        }
    }
}
