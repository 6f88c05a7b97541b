//! Outgoing payouts: fetch spendable outputs, sign, broadcast.
//!
//! Used by escrow release, refunds and withdrawals. Nothing reaches the
//! network unless signing succeeded.

use std::sync::Arc;

use crate::blockchain::address::Address;
use crate::blockchain::indexer::LedgerIndexer;
use crate::blockchain::transaction::builder::{build_and_sign, Destination, SignedTransaction};
use crate::blockchain::types::{BlockchainError, BlockchainResult, Network};
use crate::blockchain::wallet::HdWallet;
use crate::observability::metrics;

/// Payout builder bound to one wallet and indexer.
pub struct Payout {
    indexer: Arc<dyn LedgerIndexer>,
    wallet: HdWallet,
    fee_rate: u64,
}

impl Payout {
    pub fn new(indexer: Arc<dyn LedgerIndexer>, wallet: HdWallet, fee_rate: u64) -> Self {
        Self {
            indexer,
            wallet,
            fee_rate,
        }
    }

    pub fn network(&self) -> Network {
        self.wallet.network()
    }

    /// Sign a spend of the funds held at `sender_index` without broadcasting.
    pub async fn prepare(
        &self,
        sender_index: u32,
        destinations: &[Destination],
    ) -> BlockchainResult<SignedTransaction> {
        let keys = self.wallet.derive_key_set(sender_index)?;
        let utxos = self.indexer.list_unspent(&keys.address).await?;
        tracing::debug!(
            sender = %keys.address,
            available = utxos.len(),
            "Fetched spendable outputs"
        );
        build_and_sign(&keys, destinations, &utxos, self.fee_rate)
    }

    /// Sign and broadcast a single-recipient payout.
    pub async fn send(
        &self,
        sender_index: u32,
        recipient: &Address,
        amount: u64,
    ) -> BlockchainResult<SignedTransaction> {
        if recipient.network != self.wallet.network() {
            return Err(BlockchainError::InvalidAddress(recipient.to_cashaddr()));
        }
        let signed = self
            .prepare(
                sender_index,
                &[Destination {
                    address: recipient.clone(),
                    amount,
                }],
            )
            .await?;

        let accepted = self.indexer.broadcast(&signed.raw).await?;
        metrics::record_payout();
        if accepted != signed.tx_id {
            tracing::warn!(
                local = %signed.tx_id,
                remote = %accepted,
                "Indexer reported a different txid for broadcast"
            );
        }
        tracing::info!(
            tx_id = %signed.tx_id,
            recipient = %recipient,
            amount = amount,
            fee = signed.fee,
            "Payout broadcast"
        );
        Ok(signed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::memory::MemoryIndexer;
    use crate::blockchain::types::{Network, UnspentOutput};

    const SEED: &str = "000102030405060708090a0b0c0d0e0f";

    #[tokio::test]
    async fn test_send_broadcasts_and_spends_outputs() {
        let indexer = Arc::new(MemoryIndexer::new(Network::Mainnet));
        let _events = indexer.connect().await.unwrap();
        let wallet = HdWallet::from_seed_hex(SEED, Network::Mainnet, 0).unwrap();
        let sender = wallet.derive_key_set(0).unwrap();
        indexer.add_unspent(
            &sender.address,
            UnspentOutput {
                tx_id: "cd".repeat(32),
                output_index: 0,
                value: 100_000,
                script_pubkey: sender.address.locking_script(),
            },
        );

        let payout = Payout::new(indexer.clone(), wallet.clone(), 1);
        let recipient = wallet.derive_address(9).unwrap();
        let signed = payout.send(0, &recipient, 60_000).await.unwrap();

        assert_eq!(indexer.broadcasts(), vec![signed.raw.clone()]);
        assert!(indexer.list_unspent(&sender.address).await.unwrap().is_empty());

        let again = payout.send(0, &recipient, 60_000).await;
        assert!(matches!(again, Err(BlockchainError::InsufficientFunds { .. })));
        assert_eq!(indexer.broadcasts().len(), 1);
    }

    #[tokio::test]
    async fn test_rejects_other_network_recipient() {
        let indexer = Arc::new(MemoryIndexer::new(Network::Mainnet));
        let wallet = HdWallet::from_seed_hex(SEED, Network::Mainnet, 0).unwrap();
        let testnet = HdWallet::from_seed_hex(SEED, Network::Testnet, 0).unwrap();
        let payout = Payout::new(indexer, wallet, 1);
        let result = payout.send(0, &testnet.derive_address(0).unwrap(), 10_000).await;
        assert!(matches!(result, Err(BlockchainError::InvalidAddress(_))));
    }
}
