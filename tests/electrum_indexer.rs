//! Electrum client against a mock WebSocket indexer.

use settlement_engine::blockchain::transaction::build_and_sign_transaction;
use settlement_engine::blockchain::transaction::encode::{TxIn, TxOut};
use settlement_engine::blockchain::transaction::Transaction;
use settlement_engine::blockchain::{ElectrumClient, LedgerIndexer, Network, UnspentOutput};
use settlement_engine::config::IndexerConfig;

mod common;

async fn client(url: String) -> ElectrumClient {
    let client = ElectrumClient::new(
        IndexerConfig {
            url,
            request_timeout_secs: 2,
            ..IndexerConfig::default()
        },
        Network::Mainnet,
    );
    let _events = client.connect().await.unwrap();
    client
}

#[tokio::test]
async fn test_payout_change_is_not_reported_as_payment() {
    let wallet = common::test_wallet();
    let merchant = wallet.derive_key_set(0).unwrap();
    let recipient = wallet.derive_address(9).unwrap();

    let funding = Transaction {
        version: 2,
        inputs: vec![TxIn {
            prev_tx_hash: [0x42; 32],
            prev_index: 1,
            script_sig: vec![0x51],
            sequence: u32::MAX,
        }],
        outputs: vec![TxOut {
            value: 100_000,
            script_pubkey: merchant.address.locking_script(),
        }],
        locktime: 0,
    };
    let utxo = UnspentOutput {
        tx_id: funding.tx_id(),
        output_index: 0,
        value: 100_000,
        script_pubkey: merchant.address.locking_script(),
    };
    let payout = build_and_sign_transaction(&merchant, &recipient, 60_000, &[utxo], 1).unwrap();
    let change = payout.change.unwrap();
    assert!(change > 0);

    let url = common::start_electrum(
        800_000,
        vec![
            (hex::encode(funding.serialize()), 799_990),
            (hex::encode(&payout.raw), 800_000),
        ],
    )
    .await;
    let indexer = client(url).await;

    let history = indexer.address_history(&merchant.address).await.unwrap();
    assert_eq!(history.len(), 1, "change output surfaced as a payment: {:?}", history);
    assert_eq!(history[0].tx_id, funding.tx_id());
    assert_eq!(history[0].amount, 100_000);
    assert_eq!(history[0].confirmations, 11);
    assert_eq!(history[0].block_height, Some(799_990));

    // The recipient side still sees the payout.
    let received = indexer.address_history(&recipient).await.unwrap();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].amount, 60_000);
    assert_eq!(received[0].confirmations, 1);

    indexer.disconnect().await;
}

#[tokio::test]
async fn test_payout_alone_is_not_income() {
    let wallet = common::test_wallet();
    let merchant = wallet.derive_key_set(0).unwrap();
    let recipient = wallet.derive_address(9).unwrap();
    let utxo = UnspentOutput {
        tx_id: "ab".repeat(32),
        output_index: 3,
        value: 250_000,
        script_pubkey: merchant.address.locking_script(),
    };
    let payout = build_and_sign_transaction(&merchant, &recipient, 60_000, &[utxo], 1).unwrap();

    // Mempool only; the funding transaction fell out of the server's history.
    let url = common::start_electrum(800_000, vec![(hex::encode(&payout.raw), 0)]).await;
    let indexer = client(url).await;

    assert!(indexer
        .address_history(&merchant.address)
        .await
        .unwrap()
        .is_empty());
    let received = indexer.address_history(&recipient).await.unwrap();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].confirmations, 0);
    assert_eq!(received[0].block_height, None);

    indexer.disconnect().await;
}
