//! Coin selection, fee estimation, change handling and input signing.

use k256::ecdsa::signature::hazmat::PrehashSigner;
use k256::ecdsa::Signature;
use serde::Serialize;

use crate::blockchain::address::Address;
use crate::blockchain::transaction::encode::{tx_hash_from_hex, Transaction, TxIn, TxOut};
use crate::blockchain::transaction::sighash::{SighashCache, SIGHASH_ALL_FORKID};
use crate::blockchain::types::{BlockchainError, BlockchainResult, UnspentOutput};
use crate::blockchain::wallet::KeySet;

/// Minimum value of a standard output; smaller change is left to the fee.
pub const DUST_THRESHOLD: u64 = 546;
pub const TX_VERSION: u32 = 2;
pub const FINAL_SEQUENCE: u32 = 0xffff_ffff;

const INPUT_SIZE: u64 = 148;
const OUTPUT_SIZE: u64 = 34;
const TX_OVERHEAD: u64 = 10;

/// Linear size model times the fee rate (satoshis per byte).
pub fn estimate_fee(inputs: usize, outputs: usize, fee_rate: u64) -> u64 {
    let size = INPUT_SIZE * inputs as u64 + OUTPUT_SIZE * outputs as u64 + TX_OVERHEAD;
    size.saturating_mul(fee_rate)
}

/// One payment leg.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub address: Address,
    pub amount: u64,
}

/// Outputs chosen to fund a spend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoinSelection {
    pub selected: Vec<UnspentOutput>,
    pub total: u64,
    /// Fee estimated for the selected inputs and `output_count` outputs.
    pub fee: u64,
}

/// Largest-first greedy selection covering `target` plus the running fee.
pub fn select_coins(
    available: &[UnspentOutput],
    target: u64,
    output_count: usize,
    fee_rate: u64,
) -> BlockchainResult<CoinSelection> {
    let mut sorted: Vec<&UnspentOutput> = available.iter().collect();
    sorted.sort_by(|a, b| b.value.cmp(&a.value));

    let mut selected = Vec::new();
    let mut total: u64 = 0;
    for utxo in sorted {
        selected.push(utxo.clone());
        total = total.saturating_add(utxo.value);
        let fee = estimate_fee(selected.len(), output_count, fee_rate);
        if total >= target.saturating_add(fee) {
            return Ok(CoinSelection {
                selected,
                total,
                fee,
            });
        }
    }

    let fee = estimate_fee(available.len().max(1), output_count, fee_rate);
    Err(BlockchainError::InsufficientFunds {
        available: total,
        required: target.saturating_add(fee),
    })
}

/// A fully signed transaction ready for broadcast.
#[derive(Debug, Clone, Serialize)]
pub struct SignedTransaction {
    pub tx_id: String,
    #[serde(skip)]
    pub raw: Vec<u8>,
    pub fee: u64,
    pub change: Option<u64>,
    pub inputs: Vec<UnspentOutput>,
}

impl SignedTransaction {
    pub fn raw_hex(&self) -> String {
        hex::encode(&self.raw)
    }
}

/// Pay `amount` to `recipient` from the sender's outputs.
pub fn build_and_sign_transaction(
    sender: &KeySet,
    recipient: &Address,
    amount: u64,
    utxos: &[UnspentOutput],
    fee_rate: u64,
) -> BlockchainResult<SignedTransaction> {
    build_and_sign(
        sender,
        &[Destination {
            address: recipient.clone(),
            amount,
        }],
        utxos,
        fee_rate,
    )
}

/// Pay several destinations; change returns to the sender's address.
pub fn build_and_sign(
    sender: &KeySet,
    destinations: &[Destination],
    utxos: &[UnspentOutput],
    fee_rate: u64,
) -> BlockchainResult<SignedTransaction> {
    if destinations.is_empty() {
        return Err(BlockchainError::Signing("No destinations given".to_string()));
    }
    for dest in destinations {
        if dest.amount < DUST_THRESHOLD {
            return Err(BlockchainError::OutputBelowDust {
                value: dest.amount,
                threshold: DUST_THRESHOLD,
            });
        }
    }
    let amount = destinations
        .iter()
        .try_fold(0u64, |acc, d| acc.checked_add(d.amount))
        .ok_or_else(|| BlockchainError::Signing("Destination amounts overflow".to_string()))?;

    let sender_script = sender.address.locking_script();
    if let Some(foreign) = utxos.iter().find(|u| u.script_pubkey != sender_script) {
        return Err(BlockchainError::Signing(format!(
            "Output {}:{} is not locked to {}",
            foreign.tx_id, foreign.output_index, sender.address
        )));
    }

    // Selection assumes a change output will exist.
    let selection = select_coins(utxos, amount, destinations.len() + 1, fee_rate)?;
    let leftover = selection.total - amount - selection.fee;

    let mut outputs: Vec<TxOut> = destinations
        .iter()
        .map(|d| TxOut {
            value: d.amount,
            script_pubkey: d.address.locking_script(),
        })
        .collect();
    let change = if leftover >= DUST_THRESHOLD {
        outputs.push(TxOut {
            value: leftover,
            script_pubkey: sender_script.clone(),
        });
        Some(leftover)
    } else {
        None
    };
    let fee = selection.total - amount - change.unwrap_or(0);

    let inputs = selection
        .selected
        .iter()
        .map(|utxo| {
            Ok(TxIn {
                prev_tx_hash: tx_hash_from_hex(&utxo.tx_id)?,
                prev_index: utxo.output_index,
                script_sig: Vec::new(),
                sequence: FINAL_SEQUENCE,
            })
        })
        .collect::<BlockchainResult<Vec<_>>>()?;

    let mut tx = Transaction {
        version: TX_VERSION,
        inputs,
        outputs,
        locktime: 0,
    };

    let cache = SighashCache::new(&tx);
    let mut unlock_scripts = Vec::with_capacity(tx.inputs.len());
    for (i, utxo) in selection.selected.iter().enumerate() {
        let digest = cache.digest(&tx, i, &utxo.script_pubkey, utxo.value)?;
        unlock_scripts.push(unlock_script(sender, &digest)?);
    }
    for (input, script) in tx.inputs.iter_mut().zip(unlock_scripts) {
        input.script_sig = script;
    }

    let raw = tx.serialize();
    let tx_id = tx.tx_id();

    tracing::debug!(
        tx_id = %tx_id,
        inputs = tx.inputs.len(),
        outputs = tx.outputs.len(),
        fee = fee,
        "Transaction signed"
    );

    Ok(SignedTransaction {
        tx_id,
        raw,
        fee,
        change,
        inputs: selection.selected,
    })
}

/// `<sig + sighash byte> <compressed pubkey>`
fn unlock_script(sender: &KeySet, digest: &[u8; 32]) -> BlockchainResult<Vec<u8>> {
    let signature: Signature = sender
        .signing_key()
        .sign_prehash(digest)
        .map_err(|e| BlockchainError::Signing(e.to_string()))?;
    let signature = signature.normalize_s().unwrap_or(signature);
    let der = signature.to_der();

    let mut script = Vec::with_capacity(der.as_bytes().len() + 36);
    script.push((der.as_bytes().len() + 1) as u8);
    script.extend_from_slice(der.as_bytes());
    script.push(SIGHASH_ALL_FORKID as u8);
    script.push(sender.public_key.len() as u8);
    script.extend_from_slice(&sender.public_key);
    Ok(script)
}
