//! Fork-id signature digest (BIP143 layout with `SIGHASH_FORKID`).
//!
//! Preimage per input:
//! ```text
//! version · hashPrevouts · hashSequence · outpoint · scriptCode · value
//!   · sequence · hashOutputs · locktime · sighash type (LE32)
//! ```
//! The three shared hashes are computed once per transaction.

use crate::blockchain::transaction::encode::{sha256d, write_output, write_varint, Transaction};
use crate::blockchain::types::{BlockchainError, BlockchainResult};

pub const SIGHASH_ALL: u32 = 0x01;
pub const SIGHASH_FORKID: u32 = 0x40;
/// The only sighash type the engine produces.
pub const SIGHASH_ALL_FORKID: u32 = SIGHASH_ALL | SIGHASH_FORKID;

/// Hashes shared by every input of one transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SighashCache {
    pub hash_prevouts: [u8; 32],
    pub hash_sequence: [u8; 32],
    pub hash_outputs: [u8; 32],
}

impl SighashCache {
    pub fn new(tx: &Transaction) -> Self {
        let mut prevouts = Vec::with_capacity(tx.inputs.len() * 36);
        let mut sequences = Vec::with_capacity(tx.inputs.len() * 4);
        for input in &tx.inputs {
            prevouts.extend_from_slice(&input.prev_tx_hash);
            prevouts.extend_from_slice(&input.prev_index.to_le_bytes());
            sequences.extend_from_slice(&input.sequence.to_le_bytes());
        }
        let mut outputs = Vec::with_capacity(tx.outputs.len() * 34);
        for output in &tx.outputs {
            write_output(&mut outputs, output);
        }
        Self {
            hash_prevouts: sha256d(&prevouts),
            hash_sequence: sha256d(&sequences),
            hash_outputs: sha256d(&outputs),
        }
    }

    /// Preimage for `input_index` spending an output locked by `script_code`.
    pub fn preimage(
        &self,
        tx: &Transaction,
        input_index: usize,
        script_code: &[u8],
        value: u64,
    ) -> BlockchainResult<Vec<u8>> {
        let input = tx.inputs.get(input_index).ok_or_else(|| {
            BlockchainError::Decode(format!(
                "Input {} out of range ({} inputs)",
                input_index,
                tx.inputs.len()
            ))
        })?;

        let mut buf = Vec::with_capacity(156 + script_code.len());
        buf.extend_from_slice(&tx.version.to_le_bytes());
        buf.extend_from_slice(&self.hash_prevouts);
        buf.extend_from_slice(&self.hash_sequence);
        buf.extend_from_slice(&input.prev_tx_hash);
        buf.extend_from_slice(&input.prev_index.to_le_bytes());
        write_varint(&mut buf, script_code.len() as u64);
        buf.extend_from_slice(script_code);
        buf.extend_from_slice(&value.to_le_bytes());
        buf.extend_from_slice(&input.sequence.to_le_bytes());
        buf.extend_from_slice(&self.hash_outputs);
        buf.extend_from_slice(&tx.locktime.to_le_bytes());
        buf.extend_from_slice(&SIGHASH_ALL_FORKID.to_le_bytes());
        Ok(buf)
    }

    /// Double-SHA256 of the preimage; this is what gets signed.
    pub fn digest(
        &self,
        tx: &Transaction,
        input_index: usize,
        script_code: &[u8],
        value: u64,
    ) -> BlockchainResult<[u8; 32]> {
        Ok(sha256d(&self.preimage(tx, input_index, script_code, value)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::transaction::encode::{TxIn, TxOut};

    fn sample_tx() -> Transaction {
        Transaction {
            version: 2,
            inputs: vec![
                TxIn {
                    prev_tx_hash: [0x01; 32],
                    prev_index: 0,
                    script_sig: Vec::new(),
                    sequence: 0xffff_ffff,
                },
                TxIn {
                    prev_tx_hash: [0x02; 32],
                    prev_index: 5,
                    script_sig: Vec::new(),
                    sequence: 0xffff_fffe,
                },
            ],
            outputs: vec![TxOut {
                value: 10_000,
                script_pubkey: vec![0x76, 0xa9],
            }],
            locktime: 0,
        }
    }

    #[test]
    fn test_preimage_layout() {
        let tx = sample_tx();
        let cache = SighashCache::new(&tx);
        let script = [0xac_u8; 25];
        let pre = cache.preimage(&tx, 1, &script, 1234).unwrap();

        assert_eq!(pre.len(), 4 + 32 + 32 + 36 + 1 + 25 + 8 + 4 + 32 + 4 + 4);
        assert_eq!(&pre[..4], &[2, 0, 0, 0]);
        assert_eq!(&pre[4..36], &cache.hash_prevouts);
        assert_eq!(&pre[68..100], &[0x02; 32]);
        assert_eq!(&pre[100..104], &[5, 0, 0, 0]);
        assert_eq!(pre[104], 25);
        assert_eq!(&pre[130..138], &1234u64.to_le_bytes());
        assert_eq!(&pre[138..142], &0xffff_fffe_u32.to_le_bytes());
        assert_eq!(&pre[pre.len() - 4..], &[0x41, 0, 0, 0]);
    }

    #[test]
    fn test_shared_hashes_match_manual_computation() {
        let tx = sample_tx();
        let cache = SighashCache::new(&tx);

        let mut sequences = Vec::new();
        sequences.extend_from_slice(&0xffff_ffff_u32.to_le_bytes());
        sequences.extend_from_slice(&0xffff_fffe_u32.to_le_bytes());
        assert_eq!(cache.hash_sequence, sha256d(&sequences));

        let mut outputs = Vec::new();
        outputs.extend_from_slice(&10_000u64.to_le_bytes());
        outputs.extend_from_slice(&[2, 0x76, 0xa9]);
        assert_eq!(cache.hash_outputs, sha256d(&outputs));
    }

    #[test]
    fn test_digest_is_deterministic_and_input_specific() {
        let tx = sample_tx();
        let a = SighashCache::new(&tx).digest(&tx, 0, &[0x51], 1).unwrap();
        let b = SighashCache::new(&tx).digest(&tx, 0, &[0x51], 1).unwrap();
        let c = SighashCache::new(&tx).digest(&tx, 1, &[0x51], 1).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(SighashCache::new(&tx).digest(&tx, 2, &[0x51], 1).is_err());
    }

    // Native P2WPKH example from BIP143. The forkid digest reuses its
    // preimage layout with hash type 0x41.
    const BIP143_UNSIGNED: &str = "0100000002fff7f7881a8099afa6940d42d1e7f6362bec38171ea3edf433541db4e4ad969f0000000000eeffffffef51e1b804cc89d182d279655c3aa89e815b1b309fe287d9b2b55d57b90ec68a0100000000ffffffff02202cb206000000001976a9148280b37df378db99f66f85c95a783a76ac7a6d5988ac9093510d000000001976a9143bde42dbee7e4dbe6a21b2d50ce2f0167faa815988ac11000000";
    const BIP143_PREIMAGE: &str = "0100000096b827c8483d4e9b96712b6713a7b68d6e8003a781feba36c31143470b4efd3752b0a642eea2fb7ae638c36f6252b6750293dbe574a806984b8e4d8548339a3bef51e1b804cc89d182d279655c3aa89e815b1b309fe287d9b2b55d57b90ec68a010000001976a9141d0f172a0ecb48aee1be1f2687d2963ae33f71a188ac0046c32300000000ffffffff863ef3e1a92afbfdb97f31ad0fc7683ee943e9abcf2501590ff8f6551f47e5e51100000001000000";

    #[test]
    fn test_bip143_known_answer() {
        let tx = Transaction::deserialize(&hex::decode(BIP143_UNSIGNED).unwrap()).unwrap();
        let cache = SighashCache::new(&tx);
        assert_eq!(
            hex::encode(cache.hash_prevouts),
            "96b827c8483d4e9b96712b6713a7b68d6e8003a781feba36c31143470b4efd37"
        );
        assert_eq!(
            hex::encode(cache.hash_sequence),
            "52b0a642eea2fb7ae638c36f6252b6750293dbe574a806984b8e4d8548339a3b"
        );
        assert_eq!(
            hex::encode(cache.hash_outputs),
            "863ef3e1a92afbfdb97f31ad0fc7683ee943e9abcf2501590ff8f6551f47e5e5"
        );

        let script_code = hex::decode("76a9141d0f172a0ecb48aee1be1f2687d2963ae33f71a188ac").unwrap();
        let pre = cache.preimage(&tx, 1, &script_code, 600_000_000).unwrap();
        let published = hex::decode(BIP143_PREIMAGE).unwrap();
        assert_eq!(pre.len(), published.len());
        assert_eq!(&pre[..pre.len() - 4], &published[..published.len() - 4]);
        assert_eq!(&pre[pre.len() - 4..], &[0x41, 0, 0, 0]);

        // Published digest for SIGHASH_ALL over the same fields.
        assert_eq!(
            hex::encode(sha256d(&published)),
            "c37af31116d1b27caf68aae9e3ac82f1477929014d5b917657d0eb49478cb670"
        );
        assert_eq!(
            hex::encode(cache.digest(&tx, 1, &script_code, 600_000_000).unwrap()),
            "467f411d178762db122a6aced76370a1c8324355bf0796502bf82eeaeda86a35"
        );
    }
}
